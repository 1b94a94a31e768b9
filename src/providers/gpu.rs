// Adapter for the GPU-compiled execution engine
//
// The native runtime already speaks structured chat requests, so adaptation
// is mostly request shaping plus translating its chunk-iterable streaming
// into the shared per-token callback.

use crate::engines::{GpuChatRequest, GpuEngine, GpuEngineLoader, WireMessage};
use crate::error::{ProviderError, Result};
use crate::providers::{
	Backend, ChatMessage, GenerateOptions, LoadProgress, ModelProvider, ProgressFn, TokenFn,
};
use crate::registry;
use crate::{log_debug, log_info};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;

/// Engine handle plus the identifier it was initialized with. Present only
/// while a model is loaded; exclusively owned by the adapter.
struct ProviderState {
	engine: Box<dyn GpuEngine>,
	model_id: String,
}

pub struct GpuProvider {
	loader: Arc<dyn GpuEngineLoader>,
	state: Option<ProviderState>,
}

impl GpuProvider {
	pub fn new(loader: Arc<dyn GpuEngineLoader>) -> Self {
		Self { loader, state: None }
	}

	fn build_request(messages: &[ChatMessage], options: &GenerateOptions) -> GpuChatRequest {
		let wire_messages = messages
			.iter()
			.map(|msg| WireMessage {
				role: msg.role.as_str().to_string(),
				content: serde_json::to_value(&msg.content).unwrap_or_default(),
			})
			.collect();

		GpuChatRequest {
			messages: wire_messages,
			temperature: options.temperature,
			max_tokens: options.max_tokens,
			top_p: options.top_p,
			stop: options.stop_sequences.clone().unwrap_or_default(),
		}
	}
}

#[async_trait]
impl ModelProvider for GpuProvider {
	fn backend(&self) -> Backend {
		Backend::Gpu
	}

	fn model_id(&self) -> Option<&str> {
		self.state.as_ref().map(|s| s.model_id.as_str())
	}

	fn is_ready(&self) -> bool {
		self.state.is_some()
	}

	async fn load(&mut self, model_id: &str, mut on_progress: Option<ProgressFn>) -> Result<()> {
		// Never hold two live engine handles
		if let Some(mut old) = self.state.take() {
			log_debug!("Disposing previous engine before loading {}", model_id);
			let _ = old.engine.dispose().await;
		}

		let resolved = registry::resolve(model_id).to_string();
		log_info!("Loading model {} on gpu backend", resolved);

		// Native init events carry a 0..1 fraction; the contract wants 0-100
		let on_event = Box::new(move |event: crate::engines::GpuInitEvent| {
			if let Some(cb) = on_progress.as_mut() {
				let percent = (event.progress * 100.0).round().clamp(0.0, 100.0) as u8;
				cb(LoadProgress {
					progress: percent,
					status: event.text,
					loaded: None,
					total: None,
				});
			}
		});

		let engine = self
			.loader
			.init(&resolved, on_event)
			.await
			.map_err(ProviderError::load_failed)?;

		self.state = Some(ProviderState {
			engine,
			model_id: resolved,
		});
		Ok(())
	}

	async fn chat(&mut self, messages: &[ChatMessage], options: &GenerateOptions) -> Result<String> {
		let state = self.state.as_mut().ok_or(ProviderError::NotLoaded)?;
		let request = Self::build_request(messages, options);

		state
			.engine
			.chat(request)
			.await
			.map_err(ProviderError::generation)
	}

	async fn stream(
		&mut self,
		messages: &[ChatMessage],
		on_token: TokenFn<'_>,
		options: &GenerateOptions,
	) -> Result<String> {
		let state = self.state.as_mut().ok_or(ProviderError::NotLoaded)?;
		let request = Self::build_request(messages, options);

		let mut chunks = state
			.engine
			.open_stream(request)
			.await
			.map_err(ProviderError::generation)?;

		let mut full = String::new();
		while let Some(chunk) = chunks.next().await {
			let token = chunk.map_err(ProviderError::generation)?;
			full.push_str(&token);
			on_token(&token, &full);
		}
		Ok(full)
	}

	async fn unload(&mut self) -> Result<()> {
		if let Some(mut state) = self.state.take() {
			log_info!("Unloading model {}", state.model_id);
			state
				.engine
				.dispose()
				.await
				.map_err(ProviderError::generation)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::engines::mock::MockGpuLoader;
	use parking_lot::Mutex;

	fn provider(tokens: Vec<&'static str>) -> (GpuProvider, Arc<MockGpuLoader>) {
		let loader = Arc::new(MockGpuLoader::new(tokens));
		(GpuProvider::new(loader.clone()), loader)
	}

	#[tokio::test]
	async fn test_load_resolves_alias_and_reports_progress() {
		let (mut provider, _) = provider(vec!["ok"]);
		assert!(!provider.is_ready());

		let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
		let seen_clone = seen.clone();
		let on_progress: ProgressFn = Box::new(move |p| seen_clone.lock().push(p.progress));

		provider.load("qwen-0.5b", Some(on_progress)).await.unwrap();

		assert!(provider.is_ready());
		assert_eq!(provider.model_id(), Some("Qwen2.5-0.5B-Instruct-q4f16_1"));
		assert_eq!(*seen.lock(), vec![0, 100]);
	}

	#[tokio::test]
	async fn test_chat_before_load_fails() {
		let (mut provider, _) = provider(vec!["ok"]);
		let err = provider
			.chat(&[ChatMessage::user("hi")], &GenerateOptions::default())
			.await
			.unwrap_err();
		assert!(matches!(err, ProviderError::NotLoaded));
	}

	#[tokio::test]
	async fn test_load_failure_leaves_state_unset() {
		let mut loader = MockGpuLoader::new(vec![]);
		loader.fail_load = true;
		let mut provider = GpuProvider::new(Arc::new(loader));

		let err = provider.load("tinyllama", None).await.unwrap_err();
		assert!(matches!(err, ProviderError::LoadFailed(_)));
		assert!(!provider.is_ready());
		assert_eq!(provider.model_id(), None);
	}

	#[tokio::test]
	async fn test_stream_surfaces_tokens() {
		let (mut provider, _) = provider(vec!["Hel", "lo", "!"]);
		provider.load("tinyllama", None).await.unwrap();

		let mut tokens = Vec::new();
		let mut accumulated = Vec::new();
		let full = provider
			.stream(
				&[ChatMessage::user("hi")],
				&mut |tok, so_far| {
					tokens.push(tok.to_string());
					accumulated.push(so_far.to_string());
				},
				&GenerateOptions::default(),
			)
			.await
			.unwrap();

		assert_eq!(full, "Hello!");
		assert_eq!(tokens, vec!["Hel", "lo", "!"]);
		assert_eq!(accumulated, vec!["Hel", "Hello", "Hello!"]);
	}

	#[tokio::test]
	async fn test_options_reach_the_engine() {
		let (mut provider, loader) = provider(vec!["ok"]);
		provider.load("tinyllama", None).await.unwrap();

		let options = GenerateOptions {
			temperature: Some(0.1),
			max_tokens: Some(64),
			top_p: None,
			stop_sequences: Some(vec!["END".to_string()]),
		};
		provider
			.chat(&[ChatMessage::user("hi")], &options)
			.await
			.unwrap();

		let requests = loader.seen_requests.lock();
		assert_eq!(requests.len(), 1);
		assert_eq!(requests[0].temperature, Some(0.1));
		assert_eq!(requests[0].max_tokens, Some(64));
		assert_eq!(requests[0].stop, vec!["END".to_string()]);
	}

	#[tokio::test]
	async fn test_unload_disposes_and_is_idempotent() {
		let (mut provider, loader) = provider(vec!["ok"]);
		provider.load("tinyllama", None).await.unwrap();
		assert!(provider.is_ready());

		provider.unload().await.unwrap();
		assert!(!provider.is_ready());
		assert_eq!(provider.model_id(), None);
		assert!(loader.disposed.load(std::sync::atomic::Ordering::SeqCst));

		// Second unload is a no-op
		provider.unload().await.unwrap();

		let err = provider
			.chat(&[ChatMessage::user("hi")], &GenerateOptions::default())
			.await
			.unwrap_err();
		assert!(matches!(err, ProviderError::NotLoaded));
	}
}
