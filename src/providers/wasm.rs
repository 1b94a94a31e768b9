// Adapter for the bytecode-interpreted execution engine
//
// This runtime consumes a single flat prompt and pushes tokens through a
// callback during one completion call. Conversations are flattened with the
// model's chat template first, and the push-style callback is pumped through
// a channel so every token is an explicit suspend point for the layers
// above.

use crate::engines::{TokenSink, VmCompletionParams, VmEngine, VmEngineLoader, VmLoadEvent};
use crate::error::{ProviderError, Result};
use crate::providers::template::ChatTemplate;
use crate::providers::{
	Backend, ChatMessage, GenerateOptions, LoadProgress, ModelProvider, ProgressFn, TokenFn,
};
use crate::registry;
use crate::{log_debug, log_info};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Engine handle plus the identifier it was loaded with. Present only while
/// a model is loaded; exclusively owned by the adapter.
struct ProviderState {
	engine: Box<dyn VmEngine>,
	model_id: String,
}

pub struct WasmProvider {
	loader: Arc<dyn VmEngineLoader>,
	state: Option<ProviderState>,
}

impl WasmProvider {
	pub fn new(loader: Arc<dyn VmEngineLoader>) -> Self {
		Self { loader, state: None }
	}

	fn build_params(template: &ChatTemplate, options: &GenerateOptions) -> VmCompletionParams {
		let mut stop: Vec<String> = template
			.stop_tokens()
			.iter()
			.map(|s| s.to_string())
			.collect();
		if let Some(extra) = &options.stop_sequences {
			stop.extend(extra.iter().cloned());
		}

		VmCompletionParams {
			temperature: options.temperature,
			n_predict: options.max_tokens,
			top_p: options.top_p,
			stop,
		}
	}
}

#[async_trait]
impl ModelProvider for WasmProvider {
	fn backend(&self) -> Backend {
		Backend::Wasm
	}

	fn model_id(&self) -> Option<&str> {
		self.state.as_ref().map(|s| s.model_id.as_str())
	}

	fn is_ready(&self) -> bool {
		self.state.is_some()
	}

	async fn load(&mut self, model_id: &str, mut on_progress: Option<ProgressFn>) -> Result<()> {
		if let Some(mut old) = self.state.take() {
			log_debug!("Disposing previous engine before loading {}", model_id);
			let _ = old.engine.dispose().await;
		}

		let resolved = registry::resolve(model_id).to_string();
		log_info!("Loading model {} on wasm backend", resolved);

		// Native events report raw byte counts; translate to 0-100
		let on_event = Box::new(move |event: VmLoadEvent| {
			if let Some(cb) = on_progress.as_mut() {
				let percent = if event.total_bytes == 0 {
					0
				} else {
					((event.loaded_bytes * 100) / event.total_bytes).min(100) as u8
				};
				cb(LoadProgress {
					progress: percent,
					status: format!("Fetching model: {}%", percent),
					loaded: Some(event.loaded_bytes),
					total: Some(event.total_bytes),
				});
			}
		});

		let engine = self
			.loader
			.load(&resolved, on_event)
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
		let template = ChatTemplate::for_model(&state.model_id);
		let prompt = template.format(messages);
		let params = Self::build_params(&template, options);

		let sink: TokenSink = Box::new(|_tok| {});
		let raw = state
			.engine
			.complete(&prompt, params, sink)
			.await
			.map_err(ProviderError::generation)?;

		Ok(template.strip_closing(&raw))
	}

	async fn stream(
		&mut self,
		messages: &[ChatMessage],
		on_token: TokenFn<'_>,
		options: &GenerateOptions,
	) -> Result<String> {
		let state = self.state.as_mut().ok_or(ProviderError::NotLoaded)?;
		let template = ChatTemplate::for_model(&state.model_id);
		let prompt = template.format(messages);
		let params = Self::build_params(&template, options);

		// The runtime pushes tokens synchronously into its callback during a
		// single call. Pump them through a channel so each one becomes a
		// suspend point the orchestrator can observe between.
		let (tx, mut rx) = mpsc::unbounded_channel::<String>();
		let sink: TokenSink = Box::new(move |tok| {
			let _ = tx.send(tok.to_string());
		});

		let completion = state.engine.complete(&prompt, params, sink);
		tokio::pin!(completion);

		let mut full = String::new();
		let mut outcome = None;
		loop {
			tokio::select! {
				token = rx.recv() => match token {
					Some(token) => {
						full.push_str(&token);
						on_token(&token, &full);
					}
					// Sender dropped with the finished call: all tokens drained
					None => break,
				},
				result = &mut completion, if outcome.is_none() => {
					outcome = Some(result);
				}
			}
		}

		let raw = match outcome {
			Some(result) => result.map_err(ProviderError::generation)?,
			// Sink dropped early by the engine; wait for the call to finish
			None => completion.await.map_err(ProviderError::generation)?,
		};

		Ok(template.strip_closing(&raw))
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
	use crate::engines::mock::MockVmLoader;
	use parking_lot::Mutex;

	fn provider(tokens: Vec<&'static str>) -> (WasmProvider, Arc<MockVmLoader>) {
		let loader = Arc::new(MockVmLoader::new(tokens));
		(WasmProvider::new(loader.clone()), loader)
	}

	#[tokio::test]
	async fn test_load_reports_byte_progress() {
		let (mut provider, _) = provider(vec!["ok"]);

		let seen: Arc<Mutex<Vec<LoadProgress>>> = Arc::new(Mutex::new(Vec::new()));
		let seen_clone = seen.clone();
		let on_progress: ProgressFn = Box::new(move |p| seen_clone.lock().push(p));

		provider.load("qwen-0.5b", Some(on_progress)).await.unwrap();
		assert!(provider.is_ready());

		let events = seen.lock();
		assert_eq!(events.first().map(|p| p.progress), Some(0));
		assert_eq!(events.last().map(|p| p.progress), Some(100));
		assert_eq!(events.last().and_then(|p| p.loaded), Some(1000));
		assert_eq!(events.last().and_then(|p| p.total), Some(1000));
	}

	#[tokio::test]
	async fn test_prompt_is_template_formatted() {
		let (mut provider, loader) = provider(vec!["hey"]);
		provider.load("qwen-0.5b", None).await.unwrap();

		provider
			.chat(
				&[ChatMessage::system("S"), ChatMessage::user("hi")],
				&GenerateOptions::default(),
			)
			.await
			.unwrap();

		let prompts = loader.seen_prompts.lock();
		assert_eq!(prompts.len(), 1);
		// Qwen resolves to a ChatML-family identifier
		assert!(prompts[0].starts_with("<|im_start|>system\nS<|im_end|>"));
		assert!(prompts[0].ends_with("<|im_start|>assistant\n"));
	}

	#[tokio::test]
	async fn test_closing_tokens_stripped() {
		let (mut provider, _) = provider(vec!["Hello", "<|im_end|>"]);
		provider.load("qwen-0.5b", None).await.unwrap();

		let text = provider
			.chat(&[ChatMessage::user("hi")], &GenerateOptions::default())
			.await
			.unwrap();
		assert_eq!(text, "Hello");
	}

	#[tokio::test]
	async fn test_stream_pumps_callback_tokens() {
		let (mut provider, _) = provider(vec!["a", "b", "c"]);
		provider.load("tinyllama", None).await.unwrap();

		let mut seen = Vec::new();
		let full = provider
			.stream(
				&[ChatMessage::user("hi")],
				&mut |tok, so_far| seen.push((tok.to_string(), so_far.to_string())),
				&GenerateOptions::default(),
			)
			.await
			.unwrap();

		assert_eq!(full, "abc");
		assert_eq!(
			seen,
			vec![
				("a".to_string(), "a".to_string()),
				("b".to_string(), "ab".to_string()),
				("c".to_string(), "abc".to_string()),
			]
		);
	}

	#[tokio::test]
	async fn test_chat_before_load_and_after_unload() {
		let (mut provider, loader) = provider(vec!["ok"]);
		let err = provider
			.chat(&[ChatMessage::user("hi")], &GenerateOptions::default())
			.await
			.unwrap_err();
		assert!(matches!(err, ProviderError::NotLoaded));

		provider.load("tinyllama", None).await.unwrap();
		provider.unload().await.unwrap();
		provider.unload().await.unwrap(); // idempotent
		assert!(loader.disposed.load(std::sync::atomic::Ordering::SeqCst));

		let err = provider
			.chat(&[ChatMessage::user("hi")], &GenerateOptions::default())
			.await
			.unwrap_err();
		assert!(matches!(err, ProviderError::NotLoaded));
		assert_eq!(provider.model_id(), None);
	}

	#[tokio::test]
	async fn test_template_stops_merged_with_options() {
		let (mut provider, _) = provider(vec!["ok"]);
		provider.load("qwen-0.5b", None).await.unwrap();

		let state = provider.state.as_ref().unwrap();
		let template = ChatTemplate::for_model(&state.model_id);
		let options = GenerateOptions {
			stop_sequences: Some(vec!["DONE".to_string()]),
			..Default::default()
		};
		let params = WasmProvider::build_params(&template, &options);

		assert!(params.stop.contains(&"<|im_end|>".to_string()));
		assert!(params.stop.contains(&"DONE".to_string()));
	}
}
