// Session layer: factory, facade and the orchestrators built on top
//
// The factory selects and constructs one engine adapter, drives loading in
// the background and hands back a facade. Callers never learn which concrete
// adapter is active.

pub mod chat; // Stateful conversation orchestrator
pub mod oneshot; // Stateless one-off streaming

use crate::capability::CapabilityProbe;
use crate::config::Config;
use crate::engines::{GpuEngineLoader, VmEngineLoader};
use crate::error::{ProviderError, Result};
use crate::providers::{
	Backend, ChatMessage, GenerateOptions, GpuProvider, ModelProvider, ProgressFn, TokenFn,
	WasmProvider,
};
use crate::{log_error, log_info, log_warn};
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle phase of a session's backing model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
	Loading,
	Ready,
	Failed,
	Closed,
}

/// Caller input for a chat or stream call: either a bare string (wrapped as
/// one user message) or an explicit message array
pub enum ChatInput {
	Text(String),
	Messages(Vec<ChatMessage>),
}

impl From<&str> for ChatInput {
	fn from(text: &str) -> Self {
		ChatInput::Text(text.to_string())
	}
}

impl From<String> for ChatInput {
	fn from(text: String) -> Self {
		ChatInput::Text(text)
	}
}

impl From<Vec<ChatMessage>> for ChatInput {
	fn from(messages: Vec<ChatMessage>) -> Self {
		ChatInput::Messages(messages)
	}
}

/// Normalize caller input into the message array handed to the adapter.
/// The session-level system prompt, when present, always comes first
/// regardless of the input shape.
pub fn normalize_messages(input: ChatInput, system_prompt: Option<&str>) -> Vec<ChatMessage> {
	let mut messages = Vec::new();
	if let Some(prompt) = system_prompt {
		messages.push(ChatMessage::system(prompt));
	}
	match input {
		ChatInput::Text(text) => messages.push(ChatMessage::user(text)),
		ChatInput::Messages(given) => messages.extend(given),
	}
	messages
}

/// What a caller asks the factory for
pub struct SessionRequest {
	pub model: String,
	pub backend: Backend,
	pub system_prompt: Option<String>,
	pub on_progress: Option<ProgressFn>,
}

impl SessionRequest {
	pub fn new(model: impl Into<String>, backend: Backend) -> Self {
		Self {
			model: model.into(),
			backend,
			system_prompt: None,
			on_progress: None,
		}
	}

	/// Build a request from the configured defaults
	pub fn from_config(config: &Config) -> Self {
		let backend = match config.session.backend.as_str() {
			"wasm" => Backend::Wasm,
			_ => Backend::Gpu,
		};
		Self {
			model: config.session.model.clone(),
			backend,
			system_prompt: config.session.system_prompt.clone(),
			on_progress: None,
		}
	}

	pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
		self.system_prompt = Some(prompt.into());
		self
	}

	pub fn with_progress(mut self, on_progress: ProgressFn) -> Self {
		self.on_progress = Some(on_progress);
		self
	}
}

struct SessionMeta {
	phase: SessionPhase,
	model_id: Option<String>,
	downgraded: bool,
	last_error: Option<String>,
}

struct SessionInner {
	backend: Backend,
	system_prompt: Option<String>,
	provider: tokio::sync::Mutex<Box<dyn ModelProvider>>,
	meta: parking_lot::Mutex<SessionMeta>,
	phase_tx: watch::Sender<SessionPhase>,
}

/// Facade over the active adapter. Cheap to clone; all clones address the
/// same underlying provider.
#[derive(Clone)]
pub struct ModelSession {
	inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ModelSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ModelSession")
			.field("backend", &self.inner.backend)
			.finish_non_exhaustive()
	}
}

impl ModelSession {
	fn new(
		backend: Backend,
		system_prompt: Option<String>,
		provider: Box<dyn ModelProvider>,
		downgraded: bool,
	) -> Self {
		let (phase_tx, _) = watch::channel(SessionPhase::Loading);
		Self {
			inner: Arc::new(SessionInner {
				backend,
				system_prompt,
				provider: tokio::sync::Mutex::new(provider),
				meta: parking_lot::Mutex::new(SessionMeta {
					phase: SessionPhase::Loading,
					model_id: None,
					downgraded,
					last_error: None,
				}),
				phase_tx,
			}),
		}
	}

	pub fn backend(&self) -> Backend {
		self.inner.backend
	}

	pub fn system_prompt(&self) -> Option<String> {
		self.inner.system_prompt.clone()
	}

	pub fn phase(&self) -> SessionPhase {
		self.inner.meta.lock().phase
	}

	pub fn is_ready(&self) -> bool {
		self.phase() == SessionPhase::Ready
	}

	pub fn model_id(&self) -> Option<String> {
		self.inner.meta.lock().model_id.clone()
	}

	/// True when the factory substituted this backend for an unavailable one
	pub fn downgraded(&self) -> bool {
		self.inner.meta.lock().downgraded
	}

	pub fn last_error(&self) -> Option<String> {
		self.inner.meta.lock().last_error.clone()
	}

	/// Subscribe to phase transitions. The transition to `Ready` is the
	/// notification that releases eagerly submitted messages.
	pub fn phase_watch(&self) -> watch::Receiver<SessionPhase> {
		self.inner.phase_tx.subscribe()
	}

	fn set_phase(&self, phase: SessionPhase) {
		self.inner.meta.lock().phase = phase;
		let _ = self.inner.phase_tx.send(phase);
	}

	/// Wait until the in-flight load settles
	pub async fn wait_ready(&self) -> Result<()> {
		let mut rx = self.phase_watch();
		loop {
			match self.phase() {
				SessionPhase::Ready => return Ok(()),
				SessionPhase::Failed => {
					let reason = self
						.last_error()
						.unwrap_or_else(|| "unknown load error".to_string());
					return Err(ProviderError::LoadFailed(reason));
				}
				SessionPhase::Closed => return Err(ProviderError::NotLoaded),
				SessionPhase::Loading => {
					if rx.changed().await.is_err() {
						return Err(ProviderError::LoadFailed(
							"session dropped while loading".to_string(),
						));
					}
				}
			}
		}
	}

	/// Drive the adapter's load. Used for the initial load and for manual
	/// retries after a failure; there are no automatic retries.
	pub async fn load(&self, model_id: &str, on_progress: Option<ProgressFn>) -> Result<()> {
		self.set_phase(SessionPhase::Loading);

		let mut provider = self.inner.provider.lock().await;
		match provider.load(model_id, on_progress).await {
			Ok(()) => {
				let resolved = provider.model_id().map(|s| s.to_string());
				drop(provider);
				self.inner.meta.lock().model_id = resolved;
				self.set_phase(SessionPhase::Ready);
				Ok(())
			}
			Err(err) => {
				drop(provider);
				{
					let mut meta = self.inner.meta.lock();
					meta.model_id = None;
					meta.last_error = Some(err.to_string());
				}
				self.set_phase(SessionPhase::Failed);
				Err(err)
			}
		}
	}

	pub async fn chat(
		&self,
		input: impl Into<ChatInput>,
		options: &GenerateOptions,
	) -> Result<String> {
		let messages = normalize_messages(input.into(), self.inner.system_prompt.as_deref());
		let mut provider = self.inner.provider.lock().await;
		provider.chat(&messages, options).await
	}

	pub async fn stream(
		&self,
		input: impl Into<ChatInput>,
		on_token: TokenFn<'_>,
		options: &GenerateOptions,
	) -> Result<String> {
		let messages = normalize_messages(input.into(), self.inner.system_prompt.as_deref());
		let mut provider = self.inner.provider.lock().await;
		provider.stream(&messages, on_token, options).await
	}

	/// Tear down the engine and release its resources. This is the only
	/// operation that reclaims engine memory; cancellation never does.
	pub async fn unload(&self) -> Result<()> {
		let mut provider = self.inner.provider.lock().await;
		provider.unload().await?;
		drop(provider);
		self.inner.meta.lock().model_id = None;
		self.set_phase(SessionPhase::Closed);
		Ok(())
	}
}

/// Builds sessions: probes capability, selects an adapter, constructs it and
/// drives loading. No retries: Probe -> SelectAdapter -> ConstructAdapter ->
/// Load -> Ready | LoadFailed.
pub struct SessionFactory {
	probe: Arc<dyn CapabilityProbe>,
	gpu_loader: Arc<dyn GpuEngineLoader>,
	vm_loader: Arc<dyn VmEngineLoader>,
}

impl SessionFactory {
	pub fn new(
		probe: Arc<dyn CapabilityProbe>,
		gpu_loader: Arc<dyn GpuEngineLoader>,
		vm_loader: Arc<dyn VmEngineLoader>,
	) -> Self {
		Self {
			probe,
			gpu_loader,
			vm_loader,
		}
	}

	/// Construct the session and start loading in the background. The facade
	/// is returned immediately so callers can submit messages eagerly while
	/// the model is still loading.
	pub async fn open(&self, request: SessionRequest) -> ModelSession {
		let mut backend = request.backend;
		let mut downgraded = false;

		// Non-fatal downgrade when the accelerated path is unavailable
		if backend == Backend::Gpu && !self.probe.gpu_available().await {
			log_warn!("GPU backend requested but unavailable, falling back to wasm");
			backend = Backend::Wasm;
			downgraded = true;
		}

		let provider: Box<dyn ModelProvider> = match backend {
			Backend::Gpu => Box::new(GpuProvider::new(self.gpu_loader.clone())),
			Backend::Wasm => Box::new(WasmProvider::new(self.vm_loader.clone())),
		};

		log_info!("Opening {} session for model {}", backend, request.model);
		let session = ModelSession::new(backend, request.system_prompt, provider, downgraded);

		let load_session = session.clone();
		let model = request.model;
		let on_progress = request.on_progress;
		tokio::spawn(async move {
			if let Err(err) = load_session.load(&model, on_progress).await {
				log_error!("Model load failed: {}", err);
			}
		});

		session
	}

	/// Open and wait for the load to settle, rejecting on load failure
	pub async fn connect(&self, request: SessionRequest) -> Result<ModelSession> {
		let session = self.open(request).await;
		session.wait_ready().await?;
		Ok(session)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::capability::FixedCapability;
	use crate::engines::mock::{MockGpuLoader, MockVmLoader};
	use crate::providers::{Content, Role};
	use std::time::Duration;

	fn factory(gpu_ok: bool, gpu: MockGpuLoader, vm: MockVmLoader) -> SessionFactory {
		SessionFactory::new(
			Arc::new(FixedCapability(gpu_ok)),
			Arc::new(gpu),
			Arc::new(vm),
		)
	}

	#[test]
	fn test_normalize_string_input() {
		let messages = normalize_messages("hi".into(), Some("S"));
		assert_eq!(messages.len(), 2);
		assert_eq!(messages[0].role, Role::System);
		assert_eq!(messages[0].content, Content::Text("S".to_string()));
		assert_eq!(messages[1].role, Role::User);
		assert_eq!(messages[1].content, Content::Text("hi".to_string()));
	}

	#[test]
	fn test_normalize_array_input() {
		let given = vec![ChatMessage::user("hi")];
		let messages = normalize_messages(given.into(), Some("S"));
		assert_eq!(messages.len(), 2);
		assert_eq!(messages[0].role, Role::System);
		assert_eq!(messages[1].role, Role::User);

		// Without a system prompt, input passes through untouched
		let messages = normalize_messages("hi".into(), None);
		assert_eq!(messages.len(), 1);
		assert_eq!(messages[0].role, Role::User);
	}

	#[tokio::test]
	async fn test_connect_ready_gpu() {
		let factory = factory(true, MockGpuLoader::new(vec!["ok"]), MockVmLoader::new(vec![]));
		let session = factory
			.connect(SessionRequest::new("qwen-0.5b", Backend::Gpu))
			.await
			.unwrap();

		assert!(session.is_ready());
		assert_eq!(session.backend(), Backend::Gpu);
		assert!(!session.downgraded());
		assert_eq!(
			session.model_id(),
			Some("Qwen2.5-0.5B-Instruct-q4f16_1".to_string())
		);
	}

	#[tokio::test]
	async fn test_gpu_unavailable_downgrades_to_wasm() {
		let factory = factory(
			false,
			MockGpuLoader::new(vec![]),
			MockVmLoader::new(vec!["ok"]),
		);
		let session = factory
			.connect(SessionRequest::new("tinyllama", Backend::Gpu))
			.await
			.unwrap();

		assert_eq!(session.backend(), Backend::Wasm);
		assert!(session.downgraded());
		assert!(session.is_ready());
	}

	#[tokio::test]
	async fn test_load_failure_surfaces_and_session_stays_not_ready() {
		let mut gpu = MockGpuLoader::new(vec![]);
		gpu.fail_load = true;
		let factory = factory(true, gpu, MockVmLoader::new(vec![]));

		let err = factory
			.connect(SessionRequest::new("tinyllama", Backend::Gpu))
			.await
			.unwrap_err();
		assert!(matches!(err, ProviderError::LoadFailed(_)));
	}

	#[tokio::test]
	async fn test_open_returns_before_ready() {
		let mut gpu = MockGpuLoader::new(vec!["ok"]);
		gpu.load_delay = Duration::from_millis(50);
		let factory = factory(true, gpu, MockVmLoader::new(vec![]));

		let session = factory
			.open(SessionRequest::new("tinyllama", Backend::Gpu))
			.await;
		assert!(!session.is_ready());
		assert_eq!(session.phase(), SessionPhase::Loading);

		session.wait_ready().await.unwrap();
		assert!(session.is_ready());
	}

	#[tokio::test]
	async fn test_unload_then_chat_rejects() {
		let factory = factory(true, MockGpuLoader::new(vec!["ok"]), MockVmLoader::new(vec![]));
		let session = factory
			.connect(SessionRequest::new("tinyllama", Backend::Gpu))
			.await
			.unwrap();

		session.unload().await.unwrap();
		assert!(!session.is_ready());
		assert_eq!(session.model_id(), None);
		assert_eq!(session.phase(), SessionPhase::Closed);

		let err = session
			.chat("hi", &GenerateOptions::default())
			.await
			.unwrap_err();
		assert!(matches!(err, ProviderError::NotLoaded));
	}

	#[tokio::test]
	async fn test_system_prompt_prepended_on_facade_calls() {
		let gpu = MockGpuLoader::new(vec!["ok"]);
		let seen = gpu.seen_requests.clone();
		let factory = factory(true, gpu, MockVmLoader::new(vec![]));
		let session = factory
			.connect(SessionRequest::new("tinyllama", Backend::Gpu).with_system_prompt("S"))
			.await
			.unwrap();

		session.chat("hi", &GenerateOptions::default()).await.unwrap();

		let requests = seen.lock();
		assert_eq!(requests[0].messages[0].role, "system");
		assert_eq!(requests[0].messages[1].role, "user");
	}
}
