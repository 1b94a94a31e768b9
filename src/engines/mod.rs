// Native engine SDK seams
//
// The two execution engines are external collaborators with structurally
// different native APIs. The GPU-compiled runtime speaks a structured
// chat-completion protocol and streams discrete chunks from an iterable
// response. The bytecode-interpreted runtime consumes a single flat prompt
// and invokes a caller-supplied per-token callback during one completion
// call. The adapters in `providers` normalize both into the shared contract;
// nothing else in this crate touches these traits.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;

/// Native init progress event emitted by the GPU runtime (fraction 0..1)
#[derive(Debug, Clone)]
pub struct GpuInitEvent {
	pub progress: f64,
	pub text: String,
}

/// Native load progress event emitted by the bytecode runtime (raw bytes)
#[derive(Debug, Clone)]
pub struct VmLoadEvent {
	pub loaded_bytes: u64,
	pub total_bytes: u64,
}

pub type GpuProgressFn = Box<dyn FnMut(GpuInitEvent) + Send>;
pub type VmProgressFn = Box<dyn FnMut(VmLoadEvent) + Send>;

/// One message in the GPU runtime's structured request shape.
/// Content is passed through as-is so multi-part payloads survive.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WireMessage {
	pub role: String,
	pub content: serde_json::Value,
}

/// Structured chat-completion request for the GPU runtime
#[derive(Debug, Clone, serde::Serialize)]
pub struct GpuChatRequest {
	pub messages: Vec<WireMessage>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f32>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub stop: Vec<String>,
}

/// Chunk-iterable streaming response from the GPU runtime
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Handle to an initialized GPU-compiled engine holding one model
#[async_trait]
pub trait GpuEngine: Send {
	/// Single-shot structured chat completion
	async fn chat(&mut self, request: GpuChatRequest) -> Result<String>;

	/// Open a streaming chat completion; chunks arrive as an iterable
	async fn open_stream(&mut self, request: GpuChatRequest) -> Result<TokenStream>;

	/// Tear down the engine and release its resources
	async fn dispose(&mut self) -> Result<()>;
}

/// Entry point of the GPU runtime SDK: builds an engine already holding the
/// requested model, reporting native init events along the way
#[async_trait]
pub trait GpuEngineLoader: Send + Sync {
	async fn init(&self, model_id: &str, on_event: GpuProgressFn) -> Result<Box<dyn GpuEngine>>;
}

/// Sampling parameters for the bytecode runtime's completion call
#[derive(Debug, Clone, Default)]
pub struct VmCompletionParams {
	pub temperature: Option<f32>,
	pub n_predict: Option<u32>,
	pub top_p: Option<f32>,
	pub stop: Vec<String>,
}

/// Per-token sink invoked by the bytecode runtime during a completion call
pub type TokenSink = Box<dyn FnMut(&str) + Send>;

/// Handle to a bytecode-interpreted engine holding one model
#[async_trait]
pub trait VmEngine: Send {
	/// Run one completion over a flat prompt string. Tokens are pushed
	/// through `on_token` as they are produced; the full text is returned
	/// when the call finishes. The call cannot be interrupted once started.
	async fn complete(
		&mut self,
		prompt: &str,
		params: VmCompletionParams,
		on_token: TokenSink,
	) -> Result<String>;

	/// Tear down the engine and release its resources
	async fn dispose(&mut self) -> Result<()>;
}

/// Entry point of the bytecode runtime SDK: fetches and loads the requested
/// model, reporting byte-level progress along the way
#[async_trait]
pub trait VmEngineLoader: Send + Sync {
	async fn load(&self, model_id: &str, on_event: VmProgressFn) -> Result<Box<dyn VmEngine>>;
}
