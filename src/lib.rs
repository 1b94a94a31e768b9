// emberlm - local inference session layer
//
// Gives a host application a conversational-inference session backed by one
// of two interchangeable local execution engines: a GPU-compiled runtime with
// a structured chat-completion API, and a bytecode-interpreted runtime that
// consumes a flat prompt and pushes tokens through a callback. Both are
// normalized behind a single provider contract; this crate manages request
// shape, lifecycle and token flow around them and never runs inference
// itself.

pub mod capability; // GPU availability probe seam
pub mod config; // Configuration and logging macros
pub mod engines; // Native engine SDK seams (external collaborators)
pub mod error; // Provider error kinds
pub mod providers; // Provider contract + the two engine adapters
pub mod registry; // Model alias registry
pub mod session; // Session factory, facade, orchestrators

pub use capability::{CapabilityProbe, FixedCapability};
pub use config::{Config, LogLevel};
pub use error::{ProviderError, Result};
pub use providers::{
	Backend, ChatMessage, Content, ContentPart, GenerateOptions, LoadProgress, ModelProvider, Role,
};
pub use session::chat::{ChatOrchestrator, SendOutcome};
pub use session::oneshot::SingleShotStreamer;
pub use session::{ChatInput, ModelSession, SessionFactory, SessionPhase, SessionRequest};
