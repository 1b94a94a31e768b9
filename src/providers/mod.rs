// Provider abstraction layer over the two local execution engines

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod gpu;
pub mod template;
pub mod wasm;

// Re-export adapter implementations
pub use gpu::GpuProvider;
pub use wasm::WasmProvider;

/// Which execution engine backs a provider
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
	/// GPU-compiled runtime with a structured chat-completion API
	Gpu,
	/// Bytecode-interpreted runtime driven by flat prompts
	Wasm,
}

impl std::fmt::Display for Backend {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Backend::Gpu => write!(f, "gpu"),
			Backend::Wasm => write!(f, "wasm"),
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	System,
	User,
	Assistant,
}

impl Role {
	pub fn as_str(&self) -> &'static str {
		match self {
			Role::System => "system",
			Role::User => "user",
			Role::Assistant => "assistant",
		}
	}
}

/// One typed part of a multi-part message payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
	Text {
		text: String,
	},
	Image {
		#[serde(rename = "ref")]
		reference: String,
	},
}

/// Message content: plain text or an ordered list of typed parts
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Content {
	Text(String),
	Parts(Vec<ContentPart>),
}

impl Content {
	/// Flatten content into plain text. Image parts carry no text and are
	/// skipped; the bytecode runtime cannot consume them.
	pub fn as_text(&self) -> String {
		match self {
			Content::Text(text) => text.clone(),
			Content::Parts(parts) => parts
				.iter()
				.filter_map(|part| match part {
					ContentPart::Text { text } => Some(text.as_str()),
					ContentPart::Image { .. } => None,
				})
				.collect::<Vec<_>>()
				.join("\n"),
		}
	}
}

/// A single conversation message. Immutable once appended to history;
/// ordering is append-only and defines the conversation given to the engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
	pub role: Role,
	pub content: Content,
}

impl ChatMessage {
	pub fn system(content: impl Into<String>) -> Self {
		Self {
			role: Role::System,
			content: Content::Text(content.into()),
		}
	}

	pub fn user(content: impl Into<String>) -> Self {
		Self {
			role: Role::User,
			content: Content::Text(content.into()),
		}
	}

	pub fn assistant(content: impl Into<String>) -> Self {
		Self {
			role: Role::Assistant,
			content: Content::Text(content.into()),
		}
	}
}

/// Generation parameters. All optional; the orchestrator layer fills in
/// defaults, the adapters never do.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
	pub temperature: Option<f32>,
	pub max_tokens: Option<u32>,
	pub top_p: Option<f32>,
	pub stop_sequences: Option<Vec<String>>,
}

/// Uniform load progress reported by both adapters
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoadProgress {
	/// 0..=100, non-decreasing by convention (not enforced)
	pub progress: u8,
	pub status: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub loaded: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub total: Option<u64>,
}

/// Load progress callback handed to `ModelProvider::load`
pub type ProgressFn = Box<dyn FnMut(LoadProgress) + Send>;

/// Incremental token callback: `(token, full_text_so_far)`
pub type TokenFn<'a> = &'a mut (dyn FnMut(&str, &str) + Send);

/// Shared contract both engine adapters implement. Selected once at
/// construction by the session factory and never branched on again.
#[async_trait]
pub trait ModelProvider: Send {
	/// Which engine backs this provider
	fn backend(&self) -> Backend;

	/// Identifier of the currently loaded model, if any
	fn model_id(&self) -> Option<&str>;

	/// True when a model is loaded and the provider can generate
	fn is_ready(&self) -> bool;

	/// Resolve the alias, drive the underlying engine's initialization and
	/// translate its native progress events into `LoadProgress`. On failure
	/// the provider state stays unset.
	async fn load(&mut self, model_id: &str, on_progress: Option<ProgressFn>) -> Result<()>;

	/// Single-shot completion over the given conversation
	async fn chat(&mut self, messages: &[ChatMessage], options: &GenerateOptions) -> Result<String>;

	/// Streaming completion; surfaces each token through `on_token` and also
	/// returns the final full text
	async fn stream(
		&mut self,
		messages: &[ChatMessage],
		on_token: TokenFn<'_>,
		options: &GenerateOptions,
	) -> Result<String>;

	/// Tear down the engine handle and clear provider state. Calling on an
	/// already-unloaded provider is a no-op.
	async fn unload(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_message_wire_shape() {
		let msg = ChatMessage::user("hi");
		let json = serde_json::to_value(&msg).unwrap();
		assert_eq!(json, serde_json::json!({"role": "user", "content": "hi"}));
	}

	#[test]
	fn test_multipart_wire_shape() {
		let msg = ChatMessage {
			role: Role::User,
			content: Content::Parts(vec![
				ContentPart::Text {
					text: "what is this?".to_string(),
				},
				ContentPart::Image {
					reference: "blob:1234".to_string(),
				},
			]),
		};
		let json = serde_json::to_value(&msg).unwrap();
		assert_eq!(
			json,
			serde_json::json!({
				"role": "user",
				"content": [
					{"type": "text", "text": "what is this?"},
					{"type": "image", "ref": "blob:1234"}
				]
			})
		);

		// And back
		let parsed: ChatMessage = serde_json::from_value(json).unwrap();
		assert_eq!(parsed, msg);
	}

	#[test]
	fn test_content_as_text_skips_images() {
		let content = Content::Parts(vec![
			ContentPart::Text {
				text: "a".to_string(),
			},
			ContentPart::Image {
				reference: "blob:9".to_string(),
			},
			ContentPart::Text {
				text: "b".to_string(),
			},
		]);
		assert_eq!(content.as_text(), "a\nb");
	}
}
