// Chat template formatting for the bytecode-interpreted engine
//
// The bytecode runtime has no notion of structured messages; conversations
// must be flattened into a single prompt string in the template family the
// model was tuned on. The family is selected by substring-matching the model
// identifier, with a generic `role: content` join as last resort.

use crate::providers::{ChatMessage, Role};

/// Known prompt template families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFamily {
	/// Role-tagged control tokens: `<|im_start|>role ... <|im_end|>`
	ChatMl,
	/// `[INST]`-style instruction wrapping with an optional `<<SYS>>` block
	Instruct,
	/// Generic `role: content` join
	Plain,
}

/// Model identifier substrings mapped to ChatML-family templates
const CHATML_MARKERS: &[&str] = &["qwen", "smollm", "phi-", "yi-", "hermes", "chatml"];

/// Model identifier substrings mapped to `[INST]`-family templates
const INSTRUCT_MARKERS: &[&str] = &["mistral", "mixtral", "llama-2", "codellama"];

const CHATML_STOP: &[&str] = &["<|im_end|>", "<|endoftext|>"];
const INSTRUCT_STOP: &[&str] = &["</s>", "[INST]"];
const PLAIN_STOP: &[&str] = &["\nuser:", "\nsystem:"];

/// Prompt formatter bound to one model's template family
#[derive(Debug, Clone, Copy)]
pub struct ChatTemplate {
	family: TemplateFamily,
}

impl ChatTemplate {
	/// Select the template family for a model identifier
	pub fn for_model(model_id: &str) -> Self {
		let id = model_id.to_lowercase();

		let family = if CHATML_MARKERS.iter().any(|m| id.contains(m)) {
			TemplateFamily::ChatMl
		} else if INSTRUCT_MARKERS.iter().any(|m| id.contains(m)) {
			TemplateFamily::Instruct
		} else {
			TemplateFamily::Plain
		};

		Self { family }
	}

	pub fn family(&self) -> TemplateFamily {
		self.family
	}

	/// Flatten a conversation into a single prompt ending at the point where
	/// the assistant is expected to continue
	pub fn format(&self, messages: &[ChatMessage]) -> String {
		match self.family {
			TemplateFamily::ChatMl => format_chatml(messages),
			TemplateFamily::Instruct => format_instruct(messages),
			TemplateFamily::Plain => format_plain(messages),
		}
	}

	/// Stop sequences the engine should honor for this family
	pub fn stop_tokens(&self) -> &'static [&'static str] {
		match self.family {
			TemplateFamily::ChatMl => CHATML_STOP,
			TemplateFamily::Instruct => INSTRUCT_STOP,
			TemplateFamily::Plain => PLAIN_STOP,
		}
	}

	/// Strip template closing tokens from generated text. Output is cut at
	/// the first closing token since nothing after it belongs to the reply.
	pub fn strip_closing(&self, text: &str) -> String {
		let mut result = text;
		for stop in self.stop_tokens() {
			if let Some(pos) = result.find(stop) {
				result = &result[..pos];
			}
		}
		result.trim().to_string()
	}
}

fn format_chatml(messages: &[ChatMessage]) -> String {
	let mut prompt = String::new();
	for msg in messages {
		prompt.push_str("<|im_start|>");
		prompt.push_str(msg.role.as_str());
		prompt.push('\n');
		prompt.push_str(&msg.content.as_text());
		prompt.push_str("<|im_end|>\n");
	}
	prompt.push_str("<|im_start|>assistant\n");
	prompt
}

fn format_instruct(messages: &[ChatMessage]) -> String {
	// System content goes into a <<SYS>> block inside the first instruction
	let system: Vec<String> = messages
		.iter()
		.filter(|m| m.role == Role::System)
		.map(|m| m.content.as_text())
		.collect();

	let mut prompt = String::new();
	let mut first_turn = true;
	let mut open_inst = false;

	for msg in messages {
		match msg.role {
			Role::System => {}
			Role::User => {
				if open_inst {
					// Consecutive user turns collapse into one instruction
					prompt.push('\n');
				} else {
					prompt.push_str("<s>[INST] ");
					if first_turn && !system.is_empty() {
						prompt.push_str("<<SYS>>\n");
						prompt.push_str(&system.join("\n"));
						prompt.push_str("\n<</SYS>>\n\n");
					}
					first_turn = false;
					open_inst = true;
				}
				prompt.push_str(&msg.content.as_text());
			}
			Role::Assistant => {
				if open_inst {
					prompt.push_str(" [/INST] ");
					open_inst = false;
				}
				prompt.push_str(&msg.content.as_text());
				prompt.push_str(" </s>");
			}
		}
	}

	if open_inst {
		prompt.push_str(" [/INST]");
	}
	prompt
}

fn format_plain(messages: &[ChatMessage]) -> String {
	let mut prompt = String::new();
	for msg in messages {
		prompt.push_str(msg.role.as_str());
		prompt.push_str(": ");
		prompt.push_str(&msg.content.as_text());
		prompt.push('\n');
	}
	prompt.push_str("assistant:");
	prompt
}
