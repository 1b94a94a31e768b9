// Model alias registry
//
// Static mapping from human-friendly aliases to the concrete identifiers the
// engines understand. Pure lookup; unknown identifiers pass through
// unchanged so callers can always address a model directly.

use lazy_static::lazy_static;
use std::collections::HashMap;

lazy_static! {
	static ref ALIASES: HashMap<&'static str, &'static str> = {
		let mut m = HashMap::new();
		m.insert("qwen-0.5b", "Qwen2.5-0.5B-Instruct-q4f16_1");
		m.insert("qwen-1.5b", "Qwen2.5-1.5B-Instruct-q4f16_1");
		m.insert("llama-3.2-1b", "Llama-3.2-1B-Instruct-q4f16_1");
		m.insert("llama-3.2-3b", "Llama-3.2-3B-Instruct-q4f16_1");
		m.insert("tinyllama", "TinyLlama-1.1B-Chat-v1.0-q4f16_1");
		m.insert("mistral-7b", "Mistral-7B-Instruct-v0.3-q4f16_1");
		m.insert("phi-3.5-mini", "Phi-3.5-mini-instruct-q4f16_1");
		m.insert("smollm-360m", "SmolLM2-360M-Instruct-q4f16_1");
		m
	};
}

/// Resolve a model alias to its concrete identifier.
/// Unknown names are returned as-is.
pub fn resolve(name: &str) -> &str {
	ALIASES.get(name).copied().unwrap_or(name)
}

/// List the known aliases, for display purposes
pub fn known_aliases() -> Vec<&'static str> {
	let mut aliases: Vec<&'static str> = ALIASES.keys().copied().collect();
	aliases.sort_unstable();
	aliases
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_resolve_known_alias() {
		assert_eq!(resolve("qwen-0.5b"), "Qwen2.5-0.5B-Instruct-q4f16_1");
		assert_eq!(resolve("tinyllama"), "TinyLlama-1.1B-Chat-v1.0-q4f16_1");
	}

	#[test]
	fn test_resolve_passthrough() {
		// Concrete identifiers and unknown names pass through unchanged
		assert_eq!(resolve("Mistral-7B-Instruct-v0.3-q4f16_1"), "Mistral-7B-Instruct-v0.3-q4f16_1");
		assert_eq!(resolve("my-custom-model"), "my-custom-model");
	}

	#[test]
	fn test_known_aliases_sorted() {
		let aliases = known_aliases();
		assert!(aliases.contains(&"llama-3.2-1b"));
		let mut sorted = aliases.clone();
		sorted.sort_unstable();
		assert_eq!(aliases, sorted);
	}
}
