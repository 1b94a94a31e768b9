// Configuration loading and logging macros

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::path::Path;

/// Log verbosity level for the session layer
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	#[default]
	None,
	Info,
	Debug,
}

impl LogLevel {
	pub fn is_info_enabled(&self) -> bool {
		matches!(self, LogLevel::Info | LogLevel::Debug)
	}

	pub fn is_debug_enabled(&self) -> bool {
		matches!(self, LogLevel::Debug)
	}
}

/// Session-level defaults
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SessionConfig {
	/// Default model alias or concrete identifier
	pub model: String,
	/// Default backend: "gpu" or "wasm"
	pub backend: String,
	/// Optional system prompt prepended to every conversation
	pub system_prompt: Option<String>,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			model: "qwen-0.5b".to_string(),
			backend: "gpu".to_string(),
			system_prompt: None,
		}
	}
}

/// Generation parameter defaults applied by the orchestrator layer
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GenerationConfig {
	pub temperature: f32,
	pub max_tokens: u32,
	pub top_p: f32,
}

impl Default for GenerationConfig {
	fn default() -> Self {
		Self {
			temperature: 0.7,
			max_tokens: 1024,
			top_p: 0.95,
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct LogConfig {
	pub level: LogLevel,
}

/// Top-level configuration for the session layer
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
	pub session: SessionConfig,
	pub generation: GenerationConfig,
	pub log: LogConfig,
}

impl Config {
	/// Load configuration from a TOML file, falling back to defaults when the
	/// file does not exist
	pub fn load(path: &Path) -> Result<Self> {
		if !path.exists() {
			return Ok(Self::default());
		}
		let content = std::fs::read_to_string(path)?;
		let config: Config = toml::from_str(&content)?;
		Ok(config)
	}

	pub fn get_log_level(&self) -> LogLevel {
		self.log.level
	}
}

// Logging macros for different log levels
// These macros automatically check the current log level and only print if appropriate

thread_local! {
	static CURRENT_CONFIG: RefCell<Option<Config>> = const { RefCell::new(None) };
}

/// Set the current config for the thread (to be used by logging macros)
pub fn set_thread_config(config: &Config) {
	CURRENT_CONFIG.with(|c| {
		*c.borrow_mut() = Some(config.clone());
	});
}

/// Get the current config for the thread
pub fn with_thread_config<F, R>(f: F) -> Option<R>
where
	F: FnOnce(&Config) -> R,
{
	CURRENT_CONFIG.with(|c| (*c.borrow()).as_ref().map(f))
}

/// Info logging macro with automatic cyan coloring
/// Shows info messages when log level is Info OR Debug
#[macro_export]
macro_rules! log_info {
	($fmt:expr) => {
		if let Some(should_log) = $crate::config::with_thread_config(|config| config.get_log_level().is_info_enabled()) {
		if should_log {
		use colored::Colorize;
		println!("{}", $fmt.cyan());
		}
		}
	};
	($fmt:expr, $($arg:expr),*) => {
		if let Some(should_log) = $crate::config::with_thread_config(|config| config.get_log_level().is_info_enabled()) {
		if should_log {
		use colored::Colorize;
	println!("{}", format!($fmt, $($arg),*).cyan());
	}
	}
	};
}

/// Warning logging macro with automatic yellow coloring
/// Shown at Info level and above; used for non-fatal conditions like a
/// backend downgrade
#[macro_export]
macro_rules! log_warn {
	($fmt:expr) => {
		if let Some(should_log) = $crate::config::with_thread_config(|config| config.get_log_level().is_info_enabled()) {
		if should_log {
		use colored::Colorize;
		println!("{}", $fmt.yellow());
		}
		}
	};
	($fmt:expr, $($arg:expr),*) => {
		if let Some(should_log) = $crate::config::with_thread_config(|config| config.get_log_level().is_info_enabled()) {
		if should_log {
		use colored::Colorize;
	println!("{}", format!($fmt, $($arg),*).yellow());
	}
	}
	};
}

/// Debug logging macro with automatic bright blue coloring
#[macro_export]
macro_rules! log_debug {
	($fmt:expr) => {
		if let Some(should_log) = $crate::config::with_thread_config(|config| config.get_log_level().is_debug_enabled()) {
		if should_log {
		use colored::Colorize;
		println!("{}", $fmt.bright_blue());
		}
		}
	};
	($fmt:expr, $($arg:expr),*) => {
		if let Some(should_log) = $crate::config::with_thread_config(|config| config.get_log_level().is_debug_enabled()) {
		if should_log {
		use colored::Colorize;
	println!("{}", format!($fmt, $($arg),*).bright_blue());
	}
	}
	};
}

/// Error logging macro with automatic bright red coloring
/// Always visible regardless of log level (errors should always be shown)
#[macro_export]
macro_rules! log_error {
	($fmt:expr) => {{
		use colored::Colorize;
		eprintln!("{}", $fmt.bright_red());
		}};
	($fmt:expr, $($arg:expr),*) => {{
		use colored::Colorize;
		eprintln!("{}", format!($fmt, $($arg),*).bright_red());
		}};
}
