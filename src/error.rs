// Error kinds surfaced at the provider boundary

/// Errors that can occur across the provider contract.
///
/// None of these are retried automatically; retry decisions belong to the
/// caller. `NotLoaded` is fatal to that call only - the session becomes
/// usable again after a later successful `load`.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
	#[error("model is not loaded")]
	NotLoaded,

	#[error("model load failed: {0}")]
	LoadFailed(String),

	#[error("generation failed: {0}")]
	Generation(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

impl ProviderError {
	pub fn load_failed(err: impl std::fmt::Display) -> Self {
		ProviderError::LoadFailed(err.to_string())
	}

	pub fn generation(err: impl std::fmt::Display) -> Self {
		ProviderError::Generation(err.to_string())
	}
}
