// Capability probing seam
//
// The actual GPU/runtime detection lives outside this layer; the session
// factory only consumes a boolean-producing probe.

use async_trait::async_trait;

/// Reports whether the GPU-accelerated execution path is available.
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
	async fn gpu_available(&self) -> bool;
}

/// Probe with a fixed answer, for wiring and tests
pub struct FixedCapability(pub bool);

#[async_trait]
impl CapabilityProbe for FixedCapability {
	async fn gpu_available(&self) -> bool {
		self.0
	}
}
