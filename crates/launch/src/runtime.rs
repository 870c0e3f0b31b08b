//! The device-runtime seam.
//!
//! A real HIP/CUDA module loader and launcher lives outside this crate;
//! the driver only needs the three operations below. Every call blocks
//! until device completion, and calls issued on one runtime are observed
//! by the device in call order. That total order is what makes the
//! zero-fill pre-pass safe against the accumulating launches that follow
//! it, and keeps repeated measurements isolated from each other.

use thiserror::Error;

/// Raw device address of a caller-owned buffer.
pub type DeviceAddr = u64;

/// The three buffers of a backward-data pass. Allocation and lifetime are
/// the caller's responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffers {
    /// Input gradient, written by the pass.
    pub dinput: DeviceAddr,
    /// Filter weights, read-only.
    pub weights: DeviceAddr,
    /// Output gradient, read-only.
    pub doutput: DeviceAddr,
}

/// One-dimensional launch shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    /// Thread-group count.
    pub grid: u32,
    /// Threads per group.
    pub block: u32,
}

/// Device-side failures. All of these are fatal to the run: they signal a
/// broken environment or invocation, not a domain decision.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("kernel not found: {0}")]
    KernelNotFound(String),
    #[error("launch of {kernel} failed: {detail}")]
    LaunchFailed { kernel: String, detail: String },
    #[error("device synchronization failed: {0}")]
    SyncFailed(String),
}

/// Opaque handle to a loaded kernel, valid for the runtime that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHandle(pub(crate) usize);

pub trait KernelRuntime {
    /// Resolve a kernel name to a launchable handle.
    fn lookup_kernel(&self, name: &str) -> Result<KernelHandle, RuntimeError>;

    /// Launch and wait for completion; returns the device-measured
    /// duration in milliseconds.
    fn launch(
        &self,
        kernel: KernelHandle,
        dims: LaunchDims,
        args: &[u8],
    ) -> Result<f64, RuntimeError>;

    /// Clear `len` bytes at `addr` and wait; returns device milliseconds.
    fn zero_fill(&self, addr: DeviceAddr, len: usize) -> Result<f64, RuntimeError>;
}
