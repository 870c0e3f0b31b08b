//! Deterministic stand-in runtime for tests and dry benchmarking.
//!
//! Models device latency from the launch shape with a small seeded jitter,
//! and records every call so tests can assert on launch counts and the
//! zero-fill/accumulate ordering without a physical GPU.

use std::cell::RefCell;

use tilegrad_geometry::TunableConfig;

use crate::args::upsampling_clear_kernel_name;
use crate::runtime::{DeviceAddr, KernelHandle, KernelRuntime, LaunchDims, RuntimeError};

/// One recorded runtime call, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    ZeroFill {
        addr: DeviceAddr,
        len: usize,
    },
    Launch {
        kernel: String,
        dims: LaunchDims,
        args_len: usize,
    },
}

pub struct SimulatedRuntime {
    kernels: Vec<String>,
    calls: RefCell<Vec<SimCall>>,
    rng: RefCell<fastrand::Rng>,
}

impl SimulatedRuntime {
    /// Runtime pre-loaded with every preset tunable's kernel plus the
    /// matching upsampling-clear kernels.
    pub fn new() -> Self {
        let mut kernels: Vec<String> = TunableConfig::presets()
            .iter()
            .map(TunableConfig::kernel_name)
            .collect();
        for tunable in TunableConfig::presets() {
            let clear = upsampling_clear_kernel_name(&tunable);
            if !kernels.contains(&clear) {
                kernels.push(clear);
            }
        }
        Self::with_kernels(kernels)
    }

    pub fn with_kernels(kernels: impl IntoIterator<Item = String>) -> Self {
        Self {
            kernels: kernels.into_iter().collect(),
            calls: RefCell::new(Vec::new()),
            rng: RefCell::new(fastrand::Rng::with_seed(0x7113_67ad)),
        }
    }

    /// Everything issued so far, in order.
    pub fn calls(&self) -> Vec<SimCall> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    fn jitter(&self) -> f64 {
        1.0 + 0.05 * self.rng.borrow_mut().f64()
    }
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelRuntime for SimulatedRuntime {
    fn lookup_kernel(&self, name: &str) -> Result<KernelHandle, RuntimeError> {
        self.kernels
            .iter()
            .position(|k| k == name)
            .map(KernelHandle)
            .ok_or_else(|| RuntimeError::KernelNotFound(name.to_string()))
    }

    fn launch(
        &self,
        kernel: KernelHandle,
        dims: LaunchDims,
        args: &[u8],
    ) -> Result<f64, RuntimeError> {
        let name = self
            .kernels
            .get(kernel.0)
            .ok_or_else(|| RuntimeError::LaunchFailed {
                kernel: format!("handle {}", kernel.0),
                detail: "stale handle".to_string(),
            })?;
        self.calls.borrow_mut().push(SimCall::Launch {
            kernel: name.clone(),
            dims,
            args_len: args.len(),
        });
        let work = dims.grid as f64 * dims.block as f64;
        Ok(work * 2.0e-7 * self.jitter())
    }

    fn zero_fill(&self, addr: DeviceAddr, len: usize) -> Result<f64, RuntimeError> {
        self.calls.borrow_mut().push(SimCall::ZeroFill { addr, len });
        Ok(len as f64 * 1.0e-9 * self.jitter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_resolves_preset_kernels() {
        let runtime = SimulatedRuntime::new();
        for tunable in TunableConfig::presets() {
            assert!(runtime.lookup_kernel(&tunable.kernel_name()).is_ok());
        }
        assert!(matches!(
            runtime.lookup_kernel("igemm_bwd_gtc_no_such_kernel"),
            Err(RuntimeError::KernelNotFound(_))
        ));
    }

    #[test]
    fn calls_are_recorded_in_order() {
        let runtime = SimulatedRuntime::new();
        let handle = runtime
            .lookup_kernel(&TunableConfig::mac_64x64x16().kernel_name())
            .unwrap();
        runtime.zero_fill(0x1000, 64).unwrap();
        runtime
            .launch(handle, LaunchDims { grid: 8, block: 256 }, &[0u8; 16])
            .unwrap();

        let calls = runtime.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], SimCall::ZeroFill { len: 64, .. }));
        assert!(matches!(calls[1], SimCall::Launch { .. }));
    }
}
