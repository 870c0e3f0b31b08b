//! Orchestration of backward-data sub-GEMM launches and timing.

use std::thread;
use std::time::Duration;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tilegrad_geometry::{is_valid, resolve, ConvDescriptor, SubGemm, TunableConfig};

use crate::args::{upsampling_clear_kernel_name, BwdKernelArgs, UpsamplingClearArgs};
use crate::runtime::{DeviceBuffers, KernelRuntime, LaunchDims};
use crate::timing::trimmed_mean;

/// Outcome of one measured tunable. `return_code` 0 is success; -1 means
/// the validator rejected the configuration before any device work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub return_code: i32,
    pub duration_ms: f64,
    pub kernel_name: String,
}

impl MeasurementResult {
    pub fn rejected(kernel_name: String) -> Self {
        Self {
            return_code: -1,
            duration_ms: 0.0,
            kernel_name,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.return_code < 0
    }

    /// Effective throughput over the measured duration.
    pub fn gflops(&self, desc: &ConvDescriptor) -> f64 {
        if self.duration_ms > 0.0 {
            desc.flops() / (self.duration_ms * 1.0e6)
        } else {
            0.0
        }
    }
}

/// How the pre-pass clears the input-gradient buffer when the output does
/// not cover the full input. Resolved once per run, never mid-loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroFillMode {
    /// Generic device memset over the whole buffer.
    #[default]
    DeviceMemset,
    /// Dedicated clear kernel with its own packed argument record.
    ClearKernel,
}

/// Sequences the launches of one (descriptor, tunable) pair and measures
/// a trimmed-mean latency over repeated passes.
pub struct BwdDataDriver {
    warmup: usize,
    repeat: usize,
    zero_fill: ZeroFillMode,
}

impl BwdDataDriver {
    pub fn new() -> Self {
        Self {
            warmup: 3,
            repeat: 8,
            zero_fill: ZeroFillMode::default(),
        }
    }

    pub fn with_runs(mut self, warmup: usize, repeat: usize) -> Self {
        self.warmup = warmup;
        self.repeat = repeat;
        self
    }

    pub fn with_zero_fill(mut self, mode: ZeroFillMode) -> Self {
        self.zero_fill = mode;
        self
    }

    /// Run one tunable against one problem. Validator rejection returns a
    /// `-1` result without touching the device; runtime failures are
    /// fatal and propagate.
    pub fn run<R: KernelRuntime>(
        &self,
        runtime: &R,
        desc: &ConvDescriptor,
        tunable: &TunableConfig,
        buffers: DeviceBuffers,
    ) -> Result<MeasurementResult> {
        desc.validate()?;
        ensure!(
            self.repeat >= 3,
            "trimmed-mean timing needs at least 3 repeats, got {}",
            self.repeat
        );

        let kernel_name = tunable.kernel_name();
        if !is_valid(desc, tunable) {
            debug!(kernel = %kernel_name, "tunable rejected for this problem");
            return Ok(MeasurementResult::rejected(kernel_name));
        }

        let geom = resolve(desc, tunable);
        let block_size = tunable.block_size();
        let grid_size = geom.grid_size(desc, tunable)?;
        let dims = LaunchDims {
            grid: grid_size,
            block: block_size,
        };
        let kernel = runtime.lookup_kernel(&kernel_name)?;

        // An output that does not cover the full input leaves stale
        // elements behind; those must be cleared before accumulation.
        let need_zero_fill = desc.y < desc.stride_h
            || desc.x < desc.stride_w
            || desc.dilation_h != 1
            || desc.dilation_w != 1;
        let clear_kernel = match (need_zero_fill, self.zero_fill) {
            (true, ZeroFillMode::ClearKernel) => {
                let handle = runtime.lookup_kernel(&upsampling_clear_kernel_name(tunable))?;
                Some((handle, UpsamplingClearArgs::new(buffers.dinput, desc)))
            }
            _ => None,
        };
        let dgrad_bytes = desc.dgrad_len() * tunable.precision.data_byte() as usize;

        let mut args = BwdKernelArgs::new(buffers, desc, tunable, &geom);
        let sub_gemms: Vec<SubGemm> = geom.sub_gemms(desc).collect();
        info!(
            kernel = %kernel_name,
            grid = grid_size,
            block = block_size,
            num_of_gemm = geom.num_of_gemm,
            multihead = tunable.multihead,
            zero_fill = need_zero_fill,
            "launch plan ready"
        );

        let mut run_once = || -> Result<f64> {
            let mut ms_total = 0.0;
            if need_zero_fill {
                ms_total += match &clear_kernel {
                    Some((handle, clear_args)) => runtime.launch(
                        *handle,
                        LaunchDims {
                            grid: desc.n * desc.c,
                            block: 256,
                        },
                        clear_args.as_bytes(),
                    )?,
                    None => runtime.zero_fill(buffers.dinput, dgrad_bytes)?,
                };
            }
            if tunable.multihead {
                args.select_multihead(grid_size / geom.num_of_gemm, desc, &geom);
                debug!(args = ?args, "multihead launch");
                ms_total += runtime.launch(kernel, dims, args.as_bytes())?;
            } else {
                for sub in &sub_gemms {
                    if sub.is_empty() {
                        continue;
                    }
                    args.select_sub_gemm(sub);
                    debug!(sub_gemm = sub.index, args = ?args, "sub-GEMM launch");
                    ms_total += runtime.launch(kernel, dims, args.as_bytes())?;
                }
            }
            Ok(ms_total)
        };

        for _ in 0..self.warmup {
            run_once()?;
        }
        let mut samples = Vec::with_capacity(self.repeat);
        for _ in 0..self.repeat {
            samples.push(run_once()?);
        }
        let duration_ms = trimmed_mean(&samples)?;

        // Let the device settle before the caller moves to the next
        // tunable.
        thread::sleep(Duration::from_millis(5));

        Ok(MeasurementResult {
            return_code: 0,
            duration_ms,
            kernel_name,
        })
    }
}

impl Default for BwdDataDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rejected_results_carry_the_kernel_name() {
        let result = MeasurementResult::rejected("igemm_bwd_gtc_test".to_string());
        assert!(result.is_rejected());
        assert_eq!(result.duration_ms, 0.0);
        assert_eq!(result.kernel_name, "igemm_bwd_gtc_test");
    }

    #[test]
    fn gflops_scales_with_duration() {
        let desc = ConvDescriptor {
            hi: 14,
            wi: 14,
            n: 4,
            k: 64,
            c: 64,
            stride_h: 2,
            stride_w: 2,
            dilation_h: 1,
            dilation_w: 1,
            pad_h: 1,
            pad_w: 1,
            y: 3,
            x: 3,
            group: 1,
        };
        let result = MeasurementResult {
            return_code: 0,
            duration_ms: 1.0,
            kernel_name: String::new(),
        };
        // 2 * 4 * 64 * 7 * 7 * 64 * 3 * 3 FLOPs in 1 ms.
        assert_abs_diff_eq!(result.gflops(&desc), desc.flops() / 1.0e6, epsilon = 1e-9);
        assert_eq!(MeasurementResult::rejected(String::new()).gflops(&desc), 0.0);
    }

    #[test]
    fn measurement_result_serializes_round_trip() {
        let result = MeasurementResult {
            return_code: 0,
            duration_ms: 0.125,
            kernel_name: "igemm_bwd_gtc_test".to_string(),
        };
        let json = serde_json::to_string(&result).unwrap();
        let parsed: MeasurementResult = serde_json::from_str(&json).unwrap();
        assert_eq!(result, parsed);
    }
}
