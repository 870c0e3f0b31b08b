//! Convolution problem descriptors.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Immutable description of one 2-D convolution problem, NCHW dimension
/// order. `k` and `c` are total channel counts; per-group values are
/// derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvDescriptor {
    pub hi: u32,
    pub wi: u32,
    pub n: u32,
    pub k: u32,
    pub c: u32,
    pub stride_h: u32,
    pub stride_w: u32,
    pub dilation_h: u32,
    pub dilation_w: u32,
    pub pad_h: u32,
    pub pad_w: u32,
    pub y: u32,
    pub x: u32,
    pub group: u32,
}

/// Standard convolution output-size formula for one axis.
pub fn conv_out_size(in_size: u32, pad: u32, dilation: u32, ksize: u32, stride: u32) -> u32 {
    (in_size + 2 * pad - dilation * (ksize - 1) - 1) / stride + 1
}

impl ConvDescriptor {
    /// Channel counts must split evenly over groups; anything else is a
    /// caller contract violation, not a tunable-rejection outcome.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.group >= 1, "group count must be at least 1");
        ensure!(
            self.c % self.group == 0 && self.k % self.group == 0,
            "channel counts (k={}, c={}) must divide evenly into {} groups",
            self.k,
            self.c,
            self.group
        );
        Ok(())
    }

    pub fn ho(&self) -> u32 {
        conv_out_size(self.hi, self.pad_h, self.dilation_h, self.y, self.stride_h)
    }

    pub fn wo(&self) -> u32 {
        conv_out_size(self.wi, self.pad_w, self.dilation_w, self.x, self.stride_w)
    }

    pub fn k_per_group(&self) -> u32 {
        self.k / self.group
    }

    pub fn c_per_group(&self) -> u32 {
        self.c / self.group
    }

    /// 1x1 filter, unit stride and dilation, no padding: the only shape
    /// that needs no boundary handling at all.
    pub fn is_unit_conv(&self) -> bool {
        self.y == 1
            && self.x == 1
            && self.stride_h == 1
            && self.stride_w == 1
            && self.dilation_h == 1
            && self.dilation_w == 1
            && self.pad_h == 0
            && self.pad_w == 0
    }

    /// Element count of the input-gradient tensor (the buffer the
    /// backward-data pass accumulates into).
    pub fn dgrad_len(&self) -> usize {
        self.n as usize * self.c as usize * self.hi as usize * self.wi as usize
    }

    /// Multiply-accumulate work of the pass, in floating-point operations.
    pub fn flops(&self) -> f64 {
        2.0 * self.n as f64
            * self.k as f64
            * self.ho() as f64
            * self.wo() as f64
            * self.c_per_group() as f64
            * self.y as f64
            * self.x as f64
    }
}
