//! The tilda transform: reducing a strided/dilated backward-data pass to
//! a set of dense sub-GEMM problems.
//!
//! Per axis, stride and dilation reduce by their gcd to a `tilda` factor;
//! the output positions then split into `y_tilda * x_tilda` interleaved
//! sublattices. Each sublattice becomes one sub-GEMM over the clipped
//! coordinate range that actually overlaps the padded input.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::conv::ConvDescriptor;
use crate::math::{align_up, gcd};
use crate::tunable::TunableConfig;

/// Everything derived from one (descriptor, tunable) pair. Recomputed per
/// pair; `b` and `gemm_n` depend on the tunable's `nxb`/`nxe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedGeometry {
    pub y_tilda: u32,
    pub x_tilda: u32,
    pub y_dot: u32,
    pub x_dot: u32,
    /// Reduced dilation factors, `dilation / gcd(stride, dilation)`.
    pub dtile_dy: u32,
    pub dtile_dx: u32,
    /// Expanded coordinate extents reachable by integer tile indices.
    pub h_tilda: u32,
    pub w_tilda: u32,
    /// Active sub-range of the expanded extents.
    pub h_tilda_left: u32,
    pub w_tilda_left: u32,
    pub h_tilda_right: u32,
    pub w_tilda_right: u32,
    pub h_tilda_slice: u32,
    pub w_tilda_slice: u32,
    pub num_of_gemm: u32,
    /// Flattened spatial extent of gemm_n, padded to `nxb` when `nxe != 0`.
    pub b: u32,
    pub gemm_m: u32,
    pub gemm_n: u32,
}

/// One sublattice's dense GEMM problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubGemm {
    pub index: u32,
    pub i_y_tilda: u32,
    pub i_x_tilda: u32,
    pub y_dot_slice: u32,
    pub x_dot_slice: u32,
    pub gemm_k: u32,
}

impl SubGemm {
    /// Empty sub-GEMMs contribute nothing and are never launched.
    pub fn is_empty(&self) -> bool {
        self.y_dot_slice == 0 || self.x_dot_slice == 0 || self.gemm_k == 0
    }
}

/// Pure function of its inputs; malformed descriptors are the validator's
/// concern, never this one's.
pub fn resolve(desc: &ConvDescriptor, tunable: &TunableConfig) -> ResolvedGeometry {
    let ho = desc.ho();
    let wo = desc.wo();

    let gcd_stride_dilation_h = gcd(desc.stride_h, desc.dilation_h);
    let gcd_stride_dilation_w = gcd(desc.stride_w, desc.dilation_w);
    let y_tilda = desc.stride_h / gcd_stride_dilation_h;
    let x_tilda = desc.stride_w / gcd_stride_dilation_w;

    let y_dot = desc.y.div_ceil(y_tilda);
    let x_dot = desc.x.div_ceil(x_tilda);

    let h_tilda = ho + (desc.dilation_h * (desc.y - 1)).div_ceil(desc.stride_h);
    let w_tilda = wo + (desc.dilation_w * (desc.x - 1)).div_ceil(desc.stride_w);

    let h_tilda_left = desc
        .pad_h
        .saturating_sub(desc.dilation_h * (y_tilda - 1))
        / desc.stride_h;
    let w_tilda_left = desc
        .pad_w
        .saturating_sub(desc.dilation_w * (x_tilda - 1))
        / desc.stride_w;

    let h_tilda_right = h_tilda.min((desc.pad_h + desc.hi - 1).div_ceil(desc.stride_h) + 1);
    let w_tilda_right = w_tilda.min((desc.pad_w + desc.wi - 1).div_ceil(desc.stride_w) + 1);

    let h_tilda_slice = h_tilda_right.saturating_sub(h_tilda_left);
    let w_tilda_slice = w_tilda_right.saturating_sub(w_tilda_left);

    let raw_b = h_tilda_slice * w_tilda_slice;
    let b = if tunable.nxe == 0 {
        raw_b
    } else {
        align_up(raw_b, tunable.nxb)
    };

    ResolvedGeometry {
        y_tilda,
        x_tilda,
        y_dot,
        x_dot,
        dtile_dy: desc.dilation_h / gcd_stride_dilation_h,
        dtile_dx: desc.dilation_w / gcd_stride_dilation_w,
        h_tilda,
        w_tilda,
        h_tilda_left,
        w_tilda_left,
        h_tilda_right,
        w_tilda_right,
        h_tilda_slice,
        w_tilda_slice,
        num_of_gemm: y_tilda * x_tilda,
        b,
        gemm_m: desc.c_per_group(),
        gemm_n: desc.n * b,
    }
}

impl ResolvedGeometry {
    /// Enumerate the sub-GEMMs row-major over `(y_tilda, x_tilda)`.
    pub fn sub_gemms<'a>(
        &'a self,
        desc: &'a ConvDescriptor,
    ) -> impl Iterator<Item = SubGemm> + 'a {
        let k_per_group = desc.k_per_group();
        (0..self.num_of_gemm).map(move |index| {
            let i_y_tilda = index / self.x_tilda;
            let i_x_tilda = index % self.x_tilda;
            // ceil((y - i_y) / y_tilda), zero once i_y walks past the filter.
            let y_dot_slice = (desc.y + self.y_tilda - 1 - i_y_tilda) / self.y_tilda;
            let x_dot_slice = (desc.x + self.x_tilda - 1 - i_x_tilda) / self.x_tilda;
            let gemm_k = k_per_group * y_dot_slice * x_dot_slice;
            SubGemm {
                index,
                i_y_tilda,
                i_x_tilda,
                y_dot_slice,
                x_dot_slice,
                gemm_k,
            }
        })
    }

    /// Thread-group count of one launch. Multihead folds every sub-GEMM
    /// into the same grid; the result must stay addressable in 32 bits.
    pub fn grid_size(&self, desc: &ConvDescriptor, tunable: &TunableConfig) -> Result<u32> {
        let mut grid = desc.group as u64
            * self.gemm_m.div_ceil(tunable.gemm_m_per_block) as u64
            * self.gemm_n.div_ceil(tunable.gemm_n_per_block) as u64;
        if tunable.multihead {
            grid *= self.num_of_gemm as u64;
        }
        ensure!(
            grid <= u32::MAX as u64,
            "grid size {} exceeds the 32-bit launch ceiling",
            grid
        );
        Ok(grid as u32)
    }
}
