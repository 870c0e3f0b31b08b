//! Tunable tile configurations for the backward-data kernels.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Lanes per hardware wave, fixed for the target ISA.
pub const WAVE_SIZE: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn data_byte(&self) -> u32 {
        match self {
            Precision::Fp32 => 4,
            Precision::Fp16 | Precision::Bf16 => 2,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Bf16 => "bf16",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorLayout {
    Nchw,
}

impl TensorLayout {
    pub fn tag(&self) -> &'static str {
        match self {
            TensorLayout::Nchw => "nchw",
        }
    }
}

/// Multiply-accumulate strategy of the generated kernel. The tag decides
/// how threads are distributed over a block, and therefore the block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FmaKind {
    Mac,
    Dlops,
    Xdlops,
}

impl FmaKind {
    pub fn tag(&self) -> &'static str {
        match self {
            FmaKind::Mac => "mac",
            FmaKind::Dlops => "dlops",
            FmaKind::Xdlops => "xdlops",
        }
    }
}

/// One tunable choice: per-block GEMM tile sizes, the thread/cluster
/// distribution of both operands, launch mode and boundary handling.
///
/// `nxe` enables the padded boundary path (`0` restricts the tunable to
/// unit convolutions); `nxb` is the tile granularity of the flattened
/// spatial "b" dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunableConfig {
    pub layout: TensorLayout,
    pub precision: Precision,
    pub fma: FmaKind,
    pub gemm_m_per_block: u32,
    pub gemm_n_per_block: u32,
    pub gemm_k_per_block: u32,
    // Mac/Dlops thread distribution.
    pub gemm_m_per_thread: u32,
    pub gemm_m_level0_cluster: u32,
    pub gemm_m_level1_cluster: u32,
    pub gemm_n_per_thread: u32,
    pub gemm_n_level0_cluster: u32,
    pub gemm_n_level1_cluster: u32,
    // Xdlops wave distribution.
    pub wave_tile_m: u32,
    pub wave_step_m: u32,
    pub wave_repeat_m: u32,
    pub wave_tile_n: u32,
    pub wave_step_n: u32,
    pub wave_repeat_n: u32,
    pub wave_tile_k: u32,
    // Per-operand load decomposition, [e, k, n0, n1b] order.
    pub tensor_a_thread_lengths: [u32; 4],
    pub tensor_a_cluster_lengths: [u32; 4],
    pub tensor_b_thread_lengths: [u32; 4],
    pub tensor_b_cluster_lengths: [u32; 4],
    pub gemm_n_unmerge_cluster: u32,
    pub multihead: bool,
    pub nxb: u32,
    pub nxe: u32,
}

impl TunableConfig {
    /// Threads per block, derived from the FMA strategy's distribution.
    pub fn block_size(&self) -> u32 {
        match self.fma {
            FmaKind::Mac | FmaKind::Dlops => {
                self.gemm_m_level0_cluster
                    * self.gemm_n_level0_cluster
                    * self.gemm_m_level1_cluster
                    * self.gemm_n_level1_cluster
            }
            FmaKind::Xdlops => {
                let waves_per_m = self.gemm_m_per_block
                    / (self.wave_tile_m * self.wave_step_m * self.wave_repeat_m);
                let waves_per_n = self.gemm_n_per_block
                    / (self.wave_tile_n * self.wave_step_n * self.wave_repeat_n);
                waves_per_m * waves_per_n * WAVE_SIZE
            }
        }
    }

    /// Shared-memory footprint of the double-buffered A/B tiles, in bytes.
    pub fn shared_mem_size(&self) -> u32 {
        let data_byte = self.precision.data_byte();
        let lds_a = data_byte * self.gemm_k_per_block * self.gemm_m_per_block;
        let lds_b = data_byte * self.gemm_k_per_block * self.gemm_n_per_block;
        2 * (lds_a.next_power_of_two() + lds_b.next_power_of_two()).next_power_of_two()
    }

    /// Combined cluster x thread extent of the b-operand "n0" dimension.
    pub fn nb_n0(&self) -> u32 {
        self.tensor_b_cluster_lengths[2] * self.tensor_b_thread_lengths[2]
    }

    /// Combined cluster x thread extent of the b-operand "n1b" dimension.
    pub fn nb_n1b(&self) -> u32 {
        self.tensor_b_cluster_lengths[3] * self.tensor_b_thread_lengths[3]
    }

    /// Batch sub-factor carried by one block of the n dimension.
    pub fn unmerge_sub_n(&self) -> u32 {
        self.gemm_n_per_block / self.nxb
    }

    /// Deterministic kernel name: precision, tile shape, layout and FMA
    /// strategy all participate, so distinct tunables never collide.
    pub fn kernel_name(&self) -> String {
        let mut name = format!(
            "igemm_bwd_gtc_{}_{}_{}_bx{}_ex{}_bt{}x{}x{}",
            self.layout.tag(),
            self.precision.tag(),
            self.fma.tag(),
            self.nxb,
            self.nxe,
            self.gemm_m_per_block,
            self.gemm_n_per_block,
            self.gemm_k_per_block,
        );
        match self.fma {
            FmaKind::Mac | FmaKind::Dlops => {
                let _ = write!(
                    name,
                    "_tt{}x{}_lc{}x{}x{}x{}",
                    self.gemm_m_per_thread,
                    self.gemm_n_per_thread,
                    self.gemm_m_level0_cluster,
                    self.gemm_n_level0_cluster,
                    self.gemm_m_level1_cluster,
                    self.gemm_n_level1_cluster,
                );
            }
            FmaKind::Xdlops => {
                let _ = write!(
                    name,
                    "_wt{}x{}x{}_ws{}x{}_wr{}x{}",
                    self.wave_tile_m,
                    self.wave_tile_n,
                    self.wave_tile_k,
                    self.wave_step_m,
                    self.wave_step_n,
                    self.wave_repeat_m,
                    self.wave_repeat_n,
                );
            }
        }
        let _ = write!(
            name,
            "_ta{}_{}_tb{}_{}",
            lengths_tag(&self.tensor_a_thread_lengths),
            lengths_tag(&self.tensor_a_cluster_lengths),
            lengths_tag(&self.tensor_b_thread_lengths),
            lengths_tag(&self.tensor_b_cluster_lengths),
        );
        if self.multihead {
            name.push_str("_mh");
        }
        name
    }

    /// Internal consistency of the tunable itself, independent of any
    /// problem shape. Problem-dependent admissibility lives in
    /// [`crate::validate`].
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.gemm_m_per_block > 0 && self.gemm_n_per_block > 0 && self.gemm_k_per_block > 0,
            "per-block tile sizes must be nonzero"
        );
        ensure!(self.nxb > 0, "nxb granularity must be nonzero");
        ensure!(
            self.gemm_n_per_block % self.nxb == 0,
            "gemm_n_per_block {} must be a multiple of nxb {}",
            self.gemm_n_per_block,
            self.nxb
        );
        match self.fma {
            FmaKind::Mac | FmaKind::Dlops => {
                ensure!(
                    self.gemm_m_per_thread * self.gemm_m_level0_cluster * self.gemm_m_level1_cluster
                        == self.gemm_m_per_block,
                    "m distribution does not cover gemm_m_per_block"
                );
                ensure!(
                    self.gemm_n_per_thread * self.gemm_n_level0_cluster * self.gemm_n_level1_cluster
                        == self.gemm_n_per_block,
                    "n distribution does not cover gemm_n_per_block"
                );
            }
            FmaKind::Xdlops => {
                ensure!(
                    self.gemm_m_per_block % (self.wave_tile_m * self.wave_step_m * self.wave_repeat_m)
                        == 0,
                    "wave m distribution does not divide gemm_m_per_block"
                );
                ensure!(
                    self.gemm_n_per_block % (self.wave_tile_n * self.wave_step_n * self.wave_repeat_n)
                        == 0,
                    "wave n distribution does not divide gemm_n_per_block"
                );
            }
        }
        let block = self.block_size();
        for (tensor, cluster) in [
            ("a", &self.tensor_a_cluster_lengths),
            ("b", &self.tensor_b_cluster_lengths),
        ] {
            let product: u32 = cluster.iter().product();
            ensure!(
                product == block,
                "tensor {} cluster lengths {:?} do not cover block size {}",
                tensor,
                cluster,
                block
            );
        }
        Ok(())
    }

    /// 64x64x16 classic-FMA tunable, 256 threads.
    pub fn mac_64x64x16() -> Self {
        Self {
            layout: TensorLayout::Nchw,
            precision: Precision::Fp32,
            fma: FmaKind::Mac,
            gemm_m_per_block: 64,
            gemm_n_per_block: 64,
            gemm_k_per_block: 16,
            gemm_m_per_thread: 4,
            gemm_m_level0_cluster: 4,
            gemm_m_level1_cluster: 4,
            gemm_n_per_thread: 4,
            gemm_n_level0_cluster: 4,
            gemm_n_level1_cluster: 4,
            wave_tile_m: 0,
            wave_step_m: 0,
            wave_repeat_m: 0,
            wave_tile_n: 0,
            wave_step_n: 0,
            wave_repeat_n: 0,
            wave_tile_k: 0,
            tensor_a_thread_lengths: [1, 4, 1, 1],
            tensor_a_cluster_lengths: [1, 4, 16, 4],
            tensor_b_thread_lengths: [1, 4, 1, 1],
            tensor_b_cluster_lengths: [1, 4, 4, 16],
            gemm_n_unmerge_cluster: 0,
            multihead: false,
            nxb: 16,
            nxe: 1,
        }
    }

    /// 64x64x16 xdlops tunable, 2x2 waves of 16x16 tiles.
    pub fn xdlops_64x64x16() -> Self {
        Self {
            layout: TensorLayout::Nchw,
            precision: Precision::Fp32,
            fma: FmaKind::Xdlops,
            gemm_m_per_block: 64,
            gemm_n_per_block: 64,
            gemm_k_per_block: 16,
            gemm_m_per_thread: 0,
            gemm_m_level0_cluster: 0,
            gemm_m_level1_cluster: 0,
            gemm_n_per_thread: 0,
            gemm_n_level0_cluster: 0,
            gemm_n_level1_cluster: 0,
            wave_tile_m: 16,
            wave_step_m: 1,
            wave_repeat_m: 2,
            wave_tile_n: 16,
            wave_step_n: 1,
            wave_repeat_n: 2,
            wave_tile_k: 1,
            tensor_a_thread_lengths: [1, 4, 1, 1],
            tensor_a_cluster_lengths: [1, 4, 8, 8],
            tensor_b_thread_lengths: [1, 4, 1, 1],
            tensor_b_cluster_lengths: [1, 4, 4, 16],
            gemm_n_unmerge_cluster: 0,
            multihead: false,
            nxb: 16,
            nxe: 1,
        }
    }

    /// 128x128x16 xdlops tunable, 2x2 waves of 32x32 tiles.
    pub fn xdlops_128x128x16() -> Self {
        Self {
            gemm_m_per_block: 128,
            gemm_n_per_block: 128,
            wave_tile_m: 32,
            wave_tile_n: 32,
            tensor_a_thread_lengths: [1, 8, 1, 1],
            tensor_a_cluster_lengths: [1, 2, 4, 32],
            tensor_b_thread_lengths: [1, 8, 1, 1],
            tensor_b_cluster_lengths: [1, 2, 8, 16],
            ..Self::xdlops_64x64x16()
        }
    }

    /// Multihead variant of the 64x64x16 xdlops tunable: all sub-GEMMs
    /// fold into one launch with device-side selection.
    pub fn xdlops_64x64x16_multihead() -> Self {
        Self {
            multihead: true,
            ..Self::xdlops_64x64x16()
        }
    }

    /// The built-in candidate table the benchmark harness sweeps.
    pub fn presets() -> Vec<TunableConfig> {
        vec![
            Self::mac_64x64x16(),
            Self::xdlops_64x64x16(),
            Self::xdlops_128x128x16(),
            Self::xdlops_64x64x16_multihead(),
        ]
    }
}

fn lengths_tag(lengths: &[u32; 4]) -> String {
    let mut tag = String::new();
    for (i, len) in lengths.iter().enumerate() {
        if i > 0 {
            tag.push('x');
        }
        let _ = write!(tag, "{len}");
    }
    tag
}
