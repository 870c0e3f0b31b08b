//! Packed kernel-argument records shared with the device kernels.
//!
//! Field order and widths are a byte-exact contract with the compiled
//! kernels: pointer fields are 64-bit device addresses, everything else is
//! 32-bit, and there is no padding anywhere. Records are built once per
//! run and then mutated field-by-field as the launch loop walks the
//! sub-GEMMs; they have no identity beyond a single launch call.

use anyhow::anyhow;
use bytemuck::{Pod, Zeroable};

use tilegrad_geometry::{
    pack_shifts, ConvDescriptor, MagicDiv, ResolvedGeometry, SubGemm, TunableConfig,
};

use crate::runtime::DeviceBuffers;

/// Argument record of the backward-data GEMM kernels, 184 bytes.
///
/// `k` and `c` carry per-group counts. `dtile_*`/`dslice_*` carry the
/// tilda decomposition; in multihead mode `dtile_iy`/`dtile_ix` are
/// repurposed for the per-head grid size and the packed dot pair, and
/// `dslice_y`/`dslice_x` for the filter-size remainders.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BwdKernelArgs {
    pub dinput: u64,
    pub weights: u64,
    pub doutput: u64,
    pub hi: i32,
    pub wi: i32,
    pub n: i32,
    pub k: i32,
    pub c: i32,
    pub ho: i32,
    pub wo: i32,
    pub stride_h: i32,
    pub stride_w: i32,
    pub dilation_h: i32,
    pub dilation_w: i32,
    pub pad_h: i32,
    pub pad_w: i32,
    pub y: i32,
    pub x: i32,
    pub dtile_iy: i32,
    pub dtile_ix: i32,
    pub dtile_dy: i32,
    pub dtile_dx: i32,
    pub dtile_y: i32,
    pub dtile_x: i32,
    pub dtile_h: i32,
    pub dtile_w: i32,
    pub dslice_y: i32,
    pub dslice_x: i32,
    pub dslice_h: i32,
    pub dslice_w: i32,
    pub dslice_h_left: i32,
    pub dslice_w_left: i32,
    pub group: i32,
    pub magic_0: u32,
    pub magic_1: u32,
    pub magic_2: u32,
    pub magic_3: u32,
    pub magic_4: u32,
    pub magic_5: u32,
    pub magic_6: u32,
    pub shift_pack_0: u32,
    pub shift_pack_1: u32,
    pub pack_0: u32,
}

impl BwdKernelArgs {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build the run-invariant part of the record. The per-sub-GEMM
    /// fields start zeroed and are filled by [`Self::select_sub_gemm`] or
    /// [`Self::select_multihead`].
    pub fn new(
        buffers: DeviceBuffers,
        desc: &ConvDescriptor,
        tunable: &TunableConfig,
        geom: &ResolvedGeometry,
    ) -> Self {
        let unmerge_sub_n1 = if tunable.gemm_n_unmerge_cluster == 0 {
            tunable.unmerge_sub_n() / tunable.nb_n0()
        } else {
            tunable.unmerge_sub_n()
        };

        // Division roles, in kernel argument order: block-grid size,
        // per-block n stride, unmerge stride, slice area, slice width.
        let mdiv_2 = MagicDiv::generate(
            geom.gemm_m.div_ceil(tunable.gemm_m_per_block)
                * geom.gemm_n.div_ceil(tunable.gemm_n_per_block),
        );
        let mdiv_3 = MagicDiv::generate(geom.gemm_n / tunable.gemm_n_per_block);
        let mdiv_4 = MagicDiv::generate(if tunable.gemm_n_unmerge_cluster == 0 {
            geom.b * unmerge_sub_n1 / tunable.nb_n1b()
        } else {
            (desc.n / tunable.nb_n0() * geom.b) / tunable.nb_n1b()
        });
        let mdiv_5 = MagicDiv::generate(geom.b);
        let mdiv_6 = MagicDiv::generate(geom.w_tilda_slice);

        Self {
            dinput: buffers.dinput,
            weights: buffers.weights,
            doutput: buffers.doutput,
            hi: desc.hi as i32,
            wi: desc.wi as i32,
            n: desc.n as i32,
            k: desc.k_per_group() as i32,
            c: desc.c_per_group() as i32,
            ho: desc.ho() as i32,
            wo: desc.wo() as i32,
            stride_h: desc.stride_h as i32,
            stride_w: desc.stride_w as i32,
            dilation_h: desc.dilation_h as i32,
            dilation_w: desc.dilation_w as i32,
            pad_h: desc.pad_h as i32,
            pad_w: desc.pad_w as i32,
            y: desc.y as i32,
            x: desc.x as i32,
            dtile_iy: 0,
            dtile_ix: 0,
            dtile_dy: geom.dtile_dy as i32,
            dtile_dx: geom.dtile_dx as i32,
            dtile_y: geom.y_tilda as i32,
            dtile_x: geom.x_tilda as i32,
            dtile_h: geom.h_tilda as i32,
            dtile_w: geom.w_tilda as i32,
            dslice_y: 0,
            dslice_x: 0,
            dslice_h: geom.h_tilda_slice as i32,
            dslice_w: geom.w_tilda_slice as i32,
            dslice_h_left: geom.h_tilda_left as i32,
            dslice_w_left: geom.w_tilda_left as i32,
            group: desc.group as i32,
            magic_0: 0,
            magic_1: 0,
            magic_2: mdiv_2.magic,
            magic_3: mdiv_3.magic,
            magic_4: mdiv_4.magic,
            magic_5: mdiv_5.magic,
            magic_6: mdiv_6.magic,
            shift_pack_0: pack_shifts(0, 0, mdiv_2.shift, mdiv_3.shift),
            shift_pack_1: pack_shifts(mdiv_4.shift, mdiv_5.shift, mdiv_6.shift, 0),
            pack_0: 0,
        }
    }

    /// Point the record at one sub-GEMM. The per-sub-GEMM division
    /// constants are recomputed; the run-invariant shifts in the high
    /// half of `shift_pack_0` are kept.
    pub fn select_sub_gemm(&mut self, sub: &SubGemm) {
        self.dtile_iy = sub.i_y_tilda as i32;
        self.dtile_ix = sub.i_x_tilda as i32;
        self.dslice_y = sub.y_dot_slice as i32;
        self.dslice_x = sub.x_dot_slice as i32;
        let (mdiv_0, mdiv_1) = if sub.is_empty() {
            (MagicDiv::ZERO, MagicDiv::ZERO)
        } else {
            (
                MagicDiv::generate(sub.y_dot_slice * sub.x_dot_slice),
                MagicDiv::generate(sub.x_dot_slice),
            )
        };
        self.magic_0 = mdiv_0.magic;
        self.magic_1 = mdiv_1.magic;
        self.shift_pack_0 =
            (self.shift_pack_0 & 0xffff_0000) | pack_shifts(mdiv_0.shift, mdiv_1.shift, 0, 0);
    }

    /// Fold every sub-GEMM into one launch: the kernel recovers its
    /// sub-GEMM index from the block index via the per-head grid size,
    /// the packed dot pair and the filter-size remainders.
    pub fn select_multihead(
        &mut self,
        origin_grid_size: u32,
        desc: &ConvDescriptor,
        geom: &ResolvedGeometry,
    ) {
        self.dtile_iy = origin_grid_size as i32;
        self.dtile_ix = (geom.x_dot | (geom.y_dot << 16)) as i32;
        self.dslice_y = (desc.y % geom.y_dot) as i32;
        self.dslice_x = (desc.x % geom.x_dot) as i32;
        self.magic_0 = 0;
        self.magic_1 = 0;
        self.shift_pack_0 &= 0xffff_0000;
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        bytemuck::try_from_bytes(bytes)
            .copied()
            .map_err(|err| anyhow!("argument record decode failed: {err}"))
    }
}

/// Argument record of the dedicated upsampling-clear kernel, 88 bytes.
/// Used when the zero-fill strategy runs a kernel instead of a device
/// memset; carries magic divisors for `wi` and both strides.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UpsamplingClearArgs {
    pub dinput: u64,
    pub hi: i32,
    pub wi: i32,
    pub n: i32,
    pub k: i32,
    pub c: i32,
    pub ho: i32,
    pub wo: i32,
    pub stride_h: i32,
    pub stride_w: i32,
    pub dilation_h: i32,
    pub dilation_w: i32,
    pub pad_h: i32,
    pub pad_w: i32,
    pub y: i32,
    pub x: i32,
    pub group: i32,
    pub magic_0: u32,
    pub magic_1: u32,
    pub magic_2: u32,
    pub shift_pack_0: u32,
}

impl UpsamplingClearArgs {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(dinput: u64, desc: &ConvDescriptor) -> Self {
        let mdiv_0 = MagicDiv::generate(desc.wi);
        let mdiv_1 = MagicDiv::generate(desc.stride_h);
        let mdiv_2 = MagicDiv::generate(desc.stride_w);
        Self {
            dinput,
            hi: desc.hi as i32,
            wi: desc.wi as i32,
            n: desc.n as i32,
            k: desc.k_per_group() as i32,
            c: desc.c_per_group() as i32,
            ho: desc.ho() as i32,
            wo: desc.wo() as i32,
            stride_h: desc.stride_h as i32,
            stride_w: desc.stride_w as i32,
            dilation_h: desc.dilation_h as i32,
            dilation_w: desc.dilation_w as i32,
            pad_h: desc.pad_h as i32,
            pad_w: desc.pad_w as i32,
            y: desc.y as i32,
            x: desc.x as i32,
            group: desc.group as i32,
            magic_0: mdiv_0.magic,
            magic_1: mdiv_1.magic,
            magic_2: mdiv_2.magic,
            shift_pack_0: pack_shifts(mdiv_0.shift, mdiv_1.shift, mdiv_2.shift, 0),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Name of the clear kernel matching a tunable's layout and precision.
pub fn upsampling_clear_kernel_name(tunable: &TunableConfig) -> String {
    format!(
        "igemm_upsampling_clear_{}_{}",
        tunable.layout.tag(),
        tunable.precision.tag()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilegrad_geometry::resolve;

    fn stride2_3x3() -> ConvDescriptor {
        ConvDescriptor {
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
        }
    }

    fn buffers() -> DeviceBuffers {
        DeviceBuffers {
            dinput: 0x1000_0000,
            weights: 0x2000_0000,
            doutput: 0x3000_0000,
        }
    }

    #[test]
    fn record_sizes_match_the_kernel_contract() {
        assert_eq!(BwdKernelArgs::SIZE, 184);
        assert_eq!(UpsamplingClearArgs::SIZE, 88);
    }

    #[test]
    fn encode_decode_round_trips_bit_for_bit() {
        let desc = stride2_3x3();
        let tunable = TunableConfig::mac_64x64x16();
        let geom = resolve(&desc, &tunable);

        let mut args = BwdKernelArgs::new(buffers(), &desc, &tunable, &geom);
        let sub = geom.sub_gemms(&desc).next().unwrap();
        args.select_sub_gemm(&sub);

        let bytes = args.as_bytes().to_vec();
        assert_eq!(bytes.len(), BwdKernelArgs::SIZE);
        let decoded = BwdKernelArgs::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, args);
        assert_eq!(decoded.as_bytes(), &bytes[..]);
    }

    #[test]
    fn static_fields_carry_geometry_and_per_group_channels() {
        let desc = stride2_3x3();
        let tunable = TunableConfig::mac_64x64x16();
        let geom = resolve(&desc, &tunable);
        let args = BwdKernelArgs::new(buffers(), &desc, &tunable, &geom);

        assert_eq!({ args.k }, 64);
        assert_eq!({ args.c }, 64);
        assert_eq!({ args.dtile_y }, 2);
        assert_eq!({ args.dtile_x }, 2);
        assert_eq!({ args.dslice_h }, 8);
        assert_eq!({ args.dslice_w_left }, 0);
        assert_eq!({ args.magic_5 }, MagicDiv::generate(geom.b).magic);
        assert_eq!(
            { args.magic_6 },
            MagicDiv::generate(geom.w_tilda_slice).magic
        );
        assert_eq!({ args.magic_0 }, 0);
    }

    #[test]
    fn sub_gemm_selection_keeps_static_shifts() {
        let desc = stride2_3x3();
        let tunable = TunableConfig::mac_64x64x16();
        let geom = resolve(&desc, &tunable);
        let mut args = BwdKernelArgs::new(buffers(), &desc, &tunable, &geom);
        let static_high = { args.shift_pack_0 } & 0xffff_0000;

        for sub in geom.sub_gemms(&desc) {
            args.select_sub_gemm(&sub);
            assert_eq!({ args.shift_pack_0 } & 0xffff_0000, static_high);
            assert_eq!({ args.dtile_iy }, sub.i_y_tilda as i32);
            assert_eq!({ args.dslice_x }, sub.x_dot_slice as i32);
            if !sub.is_empty() {
                let expected = MagicDiv::generate(sub.y_dot_slice * sub.x_dot_slice);
                assert_eq!({ args.magic_0 }, expected.magic);
            }
        }
    }

    #[test]
    fn multihead_packs_the_dot_pair() {
        let desc = stride2_3x3();
        let tunable = TunableConfig::xdlops_64x64x16_multihead();
        let geom = resolve(&desc, &tunable);
        let mut args = BwdKernelArgs::new(buffers(), &desc, &tunable, &geom);

        args.select_multihead(128, &desc, &geom);
        assert_eq!({ args.dtile_iy }, 128);
        assert_eq!({ args.dtile_ix }, (geom.x_dot | (geom.y_dot << 16)) as i32);
        assert_eq!({ args.dslice_y }, (desc.y % geom.y_dot) as i32);
        assert_eq!({ args.magic_0 }, 0);
    }

    #[test]
    fn clear_args_encode_the_stride_divisors() {
        let desc = stride2_3x3();
        let args = UpsamplingClearArgs::new(0x1000_0000, &desc);
        assert_eq!({ args.magic_0 }, MagicDiv::generate(desc.wi).magic);
        assert_eq!({ args.magic_1 }, MagicDiv::generate(desc.stride_h).magic);
        assert_eq!(args.as_bytes().len(), UpsamplingClearArgs::SIZE);
    }
}
