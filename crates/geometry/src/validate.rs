//! Admissibility of a tunable tile configuration for a given problem.
//!
//! Every rule must pass before any geometry-derived value is trusted for
//! a launch; a single violation rejects the whole configuration. Rejection
//! is an expected, recoverable outcome, distinct from launch failures.

use crate::conv::ConvDescriptor;
use crate::resolve::{resolve, ResolvedGeometry};
use crate::tunable::TunableConfig;

/// Check a tunable against a problem. `Err` names the violated rule.
pub fn check(desc: &ConvDescriptor, tunable: &TunableConfig) -> Result<(), String> {
    let geom = resolve(desc, tunable);
    check_resolved(desc, tunable, &geom)
}

pub fn is_valid(desc: &ConvDescriptor, tunable: &TunableConfig) -> bool {
    check(desc, tunable).is_ok()
}

/// Rule set over an already-resolved geometry, so callers that keep the
/// geometry around do not resolve twice.
pub fn check_resolved(
    desc: &ConvDescriptor,
    tunable: &TunableConfig,
    geom: &ResolvedGeometry,
) -> Result<(), String> {
    if geom.b == 0 {
        return Err("active output slice is empty".to_string());
    }
    if geom.gemm_n % tunable.gemm_n_per_block != 0 {
        return Err(format!(
            "gemm_n {} not divisible by gemm_n_per_block {}",
            geom.gemm_n, tunable.gemm_n_per_block
        ));
    }
    if tunable.gemm_n_per_block % tunable.nxb != 0 {
        return Err(format!(
            "gemm_n_per_block {} not divisible by nxb {}",
            tunable.gemm_n_per_block, tunable.nxb
        ));
    }
    if desc.n % (tunable.gemm_n_per_block / tunable.nxb) != 0 {
        return Err(format!(
            "batch size {} not divisible by gemm_n_per_block/nxb = {}",
            desc.n,
            tunable.gemm_n_per_block / tunable.nxb
        ));
    }
    if tunable.nxe == 0 && (geom.h_tilda_slice * geom.w_tilda_slice) % tunable.nxb != 0 {
        return Err(format!(
            "slice area {} not divisible by nxb {} with padding disabled",
            geom.h_tilda_slice * geom.w_tilda_slice,
            tunable.nxb
        ));
    }
    for sub in geom.sub_gemms(desc) {
        if !sub.is_empty() && sub.gemm_k % tunable.gemm_k_per_block != 0 {
            return Err(format!(
                "sub-GEMM {} gemm_k {} not divisible by gemm_k_per_block {}",
                sub.index, sub.gemm_k, tunable.gemm_k_per_block
            ));
        }
    }
    if tunable.nxe == 0 && !desc.is_unit_conv() {
        return Err("nxe == 0 only supports unit convolutions".to_string());
    }
    let n_vector_width = tunable.tensor_b_thread_lengths[3];
    if n_vector_width > 1
        && !desc.is_unit_conv()
        && (desc.ho() * desc.wo()) % n_vector_width != 0
    {
        return Err(format!(
            "output area {} not divisible by n-operand vector width {}",
            desc.ho() * desc.wo(),
            n_vector_width
        ));
    }
    Ok(())
}
