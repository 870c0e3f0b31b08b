//! Host-side launch geometry for tiled implicit-GEMM backward-data
//! convolutions.
//!
//! A strided or dilated backward-data convolution does not map onto one
//! dense GEMM. Its output positions split into `y_tilda * x_tilda`
//! disjoint regular sublattices, each of which is a dense sub-GEMM once
//! the active coordinate range is clipped. This crate owns that
//! decomposition and everything derived from it: the resolved geometry,
//! the admissibility rules for a tunable tile configuration, and the
//! magic-division encodings the device kernels use for index arithmetic.

pub mod conv;
pub mod magic;
pub mod math;
pub mod resolve;
pub mod tunable;
pub mod validate;

pub use conv::*;
pub use magic::*;
pub use math::*;
pub use resolve::*;
pub use tunable::*;
pub use validate::*;
