//! Operator frontends and their built-in kernels.

pub mod adamw;
pub mod conv;
pub mod matmul;

use crate::binary_support::BinarySupportSet;
use crate::dispatch::{KernelRegistry, OpId};
use crate::error::AccelResult;

pub const BMM: OpId = OpId::new("bmm");
pub const CONV2D_FWD: OpId = OpId::new("conv2d_fwd");
pub const ADAMW_FUSED_STEP: OpId = OpId::new("adamw_fused_step");

pub use adamw::{adamw_fused_step, AdamwBuffers, AdamwHyperParams};
pub use conv::{conv2d, Conv2dParams, ConvPlan};
pub use matmul::{matmul, matmul_out, MatmulPlan};

/// Register the DEFAULT kernel of every built-in op, plus the vectorized
/// kernels `binary` says this build carries.
pub fn register_builtin_kernels(
    registry: &KernelRegistry,
    binary: &BinarySupportSet,
) -> AccelResult<()> {
    matmul::register_kernels(registry, binary)?;
    conv::register_kernels(registry, binary)?;
    adamw::register_kernels(registry, binary)?;
    Ok(())
}
