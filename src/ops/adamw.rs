//! Fused AdamW optimizer step with decoupled weight decay.
//!
//! Updates `param`, both moment buffers and (with `amsgrad`) the running
//! maximum of the second moment in place. When `param2` is non-empty it
//! receives the bf16 rounding of the updated parameters.

use half::bf16;

use crate::binary_support::BinarySupportSet;
use crate::context::CpuContext;
use crate::cpu_kernels::{self, AdamwCoeffs, AdamwUpdateFn};
use crate::dispatch::KernelRegistry;
use crate::error::{AccelError, AccelResult};
use crate::isa::CapabilityLevel;
use crate::ops::ADAMW_FUSED_STEP;

/// `adamw_fused_step` kernel.
pub type AdamwKernel = fn(&AdamwCoeffs, &mut AdamwBuffers<'_>, bool);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamwHyperParams {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub weight_decay: f64,
    pub eps: f64,
    /// One-based step count.
    pub step: i64,
    pub amsgrad: bool,
}

impl Default for AdamwHyperParams {
    fn default() -> Self {
        AdamwHyperParams {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 1e-2,
            eps: 1e-8,
            step: 1,
            amsgrad: false,
        }
    }
}

impl AdamwHyperParams {
    fn check(&self) -> AccelResult<()> {
        let invalid = |msg: String| Err(AccelError::InvalidArgument(msg));
        if self.lr.is_nan() || self.lr < 0.0 {
            return invalid(format!("expect learning rate >= 0.0, got {}", self.lr));
        }
        if self.eps.is_nan() || self.eps < 0.0 {
            return invalid(format!("expect eps >= 0.0, got {}", self.eps));
        }
        if !(0.0..1.0).contains(&self.beta1) {
            return invalid(format!("expect 0.0 <= beta1 < 1.0, got {}", self.beta1));
        }
        if !(0.0..1.0).contains(&self.beta2) {
            return invalid(format!("expect 0.0 <= beta2 < 1.0, got {}", self.beta2));
        }
        if self.weight_decay.is_nan() || self.weight_decay < 0.0 {
            return invalid(format!("expect weight_decay >= 0.0, got {}", self.weight_decay));
        }
        if self.step < 1 {
            return invalid(format!("expect step >= 1, got {}", self.step));
        }
        Ok(())
    }

    fn coeffs(&self) -> AdamwCoeffs {
        AdamwCoeffs::new(self.lr, self.beta1, self.beta2, self.weight_decay, self.eps, self.step)
    }
}

/// Optimizer state for one parameter tensor.
#[derive(Debug)]
pub struct AdamwBuffers<'a> {
    pub param: &'a mut [f32],
    pub exp_avg: &'a mut [f32],
    pub exp_avg_sq: &'a mut [f32],
    /// Only read when `amsgrad` is set; may be empty otherwise.
    pub max_exp_avg_sq: &'a mut [f32],
    pub grad: &'a [f32],
    /// bf16 copy of `param`, or empty.
    pub param2: &'a mut [bf16],
}

impl AdamwBuffers<'_> {
    fn check(&self, amsgrad: bool) -> AccelResult<()> {
        let n = self.param.len();
        let same = |name: &str, len: usize| {
            if len == n {
                Ok(())
            } else {
                Err(AccelError::ShapeMismatch(format!(
                    "expect param and {} to have the same size, param: {}; {}: {}",
                    name, n, name, len
                )))
            }
        };
        same("grad", self.grad.len())?;
        same("exp_avg", self.exp_avg.len())?;
        same("exp_avg_sq", self.exp_avg_sq.len())?;
        if amsgrad {
            same("max_exp_avg_sq", self.max_exp_avg_sq.len())?;
        }
        if !self.param2.is_empty() {
            same("param2", self.param2.len())?;
        }
        Ok(())
    }
}

/// One fused AdamW step. Arguments are checked before any buffer is touched.
pub fn adamw_fused_step(
    ctx: &CpuContext,
    mut buffers: AdamwBuffers<'_>,
    hyper: &AdamwHyperParams,
) -> AccelResult<()> {
    hyper.check()?;
    buffers.check(hyper.amsgrad)?;
    let kernel = ctx.resolve::<AdamwKernel>(ADAMW_FUSED_STEP)?;
    kernel(&hyper.coeffs(), &mut buffers, hyper.amsgrad);
    Ok(())
}

// ── Kernels ─────────────────────────────────────────────────────────────

fn adamw_with(
    c: &AdamwCoeffs,
    buffers: &mut AdamwBuffers<'_>,
    amsgrad: bool,
    update: AdamwUpdateFn,
) {
    let max = if amsgrad {
        Some(&mut *buffers.max_exp_avg_sq)
    } else {
        None
    };
    update(c, buffers.param, buffers.exp_avg, buffers.exp_avg_sq, max, buffers.grad);
    if !buffers.param2.is_empty() {
        for (dst, &p) in buffers.param2.iter_mut().zip(buffers.param.iter()) {
            *dst = bf16::from_f32(p);
        }
    }
}

fn adamw_default(c: &AdamwCoeffs, buffers: &mut AdamwBuffers<'_>, amsgrad: bool) {
    adamw_with(c, buffers, amsgrad, cpu_kernels::scalar::adamw_update);
}

fn adamw_avx2(c: &AdamwCoeffs, buffers: &mut AdamwBuffers<'_>, amsgrad: bool) {
    adamw_with(c, buffers, amsgrad, cpu_kernels::avx2_adamw_update());
}

pub(crate) fn register_kernels(
    registry: &KernelRegistry,
    binary: &BinarySupportSet,
) -> AccelResult<()> {
    registry.register::<AdamwKernel>(ADAMW_FUSED_STEP, CapabilityLevel::Default, adamw_default)?;
    if binary.contains(CapabilityLevel::Avx2) {
        registry.register::<AdamwKernel>(ADAMW_FUSED_STEP, CapabilityLevel::Avx2, adamw_avx2)?;
    }
    Ok(())
}
