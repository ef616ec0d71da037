//! # CPU primitives behind the dispatched kernels
//!
//! Each ISA module exposes the same small set of slice primitives:
//!
//! | Primitive | Used by |
//! |---|---|
//! | `axpy` | `bmm`, `conv2d_fwd` row accumulation |
//! | `adamw_update` | `adamw_fused_step` |
//!
//! Scalar versions are always available. AVX2 versions are compiled on
//! `x86_64` and only handed out after the host has been checked, so a
//! context built over simulated features never executes instructions the
//! machine lacks.

use std::sync::OnceLock;

use crate::cpu_features::CpuFeatures;

#[cfg(target_arch = "x86_64")]
pub mod avx2;
pub mod scalar;

/// `y += alpha * x` over `min(x.len(), y.len())` elements.
pub type AxpyFn = fn(f32, &[f32], &mut [f32]);

/// One fused AdamW update over equally sized slices.
pub type AdamwUpdateFn =
    fn(&AdamwCoeffs, &mut [f32], &mut [f32], &mut [f32], Option<&mut [f32]>, &[f32]);

/// Per-step AdamW coefficients, folded once per call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamwCoeffs {
    pub beta1: f32,
    pub beta2: f32,
    /// `1 - lr * weight_decay`.
    pub decay: f32,
    /// `lr / (1 - beta1^step)`.
    pub step_size: f32,
    /// `sqrt(1 - beta2^step)`.
    pub bias_correction2_sqrt: f32,
    pub eps: f32,
}

impl AdamwCoeffs {
    pub fn new(lr: f64, beta1: f64, beta2: f64, weight_decay: f64, eps: f64, step: i64) -> Self {
        let exponent = i32::try_from(step).unwrap_or(i32::MAX);
        let bias_correction1 = 1.0 - beta1.powi(exponent);
        let bias_correction2 = 1.0 - beta2.powi(exponent);
        AdamwCoeffs {
            beta1: beta1 as f32,
            beta2: beta2 as f32,
            decay: (1.0 - lr * weight_decay) as f32,
            step_size: (lr / bias_correction1) as f32,
            bias_correction2_sqrt: bias_correction2.sqrt() as f32,
            eps: eps as f32,
        }
    }
}

static HOST_AVX2: OnceLock<bool> = OnceLock::new();

/// Whether this machine can run the AVX2+FMA primitives.
pub fn host_has_avx2() -> bool {
    *HOST_AVX2.get_or_init(|| {
        let features = CpuFeatures::host();
        features.avx2 && features.fma
    })
}

pub fn avx2_axpy() -> AxpyFn {
    #[cfg(target_arch = "x86_64")]
    if host_has_avx2() {
        return avx2::axpy;
    }
    scalar::axpy
}

pub fn avx2_adamw_update() -> AdamwUpdateFn {
    #[cfg(target_arch = "x86_64")]
    if host_has_avx2() {
        return avx2::adamw_update;
    }
    scalar::adamw_update
}
