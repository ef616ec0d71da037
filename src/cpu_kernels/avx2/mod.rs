//! AVX2+FMA primitives.
//!
//! The safe entry points here must only be reached through
//! [`crate::cpu_kernels::avx2_axpy`] and friends, which check the host first.

use std::arch::x86_64::*;

use crate::cpu_kernels::AdamwCoeffs;

const LANES: usize = 8;

pub(super) fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    // SAFETY: handed out only when the host reports avx2 and fma.
    unsafe { axpy_fma(alpha, x, y) }
}

#[target_feature(enable = "avx2")]
#[target_feature(enable = "fma")]
unsafe fn axpy_fma(alpha: f32, x: &[f32], y: &mut [f32]) {
    let n = x.len().min(y.len());
    let va = _mm256_set1_ps(alpha);
    let mut i = 0;
    while i + LANES <= n {
        let vx = _mm256_loadu_ps(x.as_ptr().add(i));
        let vy = _mm256_loadu_ps(y.as_ptr().add(i));
        _mm256_storeu_ps(y.as_mut_ptr().add(i), _mm256_fmadd_ps(va, vx, vy));
        i += LANES;
    }
    while i < n {
        y[i] = alpha.mul_add(x[i], y[i]);
        i += 1;
    }
}

pub(super) fn adamw_update(
    c: &AdamwCoeffs,
    param: &mut [f32],
    exp_avg: &mut [f32],
    exp_avg_sq: &mut [f32],
    max_exp_avg_sq: Option<&mut [f32]>,
    grad: &[f32],
) {
    let n = param.len();
    assert!(exp_avg.len() >= n && exp_avg_sq.len() >= n && grad.len() >= n);
    if let Some(max) = max_exp_avg_sq.as_deref() {
        assert!(max.len() >= n);
    }
    // SAFETY: host checked before this function is handed out; lengths
    // asserted above.
    unsafe { adamw_update_fma(c, param, exp_avg, exp_avg_sq, max_exp_avg_sq, grad) }
}

#[target_feature(enable = "avx2")]
#[target_feature(enable = "fma")]
unsafe fn adamw_update_fma(
    c: &AdamwCoeffs,
    param: &mut [f32],
    exp_avg: &mut [f32],
    exp_avg_sq: &mut [f32],
    mut max_exp_avg_sq: Option<&mut [f32]>,
    grad: &[f32],
) {
    let n = param.len();
    let beta1 = _mm256_set1_ps(c.beta1);
    let beta2 = _mm256_set1_ps(c.beta2);
    let one_minus_beta1 = _mm256_set1_ps(1.0 - c.beta1);
    let one_minus_beta2 = _mm256_set1_ps(1.0 - c.beta2);
    let decay = _mm256_set1_ps(c.decay);
    let step_size = _mm256_set1_ps(c.step_size);
    let bc2_sqrt = _mm256_set1_ps(c.bias_correction2_sqrt);
    let eps = _mm256_set1_ps(c.eps);

    let mut i = 0;
    while i + LANES <= n {
        let g = _mm256_loadu_ps(grad.as_ptr().add(i));
        let p = _mm256_mul_ps(_mm256_loadu_ps(param.as_ptr().add(i)), decay);
        let m = _mm256_fmadd_ps(
            beta1,
            _mm256_loadu_ps(exp_avg.as_ptr().add(i)),
            _mm256_mul_ps(one_minus_beta1, g),
        );
        let v = _mm256_fmadd_ps(
            beta2,
            _mm256_loadu_ps(exp_avg_sq.as_ptr().add(i)),
            _mm256_mul_ps(_mm256_mul_ps(one_minus_beta2, g), g),
        );
        _mm256_storeu_ps(exp_avg.as_mut_ptr().add(i), m);
        _mm256_storeu_ps(exp_avg_sq.as_mut_ptr().add(i), v);

        let second = match max_exp_avg_sq.as_deref_mut() {
            Some(max) => {
                let mx = _mm256_max_ps(_mm256_loadu_ps(max.as_ptr().add(i)), v);
                _mm256_storeu_ps(max.as_mut_ptr().add(i), mx);
                mx
            }
            None => v,
        };
        let denom = _mm256_add_ps(_mm256_div_ps(_mm256_sqrt_ps(second), bc2_sqrt), eps);
        let update = _mm256_div_ps(_mm256_mul_ps(step_size, m), denom);
        _mm256_storeu_ps(param.as_mut_ptr().add(i), _mm256_sub_ps(p, update));
        i += LANES;
    }

    if i < n {
        let tail_max = max_exp_avg_sq.map(|max| &mut max[i..n]);
        crate::cpu_kernels::scalar::adamw_update(
            c,
            &mut param[i..n],
            &mut exp_avg[i..n],
            &mut exp_avg_sq[i..n],
            tail_max,
            &grad[i..n],
        );
    }
}
