use crate::cpu_kernels::AdamwCoeffs;

pub fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

pub fn adamw_update(
    c: &AdamwCoeffs,
    param: &mut [f32],
    exp_avg: &mut [f32],
    exp_avg_sq: &mut [f32],
    mut max_exp_avg_sq: Option<&mut [f32]>,
    grad: &[f32],
) {
    let n = param.len();
    for i in 0..n {
        let g = grad[i];
        let p = param[i] * c.decay;
        let m = c.beta1 * exp_avg[i] + (1.0 - c.beta1) * g;
        let v = c.beta2 * exp_avg_sq[i] + (1.0 - c.beta2) * g * g;
        exp_avg[i] = m;
        exp_avg_sq[i] = v;

        let second = match max_exp_avg_sq.as_deref_mut() {
            Some(max) => {
                max[i] = max[i].max(v);
                max[i]
            }
            None => v,
        };
        let denom = second.sqrt() / c.bias_correction2_sqrt + c.eps;
        param[i] = p - c.step_size * m / denom;
    }
}
