//! Operator frontends against naive references, on every kernel tier the
//! host can run.

use half::bf16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cpu_accel::descriptor::FormatTag;
use cpu_accel::ops::{
    self, conv::ConvPlan, AdamwBuffers, AdamwHyperParams, Conv2dParams, MatmulPlan,
};
use cpu_accel::{
    AccelConfig, AccelError, BinarySupportSet, CapabilityLevel, CpuContext, Fp32MathMode, Tensor,
};

fn contexts() -> Vec<CpuContext> {
    [CapabilityLevel::Default, CapabilityLevel::Avx2]
        .into_iter()
        .map(|level| {
            CpuContext::builder()
                .cpu_level(level)
                .binary_support(BinarySupportSet::up_to(level))
                .config(AccelConfig::default())
                .build()
        })
        .collect()
}

fn random(rng: &mut StdRng, shape: &[usize]) -> Tensor {
    Tensor::from_fn(shape.to_vec(), |_| rng.gen_range(-1.0..1.0))
}

fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tol * (1.0 + e.abs()), "index {}: {} vs {}", i, a, e);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// matmul
// ═══════════════════════════════════════════════════════════════════════

/// Batched `[.., m, k] x [.., k, n]` with explicit broadcasting.
fn reference_matmul(a: &Tensor, b: &Tensor) -> Vec<f32> {
    let a_shape = if a.ndim() == 1 { vec![1, a.shape()[0]] } else { a.shape().to_vec() };
    let b_shape = if b.ndim() == 1 { vec![b.shape()[0], 1] } else { b.shape().to_vec() };
    let (m, k) = (a_shape[a_shape.len() - 2], a_shape[a_shape.len() - 1]);
    let n = b_shape[b_shape.len() - 1];
    let a_batch = &a_shape[..a_shape.len() - 2];
    let b_batch = &b_shape[..b_shape.len() - 2];
    let rank = a_batch.len().max(b_batch.len());
    let pad = |s: &[usize]| {
        let mut v = vec![1; rank - s.len()];
        v.extend_from_slice(s);
        v
    };
    let (pa, pb) = (pad(a_batch), pad(b_batch));
    let out_batch: Vec<usize> = pa.iter().zip(&pb).map(|(x, y)| *x.max(y)).collect();
    let batches: usize = out_batch.iter().product();

    let flat = |shape: &[usize], coords: &[usize]| {
        shape
            .iter()
            .zip(coords)
            .fold(0, |acc, (&s, &c)| acc * s + if s == 1 { 0 } else { c })
    };

    let mut out = Vec::with_capacity(batches * m * n);
    for bi in 0..batches {
        let mut coords = vec![0; rank];
        let mut rem = bi;
        for axis in (0..rank).rev() {
            coords[axis] = rem % out_batch[axis];
            rem /= out_batch[axis];
        }
        let (ao, bo) = (flat(&pa, &coords) * m * k, flat(&pb, &coords) * k * n);
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f32;
                for p in 0..k {
                    acc += a.data()[ao + i * k + p] * b.data()[bo + p * n + j];
                }
                out.push(acc);
            }
        }
    }
    out
}

#[test]
fn matmul_matches_reference_for_every_rank_combination() {
    let cases: &[(&[usize], &[usize], &[usize])] = &[
        (&[7], &[7], &[]),
        (&[4, 7], &[7], &[4]),
        (&[7], &[7, 5], &[5]),
        (&[4, 7], &[7, 5], &[4, 5]),
        (&[3, 4, 7], &[7, 5], &[3, 4, 5]),
        (&[2, 3, 4, 7], &[7], &[2, 3, 4]),
        (&[7], &[3, 7, 5], &[3, 5]),
        (&[4, 7], &[3, 7, 5], &[3, 4, 5]),
        (&[3, 4, 7], &[3, 7, 5], &[3, 4, 5]),
        (&[2, 1, 4, 7], &[3, 7, 5], &[2, 3, 4, 5]),
        (&[3, 4, 7], &[7, 1], &[3, 4, 1]),
        (&[2, 3, 4, 7], &[7, 3], &[2, 3, 4, 3]),
    ];
    let mut rng = StdRng::seed_from_u64(7);
    for ctx in contexts() {
        for (a_shape, b_shape, out_shape) in cases {
            let a = random(&mut rng, a_shape);
            let b = random(&mut rng, b_shape);
            let c = ops::matmul(&ctx, &a, &b).unwrap();
            assert_eq!(c.shape(), *out_shape, "{:?} x {:?}", a_shape, b_shape);
            assert_close(c.data(), &reference_matmul(&a, &b), 1e-4);
        }
    }
}

#[test]
fn matmul_out_requires_exact_length() {
    let ctx = &contexts()[0];
    let a = Tensor::from_fn(vec![2, 3], |i| i as f32);
    let b = Tensor::from_fn(vec![3, 4], |i| i as f32);

    let mut short = vec![0.0; 7];
    assert!(matches!(
        ops::matmul_out(ctx, &a, &b, &mut short),
        Err(AccelError::IncompatibleOutput(_))
    ));
    assert!(ctx.descriptor_cache::<MatmulPlan>().is_empty());

    let mut exact = vec![0.0; 8];
    let shape = ops::matmul_out(ctx, &a, &b, &mut exact).unwrap();
    assert_eq!(shape, vec![2, 4]);
    assert_eq!(exact, ops::matmul(ctx, &a, &b).unwrap().into_data());
}

#[test]
fn matmul_plans_are_reused_per_shape() {
    let ctx = &contexts()[0];
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..3 {
        let a = random(&mut rng, &[8, 16]);
        let b = random(&mut rng, &[16, 4]);
        ops::matmul(ctx, &a, &b).unwrap();
    }
    let a = random(&mut rng, &[8, 16]);
    let b = random(&mut rng, &[16, 5]);
    ops::matmul(ctx, &a, &b).unwrap();

    let stats = ctx.descriptor_cache::<MatmulPlan>().stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.hits, 2);
}

#[test]
fn bf32_mode_rounds_inputs_to_bf16() {
    let ctx = CpuContext::builder()
        .cpu_level(CapabilityLevel::Default)
        .config(AccelConfig::default().with_math_mode(Fp32MathMode::Bf32))
        .build();
    let a = Tensor::new(vec![1, 1], vec![1.0 + 1.0 / 512.0]).unwrap();
    let b = Tensor::new(vec![1, 1], vec![1.0]).unwrap();
    let c = ops::matmul(&ctx, &a, &b).unwrap();
    assert_eq!(c.data()[0], bf16::from_f32(1.0 + 1.0 / 512.0).to_f32());
    assert_eq!(c.data()[0], 1.0);
}

#[test]
fn matmul_shape_errors() {
    let ctx = &contexts()[0];
    let scalar = Tensor::zeros(vec![]);
    let v = Tensor::zeros(vec![3]);
    assert!(matches!(ops::matmul(ctx, &scalar, &v), Err(AccelError::InvalidArgument(_))));
    let m = Tensor::zeros(vec![2, 4]);
    assert!(matches!(ops::matmul(ctx, &m, &v), Err(AccelError::ShapeMismatch(_))));
}

// ═══════════════════════════════════════════════════════════════════════
// conv2d
// ═══════════════════════════════════════════════════════════════════════

/// NCHW direct convolution.
fn reference_conv(
    src: &Tensor,
    w: &Tensor,
    bias: Option<&Tensor>,
    p: &Conv2dParams,
) -> (Vec<usize>, Vec<f32>) {
    let [n, c, h, wd] = [src.shape()[0], src.shape()[1], src.shape()[2], src.shape()[3]];
    let [oc, icg, kh, kw] = [w.shape()[0], w.shape()[1], w.shape()[2], w.shape()[3]];
    let ocg = oc / p.groups;
    let extent = |input: usize, k: usize, axis: usize| {
        let padded = input + p.padding_l[axis] + p.padding_r[axis];
        (padded - ((k - 1) * p.dilation[axis] + 1)) / p.strides[axis] + 1
    };
    let (oh, ow) = (extent(h, kh, 0), extent(wd, kw, 1));
    let mut out = vec![0.0; n * oc * oh * ow];
    for b in 0..n {
        for o in 0..oc {
            let g = o / ocg;
            for y in 0..oh {
                for x in 0..ow {
                    let mut acc = bias.map_or(0.0, |t| t.data()[o]);
                    for il in 0..icg {
                        let ic = g * icg + il;
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (y * p.strides[0] + ky * p.dilation[0]) as isize
                                    - p.padding_l[0] as isize;
                                let ix = (x * p.strides[1] + kx * p.dilation[1]) as isize
                                    - p.padding_l[1] as isize;
                                if iy < 0 || ix < 0 || iy >= h as isize || ix >= wd as isize {
                                    continue;
                                }
                                let (iy, ix) = (iy as usize, ix as usize);
                                let sv = src.data()[((b * c + ic) * h + iy) * wd + ix];
                                let wv = w.data()[((o * icg + il) * kh + ky) * kw + kx];
                                acc += sv * wv;
                            }
                        }
                    }
                    out[((b * oc + o) * oh + y) * ow + x] = acc;
                }
            }
        }
    }
    (vec![n, oc, oh, ow], out)
}

fn nchw_to_nhwc(t: &Tensor) -> Tensor {
    let [n, c, h, w] = [t.shape()[0], t.shape()[1], t.shape()[2], t.shape()[3]];
    let mut data = vec![0.0; t.numel()];
    for b in 0..n {
        for ch in 0..c {
            for y in 0..h {
                for x in 0..w {
                    data[((b * h + y) * w + x) * c + ch] = t.data()[((b * c + ch) * h + y) * w + x];
                }
            }
        }
    }
    Tensor::new(vec![n, h, w, c], data).unwrap()
}

#[test]
fn conv2d_matches_reference_in_both_layouts() {
    let params = [
        Conv2dParams::default(),
        Conv2dParams::default().with_padding(1),
        Conv2dParams::default().with_padding(1).with_strides(2, 2),
        Conv2dParams::default().with_dilation(2, 2).with_padding(2),
        Conv2dParams::default().with_groups(2).with_padding(1),
    ];
    let mut rng = StdRng::seed_from_u64(3);
    for ctx in contexts() {
        for p in &params {
            let src = random(&mut rng, &[2, 4, 7, 9]);
            let w = random(&mut rng, &[6, 4 / p.groups, 3, 3]);
            let bias = random(&mut rng, &[6]);
            let (shape, expected) = reference_conv(&src, &w, Some(&bias), p);

            let planar = ops::conv2d(&ctx, &src, &w, Some(&bias), p, FormatTag::Nchw).unwrap();
            assert_eq!(planar.shape(), shape.as_slice());
            assert_close(planar.data(), &expected, 1e-4);

            let nhwc = ops::conv2d(&ctx, &nchw_to_nhwc(&src), &w, Some(&bias), p, FormatTag::Nhwc)
                .unwrap();
            let expected_nhwc =
                nchw_to_nhwc(&Tensor::new(shape.clone(), expected.clone()).unwrap());
            assert_eq!(nhwc.shape(), expected_nhwc.shape());
            assert_close(nhwc.data(), expected_nhwc.data(), 1e-4);
        }
    }
}

#[test]
fn conv_plans_are_keyed_by_geometry_layout_and_bias() {
    let ctx = &contexts()[0];
    let mut rng = StdRng::seed_from_u64(5);
    let src = random(&mut rng, &[1, 2, 5, 5]);
    let w = random(&mut rng, &[3, 2, 3, 3]);
    let bias = random(&mut rng, &[3]);
    let p = Conv2dParams::default();

    ops::conv2d(ctx, &src, &w, None, &p, FormatTag::Nchw).unwrap();
    ops::conv2d(ctx, &src, &w, None, &p, FormatTag::Nchw).unwrap();
    assert_eq!(ctx.descriptor_cache::<ConvPlan>().len(), 1);

    ops::conv2d(ctx, &src, &w, Some(&bias), &p, FormatTag::Nchw).unwrap();
    assert_eq!(ctx.descriptor_cache::<ConvPlan>().len(), 2);

    // Same image in channels-last layout.
    let nhwc = nchw_to_nhwc(&src);
    ops::conv2d(ctx, &nhwc, &w, None, &p, FormatTag::Nhwc).unwrap();
    assert_eq!(ctx.descriptor_cache::<ConvPlan>().len(), 3);

    ops::conv2d(ctx, &src, &w, None, &p.clone().with_padding(1), FormatTag::Nchw).unwrap();
    let stats = ctx.descriptor_cache::<ConvPlan>().stats();
    assert_eq!(stats.entries, 4);
    assert_eq!(stats.hits, 1);
}

#[test]
fn conv2d_rejects_bad_arguments_before_caching() {
    let ctx = &contexts()[0];
    let src = Tensor::zeros(vec![1, 3, 5, 5]);
    let w = Tensor::zeros(vec![4, 3, 3, 3]);
    let p = Conv2dParams::default();

    let grouped = p.clone().with_groups(2);
    assert!(matches!(
        ops::conv2d(ctx, &src, &w, None, &grouped, FormatTag::Nchw),
        Err(AccelError::InvalidArgument(_))
    ));
    let bad_bias = Tensor::zeros(vec![5]);
    assert!(matches!(
        ops::conv2d(ctx, &src, &w, Some(&bad_bias), &p, FormatTag::Nchw),
        Err(AccelError::ShapeMismatch(_))
    ));
    let tiny = Tensor::zeros(vec![1, 3, 2, 2]);
    assert!(matches!(
        ops::conv2d(ctx, &tiny, &w, None, &p, FormatTag::Nchw),
        Err(AccelError::InvalidArgument(_))
    ));
    assert!(matches!(
        ops::conv2d(ctx, &src, &w, None, &p, FormatTag::Oihw),
        Err(AccelError::InvalidArgument(_))
    ));
    assert!(ctx.descriptor_cache::<ConvPlan>().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
// adamw_fused_step
// ═══════════════════════════════════════════════════════════════════════

struct State {
    param: Vec<f32>,
    exp_avg: Vec<f32>,
    exp_avg_sq: Vec<f32>,
    max_exp_avg_sq: Vec<f32>,
    param2: Vec<bf16>,
}

impl State {
    fn new(rng: &mut StdRng, n: usize) -> Self {
        State {
            param: (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect(),
            exp_avg: vec![0.0; n],
            exp_avg_sq: vec![0.0; n],
            max_exp_avg_sq: vec![0.0; n],
            param2: vec![bf16::ZERO; n],
        }
    }

    fn buffers<'a>(&'a mut self, grad: &'a [f32]) -> AdamwBuffers<'a> {
        AdamwBuffers {
            param: &mut self.param,
            exp_avg: &mut self.exp_avg,
            exp_avg_sq: &mut self.exp_avg_sq,
            max_exp_avg_sq: &mut self.max_exp_avg_sq,
            grad,
            param2: &mut self.param2,
        }
    }
}

fn reference_adamw(state: &mut State, grad: &[f32], h: &AdamwHyperParams) {
    let bc1 = 1.0 - h.beta1.powi(h.step as i32);
    let bc2 = 1.0 - h.beta2.powi(h.step as i32);
    for i in 0..state.param.len() {
        let g = grad[i] as f64;
        let mut p = state.param[i] as f64 * (1.0 - h.lr * h.weight_decay);
        let m = h.beta1 * state.exp_avg[i] as f64 + (1.0 - h.beta1) * g;
        let v = h.beta2 * state.exp_avg_sq[i] as f64 + (1.0 - h.beta2) * g * g;
        let second = if h.amsgrad {
            let mx = (state.max_exp_avg_sq[i] as f64).max(v);
            state.max_exp_avg_sq[i] = mx as f32;
            mx
        } else {
            v
        };
        p -= h.lr / bc1 * m / (second.sqrt() / bc2.sqrt() + h.eps);
        state.param[i] = p as f32;
        state.exp_avg[i] = m as f32;
        state.exp_avg_sq[i] = v as f32;
        state.param2[i] = bf16::from_f32(p as f32);
    }
}

#[test]
fn adamw_tracks_reference_over_several_steps() {
    let mut rng = StdRng::seed_from_u64(21);
    for ctx in contexts() {
        for amsgrad in [false, true] {
            let mut state = State::new(&mut rng, 37);
            let mut expected = State {
                param: state.param.clone(),
                exp_avg: state.exp_avg.clone(),
                exp_avg_sq: state.exp_avg_sq.clone(),
                max_exp_avg_sq: state.max_exp_avg_sq.clone(),
                param2: state.param2.clone(),
            };
            for step in 1..=5 {
                let grad: Vec<f32> = (0..37).map(|_| rng.gen_range(-1.0..1.0)).collect();
                let h = AdamwHyperParams {
                    lr: 1e-2,
                    step,
                    amsgrad,
                    ..AdamwHyperParams::default()
                };
                ops::adamw_fused_step(&ctx, state.buffers(&grad), &h).unwrap();
                reference_adamw(&mut expected, &grad, &h);
            }
            assert_close(&state.param, &expected.param, 1e-4);
            assert_close(&state.exp_avg_sq, &expected.exp_avg_sq, 1e-4);
            for (got, &p) in state.param2.iter().zip(&state.param) {
                assert_eq!(*got, bf16::from_f32(p));
            }
        }
    }
}

#[test]
fn adamw_rejects_invalid_arguments_without_touching_state() {
    let ctx = &contexts()[0];
    let mut rng = StdRng::seed_from_u64(1);
    let mut state = State::new(&mut rng, 8);
    let before = state.param.clone();
    let grad = vec![0.1f32; 8];

    let bad_lr = AdamwHyperParams { lr: -1e-3, ..AdamwHyperParams::default() };
    assert!(matches!(
        ops::adamw_fused_step(ctx, state.buffers(&grad), &bad_lr),
        Err(AccelError::InvalidArgument(_))
    ));

    let short_grad = vec![0.1f32; 7];
    assert!(matches!(
        ops::adamw_fused_step(ctx, state.buffers(&short_grad), &AdamwHyperParams::default()),
        Err(AccelError::ShapeMismatch(_))
    ));

    assert_eq!(state.param, before);
    assert!(ctx.report().caches.is_empty());
}

#[test]
fn adamw_accepts_empty_param2_and_missing_max_buffer() {
    let ctx = &contexts()[0];
    let mut param = vec![1.0f32; 4];
    let (mut m, mut v) = (vec![0.0f32; 4], vec![0.0f32; 4]);
    let grad = vec![1.0f32; 4];
    let buffers = AdamwBuffers {
        param: &mut param,
        exp_avg: &mut m,
        exp_avg_sq: &mut v,
        max_exp_avg_sq: &mut [],
        grad: &grad,
        param2: &mut [],
    };
    ops::adamw_fused_step(ctx, buffers, &AdamwHyperParams::default()).unwrap();
    assert!(param.iter().all(|&p| p < 1.0));
}
