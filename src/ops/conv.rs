//! Direct 2-D convolution, forward inference.
//!
//! `src` is `[N, C, H, W]` in NCHW layout or `[N, H, W, C]` in NHWC layout;
//! the output uses the same layout as `src`. Weights are `[OC, C/G, KH, KW]`.

use rayon::prelude::*;

use crate::binary_support::BinarySupportSet;
use crate::context::CpuContext;
use crate::cpu_kernels::{self, AxpyFn};
use crate::descriptor::{
    Algorithm, CacheKey, DataType, Descriptor, FormatTag, OpKind, PropKind, TensorDesc,
};
use crate::dispatch::KernelRegistry;
use crate::error::{AccelError, AccelResult};
use crate::isa::CapabilityLevel;
use crate::ops::CONV2D_FWD;
use crate::tensor::Tensor;

/// `conv2d_fwd` kernel: `(plan, src, weights, bias, dst)`.
pub type Conv2dKernel = fn(&ConvPlan, &[f32], &[f32], Option<&[f32]>, &mut [f32]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv2dParams {
    pub strides: [usize; 2],
    /// One-based: `1` means dense.
    pub dilation: [usize; 2],
    pub padding_l: [usize; 2],
    pub padding_r: [usize; 2],
    pub groups: usize,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Conv2dParams {
            strides: [1, 1],
            dilation: [1, 1],
            padding_l: [0, 0],
            padding_r: [0, 0],
            groups: 1,
        }
    }
}

impl Conv2dParams {
    #[must_use]
    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding_l = [padding, padding];
        self.padding_r = [padding, padding];
        self
    }

    #[must_use]
    pub fn with_strides(mut self, sh: usize, sw: usize) -> Self {
        self.strides = [sh, sw];
        self
    }

    #[must_use]
    pub fn with_dilation(mut self, dh: usize, dw: usize) -> Self {
        self.dilation = [dh, dw];
        self
    }

    #[must_use]
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Zero-based dilates as the plan builder expects them.
    pub fn compatible_dilates(&self) -> [usize; 2] {
        [self.dilation[0] - 1, self.dilation[1] - 1]
    }
}

/// Cached convolution geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvPlan {
    pub batch: usize,
    pub in_channels: usize,
    pub in_hw: [usize; 2],
    pub out_channels: usize,
    pub kernel_hw: [usize; 2],
    pub out_hw: [usize; 2],
    pub strides: [usize; 2],
    pub dilates: [usize; 2],
    pub padding_l: [usize; 2],
    pub groups: usize,
    /// `[G, OC/G, C/G, KH, KW]`.
    pub grouped_weight_dims: [usize; 5],
    pub src_format: FormatTag,
    pub dst_format: FormatTag,
    pub with_bias: bool,
    pub threads: usize,
    /// Per-image NCHW staging for channels-last tensors.
    pub scratch_bytes: usize,
}

impl ConvPlan {
    fn build(
        shape: &ConvShape,
        params: &Conv2dParams,
        with_bias: bool,
        threads: usize,
    ) -> AccelResult<Self> {
        let dilates = params.compatible_dilates();
        let out_hw = [
            out_extent(shape.hw[0], shape.kernel_hw[0], params, 0)?,
            out_extent(shape.hw[1], shape.kernel_hw[1], params, 1)?,
        ];
        let g = params.groups;
        let channels_last = shape.format.is_channels_last();
        let staged = if channels_last {
            shape.channels * shape.hw[0] * shape.hw[1] + shape.out_channels * out_hw[0] * out_hw[1]
        } else {
            0
        };
        Ok(ConvPlan {
            batch: shape.batch,
            in_channels: shape.channels,
            in_hw: shape.hw,
            out_channels: shape.out_channels,
            kernel_hw: shape.kernel_hw,
            out_hw,
            strides: params.strides,
            dilates,
            padding_l: params.padding_l,
            groups: g,
            grouped_weight_dims: [
                g,
                shape.out_channels / g,
                shape.channels / g,
                shape.kernel_hw[0],
                shape.kernel_hw[1],
            ],
            src_format: shape.format,
            dst_format: shape.format,
            with_bias,
            threads,
            scratch_bytes: staged * std::mem::size_of::<f32>() * threads.min(shape.batch.max(1)),
        })
    }

    pub fn out_shape(&self) -> Vec<usize> {
        let [oh, ow] = self.out_hw;
        if self.dst_format.is_channels_last() {
            vec![self.batch, oh, ow, self.out_channels]
        } else {
            vec![self.batch, self.out_channels, oh, ow]
        }
    }

    fn src_image_len(&self) -> usize {
        self.in_channels * self.in_hw[0] * self.in_hw[1]
    }

    fn dst_image_len(&self) -> usize {
        self.out_channels * self.out_hw[0] * self.out_hw[1]
    }
}

impl Descriptor for ConvPlan {
    fn op_name(&self) -> &'static str {
        CONV2D_FWD.name()
    }

    fn validate(&self) -> Result<(), String> {
        let [g, ocg, icg, _, _] = self.grouped_weight_dims;
        if g == 0 || g * ocg != self.out_channels || g * icg != self.in_channels {
            return Err(format!(
                "grouped weights {:?} do not match {} -> {} channels",
                self.grouped_weight_dims, self.in_channels, self.out_channels
            ));
        }
        if self.src_format.is_channels_last() != self.dst_format.is_channels_last() {
            return Err("source and destination layouts disagree".into());
        }
        Ok(())
    }
}

fn out_extent(
    input: usize,
    kernel: usize,
    params: &Conv2dParams,
    axis: usize,
) -> AccelResult<usize> {
    let padded = input + params.padding_l[axis] + params.padding_r[axis];
    let effective = (kernel - 1) * params.dilation[axis] + 1;
    if padded < effective {
        return Err(AccelError::InvalidArgument(format!(
            "kernel extent {} exceeds padded input {} on axis {}",
            effective, padded, axis
        )));
    }
    Ok((padded - effective) / params.strides[axis] + 1)
}

/// Validated logical shapes of one call.
#[derive(Debug, Clone, Copy)]
struct ConvShape {
    batch: usize,
    channels: usize,
    hw: [usize; 2],
    out_channels: usize,
    kernel_hw: [usize; 2],
    format: FormatTag,
}

fn check_inputs(
    src: &Tensor,
    weights: &Tensor,
    bias: Option<&Tensor>,
    params: &Conv2dParams,
    format: FormatTag,
) -> AccelResult<ConvShape> {
    if src.ndim() != 4 || weights.ndim() != 4 {
        return Err(AccelError::InvalidArgument(format!(
            "conv2d expects 4-D src and weights, got {}D and {}D",
            src.ndim(),
            weights.ndim()
        )));
    }
    let s = src.shape();
    let (batch, channels, hw) = match format {
        FormatTag::Nchw => (s[0], s[1], [s[2], s[3]]),
        FormatTag::Nhwc => (s[0], s[3], [s[1], s[2]]),
        other => {
            return Err(AccelError::InvalidArgument(format!(
                "conv2d src layout must be nchw or nhwc, got {:?}",
                other
            )))
        }
    };
    if params.groups == 0 || params.strides.contains(&0) || params.dilation.contains(&0) {
        return Err(AccelError::InvalidArgument(format!(
            "groups, strides and dilation must be positive: {:?}",
            params
        )));
    }

    let w = weights.shape();
    let out_channels = w[0];
    if channels % params.groups != 0 || out_channels % params.groups != 0 {
        return Err(AccelError::InvalidArgument(format!(
            "groups {} must divide input channels {} and output channels {}",
            params.groups, channels, out_channels
        )));
    }
    if w[1] != channels / params.groups {
        return Err(AccelError::ShapeMismatch(format!(
            "weights {:?} expect {} input channels per group, src has {}",
            w,
            w[1],
            channels / params.groups
        )));
    }
    if w[2] == 0 || w[3] == 0 {
        return Err(AccelError::InvalidArgument(format!("empty kernel {:?}", w)));
    }
    if let Some(bias) = bias {
        if bias.shape() != [out_channels] {
            return Err(AccelError::ShapeMismatch(format!(
                "bias {:?} does not match {} output channels",
                bias.shape(),
                out_channels
            )));
        }
    }
    for axis in 0..2 {
        out_extent(hw[axis], w[2 + axis], params, axis)?;
    }

    Ok(ConvShape {
        batch,
        channels,
        hw,
        out_channels,
        kernel_hw: [w[2], w[3]],
        format,
    })
}

/// Forward convolution of `src` in `format` (NCHW or NHWC).
pub fn conv2d(
    ctx: &CpuContext,
    src: &Tensor,
    weights: &Tensor,
    bias: Option<&Tensor>,
    params: &Conv2dParams,
    format: FormatTag,
) -> AccelResult<Tensor> {
    let shape = check_inputs(src, weights, bias, params, format)?;
    let kernel = ctx.resolve::<Conv2dKernel>(CONV2D_FWD)?;

    let dilates = params.compatible_dilates();
    let key = CacheKey::builder(
        OpKind::Convolution,
        Algorithm::ConvolutionDirect,
        PropKind::ForwardInference,
    )
    .desc(&TensorDesc::with_format(src.shape(), DataType::F32, format))
    .desc(&TensorDesc::with_format(weights.shape(), DataType::F32, FormatTag::Oihw))
    .flag(bias.is_some())
    .dims(&to_i64(&params.strides))
    .dims(&to_i64(&dilates))
    .dims(&to_i64(&params.padding_l))
    .dims(&to_i64(&params.padding_r))
    .int(params.groups as i64)
    .build();
    let plan = ctx.fetch_or_create(&key, || {
        ConvPlan::build(&shape, params, bias.is_some(), key.threads())
    })?;

    let mut dst = Tensor::zeros(plan.out_shape());
    kernel(&plan, src.data(), weights.data(), bias.map(Tensor::data), dst.data_mut());
    Ok(dst)
}

fn to_i64(values: &[usize; 2]) -> [i64; 2] {
    [values[0] as i64, values[1] as i64]
}

// ── Kernels ─────────────────────────────────────────────────────────────

fn conv_with(
    plan: &ConvPlan,
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
    axpy: AxpyFn,
) {
    let src_len = plan.src_image_len();
    let dst_len = plan.dst_image_len();
    if dst_len == 0 {
        return;
    }
    let channels_last = plan.src_format.is_channels_last();

    dst.par_chunks_mut(dst_len).enumerate().for_each(|(n, dst_image)| {
        let src_image = &src[n * src_len..(n + 1) * src_len];
        if channels_last {
            let [h, w] = plan.in_hw;
            let nchw = to_planar(src_image, plan.in_channels, h * w);
            let mut out = vec![0.0; dst_len];
            conv_image(plan, &nchw, weights, bias, &mut out, axpy);
            let [oh, ow] = plan.out_hw;
            from_planar(&out, plan.out_channels, oh * ow, dst_image);
        } else {
            conv_image(plan, src_image, weights, bias, dst_image, axpy);
        }
    });
}

/// One image, planar layout on both sides.
fn conv_image(
    plan: &ConvPlan,
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
    axpy: AxpyFn,
) {
    let [_, ocg, icg, kh, kw] = plan.grouped_weight_dims;
    let [h, w] = plan.in_hw;
    let [oh, ow] = plan.out_hw;
    let [sh, sw] = plan.strides;
    let [dh, dw] = [plan.dilates[0] + 1, plan.dilates[1] + 1];
    let [ph, pw] = plan.padding_l;
    let mut row = vec![0.0f32; ow];

    for (oc, plane) in dst.chunks_mut(oh * ow).enumerate() {
        let group = oc / ocg;
        plane.fill(bias.map_or(0.0, |b| b[oc]));
        for icl in 0..icg {
            let ic = group * icg + icl;
            let channel = &src[ic * h * w..(ic + 1) * h * w];
            for ky in 0..kh {
                for kx in 0..kw {
                    let wv = weights[((oc * icg + icl) * kh + ky) * kw + kx];
                    for oy in 0..oh {
                        let iy = (oy * sh + ky * dh) as isize - ph as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        let input_row = &channel[iy as usize * w..(iy as usize + 1) * w];
                        for (ox, slot) in row.iter_mut().enumerate() {
                            let ix = (ox * sw + kx * dw) as isize - pw as isize;
                            *slot = if ix >= 0 && ix < w as isize {
                                input_row[ix as usize]
                            } else {
                                0.0
                            };
                        }
                        axpy(wv, &row, &mut plane[oy * ow..(oy + 1) * ow]);
                    }
                }
            }
        }
    }
}

/// `[HW, C]` to `[C, HW]`.
fn to_planar(image: &[f32], channels: usize, pixels: usize) -> Vec<f32> {
    let mut out = vec![0.0; image.len()];
    for p in 0..pixels {
        for c in 0..channels {
            out[c * pixels + p] = image[p * channels + c];
        }
    }
    out
}

/// `[C, HW]` to `[HW, C]`.
fn from_planar(image: &[f32], channels: usize, pixels: usize, out: &mut [f32]) {
    for c in 0..channels {
        for p in 0..pixels {
            out[p * channels + c] = image[c * pixels + p];
        }
    }
}

fn conv2d_default(
    plan: &ConvPlan,
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
) {
    conv_with(plan, src, weights, bias, dst, cpu_kernels::scalar::axpy);
}

fn conv2d_avx2(
    plan: &ConvPlan,
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
) {
    conv_with(plan, src, weights, bias, dst, cpu_kernels::avx2_axpy());
}

pub(crate) fn register_kernels(
    registry: &KernelRegistry,
    binary: &BinarySupportSet,
) -> AccelResult<()> {
    registry.register::<Conv2dKernel>(CONV2D_FWD, CapabilityLevel::Default, conv2d_default)?;
    if binary.contains(CapabilityLevel::Avx2) {
        registry.register::<Conv2dKernel>(CONV2D_FWD, CapabilityLevel::Avx2, conv2d_avx2)?;
    }
    Ok(())
}
