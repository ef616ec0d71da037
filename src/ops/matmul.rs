//! Matrix product with host-framework dimension rules.
//!
//! | `a` | `b` | Result |
//! |---|---|---|
//! | `[k]` | `[k]` | scalar (dot) |
//! | `[m, k]` | `[k]` | `[m]` |
//! | `[k]` | `[k, n]` | `[n]` |
//! | `[m, k]` | `[k, n]` | `[m, n]` |
//! | `[.., m, k]` | `[k]` or `[k, n]` | batch folded into rows |
//! | otherwise | | batch dims broadcast, batched multiply |
//!
//! Every shape reduces to a batched `[m, k] x [k, n]` run by the `bmm`
//! kernel against a cached [`MatmulPlan`].

use std::borrow::Cow;

use half::bf16;
use rayon::prelude::*;

use crate::binary_support::BinarySupportSet;
use crate::config::Fp32MathMode;
use crate::context::CpuContext;
use crate::cpu_kernels::{self, AxpyFn};
use crate::descriptor::{Algorithm, CacheKey, DataType, Descriptor, OpKind, PropKind, TensorDesc};
use crate::dispatch::KernelRegistry;
use crate::error::{AccelError, AccelResult};
use crate::isa::CapabilityLevel;
use crate::ops::BMM;
use crate::tensor::{numel, Tensor};
use crate::threads;

/// `bmm` kernel: `out[b] = a[a_index[b]] x b[b_index[b]]`.
pub type BmmKernel = fn(&MatmulPlan, &[f32], &[f32], &mut [f32]);

/// Cached execution plan for one matmul geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatmulPlan {
    pub batch: usize,
    pub m: usize,
    pub k: usize,
    pub n: usize,
    /// Source matrix of `a` for each output batch.
    pub a_index: Vec<usize>,
    pub b_index: Vec<usize>,
    pub out_shape: Vec<usize>,
    pub math_mode: Fp32MathMode,
    pub threads: usize,
    /// Output rows handed to one rayon task.
    pub rows_per_block: usize,
    /// Bytes of rounded input copies in BF32 mode.
    pub scratch_bytes: usize,
}

impl MatmulPlan {
    fn build(geometry: &Geometry, math_mode: Fp32MathMode, threads: usize) -> AccelResult<Self> {
        let batch = numel(&geometry.batch_out);
        let a_index = broadcast_sources(&geometry.batch_out, &geometry.batch_a);
        let b_index = broadcast_sources(&geometry.batch_out, &geometry.batch_b);
        let scratch_bytes = match math_mode {
            Fp32MathMode::Fp32 => 0,
            Fp32MathMode::Bf32 => {
                let a_elems = numel(&geometry.batch_a) * geometry.m * geometry.k;
                let b_elems = numel(&geometry.batch_b) * geometry.k * geometry.n;
                (a_elems + b_elems) * std::mem::size_of::<f32>()
            }
        };
        Ok(MatmulPlan {
            batch,
            m: geometry.m,
            k: geometry.k,
            n: geometry.n,
            a_index,
            b_index,
            out_shape: geometry.out_shape.clone(),
            math_mode,
            threads,
            rows_per_block: threads::rows_per_block(batch * geometry.m, threads),
            scratch_bytes,
        })
    }

    pub fn out_numel(&self) -> usize {
        self.batch * self.m * self.n
    }
}

impl Descriptor for MatmulPlan {
    fn op_name(&self) -> &'static str {
        BMM.name()
    }

    fn validate(&self) -> Result<(), String> {
        if self.a_index.len() != self.batch || self.b_index.len() != self.batch {
            return Err(format!(
                "batch index tables ({}, {}) do not cover {} batches",
                self.a_index.len(),
                self.b_index.len(),
                self.batch
            ));
        }
        if self.rows_per_block == 0 {
            return Err("empty row block".into());
        }
        if numel(&self.out_shape) != self.out_numel() {
            return Err(format!("output shape {:?} does not hold the product", self.out_shape));
        }
        Ok(())
    }
}

/// Shapes reduced to a batched multiply, before any index tables exist.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Geometry {
    batch_a: Vec<usize>,
    batch_b: Vec<usize>,
    batch_out: Vec<usize>,
    m: usize,
    k: usize,
    n: usize,
    out_shape: Vec<usize>,
}

fn geometry(a: &[usize], b: &[usize]) -> AccelResult<Geometry> {
    let (da, db) = (a.len(), b.len());
    if da == 0 || db == 0 {
        return Err(AccelError::InvalidArgument(format!(
            "both arguments to matmul need to be at least 1D, but they are {}D and {}D",
            da, db
        )));
    }

    let inner_mismatch = || {
        AccelError::ShapeMismatch(format!(
            "matmul shapes {:?} and {:?} cannot be multiplied",
            a, b
        ))
    };

    // Batch folded into rows: no broadcasting, one plain multiply.
    if db <= 2 {
        let (rows_shape, k) = a.split_at(da - 1);
        let k = k[0];
        if b[0] != k {
            return Err(inner_mismatch());
        }
        let n = if db == 2 { b[1] } else { 1 };
        let mut out_shape = rows_shape.to_vec();
        if db == 2 {
            out_shape.push(n);
        }
        return Ok(Geometry {
            batch_a: Vec::new(),
            batch_b: Vec::new(),
            batch_out: Vec::new(),
            m: numel(rows_shape),
            k,
            n,
            out_shape,
        });
    }

    let (batch_a, m, ka) = if da == 1 {
        (Vec::new(), 1, a[0])
    } else {
        (a[..da - 2].to_vec(), a[da - 2], a[da - 1])
    };
    let (batch_b, kb, n) = if db == 1 {
        (Vec::new(), b[0], 1)
    } else {
        (b[..db - 2].to_vec(), b[db - 2], b[db - 1])
    };
    if ka != kb {
        return Err(inner_mismatch());
    }

    let batch_out = broadcast_shapes(&batch_a, &batch_b)?;
    let mut out_shape = batch_out.clone();
    if da > 1 {
        out_shape.push(m);
    }
    if db > 1 {
        out_shape.push(n);
    }
    Ok(Geometry {
        batch_a,
        batch_b,
        batch_out,
        m,
        k: ka,
        n,
        out_shape,
    })
}

fn broadcast_shapes(a: &[usize], b: &[usize]) -> AccelResult<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |shape: &[usize], axis: usize| {
        let offset = rank - shape.len();
        if axis < offset {
            1
        } else {
            shape[axis - offset]
        }
    };
    (0..rank)
        .map(|axis| match (dim(a, axis), dim(b, axis)) {
            (x, y) if x == y => Ok(x),
            (1, y) => Ok(y),
            (x, 1) => Ok(x),
            (x, y) => Err(AccelError::ShapeMismatch(format!(
                "batch dims {:?} and {:?} are not broadcastable ({} vs {})",
                a, b, x, y
            ))),
        })
        .collect()
}

/// Flat source index for every flat index of `out`, right-aligned.
fn broadcast_sources(out: &[usize], src: &[usize]) -> Vec<usize> {
    let offset = out.len() - src.len();
    (0..numel(out))
        .map(|flat| {
            let mut rem = flat;
            let mut index = 0;
            let mut stride = 1;
            for axis in (0..out.len()).rev() {
                let coord = rem % out[axis];
                rem /= out[axis];
                if axis >= offset {
                    let size = src[axis - offset];
                    if size != 1 {
                        index += coord * stride;
                    }
                    stride *= size;
                }
            }
            index
        })
        .collect()
}

/// `a x b` into a new tensor.
pub fn matmul(ctx: &CpuContext, a: &Tensor, b: &Tensor) -> AccelResult<Tensor> {
    let geometry = geometry(a.shape(), b.shape())?;
    let mut out = Tensor::zeros(geometry.out_shape.clone());
    run(ctx, &geometry, a, b, out.data_mut())?;
    Ok(out)
}

/// `a x b` into a caller buffer sized exactly like the result.
///
/// Returns the result shape.
pub fn matmul_out(
    ctx: &CpuContext,
    a: &Tensor,
    b: &Tensor,
    out: &mut [f32],
) -> AccelResult<Vec<usize>> {
    let geometry = geometry(a.shape(), b.shape())?;
    let expected = numel(&geometry.out_shape);
    if out.len() != expected {
        return Err(AccelError::IncompatibleOutput(format!(
            "matmul result {:?} needs {} elements, output holds {}",
            geometry.out_shape,
            expected,
            out.len()
        )));
    }
    run(ctx, &geometry, a, b, out)?;
    Ok(geometry.out_shape)
}

fn run(
    ctx: &CpuContext,
    geometry: &Geometry,
    a: &Tensor,
    b: &Tensor,
    out: &mut [f32],
) -> AccelResult<()> {
    let kernel = ctx.resolve::<BmmKernel>(BMM)?;
    let math_mode = ctx.math_mode();
    let key = CacheKey::builder(OpKind::Matmul, Algorithm::MatmulGemm, PropKind::ForwardInference)
        .desc(&TensorDesc::contiguous(a.shape(), DataType::F32))
        .desc(&TensorDesc::contiguous(b.shape(), DataType::F32))
        .tag(math_mode.name())
        .build();
    let plan =
        ctx.fetch_or_create(&key, || MatmulPlan::build(geometry, math_mode, key.threads()))?;

    let (a_data, b_data) = match plan.math_mode {
        Fp32MathMode::Fp32 => (Cow::Borrowed(a.data()), Cow::Borrowed(b.data())),
        Fp32MathMode::Bf32 => (
            Cow::Owned(round_bf16(a.data())),
            Cow::Owned(round_bf16(b.data())),
        ),
    };
    kernel(&plan, &a_data, &b_data, out);
    Ok(())
}

fn round_bf16(data: &[f32]) -> Vec<f32> {
    data.iter().map(|&x| bf16::from_f32(x).to_f32()).collect()
}

// ── Kernels ─────────────────────────────────────────────────────────────

fn bmm_with(plan: &MatmulPlan, a: &[f32], b: &[f32], out: &mut [f32], axpy: AxpyFn) {
    let (m, k, n) = (plan.m, plan.k, plan.n);
    if out.is_empty() || n == 0 {
        return;
    }
    let block = plan.rows_per_block * n;
    out.par_chunks_mut(block).enumerate().for_each(|(block_idx, chunk)| {
        let first_row = block_idx * plan.rows_per_block;
        for (local, out_row) in chunk.chunks_mut(n).enumerate() {
            let row = first_row + local;
            let (batch, i) = (row / m, row % m);
            let a_row = plan.a_index[batch] * m * k + i * k;
            let b_base = plan.b_index[batch] * k * n;
            out_row.fill(0.0);
            for p in 0..k {
                let b_row = &b[b_base + p * n..b_base + (p + 1) * n];
                axpy(a[a_row + p], b_row, out_row);
            }
        }
    });
}

fn bmm_default(plan: &MatmulPlan, a: &[f32], b: &[f32], out: &mut [f32]) {
    bmm_with(plan, a, b, out, cpu_kernels::scalar::axpy);
}

fn bmm_avx2(plan: &MatmulPlan, a: &[f32], b: &[f32], out: &mut [f32]) {
    bmm_with(plan, a, b, out, cpu_kernels::avx2_axpy());
}

pub(crate) fn register_kernels(
    registry: &KernelRegistry,
    binary: &BinarySupportSet,
) -> AccelResult<()> {
    registry.register::<BmmKernel>(BMM, CapabilityLevel::Default, bmm_default)?;
    if binary.contains(CapabilityLevel::Avx2) {
        registry.register::<BmmKernel>(BMM, CapabilityLevel::Avx2, bmm_avx2)?;
    }
    Ok(())
}
