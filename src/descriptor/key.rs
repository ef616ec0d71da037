//! Structural cache keys for computation descriptors.
//!
//! A key is an ordered tuple of everything a descriptor depends on: the
//! operation, its algorithm and propagation kind, the tensor descriptors
//! (dims, layout, element type), scalar attributes, and the thread count
//! in effect when the descriptor was built. Equality is component-wise.

use std::fmt;

use crate::threads;

/// Element data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F32,
    Bf16,
    F16,
    S32,
    S8,
    U8,
}

impl DataType {
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::F32 | Self::S32 => 4,
            Self::Bf16 | Self::F16 => 2,
            Self::S8 | Self::U8 => 1,
        }
    }
}

/// Logical memory format tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    /// Let the plan builder pick.
    Any,
    /// Row-major, innermost dimension last.
    Plain,
    Ncw,
    Nwc,
    Nchw,
    Nhwc,
    Ncdhw,
    Ndhwc,
    Oihw,
    /// Grouped weights `[G, OC/G, IC/G, KH, KW]`.
    Goihw,
}

impl FormatTag {
    /// Channels-last activation tag for a given rank, if one exists.
    pub fn channels_last(ndims: usize) -> Option<Self> {
        match ndims {
            3 => Some(Self::Nwc),
            4 => Some(Self::Nhwc),
            5 => Some(Self::Ndhwc),
            _ => None,
        }
    }

    pub fn is_channels_last(self) -> bool {
        matches!(self, Self::Nwc | Self::Nhwc | Self::Ndhwc)
    }
}

/// How a tensor is laid out: a format tag or explicit strides.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Layout {
    Format(FormatTag),
    Strided(Vec<i64>),
}

/// Dims, element type and layout of one tensor operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    dims: Vec<i64>,
    dtype: DataType,
    layout: Layout,
}

impl TensorDesc {
    pub fn new(dims: Vec<i64>, dtype: DataType, layout: Layout) -> Self {
        TensorDesc {
            dims,
            dtype,
            layout,
        }
    }

    /// Dense row-major descriptor with explicit strides.
    pub fn contiguous(dims: &[usize], dtype: DataType) -> Self {
        let dims: Vec<i64> = dims.iter().map(|&d| d as i64).collect();
        let strides = contiguous_strides(&dims);
        TensorDesc::new(dims, dtype, Layout::Strided(strides))
    }

    pub fn with_format(dims: &[usize], dtype: DataType, tag: FormatTag) -> Self {
        TensorDesc::new(
            dims.iter().map(|&d| d as i64).collect(),
            dtype,
            Layout::Format(tag),
        )
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn nelems(&self) -> usize {
        self.dims.iter().map(|&d| d.max(0) as usize).product()
    }

    pub fn size_bytes(&self) -> usize {
        self.nelems() * self.dtype.size_bytes()
    }

    #[must_use]
    pub fn to_format(&self, tag: FormatTag) -> Self {
        TensorDesc::new(self.dims.clone(), self.dtype, Layout::Format(tag))
    }

    #[must_use]
    pub fn to_format_any(&self) -> Self {
        self.to_format(FormatTag::Any)
    }

    #[must_use]
    pub fn to_type(&self, dtype: DataType) -> Self {
        TensorDesc::new(self.dims.clone(), dtype, self.layout.clone())
    }

    /// Whether the channel axis (axis 1) is innermost.
    pub fn is_channels_last(&self) -> bool {
        match &self.layout {
            Layout::Format(tag) => tag.is_channels_last(),
            Layout::Strided(strides) => {
                let n = strides.len();
                if !(3..=5).contains(&n) || self.dims.len() != n {
                    return false;
                }
                let c_stride = strides[1];
                c_stride == 1
                    && (2..n).all(|axis| strides[axis] >= c_stride * self.dims[1])
                    && strides[0] >= strides[2..].iter().copied().max().unwrap_or(1)
            }
        }
    }
}

fn contiguous_strides(dims: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1].max(1);
    }
    strides
}

/// Operation family a descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Matmul,
    Convolution,
    Eltwise,
    Reorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropKind {
    ForwardTraining,
    ForwardInference,
    BackwardData,
    BackwardWeights,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    MatmulGemm,
    ConvolutionDirect,
    ConvolutionAuto,
}

/// A scalar attribute of a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyParam {
    Bool(bool),
    Int(i64),
    Dims(Vec<i64>),
    /// Floats compare by bit pattern.
    Float(u64),
    Tag(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    op: OpKind,
    algorithm: Algorithm,
    prop: PropKind,
    descs: Vec<TensorDesc>,
    params: Vec<KeyParam>,
    threads: usize,
}

impl CacheKey {
    pub fn builder(op: OpKind, algorithm: Algorithm, prop: PropKind) -> CacheKeyBuilder {
        CacheKeyBuilder {
            key: CacheKey {
                op,
                algorithm,
                prop,
                descs: Vec::new(),
                params: Vec::new(),
                threads: 0,
            },
            threads: None,
        }
    }

    pub fn op(&self) -> OpKind {
        self.op
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn prop(&self) -> PropKind {
        self.prop
    }

    pub fn descs(&self) -> &[TensorDesc] {
        &self.descs
    }

    pub fn params(&self) -> &[KeyParam] {
        &self.params
    }

    /// Thread count the descriptor was (or will be) built under.
    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}/{:?}", self.op, self.algorithm, self.prop)?;
        for desc in &self.descs {
            write!(f, " {:?}:{:?}", desc.dims, desc.dtype)?;
        }
        write!(f, " threads={}", self.threads)
    }
}

/// Appends key components in order.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    key: CacheKey,
    threads: Option<usize>,
}

impl CacheKeyBuilder {
    #[must_use]
    pub fn desc(mut self, desc: &TensorDesc) -> Self {
        self.key.descs.push(desc.clone());
        self
    }

    #[must_use]
    pub fn flag(mut self, value: bool) -> Self {
        self.key.params.push(KeyParam::Bool(value));
        self
    }

    #[must_use]
    pub fn int(mut self, value: i64) -> Self {
        self.key.params.push(KeyParam::Int(value));
        self
    }

    #[must_use]
    pub fn dims(mut self, dims: &[i64]) -> Self {
        self.key.params.push(KeyParam::Dims(dims.to_vec()));
        self
    }

    #[must_use]
    pub fn float(mut self, value: f64) -> Self {
        self.key.params.push(KeyParam::Float(value.to_bits()));
        self
    }

    #[must_use]
    pub fn tag(mut self, value: &'static str) -> Self {
        self.key.params.push(KeyParam::Tag(value));
        self
    }

    /// Pin the thread count instead of reading the current pool's.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn build(mut self) -> CacheKey {
        self.key.threads = self.threads.unwrap_or_else(threads::max_threads);
        self.key
    }
}
