//! cpu-accel: capability-based CPU kernel dispatch with descriptor memoization.
//!
//! This crate provides the runtime plumbing behind CPU operator libraries:
//! - **Capability Resolution**: Probes the CPU once, caps it by the tiers this
//!   build ships, and honours a downgrade-only `ATEN_CPU_CAPABILITY` override
//! - **Kernel Dispatch**: Sparse per-tier kernel tables with a fixed downgrade
//!   policy, memoized per operation
//! - **Descriptor Cache**: Expensive plans built once per structural key and
//!   shared through `Arc`
//! - **Reference Operators**: `matmul`, `conv2d` and a fused AdamW step, each
//!   with DEFAULT and AVX2 kernels
//!
//! # Quick Start
//!
//! ```no_run
//! use cpu_accel::{ops, Tensor};
//!
//! let ctx = cpu_accel::global();
//! let a = Tensor::from_fn(vec![2, 3], |i| i as f32);
//! let b = Tensor::from_fn(vec![3, 4], |i| i as f32);
//! let c = ops::matmul(ctx, &a, &b)?;
//! assert_eq!(c.shape(), &[2, 4]);
//! println!("{}", ctx.report_json()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod binary_support;
pub mod capability;
pub mod config;
pub mod context;
pub mod cpu_features;
pub mod cpu_kernels;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod isa;
pub mod ops;
pub mod tensor;
pub mod threads;

pub use binary_support::BinarySupportSet;
pub use capability::{resolve_capability, CapabilityResolution, OverrideWarning};
pub use config::{AccelConfig, Fp32MathMode, CAPABILITY_ENV, MATH_MODE_ENV};
pub use context::{global, CapabilityReport, CpuContext, CpuContextBuilder, DescriptorCacheReport};
pub use cpu_features::{CpuFeatures, FeatureProbe, HostProbe};
pub use descriptor::{CacheKey, CacheStats, Descriptor, DescriptorCache};
pub use dispatch::{DispatchStub, DispatchTable, KernelRegistry, OpId};
pub use error::{AccelError, AccelResult};
pub use isa::CapabilityLevel;
pub use tensor::Tensor;
