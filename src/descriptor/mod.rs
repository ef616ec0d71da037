//! Descriptor memoization: structural keys and the shared cache.

pub mod cache;
pub mod key;

pub use cache::{CacheStats, Descriptor, DescriptorCache};
pub use key::{
    Algorithm, CacheKey, CacheKeyBuilder, DataType, FormatTag, KeyParam, Layout, OpKind,
    PropKind, TensorDesc,
};
