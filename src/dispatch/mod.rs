//! Capability-based kernel dispatch.
//!
//! Each operation owns a sparse table of kernels, one slot per
//! [`CapabilityLevel`](crate::isa::CapabilityLevel). On first use the table
//! is frozen and the best kernel for the resolved capability is memoized:
//!
//! | Resolved level | Kernel present | Selected |
//! |---|---|---|
//! | AMX .. AVX512 | same tier | that tier |
//! | AMX .. AVX512 | tier missing, AVX2 present | AVX2 |
//! | AMX .. AVX512 | tier and AVX2 missing | DEFAULT |
//! | AVX2_VNNI, AVX2 | walk down | first present |
//! | any | nothing, no DEFAULT | `MissingDefaultKernel` |

pub mod registry;
pub mod stub;
pub mod table;

pub use registry::{KernelRegistry, OpDispatchInfo, OpId};
pub use stub::DispatchStub;
pub use table::DispatchTable;
