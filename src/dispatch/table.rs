//! Sparse per-level kernel table and the selection policy.

use crate::error::{AccelError, AccelResult};
use crate::isa::CapabilityLevel;

/// Upper tiers that fall back straight to AVX2 when their kernel is missing.
const AVX2_FLOOR_TIERS: [CapabilityLevel; 4] = [
    CapabilityLevel::Amx,
    CapabilityLevel::Avx512Bf16,
    CapabilityLevel::Avx512Vnni,
    CapabilityLevel::Avx512,
];

/// One kernel handle slot per capability level; any slot may be empty.
#[derive(Debug, Clone)]
pub struct DispatchTable<H> {
    entries: [Option<H>; CapabilityLevel::COUNT],
}

impl<H> Default for DispatchTable<H> {
    fn default() -> Self {
        DispatchTable {
            entries: std::array::from_fn(|_| None),
        }
    }
}

impl<H: Clone> DispatchTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with only the mandatory scalar entry.
    pub fn with_default(handle: H) -> Self {
        let mut table = Self::new();
        table.set(CapabilityLevel::Default, handle);
        table
    }

    /// Install `handle` for `level`, returning the handle it replaces.
    pub fn set(&mut self, level: CapabilityLevel, handle: H) -> Option<H> {
        self.entries[level.index()].replace(handle)
    }

    #[must_use]
    pub fn entry(mut self, level: CapabilityLevel, handle: H) -> Self {
        self.set(level, handle);
        self
    }

    pub fn get(&self, level: CapabilityLevel) -> Option<&H> {
        self.entries[level.index()].as_ref()
    }

    pub fn has_default(&self) -> bool {
        self.get(CapabilityLevel::Default).is_some()
    }

    /// Levels that carry a kernel, weakest first.
    pub fn levels(&self) -> impl Iterator<Item = CapabilityLevel> + '_ {
        CapabilityLevel::ALL
            .into_iter()
            .filter(move |level| self.get(*level).is_some())
    }

    /// Level of the kernel selected for `capability`.
    ///
    /// AMX, AVX512_BF16, AVX512_VNNI and AVX512 kernels are sometimes not
    /// built; a missing upper-tier kernel falls back to AVX2 rather than
    /// walking through the intermediate tiers, and to DEFAULT only when
    /// AVX2 is missing too. Below AVX512 the walk is level by level.
    pub fn choose_level(
        &self,
        capability: CapabilityLevel,
        op: &'static str,
    ) -> AccelResult<CapabilityLevel> {
        for tier in AVX2_FLOOR_TIERS {
            if capability >= tier {
                if self.get(tier).is_some() {
                    return Ok(tier);
                }
                if self.get(CapabilityLevel::Avx2).is_some() {
                    log::debug!("{}: no {} kernel, dispatching to AVX2", op, tier);
                    return Ok(CapabilityLevel::Avx2);
                }
                return self.default_level(op);
            }
        }

        for tier in [CapabilityLevel::Avx2Vnni, CapabilityLevel::Avx2] {
            if capability >= tier && self.get(tier).is_some() {
                return Ok(tier);
            }
        }

        self.default_level(op)
    }

    /// Kernel selected for `capability`; see [`choose_level`](Self::choose_level).
    pub fn choose(&self, capability: CapabilityLevel, op: &'static str) -> AccelResult<H> {
        let level = self.choose_level(capability, op)?;
        self.get(level)
            .cloned()
            .ok_or(AccelError::MissingDefaultKernel { op })
    }

    fn default_level(&self, op: &'static str) -> AccelResult<CapabilityLevel> {
        if self.has_default() {
            Ok(CapabilityLevel::Default)
        } else {
            Err(AccelError::MissingDefaultKernel { op })
        }
    }
}
