//! Capability tiers compiled into this build.
//!
//! Which tiers ship kernels is decided by cargo features at build time, but
//! it is carried around as plain data so that a context can be built over
//! any simulated support set.

use std::fmt;

use crate::isa::CapabilityLevel;

/// Set of capability levels with compiled kernels. `Default` is always a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinarySupportSet {
    bits: u8,
}

impl BinarySupportSet {
    const DEFAULT_BIT: u8 = 1 << CapabilityLevel::Default as u8;

    /// Only the scalar reference tier.
    pub const fn default_only() -> Self {
        BinarySupportSet {
            bits: Self::DEFAULT_BIT,
        }
    }

    /// Every tier up to and including `ceiling`.
    pub fn up_to(ceiling: CapabilityLevel) -> Self {
        ceiling
            .descending_from()
            .fold(Self::default_only(), |set, level| set.with(level))
    }

    pub fn from_levels<I: IntoIterator<Item = CapabilityLevel>>(levels: I) -> Self {
        levels
            .into_iter()
            .fold(Self::default_only(), |set, level| set.with(level))
    }

    /// The tiers enabled for the current target and cargo features.
    pub fn compiled() -> Self {
        #[allow(unused_mut)]
        let mut set = Self::default_only();
        #[cfg(all(target_arch = "x86_64", feature = "avx2"))]
        {
            set = set.with(CapabilityLevel::Avx2);
        }
        #[cfg(all(target_arch = "x86_64", feature = "avx2-vnni"))]
        {
            set = set.with(CapabilityLevel::Avx2Vnni);
        }
        #[cfg(all(target_arch = "x86_64", feature = "avx512"))]
        {
            set = set.with(CapabilityLevel::Avx512);
        }
        #[cfg(all(target_arch = "x86_64", feature = "avx512-vnni"))]
        {
            set = set.with(CapabilityLevel::Avx512Vnni);
        }
        #[cfg(all(target_arch = "x86_64", feature = "avx512-bf16"))]
        {
            set = set.with(CapabilityLevel::Avx512Bf16);
        }
        #[cfg(all(target_arch = "x86_64", feature = "amx"))]
        {
            set = set.with(CapabilityLevel::Amx);
        }
        set
    }

    #[must_use]
    pub const fn with(self, level: CapabilityLevel) -> Self {
        BinarySupportSet {
            bits: self.bits | (1 << level as u8),
        }
    }

    #[inline]
    pub fn contains(&self, level: CapabilityLevel) -> bool {
        self.bits & (1 << level as u8) != 0
    }

    /// Highest member. Never below `Default`.
    pub fn ceiling(&self) -> CapabilityLevel {
        CapabilityLevel::Amx
            .descending_from()
            .find(|level| self.contains(*level))
            .unwrap_or(CapabilityLevel::Default)
    }

    pub fn levels(&self) -> impl Iterator<Item = CapabilityLevel> + '_ {
        CapabilityLevel::ALL
            .into_iter()
            .filter(move |level| self.contains(*level))
    }
}

impl Default for BinarySupportSet {
    fn default() -> Self {
        Self::compiled()
    }
}

impl fmt::Display for BinarySupportSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.levels().map(CapabilityLevel::name).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}
