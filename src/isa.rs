//! Ordered CPU capability tiers.
//!
//! A capability level names a group of instruction-set extensions. Levels are
//! totally ordered from the scalar reference tier up to AMX; "supports X"
//! always means "is at least X".

use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityLevel {
    /// Scalar reference path, always available.
    #[default]
    Default,
    Avx2,
    Avx2Vnni,
    Avx512,
    Avx512Vnni,
    Avx512Bf16,
    /// AVX-512 BF16 plus AMX tile/int8/bf16 units (Sapphire Rapids+).
    Amx,
}

impl CapabilityLevel {
    pub const COUNT: usize = 7;

    /// All levels, weakest first.
    pub const ALL: [CapabilityLevel; Self::COUNT] = [
        Self::Default,
        Self::Avx2,
        Self::Avx2Vnni,
        Self::Avx512,
        Self::Avx512Vnni,
        Self::Avx512Bf16,
        Self::Amx,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::Avx2 => "AVX2",
            Self::Avx2Vnni => "AVX2_VNNI",
            Self::Avx512 => "AVX512",
            Self::Avx512Vnni => "AVX512_VNNI",
            Self::Avx512Bf16 => "AVX512_BF16",
            Self::Amx => "AMX",
        }
    }

    /// Token accepted by the capability override variable.
    pub fn token(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Avx2 => "avx2",
            Self::Avx2Vnni => "avx2_vnni",
            Self::Avx512 => "avx512",
            Self::Avx512Vnni => "avx512_vnni",
            Self::Avx512Bf16 => "avx512_bf16",
            Self::Amx => "amx",
        }
    }

    /// Parse an override token. Matching is exact and case-sensitive.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.token() == token)
    }

    /// Levels at or below `self`, strongest first.
    pub fn descending_from(self) -> impl Iterator<Item = CapabilityLevel> {
        Self::ALL[..=self.index()].iter().rev().copied()
    }

    /// Whether kernels of this tier use vector registers at all.
    #[inline]
    pub fn is_vectorized(self) -> bool {
        self >= Self::Avx2
    }
}

impl fmt::Display for CapabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
