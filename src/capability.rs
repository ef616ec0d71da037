//! Resolution of the effective capability level.
//!
//! The effective level is the probed CPU level capped by the binary
//! ceiling. A manual override may only lower it: an override above the cap
//! would select kernels the binary lacks or the CPU cannot execute.

use std::fmt;

use crate::isa::CapabilityLevel;

/// Why a manual override was not applied.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverrideWarning {
    /// The token is not in the override vocabulary.
    Unrecognized { value: String },
    /// The token names a level above what the CPU and binary support.
    ExceedsCeiling {
        requested: CapabilityLevel,
        ceiling: CapabilityLevel,
    },
}

impl fmt::Display for OverrideWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrecognized { value } => write!(
                f,
                "ignoring invalid value for {}: {}",
                crate::config::CAPABILITY_ENV,
                value
            ),
            Self::ExceedsCeiling { requested, ceiling } => write!(
                f,
                "ignoring {} override {}: exceeds supported level {}",
                crate::config::CAPABILITY_ENV,
                requested,
                ceiling
            ),
        }
    }
}

/// Outcome of capability resolution.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CapabilityResolution {
    /// Highest level the CPU supports.
    pub probed: CapabilityLevel,
    /// Highest level the binary has kernels for.
    pub binary_ceiling: CapabilityLevel,
    /// Effective level used for dispatch.
    pub level: CapabilityLevel,
    /// Override level, when one was requested and applied.
    pub overridden: Option<CapabilityLevel>,
    pub warning: Option<OverrideWarning>,
}

impl CapabilityResolution {
    /// `min(probed, binary_ceiling)`, the level used without an override.
    pub fn ceiling(&self) -> CapabilityLevel {
        self.probed.min(self.binary_ceiling)
    }
}

/// Resolve the effective capability level. Pure; logs any ignored override.
pub fn resolve_capability(
    probed: CapabilityLevel,
    binary_ceiling: CapabilityLevel,
    raw_override: Option<&str>,
) -> CapabilityResolution {
    let ceiling = probed.min(binary_ceiling);
    let mut resolution = CapabilityResolution {
        probed,
        binary_ceiling,
        level: ceiling,
        overridden: None,
        warning: None,
    };

    let Some(raw) = raw_override else {
        return resolution;
    };

    match CapabilityLevel::from_token(raw) {
        Some(requested) if requested <= ceiling => {
            resolution.level = requested;
            resolution.overridden = Some(requested);
        }
        Some(requested) => {
            let warning = OverrideWarning::ExceedsCeiling { requested, ceiling };
            log::info!("{}", warning);
            resolution.warning = Some(warning);
        }
        None => {
            let warning = OverrideWarning::Unrecognized {
                value: raw.to_string(),
            };
            log::warn!("{}", warning);
            resolution.warning = Some(warning);
        }
    }

    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use CapabilityLevel::*;

    #[test]
    fn no_override_uses_min_of_cpu_and_binary() {
        assert_eq!(resolve_capability(Amx, Avx2, None).level, Avx2);
        assert_eq!(resolve_capability(Avx2, Amx, None).level, Avx2);
    }

    #[test]
    fn override_may_downgrade() {
        let r = resolve_capability(Avx512, Avx512, Some("default"));
        assert_eq!(r.level, Default);
        assert_eq!(r.overridden, Some(Default));
        assert!(r.warning.is_none());
    }

    #[test]
    fn override_above_ceiling_is_ignored() {
        let r = resolve_capability(Avx2, Amx, Some("avx512"));
        assert_eq!(r.level, Avx2);
        assert_eq!(
            r.warning,
            Some(OverrideWarning::ExceedsCeiling {
                requested: Avx512,
                ceiling: Avx2
            })
        );
    }

    #[test]
    fn unrecognized_override_warns_and_falls_back() {
        let r = resolve_capability(Avx512Vnni, Avx512, Some("bogus"));
        assert_eq!(r.level, Avx512);
        assert_eq!(r.ceiling(), Avx512);
        assert!(matches!(
            r.warning,
            Some(OverrideWarning::Unrecognized { ref value }) if value == "bogus"
        ));
        assert!(r.warning.unwrap().to_string().contains("ATEN_CPU_CAPABILITY"));
    }

    #[test]
    fn override_tokens_are_case_sensitive() {
        let r = resolve_capability(Avx512, Avx512, Some("AVX2"));
        assert_eq!(r.level, Avx512);
        assert!(r.warning.is_some());
    }
}
