//! Environment-driven runtime configuration.

use std::env;

/// Capability override, shared with the host framework's own variable.
pub const CAPABILITY_ENV: &str = "ATEN_CPU_CAPABILITY";

/// FP32 math mode selection (`fp32` or `bf32`).
pub const MATH_MODE_ENV: &str = "CPU_ACCEL_FP32_MATH_MODE";

/// How fp32 matmul inputs are treated by the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Fp32MathMode {
    /// Full fp32 multiply-accumulate.
    #[default]
    Fp32,
    /// Inputs rounded to bf16, accumulation in fp32.
    Bf32,
}

impl Fp32MathMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            v if v.eq_ignore_ascii_case("fp32") => Some(Self::Fp32),
            v if v.eq_ignore_ascii_case("bf32") => Some(Self::Bf32),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Fp32 => "fp32",
            Self::Bf32 => "bf32",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccelConfig {
    /// Raw override token; validated when the capability is resolved.
    pub capability_override: Option<String>,
    pub math_mode: Fp32MathMode,
}

impl AccelConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        let capability_override = env::var(CAPABILITY_ENV).ok();

        let math_mode = match env::var(MATH_MODE_ENV) {
            Ok(value) => Fp32MathMode::parse(&value).unwrap_or_else(|| {
                log::warn!("ignoring invalid value for {}: {}", MATH_MODE_ENV, value);
                Fp32MathMode::default()
            }),
            Err(_) => Fp32MathMode::default(),
        };

        AccelConfig {
            capability_override,
            math_mode,
        }
    }

    #[must_use]
    pub fn with_capability_override(mut self, token: impl Into<String>) -> Self {
        self.capability_override = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_math_mode(mut self, mode: Fp32MathMode) -> Self {
        self.math_mode = mode;
        self
    }
}
