//! CPU feature detection and capability probing.
//!
//! Collects the instruction-set extensions relevant to kernel selection into
//! a `CpuFeatures` value and maps it to the highest `CapabilityLevel` whose
//! prerequisites are fully met. Host detection runs once per process.

use std::fmt;
use std::sync::OnceLock;

use crate::isa::CapabilityLevel;

/// ISA feature set relevant to kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
pub struct CpuFeatures {
    pub avx2: bool,
    pub fma: bool,
    /// VEX-encoded VNNI (Alder Lake and later client parts).
    pub avx_vnni: bool,
    pub avx512f: bool,
    pub avx512bw: bool,
    pub avx512vl: bool,
    pub avx512dq: bool,
    pub avx512_vnni: bool,
    pub avx512_bf16: bool,
    pub amx_tile: bool,
    pub amx_int8: bool,
    pub amx_bf16: bool,
}

impl CpuFeatures {
    /// No extensions at all; probes to `CapabilityLevel::Default`.
    pub const fn scalar() -> Self {
        CpuFeatures {
            avx2: false,
            fma: false,
            avx_vnni: false,
            avx512f: false,
            avx512bw: false,
            avx512vl: false,
            avx512dq: false,
            avx512_vnni: false,
            avx512_bf16: false,
            amx_tile: false,
            amx_int8: false,
            amx_bf16: false,
        }
    }

    /// The minimal feature set that satisfies `level`.
    pub fn for_level(level: CapabilityLevel) -> Self {
        let mut f = Self::scalar();
        if level >= CapabilityLevel::Avx2 {
            f.avx2 = true;
            f.fma = true;
        }
        if level == CapabilityLevel::Avx2Vnni {
            f.avx_vnni = true;
        }
        if level >= CapabilityLevel::Avx512 {
            f.avx512f = true;
            f.avx512bw = true;
            f.avx512vl = true;
            f.avx512dq = true;
        }
        if level >= CapabilityLevel::Avx512Vnni {
            f.avx512_vnni = true;
        }
        if level >= CapabilityLevel::Avx512Bf16 {
            f.avx512_bf16 = true;
        }
        if level >= CapabilityLevel::Amx {
            f.amx_tile = true;
            f.amx_int8 = true;
            f.amx_bf16 = true;
        }
        f
    }

    /// Features of the running CPU, detected once and cached.
    pub fn host() -> Self {
        static HOST: OnceLock<CpuFeatures> = OnceLock::new();
        *HOST.get_or_init(|| {
            let features = detect_host_features();
            log::debug!("Detected CPU features: {}", features);
            features
        })
    }

    fn has_avx2(&self) -> bool {
        self.avx2 && self.fma
    }

    fn has_avx512_core(&self) -> bool {
        self.has_avx2() && self.avx512f && self.avx512bw && self.avx512vl && self.avx512dq
    }

    /// Highest level whose full prerequisites are present.
    ///
    /// The AVX-512 family is checked before AVX2_VNNI: a server part with
    /// AVX-512 VNNI never reports the client-only VEX VNNI bit.
    pub fn highest_level(&self) -> CapabilityLevel {
        let avx512 = self.has_avx512_core();
        let avx512_vnni = avx512 && self.avx512_vnni;
        let avx512_bf16 = avx512_vnni && self.avx512_bf16;
        let amx = avx512_bf16 && self.amx_tile && self.amx_int8 && self.amx_bf16;

        if amx {
            CapabilityLevel::Amx
        } else if avx512_bf16 {
            CapabilityLevel::Avx512Bf16
        } else if avx512_vnni {
            CapabilityLevel::Avx512Vnni
        } else if avx512 {
            CapabilityLevel::Avx512
        } else if self.has_avx2() && self.avx_vnni {
            CapabilityLevel::Avx2Vnni
        } else if self.has_avx2() {
            CapabilityLevel::Avx2
        } else {
            CapabilityLevel::Default
        }
    }
}

impl fmt::Display for CpuFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.avx2, "AVX2"),
            (self.fma, "FMA"),
            (self.avx_vnni, "AVX-VNNI"),
            (self.avx512f, "AVX512F"),
            (self.avx512bw, "AVX512BW"),
            (self.avx512vl, "AVX512VL"),
            (self.avx512dq, "AVX512DQ"),
            (self.avx512_vnni, "AVX512-VNNI"),
            (self.avx512_bf16, "AVX512-BF16"),
            (self.amx_tile, "AMX-TILE"),
            (self.amx_int8, "AMX-INT8"),
            (self.amx_bf16, "AMX-BF16"),
        ];
        let feats: Vec<&str> = flags
            .iter()
            .filter(|(on, _)| *on)
            .map(|(_, name)| *name)
            .collect();
        if feats.is_empty() {
            f.write_str("Scalar")
        } else {
            f.write_str(&feats.join("+"))
        }
    }
}

/// Source of CPU feature bits for capability probing.
pub trait FeatureProbe: Send + Sync {
    fn features(&self) -> CpuFeatures;

    fn probe(&self) -> CapabilityLevel {
        self.features().highest_level()
    }
}

/// Probes the machine the process runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProbe;

impl FeatureProbe for HostProbe {
    fn features(&self) -> CpuFeatures {
        CpuFeatures::host()
    }
}

/// A fixed feature set, for simulating other machines.
impl FeatureProbe for CpuFeatures {
    fn features(&self) -> CpuFeatures {
        *self
    }
}

// ── Host detection ──────────────────────────────────────────────────────

#[cfg(target_arch = "x86_64")]
fn detect_host_features() -> CpuFeatures {
    use std::arch::x86_64::__cpuid_count;

    let mut f = CpuFeatures {
        avx2: is_x86_feature_detected!("avx2"),
        fma: is_x86_feature_detected!("fma"),
        avx512f: is_x86_feature_detected!("avx512f"),
        avx512bw: is_x86_feature_detected!("avx512bw"),
        avx512vl: is_x86_feature_detected!("avx512vl"),
        avx512dq: is_x86_feature_detected!("avx512dq"),
        ..CpuFeatures::scalar()
    };

    #[allow(unused_unsafe)]
    let max_leaf = unsafe { __cpuid_count(0, 0) }.eax;
    if max_leaf < 7 {
        return f;
    }

    #[allow(unused_unsafe)]
    let leaf7 = unsafe { __cpuid_count(7, 0) };
    #[allow(unused_unsafe)]
    let leaf7_1 = unsafe { __cpuid_count(7, 1) };

    // VEX VNNI needs YMM state, which avx2 detection already confirmed.
    f.avx_vnni = f.avx2 && leaf7_1.eax & (1 << 4) != 0;

    // EVEX extensions are only usable when the OS saves ZMM state, which
    // avx512f detection already confirmed.
    if f.avx512f {
        f.avx512_vnni = leaf7.ecx & (1 << 11) != 0;
        f.avx512_bf16 = leaf7_1.eax & (1 << 5) != 0;
    }

    let amx_cpu = leaf7.edx & (1 << 24) != 0;
    if amx_cpu && os_saves_amx_state() {
        f.amx_tile = true;
        f.amx_bf16 = leaf7.edx & (1 << 22) != 0;
        f.amx_int8 = leaf7.edx & (1 << 25) != 0;
    }

    f
}

/// XCR0 bits 17 (XTILECFG) and 18 (XTILEDATA).
#[cfg(target_arch = "x86_64")]
fn os_saves_amx_state() -> bool {
    if !is_x86_feature_detected!("xsave") {
        return false;
    }

    #[target_feature(enable = "xsave")]
    unsafe fn xcr0() -> u64 {
        std::arch::x86_64::_xgetbv(0)
    }

    // SAFETY: xsave support was checked above.
    let xcr0 = unsafe { xcr0() };
    const TILE_STATE: u64 = (1 << 17) | (1 << 18);
    xcr0 & TILE_STATE == TILE_STATE
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_host_features() -> CpuFeatures {
    CpuFeatures::scalar()
}
