//! Process-scoped accelerator context.
//!
//! A `CpuContext` owns everything that is resolved once and then shared:
//! the effective capability level, the kernel registry and one descriptor
//! cache per descriptor type. [`global`] hands out a lazily built instance
//! over the host CPU and the process environment; tests and embedders build
//! their own with [`CpuContext::builder`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use crate::binary_support::BinarySupportSet;
use crate::capability::{resolve_capability, CapabilityResolution, OverrideWarning};
use crate::config::{AccelConfig, Fp32MathMode};
use crate::cpu_features::{CpuFeatures, FeatureProbe, HostProbe};
use crate::descriptor::{CacheKey, CacheStats, Descriptor, DescriptorCache};
use crate::dispatch::{KernelRegistry, OpDispatchInfo, OpId};
use crate::error::AccelResult;
use crate::isa::CapabilityLevel;
use crate::ops;
use crate::threads;

trait ErasedCache: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn descriptor_type(&self) -> &'static str;
    fn stats(&self) -> CacheStats;
}

impl<D: Descriptor> ErasedCache for DescriptorCache<D> {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn descriptor_type(&self) -> &'static str {
        std::any::type_name::<D>()
    }

    fn stats(&self) -> CacheStats {
        DescriptorCache::stats(self)
    }
}

/// Cache statistics of one descriptor type.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DescriptorCacheReport {
    pub descriptor: &'static str,
    #[serde(flatten)]
    pub stats: CacheStats,
}

/// Snapshot of capability and dispatch state, serializable for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CapabilityReport {
    pub cpu_capability: CapabilityLevel,
    pub binary_capability: CapabilityLevel,
    pub binary_levels: Vec<CapabilityLevel>,
    pub resolved_capability: CapabilityLevel,
    pub overridden: Option<CapabilityLevel>,
    pub warning: Option<OverrideWarning>,
    pub features: CpuFeatures,
    pub math_mode: Fp32MathMode,
    pub threads: usize,
    pub ops: Vec<OpDispatchInfo>,
    pub caches: Vec<DescriptorCacheReport>,
}

pub struct CpuContextBuilder {
    probe: Box<dyn FeatureProbe>,
    binary: BinarySupportSet,
    config: Option<AccelConfig>,
    builtin_kernels: bool,
}

impl CpuContextBuilder {
    #[must_use]
    pub fn probe(mut self, probe: impl FeatureProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Simulate a machine with exactly the features of `level`.
    #[must_use]
    pub fn cpu_level(self, level: CapabilityLevel) -> Self {
        self.probe(CpuFeatures::for_level(level))
    }

    #[must_use]
    pub fn binary_support(mut self, binary: BinarySupportSet) -> Self {
        self.binary = binary;
        self
    }

    /// Use `config` instead of reading the environment.
    #[must_use]
    pub fn config(mut self, config: AccelConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Force the override token. Without a prior [`config`](Self::config)
    /// the rest of the configuration still comes from the environment.
    #[must_use]
    pub fn capability_override(mut self, token: impl Into<String>) -> Self {
        let config = self.config.take().unwrap_or_else(AccelConfig::from_env);
        self.config = Some(config.with_capability_override(token));
        self
    }

    /// Skip registering the matmul, conv2d and AdamW kernels.
    #[must_use]
    pub fn without_builtin_kernels(mut self) -> Self {
        self.builtin_kernels = false;
        self
    }

    /// Build the context, failing if a built-in kernel cannot be registered.
    pub fn try_build(self) -> AccelResult<CpuContext> {
        let builtin_kernels = self.builtin_kernels;
        let ctx = self.into_context();
        if builtin_kernels {
            ops::register_builtin_kernels(&ctx.registry, &ctx.binary)?;
        }
        Ok(ctx)
    }

    /// Build the context.
    ///
    /// Built-in kernels go into the new context's own empty registry, one
    /// handle type per op id, so their registration cannot fail. Use
    /// [`try_build`](Self::try_build) to have that checked.
    pub fn build(self) -> CpuContext {
        let builtin_kernels = self.builtin_kernels;
        let ctx = self.into_context();
        if builtin_kernels {
            if let Err(err) = ops::register_builtin_kernels(&ctx.registry, &ctx.binary) {
                log::error!("failed to register built-in kernels: {}", err);
            }
        }
        ctx
    }

    fn into_context(self) -> CpuContext {
        CpuContext {
            probe: self.probe,
            binary: self.binary,
            config: self.config.unwrap_or_else(AccelConfig::from_env),
            resolution: OnceLock::new(),
            registry: KernelRegistry::new(),
            caches: RwLock::new(HashMap::new()),
        }
    }
}

pub struct CpuContext {
    probe: Box<dyn FeatureProbe>,
    binary: BinarySupportSet,
    config: AccelConfig,
    resolution: OnceLock<CapabilityResolution>,
    registry: KernelRegistry,
    caches: RwLock<HashMap<TypeId, Arc<dyn ErasedCache>>>,
}

impl CpuContext {
    /// Host CPU, compiled kernel set, configuration from the environment.
    pub fn builder() -> CpuContextBuilder {
        CpuContextBuilder {
            probe: Box::new(HostProbe),
            binary: BinarySupportSet::compiled(),
            config: None,
            builtin_kernels: true,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    pub fn math_mode(&self) -> Fp32MathMode {
        self.config.math_mode
    }

    pub fn features(&self) -> CpuFeatures {
        self.probe.features()
    }

    /// Highest level the CPU supports, ignoring the binary and overrides.
    pub fn cpu_capability(&self) -> CapabilityLevel {
        self.capability_resolution().probed
    }

    /// Highest level this context has kernels compiled for.
    pub fn binary_capability(&self) -> CapabilityLevel {
        self.binary.ceiling()
    }

    pub fn binary_support(&self) -> BinarySupportSet {
        self.binary
    }

    /// Full capability resolution, computed on first use.
    pub fn capability_resolution(&self) -> &CapabilityResolution {
        self.resolution.get_or_init(|| {
            let probed = self.probe.probe();
            let resolution = resolve_capability(
                probed,
                self.binary.ceiling(),
                self.config.capability_override.as_deref(),
            );
            log::info!(
                "CPU capability: {} (cpu {}, binary {})",
                resolution.level,
                resolution.probed,
                resolution.binary_ceiling
            );
            resolution
        })
    }

    pub fn resolved_capability(&self) -> CapabilityLevel {
        self.capability_resolution().level
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    pub fn register<H>(&self, op: OpId, level: CapabilityLevel, handle: H) -> AccelResult<()>
    where
        H: Clone + Send + Sync + 'static,
    {
        self.registry.register(op, level, handle)
    }

    /// Kernel of `op` for the resolved capability.
    pub fn resolve<H>(&self, op: OpId) -> AccelResult<H>
    where
        H: Clone + Send + Sync + 'static,
    {
        self.registry.resolve(op, self.resolved_capability())
    }

    /// Shared descriptor for `key`, built by `builder` on first use.
    pub fn fetch_or_create<D, F>(&self, key: &CacheKey, builder: F) -> AccelResult<Arc<D>>
    where
        D: Descriptor,
        F: FnOnce() -> AccelResult<D>,
    {
        self.descriptor_cache::<D>().fetch_or_create(key, builder)
    }

    /// The cache holding descriptors of type `D`.
    pub fn descriptor_cache<D: Descriptor>(&self) -> Arc<DescriptorCache<D>> {
        {
            let caches = self.caches.read().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = caches.get(&TypeId::of::<D>()) {
                if let Ok(cache) = Arc::clone(slot).into_any().downcast::<DescriptorCache<D>>() {
                    return cache;
                }
            }
        }

        let mut caches = self.caches.write().unwrap_or_else(|e| e.into_inner());
        let slot = caches
            .entry(TypeId::of::<D>())
            .or_insert_with(|| Arc::new(DescriptorCache::<D>::new()) as Arc<dyn ErasedCache>);
        match Arc::clone(slot).into_any().downcast::<DescriptorCache<D>>() {
            Ok(cache) => cache,
            Err(_) => {
                let fresh = Arc::new(DescriptorCache::<D>::new());
                *slot = Arc::clone(&fresh) as Arc<dyn ErasedCache>;
                fresh
            }
        }
    }

    pub fn report(&self) -> CapabilityReport {
        let resolution = self.capability_resolution().clone();
        let mut caches: Vec<DescriptorCacheReport> = {
            let caches = self.caches.read().unwrap_or_else(|e| e.into_inner());
            caches
                .values()
                .map(|cache| DescriptorCacheReport {
                    descriptor: cache.descriptor_type(),
                    stats: cache.stats(),
                })
                .collect()
        };
        caches.sort_by_key(|c| c.descriptor);

        CapabilityReport {
            cpu_capability: resolution.probed,
            binary_capability: resolution.binary_ceiling,
            binary_levels: self.binary.levels().collect(),
            resolved_capability: resolution.level,
            overridden: resolution.overridden,
            warning: resolution.warning,
            features: self.features(),
            math_mode: self.config.math_mode,
            threads: threads::max_threads(),
            ops: self.registry.ops(),
            caches,
        }
    }

    pub fn report_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.report())
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuContext")
            .field("binary", &self.binary)
            .field("config", &self.config)
            .field("resolution", &self.resolution.get())
            .field("registry", &self.registry)
            .finish()
    }
}

static GLOBAL: OnceLock<CpuContext> = OnceLock::new();

/// Process-wide context over the host CPU and environment.
pub fn global() -> &'static CpuContext {
    GLOBAL.get_or_init(CpuContext::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccelConfig;

    fn ctx(cpu: CapabilityLevel, binary: CapabilityLevel) -> CpuContext {
        CpuContext::builder()
            .cpu_level(cpu)
            .binary_support(BinarySupportSet::up_to(binary))
            .config(AccelConfig::default())
            .build()
    }

    #[test]
    fn resolution_caps_cpu_by_binary() {
        let ctx = ctx(CapabilityLevel::Amx, CapabilityLevel::Avx512);
        assert_eq!(ctx.cpu_capability(), CapabilityLevel::Amx);
        assert_eq!(ctx.binary_capability(), CapabilityLevel::Avx512);
        assert_eq!(ctx.resolved_capability(), CapabilityLevel::Avx512);
    }

    #[test]
    fn builtin_kernels_follow_binary_support() {
        let scalar = ctx(CapabilityLevel::Amx, CapabilityLevel::Default);
        let ops = scalar.registry().ops();
        assert_eq!(ops.len(), 3);
        assert!(ops.iter().all(|op| op.registered == vec![CapabilityLevel::Default]));

        let empty = CpuContext::builder()
            .config(AccelConfig::default())
            .without_builtin_kernels()
            .build();
        assert!(empty.registry().ops().is_empty());
    }

    #[test]
    fn caches_are_per_descriptor_type() {
        struct A;
        struct B;
        impl Descriptor for A {
            fn op_name(&self) -> &'static str {
                "a"
            }
        }
        impl Descriptor for B {
            fn op_name(&self) -> &'static str {
                "b"
            }
        }

        let ctx = ctx(CapabilityLevel::Default, CapabilityLevel::Default);
        let key = CacheKey::builder(
            crate::descriptor::OpKind::Eltwise,
            crate::descriptor::Algorithm::MatmulGemm,
            crate::descriptor::PropKind::ForwardInference,
        )
        .threads(1)
        .build();
        ctx.fetch_or_create(&key, || Ok(A)).unwrap();
        ctx.fetch_or_create(&key, || Ok(B)).unwrap();
        assert_eq!(ctx.descriptor_cache::<A>().len(), 1);
        assert_eq!(ctx.descriptor_cache::<B>().len(), 1);
        assert_eq!(ctx.report().caches.len(), 2);
    }

    #[test]
    fn try_build_registers_builtins_for_every_binary_set() {
        for level in CapabilityLevel::ALL {
            let ctx = CpuContext::builder()
                .cpu_level(level)
                .binary_support(BinarySupportSet::up_to(level))
                .config(AccelConfig::default())
                .try_build()
                .unwrap();
            assert_eq!(ctx.registry().ops().len(), 3);
        }
    }

    #[test]
    fn builtin_registration_reports_conflicts() {
        type Wrong = fn() -> u8;
        let registry = KernelRegistry::new();
        registry
            .register::<Wrong>(ops::BMM, CapabilityLevel::Default, || 0)
            .unwrap();
        let err = ops::register_builtin_kernels(&registry, &BinarySupportSet::compiled());
        assert!(matches!(
            err,
            Err(crate::error::AccelError::HandleTypeMismatch { op: "bmm", .. })
        ));
    }

    #[test]
    fn descriptor_cache_lookups_share_one_instance_across_threads() {
        struct Plan;
        impl Descriptor for Plan {
            fn op_name(&self) -> &'static str {
                "plan"
            }
        }

        let ctx = Arc::new(ctx(CapabilityLevel::Default, CapabilityLevel::Default));
        let first = ctx.descriptor_cache::<Plan>();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || ctx.descriptor_cache::<Plan>())
            })
            .collect();
        for h in handles {
            assert!(Arc::ptr_eq(&first, &h.join().unwrap()));
        }
        assert_eq!(ctx.report().caches.len(), 1);
    }

    #[test]
    fn report_serializes() {
        let ctx = CpuContext::builder()
            .cpu_level(CapabilityLevel::Avx2)
            .binary_support(BinarySupportSet::up_to(CapabilityLevel::Amx))
            .config(AccelConfig::default().with_capability_override("bogus"))
            .build();
        let json = ctx.report_json().unwrap();
        assert!(json.contains("\"resolved_capability\": \"AVX2\""));
        assert!(json.contains("\"kind\": \"unrecognized\""));
    }
}
