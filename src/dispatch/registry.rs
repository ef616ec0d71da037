//! Registry of dispatched operations.
//!
//! Maps an operation identifier to its [`DispatchStub`]. Handle types differ
//! per operation (each op has its own kernel signature), so stubs are stored
//! type-erased and recovered by downcasting on lookup.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::dispatch::stub::DispatchStub;
use crate::error::{AccelError, AccelResult};
use crate::isa::CapabilityLevel;

/// Identifier of a dispatched operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(&'static str);

impl OpId {
    pub const fn new(name: &'static str) -> Self {
        OpId(name)
    }

    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

trait ErasedStub: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn handle_type(&self) -> &'static str;
    fn resolved_level(&self) -> Option<CapabilityLevel>;
    fn registered_levels(&self) -> Vec<CapabilityLevel>;
}

impl<H: Clone + Send + Sync + 'static> ErasedStub for DispatchStub<H> {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn handle_type(&self) -> &'static str {
        std::any::type_name::<H>()
    }

    fn resolved_level(&self) -> Option<CapabilityLevel> {
        DispatchStub::resolved_level(self)
    }

    fn registered_levels(&self) -> Vec<CapabilityLevel> {
        DispatchStub::registered_levels(self)
    }
}

/// Dispatch state of one operation, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct OpDispatchInfo {
    pub op: &'static str,
    pub registered: Vec<CapabilityLevel>,
    pub resolved: Option<CapabilityLevel>,
}

#[derive(Default)]
pub struct KernelRegistry {
    stubs: RwLock<BTreeMap<OpId, Arc<dyn ErasedStub>>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the `level` kernel of `op`.
    ///
    /// Must happen during initialization: once `op` has been resolved its
    /// table is frozen and this returns `RegistrationClosed`.
    pub fn register<H>(&self, op: OpId, level: CapabilityLevel, handle: H) -> AccelResult<()>
    where
        H: Clone + Send + Sync + 'static,
    {
        let stub = {
            let mut stubs = self.stubs.write().unwrap_or_else(|e| e.into_inner());
            let erased = stubs.entry(op).or_insert_with(|| {
                Arc::new(DispatchStub::<H>::new(op.name())) as Arc<dyn ErasedStub>
            });
            downcast::<H>(op, Arc::clone(erased))?
        };
        stub.register(level, handle)
    }

    /// Stub for `op`, for callers that want to skip the map lookup on hot paths.
    pub fn stub<H>(&self, op: OpId) -> AccelResult<Arc<DispatchStub<H>>>
    where
        H: Clone + Send + Sync + 'static,
    {
        let erased = {
            let stubs = self.stubs.read().unwrap_or_else(|e| e.into_inner());
            stubs
                .get(&op)
                .cloned()
                .ok_or(AccelError::UnknownOperation(op.name()))?
        };
        downcast::<H>(op, erased)
    }

    /// Kernel for `op` at `capability`, memoized per operation.
    pub fn resolve<H>(&self, op: OpId, capability: CapabilityLevel) -> AccelResult<H>
    where
        H: Clone + Send + Sync + 'static,
    {
        self.stub::<H>(op)?.resolve(capability)
    }

    pub fn contains(&self, op: OpId) -> bool {
        let stubs = self.stubs.read().unwrap_or_else(|e| e.into_inner());
        stubs.contains_key(&op)
    }

    pub fn ops(&self) -> Vec<OpDispatchInfo> {
        let stubs = self.stubs.read().unwrap_or_else(|e| e.into_inner());
        stubs
            .iter()
            .map(|(op, stub)| OpDispatchInfo {
                op: op.name(),
                registered: stub.registered_levels(),
                resolved: stub.resolved_level(),
            })
            .collect()
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("ops", &self.ops())
            .finish()
    }
}

fn downcast<H>(op: OpId, erased: Arc<dyn ErasedStub>) -> AccelResult<Arc<DispatchStub<H>>>
where
    H: Clone + Send + Sync + 'static,
{
    let registered = erased.handle_type();
    erased
        .into_any()
        .downcast::<DispatchStub<H>>()
        .map_err(|_| AccelError::HandleTypeMismatch {
            op: op.name(),
            registered,
        })
}
