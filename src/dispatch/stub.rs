//! Per-operation dispatch stub with a memoized selection.

use std::sync::{OnceLock, RwLock};

use crate::dispatch::table::DispatchTable;
use crate::error::{AccelError, AccelResult};
use crate::isa::CapabilityLevel;

/// Kernel table for one operation plus its resolved handle.
///
/// Entries may be added until the first [`resolve`](Self::resolve); after
/// that the table is frozen and the chosen handle is returned without
/// touching the table again.
#[derive(Debug)]
pub struct DispatchStub<H> {
    name: &'static str,
    table: RwLock<DispatchTable<H>>,
    resolved: OnceLock<(CapabilityLevel, H)>,
}

impl<H: Clone + Send + Sync> DispatchStub<H> {
    pub fn new(name: &'static str) -> Self {
        DispatchStub {
            name,
            table: RwLock::new(DispatchTable::new()),
            resolved: OnceLock::new(),
        }
    }

    pub fn from_table(name: &'static str, table: DispatchTable<H>) -> Self {
        DispatchStub {
            name,
            table: RwLock::new(table),
            resolved: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn register(&self, level: CapabilityLevel, handle: H) -> AccelResult<()> {
        if self.resolved.get().is_some() {
            return Err(AccelError::RegistrationClosed {
                op: self.name,
                level,
            });
        }
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if table.set(level, handle).is_some() {
            log::debug!("{}: replaced {} kernel", self.name, level);
        }
        Ok(())
    }

    /// Handle for `capability`, chosen on first call and memoized.
    ///
    /// Racing first calls may each run the selection; they see the same
    /// frozen table and capability, so whichever value is stored is the one
    /// every caller would have computed.
    pub fn resolve(&self, capability: CapabilityLevel) -> AccelResult<H> {
        if let Some((_, handle)) = self.resolved.get() {
            return Ok(handle.clone());
        }

        let chosen = {
            let table = self.table.read().unwrap_or_else(|e| e.into_inner());
            if !table.has_default() {
                return Err(AccelError::MissingDefaultKernel { op: self.name });
            }
            let level = table.choose_level(capability, self.name)?;
            let handle = table
                .get(level)
                .cloned()
                .ok_or(AccelError::MissingDefaultKernel { op: self.name })?;
            (level, handle)
        };

        let (_, handle) = self.resolved.get_or_init(|| {
            log::info!(
                "{}: dispatching to {} kernel (capability {})",
                self.name,
                chosen.0,
                capability
            );
            chosen
        });
        Ok(handle.clone())
    }

    /// Level of the memoized kernel, if resolved.
    pub fn resolved_level(&self) -> Option<CapabilityLevel> {
        self.resolved.get().map(|(level, _)| *level)
    }

    pub fn registered_levels(&self) -> Vec<CapabilityLevel> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.levels().collect()
    }
}
