// table.rs - Method table manager
//
// Owns the slot table of compiled routines and every write to a method's
// `compiled_slot`. Slot 0 is the null entry. Permanent installs append;
// the execution gate rebinds a method to a fresh probe slot and the guard
// returned for it restores the binding and drops the probe when it goes out
// of scope, on every exit path including unwinding.

use crate::engine::Routine;
use crate::error::TableError;
use crate::object::{Method, MethodId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

struct TableState {
    slots: Vec<Option<Arc<Routine>>>,
    /// Methods with a write to `compiled_slot` in flight
    writers: HashSet<MethodId>,
}

/// Shared indirect-call table
pub struct MethodTable {
    state: Mutex<TableState>,
}

impl Default for MethodTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable").field("len", &self.len()).finish()
    }
}

impl MethodTable {
    pub fn new() -> Self {
        MethodTable {
            state: Mutex::new(TableState {
                slots: vec![None],
                writers: HashSet::new(),
            }),
        }
    }

    /// Number of slots, including the null entry
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// True when only the null entry exists
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Append a routine and return its slot index
    pub fn allocate_slot(&self, routine: Arc<Routine>) -> u32 {
        let mut state = self.state.lock();
        state.slots.push(Some(routine));
        (state.slots.len() - 1) as u32
    }

    /// Point `method` at an allocated slot
    pub fn bind(&self, method: &Method, slot: u32) -> Result<(), TableError> {
        let state = self.state.lock();
        if state.writers.contains(&method.id()) {
            return Err(TableError::BindConflict {
                selector: method.selector().to_string(),
            });
        }
        match state.slots.get(slot as usize) {
            Some(Some(_)) => {
                method.set_compiled_slot(slot);
                Ok(())
            }
            _ => Err(TableError::UnknownSlot(slot)),
        }
    }

    /// Allocate a slot for `routine` and bind `method` to it
    pub fn install(&self, method: &Method, routine: Arc<Routine>) -> Result<u32, TableError> {
        let mut state = self.state.lock();
        if state.writers.contains(&method.id()) {
            return Err(TableError::BindConflict {
                selector: method.selector().to_string(),
            });
        }
        state.slots.push(Some(routine));
        let slot = (state.slots.len() - 1) as u32;
        method.set_compiled_slot(slot);
        tracing::info!(selector = method.selector(), slot, "installed compiled routine");
        Ok(slot)
    }

    /// Routine in `slot`, if any
    pub fn routine(&self, slot: u32) -> Option<Arc<Routine>> {
        self.state.lock().slots.get(slot as usize).cloned().flatten()
    }

    /// Whether a write to `method`'s binding is in flight
    pub fn is_writing(&self, method: MethodId) -> bool {
        self.state.lock().writers.contains(&method)
    }

    /// Bind `method` to `routine` in a fresh probe slot, run `body`, then
    /// restore the previous binding and retire the probe slot.
    ///
    /// The lock is not held while `body` runs, so `body` may dispatch
    /// through the table.
    pub fn temporarily_rebind_and_restore<R>(
        &self,
        method: &Method,
        routine: Arc<Routine>,
        body: impl FnOnce() -> R,
    ) -> Result<R, TableError> {
        let _probe = self.rebind(method, routine)?;
        Ok(body())
    }

    fn rebind<'a>(&'a self, method: &'a Method, routine: Arc<Routine>) -> Result<ProbeGuard<'a>, TableError> {
        let mut state = self.state.lock();
        if !state.writers.insert(method.id()) {
            return Err(TableError::BindConflict {
                selector: method.selector().to_string(),
            });
        }
        state.slots.push(Some(routine));
        let probe = (state.slots.len() - 1) as u32;
        let prior = method.compiled_slot();
        method.set_compiled_slot(probe);
        tracing::debug!(selector = method.selector(), probe, prior, "probe slot bound");
        Ok(ProbeGuard {
            table: self,
            method,
            prior,
            probe,
        })
    }
}

/// Restores a method's binding when dropped
struct ProbeGuard<'a> {
    table: &'a MethodTable,
    method: &'a Method,
    prior: u32,
    probe: u32,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.table.state.lock();
        self.method.set_compiled_slot(self.prior);
        let probe = self.probe as usize;
        if probe + 1 == state.slots.len() {
            state.slots.pop();
        } else if let Some(entry) = state.slots.get_mut(probe) {
            // Later installs sit above the probe; leave a hole
            *entry = None;
        }
        state.writers.remove(&self.method.id());
        tracing::debug!(selector = self.method.selector(), restored = self.prior, "probe slot retired");
    }
}
