// SharedRegistry - per-context table of shared reference cells

use super::handle::{OperationToken, RefId};
use crate::threading::error::RefError;
use crate::threading::message::RefUpdate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Which side of the isolation boundary a registry lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
    Root,
    Worker,
}

/// Backing storage of one shared reference in one context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedCell {
    pub id: RefId,
    pub content: Value,
    pub last_operation: OperationToken,
    pub locked: bool,
}

/// Result of offering a remote update to the local registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Token already applied here
    Duplicate,
    /// A local mutation is in flight; retry later
    Locked,
    /// The cell was never mirrored into this context
    Unknown,
}

/// Table of shared cells owned by one execution context
///
/// Every context has its own registry; the same `RefId` can hold diverging
/// content in different registries until updates propagate. The `locked`
/// flag of a cell brackets exactly one in-flight mutation.
#[derive(Debug)]
pub struct SharedRegistry {
    role: ContextRole,
    cells: Mutex<HashMap<RefId, SharedCell>>,
}

impl SharedRegistry {
    pub fn new(role: ContextRole) -> Self {
        Self {
            role,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Build a registry holding copies of `cells`, all unlocked
    pub fn from_cells(role: ContextRole, cells: impl IntoIterator<Item = SharedCell>) -> Self {
        let cells = cells
            .into_iter()
            .map(|mut cell| {
                cell.locked = false;
                (cell.id, cell)
            })
            .collect();
        Self {
            role,
            cells: Mutex::new(cells),
        }
    }

    pub fn role(&self) -> ContextRole {
        self.role
    }

    /// Allocate a new cell; only valid in the root context
    pub fn create(&self, value: Value) -> Result<RefId, RefError> {
        if self.role != ContextRole::Root {
            return Err(RefError::NotRootContext);
        }

        let id = RefId::new();
        self.cells.lock().insert(
            id,
            SharedCell {
                id,
                content: value,
                last_operation: OperationToken::new(),
                locked: false,
            },
        );
        tracing::debug!(ref_id = %id, "Created shared reference");
        Ok(id)
    }

    pub fn get(&self, id: RefId) -> Result<Value, RefError> {
        self.cells
            .lock()
            .get(&id)
            .map(|cell| cell.content.clone())
            .ok_or(RefError::NotFound(id))
    }

    pub fn token(&self, id: RefId) -> Result<OperationToken, RefError> {
        self.cells
            .lock()
            .get(&id)
            .map(|cell| cell.last_operation)
            .ok_or(RefError::NotFound(id))
    }

    pub fn cell(&self, id: RefId) -> Option<SharedCell> {
        self.cells.lock().get(&id).cloned()
    }

    pub fn is_locked(&self, id: RefId) -> bool {
        self.cells.lock().get(&id).is_some_and(|cell| cell.locked)
    }

    pub fn contains(&self, id: RefId) -> bool {
        self.cells.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of the requested cells; unknown ids are skipped
    pub fn snapshot(&self, ids: &[RefId]) -> Vec<SharedCell> {
        let cells = self.cells.lock();
        ids.iter().filter_map(|id| cells.get(id).cloned()).collect()
    }

    /// Replace the local content with a fresh token
    ///
    /// Returns the update to broadcast to connected contexts.
    pub fn set_local(&self, id: RefId, value: Value) -> Result<RefUpdate, RefError> {
        let mut cells = self.cells.lock();
        let cell = cells.get_mut(&id).ok_or(RefError::NotFound(id))?;
        if cell.locked {
            return Err(RefError::Locked(id));
        }

        cell.content = value;
        cell.last_operation = OperationToken::new();
        Ok(RefUpdate {
            id,
            token: cell.last_operation,
            content: cell.content.clone(),
        })
    }

    /// Read-modify-write bracketed by the cell's `locked` flag
    ///
    /// The registry mutex is not held while `f` runs, so remote updates that
    /// arrive meanwhile observe the lock and have to retry.
    pub fn update_with<F>(&self, id: RefId, f: F) -> Result<RefUpdate, RefError>
    where
        F: FnOnce(Value) -> Result<Value, RefError>,
    {
        let current = {
            let mut cells = self.cells.lock();
            let cell = cells.get_mut(&id).ok_or(RefError::NotFound(id))?;
            if cell.locked {
                return Err(RefError::Locked(id));
            }
            cell.locked = true;
            cell.content.clone()
        };

        let mut guard = CellLock {
            registry: self,
            id,
            armed: true,
        };
        let next = f(current);
        guard.armed = false;

        // Unlock and store under one critical section so no remote update can
        // slip in between.
        let mut cells = self.cells.lock();
        let cell = cells.get_mut(&id).ok_or(RefError::NotFound(id))?;
        cell.locked = false;
        cell.content = next?;
        cell.last_operation = OperationToken::new();
        Ok(RefUpdate {
            id,
            token: cell.last_operation,
            content: cell.content.clone(),
        })
    }

    /// Apply a remote update iff the cell is unlocked and the token is new
    pub fn try_apply(&self, update: &RefUpdate) -> ApplyOutcome {
        let mut cells = self.cells.lock();
        let Some(cell) = cells.get_mut(&update.id) else {
            return ApplyOutcome::Unknown;
        };
        if cell.locked {
            return ApplyOutcome::Locked;
        }
        if cell.last_operation == update.token {
            return ApplyOutcome::Duplicate;
        }

        // The registry mutex brackets the assignment, so the cell is never
        // observable half-applied.
        cell.content = update.content.clone();
        cell.last_operation = update.token;
        ApplyOutcome::Applied
    }
}

/// Clears the `locked` flag even if the update closure panics
struct CellLock<'a> {
    registry: &'a SharedRegistry,
    id: RefId,
    armed: bool,
}

impl Drop for CellLock<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(cell) = self.registry.cells.lock().get_mut(&self.id) {
            cell.locked = false;
        }
    }
}
