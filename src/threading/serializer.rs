// Task marshalling across the isolation boundary

use super::error::ThreadingError;
use super::imports::{Imports, ModuleTable};
use super::refs::{collect_ref_ids, SharedCell, SharedRegistry};
use super::task::{ErasedAction, FeatureFlags, Shared, TaskParts};
use std::sync::Arc;

/// Encodes a task's shared snapshot into a self-contained byte payload
///
/// The worker decodes its own copy, so nothing in the snapshot is ever
/// aliased between the caller and the isolated context.
pub trait Serializer: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode_snapshot(&self, shared: &Shared) -> Result<Vec<u8>, ThreadingError>;

    fn decode_snapshot(&self, bytes: &[u8]) -> Result<Shared, ThreadingError>;
}

/// Default serializer backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_snapshot(&self, shared: &Shared) -> Result<Vec<u8>, ThreadingError> {
        Ok(serde_json::to_vec(shared)?)
    }

    fn decode_snapshot(&self, bytes: &[u8]) -> Result<Shared, ThreadingError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Everything a worker needs to run one task
pub struct Payload {
    pub(crate) action: ErasedAction,
    pub(crate) snapshot: Vec<u8>,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) imports: Imports,
    pub(crate) features: FeatureFlags,
    /// Copies of every shared cell referenced from the snapshot
    pub(crate) cells: Vec<SharedCell>,
}

impl Payload {
    pub fn snapshot_len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn mirrored_refs(&self) -> usize {
        self.cells.len()
    }

    pub(crate) fn decode_shared(&self) -> Result<Shared, ThreadingError> {
        self.serializer.decode_snapshot(&self.snapshot)
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("serializer", &self.serializer.name())
            .field("snapshot_len", &self.snapshot.len())
            .field("imports", &self.imports)
            .field("features", &self.features)
            .field("cells", &self.cells.len())
            .finish_non_exhaustive()
    }
}

/// Build a payload: encode the snapshot, resolve imports and mirror the
/// referenced cells out of `registry`
pub(crate) fn build_payload(
    parts: TaskParts,
    serializer: &Arc<dyn Serializer>,
    modules: &ModuleTable,
    registry: &SharedRegistry,
) -> Result<Payload, ThreadingError> {
    let imports = modules.resolve(&parts.imports)?;
    let snapshot = serializer.encode_snapshot(&parts.shared)?;

    let mut ids = Vec::new();
    for value in parts.shared.as_map().values() {
        collect_ref_ids(value, &mut ids);
    }
    let cells = registry.snapshot(&ids);
    if cells.len() != ids.len() {
        tracing::warn!(
            requested = ids.len(),
            mirrored = cells.len(),
            "Task references shared cells unknown to this context"
        );
    }

    Ok(Payload {
        action: parts.action,
        snapshot,
        serializer: Arc::clone(serializer),
        imports,
        features: parts.features,
        cells,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threading::refs::{ContextRole, Ref, RefId};
    use crate::threading::task::Task;
    use serde_json::json;

    #[test]
    fn json_snapshot_round_trip_is_a_copy() {
        let mut shared = Shared::new();
        shared.insert("a", json!({"nested": [1, 2]}));

        let bytes = JsonSerializer.encode_snapshot(&shared).unwrap();
        let decoded = JsonSerializer.decode_snapshot(&bytes).unwrap();
        assert_eq!(decoded, shared);
    }

    #[test]
    fn payload_mirrors_referenced_cells() {
        let registry = SharedRegistry::new(ContextRole::Root);
        let used = registry.create(json!("hello")).unwrap();
        let _unused = registry.create(json!("ignored")).unwrap();

        let task = Task::new(|_, _, _| Ok(()))
            .with_shared("greeting", Ref::<String>::from_id(used))
            .unwrap();

        let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer);
        let payload =
            build_payload(task.into_parts(), &serializer, &ModuleTable::new(), &registry).unwrap();

        assert_eq!(payload.mirrored_refs(), 1);
        assert_eq!(payload.cells[0].id, used);
        assert_eq!(payload.cells[0].content, json!("hello"));
    }

    #[test]
    fn unknown_refs_are_not_mirrored() {
        let registry = SharedRegistry::new(ContextRole::Root);
        let task = Task::new(|_, _, _| Ok(()))
            .with_shared("ghost", Ref::<u8>::from_id(RefId::new()))
            .unwrap();

        let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer);
        let payload =
            build_payload(task.into_parts(), &serializer, &ModuleTable::new(), &registry).unwrap();
        assert_eq!(payload.mirrored_refs(), 0);
    }

    #[test]
    fn unresolved_import_fails_before_dispatch() {
        let registry = SharedRegistry::new(ContextRole::Root);
        let task = Task::new(|_, _, _| Ok(())).with_import("fs", ["read"]);

        let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer);
        let err = build_payload(task.into_parts(), &serializer, &ModuleTable::new(), &registry)
            .unwrap_err();
        assert!(matches!(err, ThreadingError::ImportNotFound { .. }));
    }
}
