// Task description and outcome types

use super::error::{TaskFailure, ThreadingError};
use super::imports::{ImportSpec, Imports};
use super::refs::Ref;
use super::runtime::Features;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Closure executed inside an isolated context
///
/// It may only use its declared inputs: the shared snapshot, the resolved
/// imports and the feature surface. Anything else it captures must be
/// immutable and `Send + Sync`.
pub type TaskAction<T> =
    Arc<dyn Fn(&Shared, &Imports, &Features) -> anyhow::Result<T> + Send + Sync>;

/// Type-erased action whose result has already been turned into a `Value`
pub type ErasedAction =
    Arc<dyn Fn(&Shared, &Imports, &Features) -> anyhow::Result<Value> + Send + Sync>;

/// Capabilities enabled for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// `Features::sleep` is available
    pub sleep: bool,

    /// `Features` implements ref get/set
    pub refs: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            sleep: true,
            refs: true,
        }
    }
}

impl FeatureFlags {
    pub fn none() -> Self {
        Self {
            sleep: false,
            refs: false,
        }
    }
}

/// Snapshot of shared bindings handed to a task
///
/// Every context receives its own decoded copy; mutating it never affects
/// the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shared(Map<String, Value>);

impl Shared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Decode a binding into `T`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ThreadingError> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| ThreadingError::MissingBinding(key.to_string()))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Decode a binding holding a ref handle
    pub fn get_ref<T>(&self, key: &str) -> Result<Ref<T>, ThreadingError> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| ThreadingError::MissingBinding(key.to_string()))?;
        Ok(Ref::deserialize(value)?)
    }

    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

/// An immutable description of one unit of work
pub struct Task<T> {
    action: TaskAction<T>,
    shared: Shared,
    imports: ImportSpec,
    features: FeatureFlags,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            action: Arc::clone(&self.action),
            shared: self.shared.clone(),
            imports: self.imports.clone(),
            features: self.features,
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("shared", &self.shared)
            .field("imports", &self.imports)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

impl<T> Task<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new<F>(action: F) -> Self
    where
        F: Fn(&Shared, &Imports, &Features) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            action: Arc::new(action),
            shared: Shared::new(),
            imports: ImportSpec::new(),
            features: FeatureFlags::default(),
        }
    }

    /// Add a shared binding; ref handles are mirrored into the worker
    pub fn with_shared(
        mut self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<Self, ThreadingError> {
        self.shared.insert(key, serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn with_shared_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.shared.insert(key, value);
        self
    }

    /// Request `names` from a registered module
    pub fn with_import<I, S>(mut self, module: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.imports.add(module, names);
        self
    }

    pub fn with_features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    pub fn shared(&self) -> &Shared {
        &self.shared
    }

    pub fn imports(&self) -> &ImportSpec {
        &self.imports
    }

    pub fn features(&self) -> FeatureFlags {
        self.features
    }

    /// Split into the pieces the serializer consumes
    pub(crate) fn into_parts(self) -> TaskParts {
        let action = self.action;
        let erased: ErasedAction = Arc::new(move |shared, imports, features| {
            let result = action(shared, imports, features)?;
            Ok(serde_json::to_value(result)?)
        });

        TaskParts {
            action: erased,
            shared: self.shared,
            imports: self.imports,
            features: self.features,
        }
    }
}

pub(crate) struct TaskParts {
    pub action: ErasedAction,
    pub shared: Shared,
    pub imports: ImportSpec,
    pub features: FeatureFlags,
}

/// Wall-clock and elapsed time of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTiming {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl TaskTiming {
    pub fn new(started_at: DateTime<Utc>, finished_at: DateTime<Utc>, elapsed: Duration) -> Self {
        Self {
            started_at,
            finished_at,
            elapsed,
        }
    }

    /// Timing measured on the coordinator when the worker never reported
    pub fn since(started_at: DateTime<Utc>) -> Self {
        let finished_at = Utc::now();
        let elapsed = (finished_at - started_at).to_std().unwrap_or_default();
        Self::new(started_at, finished_at, elapsed)
    }
}

/// Result of running a task; resolved exactly once per run
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Success { result: T, timing: TaskTiming },
    Failure { error: TaskFailure, timing: TaskTiming },
}

impl<T> TaskOutcome<T> {
    pub fn timing(&self) -> &TaskTiming {
        match self {
            TaskOutcome::Success { timing, .. } | TaskOutcome::Failure { timing, .. } => timing,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }

    pub fn result(&self) -> Option<&T> {
        match self {
            TaskOutcome::Success { result, .. } => Some(result),
            TaskOutcome::Failure { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            TaskOutcome::Success { .. } => None,
            TaskOutcome::Failure { error, .. } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<T, TaskFailure> {
        match self {
            TaskOutcome::Success { result, .. } => Ok(result),
            TaskOutcome::Failure { error, .. } => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threading::refs::RefId;

    #[test]
    fn shared_get_decodes_bindings() {
        let task = Task::new(|_, _, _| Ok(0u8))
            .with_shared("numbers", vec![1, 2, 3])
            .unwrap();

        let numbers: Vec<i32> = task.shared().get("numbers").unwrap();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn shared_get_missing_key() {
        let shared = Shared::new();
        let err = shared.get::<u8>("nope").unwrap_err();
        assert!(matches!(err, ThreadingError::MissingBinding(key) if key == "nope"));
    }

    #[test]
    fn shared_get_ref_round_trips_handle() {
        let handle: Ref<String> = Ref::from_id(RefId::new());
        let task = Task::new(|_, _, _| Ok(()))
            .with_shared("greeting", handle)
            .unwrap();

        let back: Ref<String> = task.shared().get_ref("greeting").unwrap();
        assert_eq!(back, handle);
    }

    #[test]
    fn cloned_task_keeps_description() {
        let task = Task::new(|_, _, _| Ok(1u32))
            .with_shared_value("x", serde_json::json!(7))
            .with_import("math", ["add", "mul"])
            .with_features(FeatureFlags::none());

        let copy = task.clone();
        assert_eq!(copy.shared(), task.shared());
        assert_eq!(copy.imports(), task.imports());
        assert_eq!(copy.features(), FeatureFlags::none());
    }

    #[test]
    fn outcome_accessors() {
        let timing = TaskTiming::since(Utc::now());
        let ok: TaskOutcome<u8> = TaskOutcome::Success { result: 4, timing };
        assert!(ok.is_success());
        assert_eq!(ok.result(), Some(&4));
        assert_eq!(ok.into_result(), Ok(4));

        let failed: TaskOutcome<u8> = TaskOutcome::Failure {
            error: TaskFailure::ContextLost,
            timing,
        };
        assert_eq!(failed.failure(), Some(&TaskFailure::ContextLost));
        assert_eq!(failed.timing().started_at, timing.started_at);
    }
}
