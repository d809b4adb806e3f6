// Error types for isolated task execution

use super::refs::RefId;
use super::runtime::ContextStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for threading operations
///
/// This is the primary error type returned by the runtime, contexts and the
/// pool. Individual error types are exposed through `From` conversions.
#[derive(Debug, Error)]
pub enum ThreadingError {
    #[error("Execution context error: {0}")]
    Context(#[from] ContextError),

    #[error("Shared reference error: {0}")]
    Ref(#[from] RefError),

    #[error("No free execution context within {}ms", waited.as_millis())]
    PoolTimeout { waited: Duration },

    #[error("Thread pool has been shut down")]
    PoolShutdown,

    #[error("Feature '{0}' is disabled for this task")]
    FeatureDisabled(&'static str),

    #[error("Import '{name}' not found in module '{module}'")]
    ImportNotFound { module: String, name: String },

    #[error("Shared binding '{0}' not found")]
    MissingBinding(String),

    #[error("Serialization failed: {0}")]
    Serialize(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ThreadingError {
    fn from(err: serde_json::Error) -> Self {
        ThreadingError::Serialize(err.to_string())
    }
}

/// Errors raised by the isolation layer of a single execution context
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Failed to spawn execution context {context}: {reason}")]
    Spawn { context: usize, reason: String },

    #[error("Execution context {context} is {status}")]
    Busy {
        context: usize,
        status: ContextStatus,
    },

    #[error("Execution context {context} has been disposed")]
    Disposed { context: usize },

    #[error("Worker thread of context {context} is gone")]
    WorkerShutdown { context: usize },
}

/// Errors raised by the shared reference registry
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefError {
    #[error("A shared reference can only be created in the root context")]
    NotRootContext,

    #[error("Shared reference {0} is not known in this context")]
    NotFound(RefId),

    #[error("Shared reference {0} is locked by an in-flight mutation")]
    Locked(RefId),

    #[error("Update to shared reference {id} dropped after {attempts} attempts")]
    Stale { id: RefId, attempts: u32 },

    #[error("Shared reference content could not be decoded: {0}")]
    Decode(String),

    #[error("Shared references are disabled for this task")]
    Disabled,
}

/// Failure of a single task run, delivered as a typed result
///
/// None of these variants crash the coordinator; only `ContextLost` affects
/// the state of the context that ran the task.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum TaskFailure {
    #[error("Task raised: {0}")]
    Raised(String),

    #[error("Execution context terminated before completing the task")]
    ContextLost,

    #[error("Task cancelled because its execution context was disposed")]
    Cancelled,

    #[error("Task result could not be decoded: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            ThreadingError::PoolTimeout {
                waited: Duration::from_millis(100)
            }
            .to_string(),
            "No free execution context within 100ms"
        );

        assert_eq!(
            ContextError::Busy {
                context: 3,
                status: ContextStatus::Occupied
            }
            .to_string(),
            "Execution context 3 is occupied"
        );

        assert_eq!(
            RefError::NotRootContext.to_string(),
            "A shared reference can only be created in the root context"
        );

        assert_eq!(
            TaskFailure::Raised("boom".to_string()).to_string(),
            "Task raised: boom"
        );
    }

    #[test]
    fn from_conversions_work() {
        let context_err: ThreadingError = ContextError::Disposed { context: 0 }.into();
        assert!(matches!(context_err, ThreadingError::Context(_)));

        let ref_err: ThreadingError = RefError::NotRootContext.into();
        assert!(matches!(ref_err, ThreadingError::Ref(RefError::NotRootContext)));

        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let ser_err: ThreadingError = json_err.into();
        assert!(matches!(ser_err, ThreadingError::Serialize(_)));
    }

    #[test]
    fn task_failure_wire_shape() {
        let json = serde_json::to_value(TaskFailure::ContextLost).unwrap();
        assert_eq!(json["kind"], "context-lost");

        let json = serde_json::to_value(TaskFailure::Raised("x".into())).unwrap();
        assert_eq!(json["detail"], "x");
    }
}
