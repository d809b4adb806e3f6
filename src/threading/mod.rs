// Isolated task execution with shared-ref synchronization
//
// A `RootContext` owns the authoritative ref registry. Tasks run on
// `ExecutionContext`s (one OS thread each), alone or borrowed from a
// `ThreadPool`; they see copies of their inputs and talk back only through
// completion and ref-update messages.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod imports;
pub mod message;
pub mod refs;
pub mod root;
pub mod runtime;
pub mod serializer;
pub mod task;

pub use config::{PoolConfig, RuntimeConfig, SyncConfig, WorkerConfig};
pub use error::{ContextError, RefError, TaskFailure, ThreadingError};
pub use events::{EventBus, RuntimeEvent};
pub use imports::{ImportSpec, Imports, ModuleTable};
pub use message::{RefUpdate, WireMessage};
pub use refs::{OperationToken, Ref, RefAccess, RefId};
pub use root::RootContext;
pub use runtime::{
    ContextChannel, ContextStatus, ExecutionContext, Features, PoolChannel, RecycleReport,
    ThreadPool,
};
pub use serializer::{JsonSerializer, Payload, Serializer};
pub use task::{FeatureFlags, Shared, Task, TaskOutcome, TaskTiming};
