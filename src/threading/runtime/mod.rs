// Runtime - isolated worker threads, execution contexts and the pool

pub mod context;
pub mod pool;
pub mod worker;

pub use context::{ContextChannel, ContextStatus, ExecutionContext};
pub use pool::{PoolChannel, RecycleReport, ThreadPool};
pub use worker::Features;
