// Shared references - registry cells mirrored across execution contexts

pub mod handle;
pub mod registry;

pub use handle::{collect_ref_ids, OperationToken, Ref, RefAccess, RefId, REF_MARKER};
pub use registry::{ApplyOutcome, ContextRole, SharedCell, SharedRegistry};
