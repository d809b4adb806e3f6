// Wire contract between an execution context and its parent

use super::refs::{OperationToken, RefId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A ref mutation travelling between contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefUpdate {
    pub id: RefId,
    pub token: OperationToken,
    pub content: Value,
}

/// Messages a worker sends to its parent during one run
///
/// Zero or more `RefUpdate`s may precede the single `Completion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    Completion {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        elapsed_ms: u64,
    },

    RefUpdate {
        id: RefId,
        token: OperationToken,
        content: Value,
    },
}

impl From<RefUpdate> for WireMessage {
    fn from(update: RefUpdate) -> Self {
        WireMessage::RefUpdate {
            id: update.id,
            token: update.token,
            content: update.content,
        }
    }
}
