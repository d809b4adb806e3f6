// Runtime events - observability signals for contexts, tasks and refs
//
// Events are fire-and-forget: emitting without subscribers is not an error,
// and slow subscribers lose the oldest events rather than blocking workers.

use super::refs::RefId;
use super::runtime::ContextStatus;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tokio::sync::broadcast;

/// Default capacity of the broadcast ring
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum RuntimeEvent {
    ContextStatusChanged {
        context: usize,
        from: ContextStatus,
        to: ContextStatus,
    },

    TaskCompleted {
        context: Option<usize>,
        success: bool,
        elapsed_ms: u64,
    },

    /// A ref-update could not be applied within the retry bound and was dropped
    StaleRefUpdate {
        id: RefId,
        context: Option<usize>,
        attempts: u32,
    },

    /// A task ran on the caller's thread because no context was free in time
    DegradedFallback { waited_ms: u64 },

    SlotRecycled { slot: usize },
}

impl RuntimeEvent {
    pub fn name(&self) -> Cow<'static, str> {
        match self {
            RuntimeEvent::ContextStatusChanged { .. } => Cow::Borrowed("context.status"),
            RuntimeEvent::TaskCompleted { .. } => Cow::Borrowed("task.completed"),
            RuntimeEvent::StaleRefUpdate { .. } => Cow::Borrowed("ref.stale"),
            RuntimeEvent::DegradedFallback { .. } => Cow::Borrowed("pool.fallback"),
            RuntimeEvent::SlotRecycled { .. } => Cow::Borrowed("pool.recycled"),
        }
    }
}

/// Broadcast bus for `RuntimeEvent`s
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: RuntimeEvent) {
        tracing::trace!(event = %event.name(), "Runtime event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names() {
        let event = RuntimeEvent::StaleRefUpdate {
            id: RefId::new(),
            context: Some(1),
            attempts: 3,
        };
        assert_eq!(event.name().as_ref(), "ref.stale");
        assert_eq!(
            RuntimeEvent::SlotRecycled { slot: 0 }.name().as_ref(),
            "pool.recycled"
        );
    }

    #[test]
    fn event_serialization() {
        let event = RuntimeEvent::DegradedFallback { waited_ms: 100 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "degraded-fallback");
        assert_eq!(json["payload"]["waited_ms"], 100);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(RuntimeEvent::SlotRecycled { slot: 2 });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(RuntimeEvent::SlotRecycled { slot: 2 });

        let received = rx.try_recv().unwrap();
        assert_eq!(received, RuntimeEvent::SlotRecycled { slot: 2 });
    }
}
