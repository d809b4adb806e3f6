// Worker thread - the isolated side of an execution context

use crate::threading::config::{SyncConfig, WorkerConfig};
use crate::threading::error::{ContextError, RefError, ThreadingError};
use crate::threading::events::EventBus;
use crate::threading::message::{RefUpdate, WireMessage};
use crate::threading::refs::{
    ApplyOutcome, ContextRole, OperationToken, RefAccess, RefId, SharedRegistry,
};
use crate::threading::root::report_stale;
use crate::threading::serializer::Payload;
use crate::threading::task::FeatureFlags;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Commands accepted by a worker thread
pub(crate) enum WorkerCommand {
    Run {
        payload: Payload,
        outbound: mpsc::UnboundedSender<WireMessage>,
        inbound: std_mpsc::Receiver<RefUpdate>,
    },
    Shutdown,
}

/// Owning side of a spawned worker thread
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerCommand>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<WorkerCommand> {
        self.tx.clone()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Ask the thread to exit once its current run (if any) returns
    pub(crate) fn shutdown(self) -> JoinHandle<()> {
        let _ = self.tx.send(WorkerCommand::Shutdown);
        self.thread
    }
}

/// Spawn the OS thread backing execution context `context`
pub(crate) fn spawn_worker(
    context: usize,
    config: &WorkerConfig,
    sync: SyncConfig,
    events: Arc<EventBus>,
) -> Result<WorkerHandle, ContextError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerCommand>();

    let mut builder =
        std::thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, context));
    if let Some(stack_size) = config.stack_size {
        builder = builder.stack_size(stack_size);
    }

    let thread = builder
        .spawn(move || {
            tracing::debug!(context, "Worker thread started");
            while let Some(command) = rx.blocking_recv() {
                match command {
                    WorkerCommand::Run {
                        payload,
                        outbound,
                        inbound,
                    } => execute(
                        payload,
                        Some(context),
                        outbound,
                        Some(inbound),
                        sync.clone(),
                        Arc::clone(&events),
                    ),
                    WorkerCommand::Shutdown => break,
                }
            }
            tracing::debug!(context, "Worker thread exiting");
        })
        .map_err(|e| ContextError::Spawn {
            context,
            reason: e.to_string(),
        })?;

    Ok(WorkerHandle { tx, thread })
}

/// Run one payload to completion and report it on `outbound`
///
/// Used both by worker threads and by the pool's degraded fallback, which
/// calls it on the caller's own thread. A panic in the action is not caught:
/// on a worker thread it unwinds the thread and the parent sees the channel
/// close without a completion.
pub(crate) fn execute(
    payload: Payload,
    context: Option<usize>,
    outbound: mpsc::UnboundedSender<WireMessage>,
    inbound: Option<std_mpsc::Receiver<RefUpdate>>,
    sync: SyncConfig,
    events: Arc<EventBus>,
) {
    let features = Features {
        flags: payload.features,
        context,
        registry: SharedRegistry::from_cells(ContextRole::Worker, payload.cells.clone()),
        outbound: outbound.clone(),
        inbound,
        pending: Mutex::new(VecDeque::new()),
        sync,
        events,
    };

    let started_at = Utc::now();
    let clock = Instant::now();
    let result = payload
        .decode_shared()
        .map_err(anyhow::Error::from)
        .and_then(|shared| (payload.action)(&shared, &payload.imports, &features));
    let elapsed = clock.elapsed();
    let finished_at = Utc::now();

    let (result, error) = match result {
        Ok(value) => (Some(value), None),
        Err(e) => {
            tracing::debug!(?context, error = %e, "Task raised");
            (None, Some(format!("{e:#}")))
        }
    };

    let completion = WireMessage::Completion {
        result,
        error,
        started_at,
        finished_at,
        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
    };
    if outbound.send(completion).is_err() {
        tracing::debug!(?context, "Parent stopped listening before completion");
    }
}

/// Capabilities available to a running task
///
/// Besides its captured bindings, this is the only way a task interacts with
/// the outside world: cooperative sleep and ref get/set. Incoming ref-updates
/// from the parent are applied whenever the task calls into this surface.
pub struct Features {
    flags: FeatureFlags,
    context: Option<usize>,
    registry: SharedRegistry,
    outbound: mpsc::UnboundedSender<WireMessage>,
    inbound: Option<std_mpsc::Receiver<RefUpdate>>,
    pending: Mutex<VecDeque<(RefUpdate, u32)>>,
    sync: SyncConfig,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for Features {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Features")
            .field("flags", &self.flags)
            .field("context", &self.context)
            .field("refs", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Features {
    pub fn flags(&self) -> FeatureFlags {
        self.flags
    }

    /// Index of the execution context running this task; `None` when the
    /// task runs on the caller's thread
    pub fn context_id(&self) -> Option<usize> {
        self.context
    }

    pub fn is_isolated(&self) -> bool {
        self.context.is_some()
    }

    /// Block this context for `duration`
    ///
    /// The thread parks on the update channel rather than spinning, so ref
    /// updates from the parent keep being applied while asleep.
    pub fn sleep(&self, duration: Duration) -> Result<(), ThreadingError> {
        if !self.flags.sleep {
            return Err(ThreadingError::FeatureDisabled("sleep"));
        }

        let deadline = Instant::now() + duration;
        self.sync_inbound();

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let mut wait = deadline - now;
            if !self.pending.lock().is_empty() {
                wait = wait.min(self.sync.apply_backoff());
            }

            match &self.inbound {
                Some(inbound) => match inbound.recv_timeout(wait) {
                    Ok(update) => self.offer(update),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                        break;
                    }
                },
                None => std::thread::sleep(wait),
            }
            self.retry_pending();
        }
        Ok(())
    }

    pub fn sleep_ms(&self, millis: u64) -> Result<(), ThreadingError> {
        self.sleep(Duration::from_millis(millis))
    }

    /// Apply every update the parent has sent so far
    fn sync_inbound(&self) {
        self.retry_pending();
        let Some(inbound) = &self.inbound else {
            return;
        };
        loop {
            match inbound.try_recv() {
                Ok(update) => self.offer(update),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn offer(&self, update: RefUpdate) {
        match self.registry.try_apply(&update) {
            ApplyOutcome::Applied => {
                tracing::trace!(
                    ref_id = %update.id,
                    context = ?self.context,
                    "Applied parent update"
                )
            }
            ApplyOutcome::Duplicate | ApplyOutcome::Unknown => {}
            ApplyOutcome::Locked => self.pending.lock().push_back((update, 1)),
        }
    }

    fn retry_pending(&self) {
        let mut pending = self.pending.lock();
        let max_attempts = self.sync.apply_retries.max(1);

        for _ in 0..pending.len() {
            let Some((update, attempts)) = pending.pop_front() else {
                break;
            };
            match self.registry.try_apply(&update) {
                ApplyOutcome::Locked if attempts + 1 >= max_attempts => {
                    report_stale(&self.events, update.id, self.context, attempts + 1);
                }
                ApplyOutcome::Locked => pending.push_back((update, attempts + 1)),
                _ => {}
            }
        }
    }

    fn ensure_refs(&self) -> Result<(), RefError> {
        if self.flags.refs {
            Ok(())
        } else {
            Err(RefError::Disabled)
        }
    }

    fn publish(&self, update: RefUpdate) {
        if self.outbound.send(update.into()).is_err() {
            tracing::debug!(context = ?self.context, "Parent gone; ref-update not delivered");
        }
    }
}

impl RefAccess for Features {
    fn read(&self, id: RefId) -> Result<Value, RefError> {
        self.ensure_refs()?;
        self.sync_inbound();
        self.registry.get(id)
    }

    fn write(&self, id: RefId, value: Value) -> Result<OperationToken, RefError> {
        self.ensure_refs()?;
        self.sync_inbound();
        let update = self.registry.set_local(id, value)?;
        let token = update.token;
        self.publish(update);
        Ok(token)
    }

    fn modify(
        &self,
        id: RefId,
        f: &mut dyn FnMut(Value) -> Result<Value, RefError>,
    ) -> Result<OperationToken, RefError> {
        self.ensure_refs()?;
        self.sync_inbound();
        let update = self.registry.update_with(id, f)?;
        let token = update.token;
        self.publish(update);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threading::events::RuntimeEvent;
    use crate::threading::imports::ModuleTable;
    use crate::threading::refs::Ref;
    use crate::threading::serializer::{build_payload, JsonSerializer, Serializer};
    use crate::threading::task::Task;
    use serde_json::json;

    fn payload_for<T>(task: Task<T>, registry: &SharedRegistry) -> Payload
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
    {
        let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer);
        build_payload(task.into_parts(), &serializer, &ModuleTable::new(), registry).unwrap()
    }

    fn completion(rx: &mut mpsc::UnboundedReceiver<WireMessage>) -> Vec<WireMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        messages
    }

    #[test]
    fn execute_reports_result() {
        let registry = SharedRegistry::new(ContextRole::Root);
        let task = Task::new(|shared, _, _| Ok(shared.get::<i64>("x")? * 2))
            .with_shared("x", 21)
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        execute(
            payload_for(task, &registry),
            None,
            tx,
            None,
            SyncConfig::default(),
            Arc::new(EventBus::new()),
        );

        let messages = completion(&mut rx);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            WireMessage::Completion { result, error, .. } => {
                assert_eq!(result.as_ref(), Some(&json!(42)));
                assert!(error.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn execute_reports_raised_error() {
        let registry = SharedRegistry::new(ContextRole::Root);
        let task: Task<u8> = Task::new(|_, _, _| anyhow::bail!("nope"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        execute(
            payload_for(task, &registry),
            None,
            tx,
            None,
            SyncConfig::default(),
            Arc::new(EventBus::new()),
        );

        match completion(&mut rx).pop() {
            Some(WireMessage::Completion { result, error, .. }) => {
                assert!(result.is_none());
                assert_eq!(error.as_deref(), Some("nope"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn ref_updates_precede_completion() {
        let registry = SharedRegistry::new(ContextRole::Root);
        let id = registry.create(json!(1)).unwrap();
        let handle: Ref<i64> = Ref::from_id(id);

        let task = Task::new(|shared, _, features| {
            let counter = shared.get_ref::<i64>("counter")?;
            counter.set(features, 5)?;
            counter.update(features, |n| n + 1)?;
            Ok(counter.get(features)?)
        })
        .with_shared("counter", handle)
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        execute(
            payload_for(task, &registry),
            Some(0),
            tx,
            None,
            SyncConfig::default(),
            Arc::new(EventBus::new()),
        );

        let messages = completion(&mut rx);
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            &messages[0],
            WireMessage::RefUpdate { content, .. } if *content == json!(5)
        ));
        assert!(matches!(
            &messages[1],
            WireMessage::RefUpdate { content, .. } if *content == json!(6)
        ));
        assert!(matches!(
            &messages[2],
            WireMessage::Completion { result: Some(v), .. } if *v == json!(6)
        ));

        // The caller's registry is untouched until it applies the updates
        assert_eq!(registry.get(id).unwrap(), json!(1));
    }

    #[test]
    fn disabled_features_are_refused() {
        let registry = SharedRegistry::new(ContextRole::Root);
        let id = registry.create(json!(1)).unwrap();
        let task = Task::new(|shared, _, features| {
            let sleep_err = features.sleep_ms(1).is_err();
            let ref_err = shared.get_ref::<i64>("r")?.get(features) == Err(RefError::Disabled);
            Ok((sleep_err, ref_err))
        })
        .with_shared("r", Ref::<i64>::from_id(id))
        .unwrap()
        .with_features(FeatureFlags::none());
        let (tx, mut rx) = mpsc::unbounded_channel();

        execute(
            payload_for(task, &registry),
            None,
            tx,
            None,
            SyncConfig::default(),
            Arc::new(EventBus::new()),
        );

        match completion(&mut rx).pop() {
            Some(WireMessage::Completion { result, .. }) => {
                assert_eq!(result, Some(json!([true, true])))
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn sleep_applies_parent_updates() {
        let registry = SharedRegistry::new(ContextRole::Root);
        let id = registry.create(json!("before")).unwrap();
        let (inbound_tx, inbound_rx) = std_mpsc::channel();
        let update = RefUpdate {
            id,
            token: OperationToken::new(),
            content: json!("after"),
        };
        inbound_tx.send(update).unwrap();

        let task = Task::new(|shared, _, features| {
            let r = shared.get_ref::<String>("r")?;
            features.sleep(Duration::from_millis(20))?;
            Ok(r.get(features)?)
        })
        .with_shared("r", Ref::<String>::from_id(id))
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        execute(
            payload_for(task, &registry),
            Some(0),
            tx,
            Some(inbound_rx),
            SyncConfig::default(),
            Arc::new(EventBus::new()),
        );

        match completion(&mut rx).pop() {
            Some(WireMessage::Completion { result, .. }) => {
                assert_eq!(result, Some(json!("after")))
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn parent_update_against_locked_cell_is_reported_stale() {
        let registry = SharedRegistry::new(ContextRole::Root);
        let id = registry.create(json!(1)).unwrap();
        let sync = SyncConfig {
            apply_retries: 3,
            apply_backoff_ms: 1,
        };
        let events = Arc::new(EventBus::new());
        let mut seen = events.subscribe();

        let (inbound_tx, inbound_rx) = std_mpsc::channel();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            inbound_tx
                .send(RefUpdate {
                    id,
                    token: OperationToken::new(),
                    content: json!(99),
                })
                .unwrap();
        });

        // The parent's update lands while this task holds the cell locked
        let task = Task::new(|shared, _, features| {
            let counter = shared.get_ref::<i64>("counter")?;
            counter.update(features, |n| {
                let _ = features.sleep_ms(100);
                n + 1
            })?;
            Ok(counter.get(features)?)
        })
        .with_shared("counter", Ref::<i64>::from_id(id))
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        execute(
            payload_for(task, &registry),
            Some(0),
            tx,
            Some(inbound_rx),
            sync,
            Arc::clone(&events),
        );
        sender.join().unwrap();

        match completion(&mut rx).pop() {
            Some(WireMessage::Completion { result, .. }) => assert_eq!(result, Some(json!(2))),
            other => panic!("unexpected message {other:?}"),
        }

        let mut stale = Vec::new();
        while let Ok(event) = seen.try_recv() {
            if let RuntimeEvent::StaleRefUpdate { .. } = event {
                stale.push(event);
            }
        }
        assert_eq!(
            stale,
            vec![RuntimeEvent::StaleRefUpdate {
                id,
                context: Some(0),
                attempts: 3
            }]
        );
    }

    #[test]
    fn spawned_worker_shuts_down() {
        let handle = spawn_worker(
            7,
            &WorkerConfig::default(),
            SyncConfig::default(),
            Arc::new(EventBus::new()),
        )
        .unwrap();
        assert_eq!(handle.thread.thread().name(), Some("isothread-worker-7"));

        handle.shutdown().join().unwrap();
    }
}
