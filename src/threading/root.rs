// Root context - the process-scoped owner of the authoritative registry

use super::config::RuntimeConfig;
use super::error::{RefError, ThreadingError};
use super::events::{EventBus, RuntimeEvent};
use super::imports::ModuleTable;
use super::message::RefUpdate;
use super::refs::{
    ApplyOutcome, ContextRole, OperationToken, Ref, RefAccess, RefId, SharedRegistry,
};
use super::runtime::{ExecutionContext, ThreadPool};
use super::serializer::{build_payload, JsonSerializer, Payload, Serializer};
use super::task::Task;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};

/// Identifier of one open channel between the root and a running task
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub(crate) struct ChildId(u64);

struct ChildLink {
    context: Option<usize>,
    tx: std_mpsc::Sender<RefUpdate>,
}

struct RootInner {
    config: RuntimeConfig,
    registry: SharedRegistry,
    children: Mutex<HashMap<ChildId, ChildLink>>,
    next_child: AtomicU64,
    modules: ModuleTable,
    serializer: Arc<dyn Serializer>,
    events: Arc<EventBus>,
}

/// The context that initiates a computation
///
/// Owns the root registry (the only place refs can be created), the module
/// table tasks import from, the serializer and the event bus. Cloning is
/// cheap; every clone refers to the same root.
#[derive(Clone)]
pub struct RootContext {
    inner: Arc<RootInner>,
}

impl Default for RootContext {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for RootContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootContext")
            .field("refs", &self.inner.registry.len())
            .field("children", &self.open_children())
            .field("serializer", &self.inner.serializer.name())
            .finish_non_exhaustive()
    }
}

impl RootContext {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_serializer(config, Arc::new(JsonSerializer))
    }

    pub fn with_serializer(config: RuntimeConfig, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            inner: Arc::new(RootInner {
                config,
                registry: SharedRegistry::new(ContextRole::Root),
                children: Mutex::new(HashMap::new()),
                next_child: AtomicU64::new(0),
                modules: ModuleTable::new(),
                serializer,
                events: Arc::new(EventBus::new()),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.inner.registry
    }

    pub fn modules(&self) -> &ModuleTable {
        &self.inner.modules
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Create a shared reference holding `value`
    pub fn create_ref<T: Serialize>(&self, value: T) -> Result<Ref<T>, ThreadingError> {
        let value = serde_json::to_value(value)?;
        let id = self.inner.registry.create(value)?;
        Ok(Ref::from_id(id))
    }

    /// Typed read of the root copy
    pub fn get<T: Serialize + DeserializeOwned>(&self, handle: &Ref<T>) -> Result<T, RefError> {
        handle.get(self)
    }

    /// Typed write to the root copy, broadcast to every open child
    pub fn set<T: Serialize + DeserializeOwned>(
        &self,
        handle: &Ref<T>,
        value: T,
    ) -> Result<OperationToken, RefError> {
        handle.set(self, value)
    }

    /// Expose a function to tasks under `module.name`
    pub fn register_import<F>(&self, module: impl Into<String>, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.inner.modules.register(module, name, f);
    }

    /// A fresh, uninitialized execution context for ad hoc runs
    pub fn context(&self, id: usize) -> ExecutionContext {
        ExecutionContext::new(id, self.clone())
    }

    /// Pool sized from this root's configuration
    pub fn pool(&self) -> Result<ThreadPool, ThreadingError> {
        ThreadPool::init(self, self.inner.config.pool.clone())
    }

    /// Serialize a task against this root's modules and registry
    pub fn prepare<T>(&self, task: Task<T>) -> Result<Payload, ThreadingError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        build_payload(
            task.into_parts(),
            &self.inner.serializer,
            &self.inner.modules,
            &self.inner.registry,
        )
    }

    pub fn open_children(&self) -> usize {
        self.inner.children.lock().len()
    }

    pub(crate) fn attach_child(
        &self,
        context: Option<usize>,
    ) -> (ChildId, std_mpsc::Receiver<RefUpdate>) {
        let id = ChildId(self.inner.next_child.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = std_mpsc::channel();
        self.inner
            .children
            .lock()
            .insert(id, ChildLink { context, tx });
        (id, rx)
    }

    pub(crate) fn detach_child(&self, id: ChildId) {
        self.inner.children.lock().remove(&id);
    }

    /// Send an update to every open child except `except`
    fn broadcast(&self, update: &RefUpdate, except: Option<ChildId>) {
        let children = self.inner.children.lock();
        for (id, link) in children.iter() {
            if Some(*id) == except {
                continue;
            }
            if link.tx.send(update.clone()).is_err() {
                tracing::debug!(
                    context = ?link.context,
                    ref_id = %update.id,
                    "Child channel closed before broadcast"
                );
            }
        }
    }

    /// Apply an update received from a child, retrying while the cell is
    /// locked, and relay it to the other children once applied
    pub(crate) async fn apply_remote(
        &self,
        update: RefUpdate,
        origin: Option<ChildId>,
        context: Option<usize>,
    ) {
        let sync = &self.inner.config.sync;
        let max_attempts = sync.apply_retries.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.inner.registry.try_apply(&update) {
                ApplyOutcome::Applied => {
                    tracing::debug!(ref_id = %update.id, ?context, "Applied ref-update");
                    self.broadcast(&update, origin);
                    return;
                }
                ApplyOutcome::Duplicate => {
                    tracing::trace!(ref_id = %update.id, "Dropped duplicate ref-update");
                    return;
                }
                ApplyOutcome::Unknown => {
                    tracing::warn!(
                        ref_id = %update.id,
                        ?context,
                        "Ref-update for a reference the root never created"
                    );
                    return;
                }
                ApplyOutcome::Locked if attempts >= max_attempts => {
                    report_stale(&self.inner.events, update.id, context, attempts);
                    return;
                }
                ApplyOutcome::Locked => tokio::time::sleep(sync.apply_backoff()).await,
            }
        }
    }
}

impl RefAccess for RootContext {
    fn read(&self, id: RefId) -> Result<Value, RefError> {
        self.inner.registry.get(id)
    }

    fn write(&self, id: RefId, value: Value) -> Result<OperationToken, RefError> {
        let update = self.inner.registry.set_local(id, value)?;
        self.broadcast(&update, None);
        Ok(update.token)
    }

    fn modify(
        &self,
        id: RefId,
        f: &mut dyn FnMut(Value) -> Result<Value, RefError>,
    ) -> Result<OperationToken, RefError> {
        let update = self.inner.registry.update_with(id, f)?;
        self.broadcast(&update, None);
        Ok(update.token)
    }
}

/// Surface a dropped ref-update; never silently desynchronize
pub(crate) fn report_stale(events: &EventBus, id: RefId, context: Option<usize>, attempts: u32) {
    let error = RefError::Stale { id, attempts };
    tracing::warn!(ref_id = %id, ?context, %error, "Dropped ref-update: cell stayed locked");
    events.emit(RuntimeEvent::StaleRefUpdate {
        id,
        context,
        attempts,
    });
}
