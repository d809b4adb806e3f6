// Thread pool of execution contexts with a FIFO borrow dispatcher

use super::context::{
    collect_outcome, duration_ms, ContextChannel, ContextStatus, ExecutionContext, FreeHook,
};
use super::worker::execute;
use crate::threading::config::PoolConfig;
use crate::threading::error::{ContextError, ThreadingError};
use crate::threading::events::RuntimeEvent;
use crate::threading::root::{ChildId, RootContext};
use crate::threading::task::{Task, TaskOutcome};
use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

type Slots = Arc<Mutex<Vec<ExecutionContext>>>;

/// Requests served by the dispatcher thread
enum DispatchCommand {
    Borrow { reply: oneshot::Sender<PoolChannel> },
    Release { slot: usize },
    Shutdown,
}

struct PoolInner {
    root: RootContext,
    config: PoolConfig,
    slots: Slots,
    dispatch: mpsc::UnboundedSender<DispatchCommand>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Fixed-size set of execution contexts
///
/// Borrowers are served by a dedicated dispatcher thread: the first free
/// context in creation order goes to the longest-waiting borrower. Cloning
/// yields another handle to the same pool; the last handle shuts it down.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

/// Result of `ThreadPool::recycle`
#[derive(Debug, Default)]
pub struct RecycleReport {
    /// Slots that now hold a fresh, free context
    pub recycled: Vec<usize>,

    /// Slots whose replacement could not be initialized; they stay `Created`
    pub failed: Vec<(usize, ThreadingError)>,
}

impl RecycleReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("config", &self.inner.config)
            .field("statuses", &self.statuses())
            .finish()
    }
}

impl ThreadPool {
    /// Create `config.size` initialized contexts and start the dispatcher
    pub fn init(root: &RootContext, config: PoolConfig) -> Result<Self, ThreadingError> {
        if config.size == 0 {
            return Err(ThreadingError::Config("pool size must be at least 1".into()));
        }

        let (dispatch, commands) = mpsc::unbounded_channel();
        let mut contexts: Vec<ExecutionContext> = Vec::with_capacity(config.size);
        for slot in 0..config.size {
            let context = root.context(slot);
            context.set_free_hook(free_hook(&dispatch));
            if let Err(e) = context.init() {
                for started in &contexts {
                    let _ = started.dispose();
                }
                return Err(e);
            }
            contexts.push(context);
        }

        let slots: Slots = Arc::new(Mutex::new(contexts));
        let name = format!("{}-dispatch", root.config().worker.thread_name_prefix);
        let dispatcher = {
            let slots = Arc::clone(&slots);
            std::thread::Builder::new()
                .name(name)
                .spawn(move || run_dispatcher(slots, commands))
        };
        let dispatcher = match dispatcher {
            Ok(handle) => handle,
            Err(e) => {
                for context in slots.lock().iter() {
                    let _ = context.dispose();
                }
                return Err(ContextError::Spawn {
                    context: config.size,
                    reason: e.to_string(),
                }
                .into());
            }
        };

        tracing::debug!(size = config.size, "Thread pool started");
        Ok(Self {
            inner: Arc::new(PoolInner {
                root: root.clone(),
                config,
                slots,
                dispatch,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.config.size
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Status of every slot, in slot order
    pub fn statuses(&self) -> Vec<ContextStatus> {
        self.inner
            .slots
            .lock()
            .iter()
            .map(ExecutionContext::status)
            .collect()
    }

    /// Borrow a context, waiting up to the configured open timeout
    pub async fn open(&self) -> Result<PoolChannel, ThreadingError> {
        self.open_with_timeout(self.inner.config.open_timeout()).await
    }

    /// Borrow a context, waiting up to `timeout`
    ///
    /// When the wait runs out the pool either fails with `PoolTimeout` or,
    /// if degraded fallback is enabled, hands out an inline channel that runs
    /// tasks on the caller's own thread.
    pub async fn open_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PoolChannel, ThreadingError> {
        let (reply, mut granted) = oneshot::channel();
        self.inner
            .dispatch
            .send(DispatchCommand::Borrow { reply })
            .map_err(|_| ThreadingError::PoolShutdown)?;

        let started = Instant::now();
        tokio::select! {
            channel = &mut granted => return channel.map_err(|_| ThreadingError::PoolShutdown),
            _ = tokio::time::sleep(timeout) => {}
        }

        // A grant may have raced the deadline; take it rather than leak the slot.
        granted.close();
        if let Ok(channel) = granted.try_recv() {
            return Ok(channel);
        }

        let waited = started.elapsed();
        if !self.inner.config.degraded_fallback {
            tracing::debug!(waited_ms = duration_ms(waited), "Pool open timed out");
            return Err(ThreadingError::PoolTimeout { waited });
        }

        tracing::warn!(
            waited_ms = duration_ms(waited),
            "No free context; running on the caller's thread without isolation"
        );
        self.inner
            .root
            .events()
            .emit(RuntimeEvent::DegradedFallback {
                waited_ms: duration_ms(waited),
            });
        Ok(PoolChannel {
            lease: Lease::Inline {
                root: self.inner.root.clone(),
            },
        })
    }

    /// Open, run one task, close
    ///
    /// If this future is dropped mid-run the slot is handed back only once
    /// its worker has finished the abandoned task.
    pub async fn run<T>(&self, task: Task<T>) -> Result<TaskOutcome<T>, ThreadingError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let mut channel = self.open().await?;
        let outcome = channel.run(task).await;
        channel.close();
        outcome
    }

    /// Replace every panicked slot with a fresh context at the same index
    ///
    /// Free and occupied slots are left alone. Slots left `Created` by an
    /// earlier failed replacement are retried. Waiting borrowers are served
    /// from the fresh contexts as soon as they come up.
    pub fn recycle(&self) -> RecycleReport {
        let mut report = RecycleReport::default();
        let mut slots = self.inner.slots.lock();

        for (slot, context) in slots.iter_mut().enumerate() {
            if !matches!(context.status(), ContextStatus::Panicked | ContextStatus::Created) {
                continue;
            }

            if let Err(e) = context.dispose() {
                tracing::debug!(context = slot, error = %e, "Dispose failed; replacing anyway");
            }
            let fresh = self.inner.root.context(slot);
            fresh.set_free_hook(free_hook(&self.inner.dispatch));
            *context = fresh.clone();

            match fresh.init() {
                Ok(()) => {
                    tracing::debug!(context = slot, "Recycled slot");
                    self.inner
                        .root
                        .events()
                        .emit(RuntimeEvent::SlotRecycled { slot });
                    report.recycled.push(slot);
                }
                Err(e) => report.failed.push((slot, e)),
            }
        }
        report
    }

    /// Stop the dispatcher and dispose every context; idempotent
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl PoolInner {
    fn shutdown(&self) {
        let Some(dispatcher) = self.dispatcher.lock().take() else {
            return;
        };

        let _ = self.dispatch.send(DispatchCommand::Shutdown);
        if dispatcher.join().is_err() {
            tracing::warn!("Pool dispatcher panicked");
        }
        for context in self.slots.lock().iter() {
            let _ = context.dispose();
        }
        tracing::debug!(size = self.config.size, "Thread pool shut down");
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wakes the dispatcher whenever a slot's context becomes free
fn free_hook(dispatch: &mpsc::UnboundedSender<DispatchCommand>) -> FreeHook {
    let dispatch = dispatch.clone();
    Arc::new(move |slot| {
        let _ = dispatch.send(DispatchCommand::Release { slot });
    })
}

fn run_dispatcher(
    slots: Slots,
    mut commands: mpsc::UnboundedReceiver<DispatchCommand>,
) {
    let mut waiters: VecDeque<oneshot::Sender<PoolChannel>> = VecDeque::new();

    while let Some(command) = commands.blocking_recv() {
        match command {
            DispatchCommand::Borrow { reply } => waiters.push_back(reply),
            DispatchCommand::Release { slot } => {
                tracing::trace!(context = slot, "Slot released");
            }
            DispatchCommand::Shutdown => break,
        }
        serve(&slots, &mut waiters);
    }

    // Pending borrowers observe the dropped senders as a shut down pool.
    waiters.clear();
}

/// Hand free contexts to waiters, oldest first
fn serve(slots: &Slots, waiters: &mut VecDeque<oneshot::Sender<PoolChannel>>) {
    while let Some(waiter) = waiters.pop_front() {
        if waiter.is_closed() {
            continue;
        }
        let Some(channel) = acquire(slots) else {
            waiters.push_front(waiter);
            return;
        };
        // A waiter that gave up in the meantime hands the slot straight back.
        if let Err(channel) = waiter.send(channel) {
            drop(channel);
        }
    }
}

fn acquire(slots: &Slots) -> Option<PoolChannel> {
    let slots = slots.lock();
    slots.iter().enumerate().find_map(|(slot, context)| {
        if context.status() != ContextStatus::Free {
            return None;
        }
        let channel = context.open().ok()?;
        Some(PoolChannel {
            lease: Lease::Isolated {
                slot,
                channel: Some(channel),
            },
        })
    })
}

enum Lease {
    Isolated {
        slot: usize,
        channel: Option<ContextChannel>,
    },
    Inline {
        root: RootContext,
    },
}

/// A borrowed pool slot, or an inline stand-in under degraded fallback
///
/// Closing or dropping the channel returns the slot to the pool.
pub struct PoolChannel {
    lease: Lease,
}

impl fmt::Debug for PoolChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolChannel")
            .field("slot", &self.slot())
            .field("isolated", &self.is_isolated())
            .finish()
    }
}

impl PoolChannel {
    /// Slot index of the borrowed context; `None` for an inline channel
    pub fn slot(&self) -> Option<usize> {
        match &self.lease {
            Lease::Isolated { slot, .. } => Some(*slot),
            Lease::Inline { .. } => None,
        }
    }

    pub fn is_isolated(&self) -> bool {
        matches!(self.lease, Lease::Isolated { .. })
    }

    pub async fn run<T>(&mut self, task: Task<T>) -> Result<TaskOutcome<T>, ThreadingError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        match &mut self.lease {
            Lease::Isolated {
                channel: Some(channel),
                ..
            } => channel.run(task).await,
            Lease::Isolated { slot, .. } => {
                Err(ContextError::WorkerShutdown { context: *slot }.into())
            }
            Lease::Inline { root } => run_inline(root, task).await,
        }
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        // The context's free hook wakes the dispatcher.
        if let Lease::Isolated { channel, .. } = &mut self.lease {
            if let Some(channel) = channel.take() {
                channel.close();
            }
        }
    }
}

impl Drop for PoolChannel {
    fn drop(&mut self) {
        self.release();
    }
}

/// Detaches an inline run's child link even if the task panics
struct InlineChild<'a> {
    root: &'a RootContext,
    id: ChildId,
}

impl Drop for InlineChild<'_> {
    fn drop(&mut self) {
        self.root.detach_child(self.id);
    }
}

/// Run a task on the caller's thread; a panic in the task propagates
async fn run_inline<T>(
    root: &RootContext,
    task: Task<T>,
) -> Result<TaskOutcome<T>, ThreadingError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let payload = root.prepare(task)?;
    let (id, inbound) = root.attach_child(None);
    let child = InlineChild { root, id };
    let (outbound, mut messages) = mpsc::unbounded_channel();
    let started_at = Utc::now();

    execute(
        payload,
        None,
        outbound,
        Some(inbound),
        root.config().sync.clone(),
        Arc::clone(root.events()),
    );
    let outcome =
        collect_outcome(root, &mut messages, Some(child.id), None, None, started_at).await;
    drop(child);

    root.events().emit(RuntimeEvent::TaskCompleted {
        context: None,
        success: outcome.is_success(),
        elapsed_ms: duration_ms(outcome.timing().elapsed),
    });
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threading::config::RuntimeConfig;

    fn pool_of(size: usize, degraded_fallback: bool) -> (RootContext, ThreadPool) {
        let root = RootContext::default();
        let pool = ThreadPool::init(
            &root,
            PoolConfig {
                size,
                open_timeout_ms: 1_000,
                degraded_fallback,
            },
        )
        .unwrap();
        (root, pool)
    }

    #[test]
    fn zero_size_is_rejected() {
        let root = RootContext::new(RuntimeConfig::default());
        let err = ThreadPool::init(
            &root,
            PoolConfig {
                size: 0,
                ..PoolConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, ThreadingError::Config(_)));
    }

    #[test]
    fn all_slots_start_free() {
        let (_root, pool) = pool_of(3, false);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.statuses(), vec![ContextStatus::Free; 3]);
    }

    #[tokio::test]
    async fn open_takes_first_free_slot() {
        let (_root, pool) = pool_of(2, false);

        let first = pool.open().await.unwrap();
        let second = pool.open().await.unwrap();
        assert_eq!(first.slot(), Some(0));
        assert_eq!(second.slot(), Some(1));
        assert_eq!(pool.statuses(), vec![ContextStatus::Occupied; 2]);

        first.close();
        let again = pool.open().await.unwrap();
        assert_eq!(again.slot(), Some(0));
        drop(second);
        drop(again);
    }

    #[tokio::test]
    async fn waiter_is_served_on_release() {
        let (_root, pool) = pool_of(1, false);
        let held = pool.open().await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.open_with_timeout(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.close();

        let channel = waiting.await.unwrap().unwrap();
        assert_eq!(channel.slot(), Some(0));
    }

    #[tokio::test]
    async fn timeout_without_fallback() {
        let (_root, pool) = pool_of(1, false);
        let _held = pool.open().await.unwrap();

        let err = pool
            .open_with_timeout(Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ThreadingError::PoolTimeout { waited } if waited >= Duration::from_millis(30)
        ));
    }

    #[tokio::test]
    async fn timeout_with_fallback_runs_inline() {
        let (root, pool) = pool_of(1, true);
        let mut events = root.events().subscribe();
        let _held = pool.open().await.unwrap();

        let mut inline = pool
            .open_with_timeout(Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!inline.is_isolated());
        assert_eq!(inline.slot(), None);

        let outcome = inline
            .run(Task::new(|_, _, features| Ok(features.is_isolated())))
            .await
            .unwrap();
        assert_eq!(outcome.into_result(), Ok(false));

        let mut saw_fallback = false;
        while let Ok(event) = events.try_recv() {
            saw_fallback |= matches!(event, RuntimeEvent::DegradedFallback { .. });
        }
        assert!(saw_fallback);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_and_future_opens() {
        let (_root, pool) = pool_of(1, false);
        let _held = pool.open().await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.open_with_timeout(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown();

        assert!(matches!(
            waiting.await.unwrap().unwrap_err(),
            ThreadingError::PoolShutdown
        ));
        assert!(matches!(
            pool.open().await.unwrap_err(),
            ThreadingError::PoolShutdown
        ));
        assert_eq!(pool.statuses(), vec![ContextStatus::Disposed]);
    }

    #[test]
    fn recycle_leaves_healthy_slots_alone() {
        let (_root, pool) = pool_of(2, false);
        let report = pool.recycle();
        assert!(report.recycled.is_empty());
        assert!(report.is_clean());
        assert_eq!(pool.statuses(), vec![ContextStatus::Free; 2]);
    }
}
