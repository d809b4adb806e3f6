// ExecutionContext - one isolated worker and its run protocol

use super::worker::{spawn_worker, WorkerCommand, WorkerHandle};
use crate::threading::error::{ContextError, TaskFailure, ThreadingError};
use crate::threading::events::RuntimeEvent;
use crate::threading::message::{RefUpdate, WireMessage};
use crate::threading::root::{ChildId, RootContext};
use crate::threading::serializer::Payload;
use crate::threading::task::{Task, TaskOutcome, TaskTiming};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Called with the context id whenever a context becomes `Free`
pub(crate) type FreeHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Lifecycle of an execution context
///
/// `Created -> Free -> Occupied -> Free` is the normal cycle. Any state can
/// fall to `Panicked`; only disposal leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextStatus {
    Created,
    Free,
    Occupied,
    Panicked,
    Disposed,
}

impl fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextStatus::Created => "created",
            ContextStatus::Free => "free",
            ContextStatus::Occupied => "occupied",
            ContextStatus::Panicked => "panicked",
            ContextStatus::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

struct ContextState {
    status: ContextStatus,
    worker: Option<WorkerHandle>,
    cancel: CancellationToken,
    /// A `Run` was sent and its completion has not been observed yet
    running: bool,
    /// The borrow ended while `running`; free the context once it finishes
    release_pending: bool,
}

struct ContextInner {
    id: usize,
    root: RootContext,
    state: Mutex<ContextState>,
    free_hook: Mutex<Option<FreeHook>>,
}

/// Owns exactly one isolated worker thread and runs one task at a time on it
///
/// Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new(id: usize, root: RootContext) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id,
                root,
                state: Mutex::new(ContextState {
                    status: ContextStatus::Created,
                    worker: None,
                    cancel: CancellationToken::new(),
                    running: false,
                    release_pending: false,
                }),
                free_hook: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn status(&self) -> ContextStatus {
        self.inner.state.lock().status
    }

    pub fn root(&self) -> &RootContext {
        &self.inner.root
    }

    pub(crate) fn set_free_hook(&self, hook: FreeHook) {
        *self.inner.free_hook.lock() = Some(hook);
    }

    /// Whether the backing worker thread is still running
    pub fn is_alive(&self) -> bool {
        self.inner
            .state
            .lock()
            .worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Spawn the worker thread; the context becomes `Free`
    ///
    /// A failed spawn leaves the context `Created` so the caller can retry.
    pub fn init(&self) -> Result<(), ThreadingError> {
        let mut state = self.inner.state.lock();
        match state.status {
            ContextStatus::Created => {}
            ContextStatus::Free | ContextStatus::Occupied => return Ok(()),
            ContextStatus::Disposed => {
                return Err(ContextError::Disposed {
                    context: self.inner.id,
                }
                .into())
            }
            status @ ContextStatus::Panicked => {
                return Err(ContextError::Busy {
                    context: self.inner.id,
                    status,
                }
                .into())
            }
        }

        let root = &self.inner.root;
        let worker = spawn_worker(
            self.inner.id,
            &root.config().worker,
            root.config().sync.clone(),
            Arc::clone(root.events()),
        )
        .inspect_err(|e| tracing::error!(context = self.inner.id, error = %e, "Spawn failed"))?;

        state.worker = Some(worker);
        self.transition(&mut state, ContextStatus::Free);
        Ok(())
    }

    /// Borrow the context for one or more runs; fails unless it is `Free`
    pub fn open(&self) -> Result<ContextChannel, ThreadingError> {
        let mut state = self.inner.state.lock();
        match state.status {
            ContextStatus::Free => {
                self.transition(&mut state, ContextStatus::Occupied);
                Ok(ContextChannel {
                    context: self.clone(),
                    open: true,
                })
            }
            ContextStatus::Disposed => Err(ContextError::Disposed {
                context: self.inner.id,
            }
            .into()),
            status => Err(ContextError::Busy {
                context: self.inner.id,
                status,
            }
            .into()),
        }
    }

    /// Ad hoc run: open, run one task, close
    ///
    /// Dropping the returned future before it resolves does not free the
    /// context: it stays `Occupied` until the worker reports the abandoned run.
    pub async fn run<T>(&self, task: Task<T>) -> Result<TaskOutcome<T>, ThreadingError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let mut channel = self.open()?;
        let outcome = channel.run(task).await;
        channel.close();
        outcome
    }

    /// Tear down the worker; safe on any status and idempotent
    ///
    /// An in-flight run resolves with `Cancelled`. The worker thread cannot be
    /// preempted: it exits as soon as the running closure returns.
    pub fn dispose(&self) -> Result<(), ThreadingError> {
        let mut state = self.inner.state.lock();
        if state.status == ContextStatus::Disposed {
            return Ok(());
        }

        state.cancel.cancel();
        if let Some(worker) = state.worker.take() {
            // Detach; the thread finishes on its own after the current run.
            drop(worker.shutdown());
        }
        self.transition(&mut state, ContextStatus::Disposed);
        Ok(())
    }

    fn transition(&self, state: &mut ContextState, to: ContextStatus) {
        let from = state.status;
        if from == to {
            return;
        }
        state.status = to;
        tracing::debug!(context = self.inner.id, %from, %to, "Context status changed");
        self.inner
            .root
            .events()
            .emit(RuntimeEvent::ContextStatusChanged {
                context: self.inner.id,
                from,
                to,
            });

        if to == ContextStatus::Free {
            let hook = self.inner.free_hook.lock().clone();
            if let Some(hook) = hook {
                hook(self.inner.id);
            }
        }
    }

    fn release(&self) {
        let mut state = self.inner.state.lock();
        if state.status != ContextStatus::Occupied {
            return;
        }
        if state.running {
            tracing::debug!(
                context = self.inner.id,
                "Borrow ended mid-run; context stays occupied until the worker reports"
            );
            state.release_pending = true;
            return;
        }
        self.transition(&mut state, ContextStatus::Free);
    }

    /// Record the end of the outstanding run
    ///
    /// A lost worker moves the context to `Panicked`; otherwise a borrow that
    /// ended while the run was outstanding is completed now.
    fn finish_run(&self, lost: bool) {
        let mut state = self.inner.state.lock();
        state.running = false;
        let release_pending = std::mem::take(&mut state.release_pending);

        if lost {
            if matches!(state.status, ContextStatus::Occupied | ContextStatus::Free) {
                tracing::warn!(context = self.inner.id, "Execution context lost its worker");
                self.transition(&mut state, ContextStatus::Panicked);
            }
        } else if release_pending && state.status == ContextStatus::Occupied {
            self.transition(&mut state, ContextStatus::Free);
        }
    }

    async fn dispatch<T>(&self, payload: Payload) -> Result<TaskOutcome<T>, ThreadingError>
    where
        T: DeserializeOwned,
    {
        let (worker_tx, cancel) = {
            let mut state = self.inner.state.lock();
            match state.status {
                ContextStatus::Occupied if !state.running => {}
                ContextStatus::Disposed => {
                    return Err(ContextError::Disposed {
                        context: self.inner.id,
                    }
                    .into())
                }
                status => {
                    return Err(ContextError::Busy {
                        context: self.inner.id,
                        status,
                    }
                    .into())
                }
            }
            let worker = state.worker.as_ref().ok_or(ContextError::WorkerShutdown {
                context: self.inner.id,
            })?;
            let handles = (worker.sender(), state.cancel.clone());
            state.running = true;
            handles
        };

        let root = &self.inner.root;
        let (child, inbound) = root.attach_child(Some(self.inner.id));
        let (outbound, messages) = mpsc::unbounded_channel();
        let mut run = InFlightRun {
            context: self.clone(),
            child,
            messages,
            cancel,
            started_at: Utc::now(),
            settled: false,
        };

        let sent = worker_tx.send(WorkerCommand::Run {
            payload,
            outbound,
            inbound,
        });
        let outcome = if sent.is_err() {
            TaskOutcome::Failure {
                error: TaskFailure::ContextLost,
                timing: TaskTiming::since(run.started_at),
            }
        } else {
            collect_outcome(
                root,
                &mut run.messages,
                Some(child),
                Some(self.inner.id),
                Some(&run.cancel),
                run.started_at,
            )
            .await
        };
        run.settled = true;
        drop(run);

        self.finish_run(matches!(outcome.failure(), Some(TaskFailure::ContextLost)));
        root.events().emit(RuntimeEvent::TaskCompleted {
            context: Some(self.inner.id),
            success: outcome.is_success(),
            elapsed_ms: duration_ms(outcome.timing().elapsed),
        });
        Ok(outcome)
    }
}

/// One dispatched run, from the `Run` command to its completion
///
/// Always detaches the run's child link. If the waiting future is dropped
/// before the completion arrives, the rest of the run is drained on the
/// runtime so the context is only freed once its worker is idle again.
struct InFlightRun {
    context: ExecutionContext,
    child: ChildId,
    messages: mpsc::UnboundedReceiver<WireMessage>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    settled: bool,
}

impl Drop for InFlightRun {
    fn drop(&mut self) {
        let root = self.context.root().clone();
        root.detach_child(self.child);
        if self.settled {
            return;
        }

        let context = self.context.clone();
        let Ok(runtime) = Handle::try_current() else {
            // Nothing left to observe the worker; let recycle replace the slot.
            context.finish_run(true);
            return;
        };

        let (_, closed) = mpsc::unbounded_channel();
        let mut messages = std::mem::replace(&mut self.messages, closed);
        let cancel = self.cancel.clone();
        let started_at = self.started_at;
        let child = self.child;
        tracing::debug!(context = context.id(), "Run abandoned; draining in background");

        runtime.spawn(async move {
            let id = context.id();
            let outcome: TaskOutcome<Value> = collect_outcome(
                &root,
                &mut messages,
                Some(child),
                Some(id),
                Some(&cancel),
                started_at,
            )
            .await;
            context.finish_run(matches!(outcome.failure(), Some(TaskFailure::ContextLost)));
            tracing::debug!(
                context = id,
                success = outcome.is_success(),
                "Abandoned run finished"
            );
        });
    }
}

/// An open borrow of an execution context
///
/// Closing (or dropping) the channel hands a healthy context back as `Free`;
/// a context that panicked during a run stays `Panicked`.
#[derive(Debug)]
pub struct ContextChannel {
    context: ExecutionContext,
    open: bool,
}

impl ContextChannel {
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Serialize `task`, run it in the isolated context and wait for its
    /// single completion, applying ref-updates as they arrive
    pub async fn run<T>(&mut self, task: Task<T>) -> Result<TaskOutcome<T>, ThreadingError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let payload = self.context.root().prepare(task)?;
        self.context.dispatch(payload).await
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.open) {
            self.context.release();
        }
    }
}

impl Drop for ContextChannel {
    fn drop(&mut self) {
        self.release();
    }
}

/// Drain one run's messages until its completion arrives
///
/// Ref-updates are applied to the root registry in arrival order. If the
/// worker's sender drops first the context was lost; if `cancel` fires the
/// run was cancelled by disposal.
pub(crate) async fn collect_outcome<T>(
    root: &RootContext,
    messages: &mut mpsc::UnboundedReceiver<WireMessage>,
    child: Option<ChildId>,
    context: Option<usize>,
    cancel: Option<&CancellationToken>,
    started_at: DateTime<Utc>,
) -> TaskOutcome<T>
where
    T: DeserializeOwned,
{
    loop {
        let message = match cancel {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return TaskOutcome::Failure {
                        error: TaskFailure::Cancelled,
                        timing: TaskTiming::since(started_at),
                    };
                }
                message = messages.recv() => message,
            },
            None => messages.recv().await,
        };

        match message {
            Some(WireMessage::RefUpdate { id, token, content }) => {
                root.apply_remote(RefUpdate { id, token, content }, child, context)
                    .await;
            }
            Some(WireMessage::Completion {
                result,
                error,
                started_at,
                finished_at,
                elapsed_ms,
            }) => {
                let timing =
                    TaskTiming::new(started_at, finished_at, Duration::from_millis(elapsed_ms));
                return decode_completion(result, error, timing);
            }
            None => {
                return TaskOutcome::Failure {
                    error: TaskFailure::ContextLost,
                    timing: TaskTiming::since(started_at),
                };
            }
        }
    }
}

fn decode_completion<T: DeserializeOwned>(
    result: Option<Value>,
    error: Option<String>,
    timing: TaskTiming,
) -> TaskOutcome<T> {
    if let Some(error) = error {
        return TaskOutcome::Failure {
            error: TaskFailure::Raised(error),
            timing,
        };
    }

    match serde_json::from_value(result.unwrap_or(Value::Null)) {
        Ok(result) => TaskOutcome::Success { result, timing },
        Err(e) => TaskOutcome::Failure {
            error: TaskFailure::Decode(e.to_string()),
            timing,
        },
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
