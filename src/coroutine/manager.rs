//! Bounded cooperative task manager with cancellation-safe shutdown

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::future::BoxFuture;
use tokio::sync::{Notify, watch};
use tracing::{debug, info};

use super::handle::TaskHandle;

/// Completion hook run after the task is removed from the active set,
/// skipped once the manager is disabled
type Epilogue = Box<dyn FnOnce() + Send + 'static>;

/// Queued unit of work awaiting a free concurrency slot
type TaskFn = Box<dyn FnOnce(TaskHandle) -> BoxFuture<'static, Epilogue> + Send + 'static>;

struct ManagerInner {
    disabled: bool,
    next_id: u64,
    /// Interruption signal per running task; the manager never owns the
    /// task itself, only the means to interrupt it
    active: HashMap<u64, watch::Sender<bool>>,
    pending: VecDeque<TaskFn>,
}

struct Core {
    /// Maximum concurrently running tasks (0 = unbounded)
    max_coroutines: usize,
    inner: Mutex<ManagerInner>,
    /// Signalled every time an active task unwinds
    unwound: Notify,
}

impl Core {
    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admits storage tasks up to a concurrency bound and interrupts them all
/// on shutdown.
///
/// Submission order is FIFO once slots free up: when a running task
/// completes, its completion path starts the next pending task directly,
/// forming a hand-off chain. Once the manager is disabled, submission is a
/// silent no-op and pending tasks are dropped without ever running.
pub struct CoroutineManager {
    core: Arc<Core>,
}

impl CoroutineManager {
    /// Create a manager with the given concurrency bound (0 = unbounded)
    pub fn new(max_coroutines: usize) -> Self {
        debug!(max_coroutines, "CoroutineManager::new: called");
        Self {
            core: Arc::new(Core {
                max_coroutines,
                inner: Mutex::new(ManagerInner {
                    disabled: false,
                    next_id: 0,
                    active: HashMap::new(),
                    pending: VecDeque::new(),
                }),
                unwound: Notify::new(),
            }),
        }
    }

    /// Schedule `task` to run with a [`TaskHandle`]
    pub fn start_task<F, Fut>(&self, task: F)
    where
        F: FnOnce(TaskHandle) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(Box::new(move |handle| {
            Box::pin(async move {
                task(handle).await;
                Box::new(|| {}) as Epilogue
            })
        }));
    }

    /// Schedule `task` and hand its output to `callback` on completion.
    ///
    /// The task is removed from the active set before the callback runs, so
    /// a callback that tears the manager down never sees an interruption
    /// attempt against its own handle. The callback is skipped entirely if
    /// the manager was disabled while the task ran.
    pub fn start_task_with_callback<T, C, F, Fut>(&self, callback: C, task: F)
    where
        T: Send + 'static,
        C: FnOnce(T) + Send + 'static,
        F: FnOnce(TaskHandle) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.enqueue(Box::new(move |handle| {
            Box::pin(async move {
                let value = task(handle).await;
                Box::new(move || callback(value)) as Epilogue
            })
        }));
    }

    /// Number of currently running tasks
    pub fn active_count(&self) -> usize {
        self.core.lock().active.len()
    }

    /// Number of tasks waiting for a free slot
    pub fn pending_count(&self) -> usize {
        self.core.lock().pending.len()
    }

    /// Whether the manager has begun shutting down
    pub fn is_disabled(&self) -> bool {
        self.core.lock().disabled
    }

    /// Disable the manager, interrupt every active task, and wait until all
    /// of them have unwound. Pending tasks are dropped without running.
    /// Idempotent.
    pub async fn shutdown(&self) {
        debug!("CoroutineManager::shutdown: called");
        {
            let mut inner = self.core.lock();
            if !inner.disabled {
                info!(
                    active = inner.active.len(),
                    dropped = inner.pending.len(),
                    "shutting down storage task manager"
                );
            }
            inner.disabled = true;
            inner.pending.clear();
            for interrupt in inner.active.values() {
                let _ = interrupt.send(true);
            }
        }
        loop {
            if self.core.lock().active.is_empty() {
                break;
            }
            self.core.unwound.notified().await;
        }
        debug!("CoroutineManager::shutdown: all active tasks unwound");
    }

    fn enqueue(&self, task: TaskFn) {
        let mut inner = self.core.lock();
        if inner.disabled {
            debug!("CoroutineManager::enqueue: disabled, dropping task");
            return;
        }
        if self.core.max_coroutines == 0 || inner.active.len() < self.core.max_coroutines {
            Self::spawn_locked(&self.core, &mut inner, task);
        } else {
            inner.pending.push_back(task);
            debug!(pending = inner.pending.len(), "CoroutineManager::enqueue: queued");
        }
    }

    fn spawn_locked(core: &Arc<Core>, inner: &mut ManagerInner, task: TaskFn) {
        let id = inner.next_id;
        inner.next_id += 1;
        let (interrupt_tx, interrupt_rx) = watch::channel(false);
        inner.active.insert(id, interrupt_tx);
        debug!(id, active = inner.active.len(), "CoroutineManager::spawn_locked: starting task");

        let handle = TaskHandle::new(interrupt_rx);
        let weak = Arc::downgrade(core);
        tokio::spawn(async move {
            let epilogue = task(handle).await;
            if Self::finish(weak, id) {
                epilogue();
            }
        });
    }

    /// Completion bookkeeping for one task. Returns whether the caller's
    /// epilogue may still run. Holds only a weak reference, so a manager
    /// destroyed while the task ran leaves no state to touch.
    fn finish(core: Weak<Core>, id: u64) -> bool {
        let Some(core) = core.upgrade() else {
            return false;
        };
        let enabled = {
            let mut inner = core.lock();
            inner.active.remove(&id);
            debug!(id, active = inner.active.len(), "CoroutineManager::finish: task unwound");
            if !inner.disabled
                && let Some(next) = inner.pending.pop_front()
            {
                // hand-off chain: the freed slot goes straight to the next
                // pending task
                Self::spawn_locked(&core, &mut inner, next);
            }
            !inner.disabled
        };
        core.unwound.notify_one();
        enabled
    }
}

impl Drop for CoroutineManager {
    fn drop(&mut self) {
        // Drop cannot await the unwind; it performs the non-blocking half
        // of shutdown. Callers needing the blocking guarantee use
        // `shutdown().await`.
        let mut inner = self.core.lock();
        inner.disabled = true;
        inner.pending.clear();
        for interrupt in inner.active.values() {
            let _ = interrupt.send(true);
        }
    }
}
