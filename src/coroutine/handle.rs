//! Task handle with interruptible suspension

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tracing::debug;

use crate::status::{Result, Status};

/// Handle given to every task started by a [`CoroutineManager`].
///
/// The handle carries the interruption signal for its task. Suspending on a
/// result through [`TaskHandle::block_on`] resolves early with
/// [`Status::Interrupted`] once the manager interrupts the task, so a
/// cancelled task unwinds at its next suspension point.
///
/// [`CoroutineManager`]: super::CoroutineManager
#[derive(Clone)]
pub struct TaskHandle {
    interrupted: watch::Receiver<bool>,
    /// Keeps the channel open for detached handles; manager-owned handles
    /// leave this empty because the manager holds the sender.
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl TaskHandle {
    pub(crate) fn new(interrupted: watch::Receiver<bool>) -> Self {
        Self {
            interrupted,
            _keepalive: None,
        }
    }

    /// Handle that is never interrupted, for callers running storage work
    /// outside a manager (one-shot tools, tests).
    pub fn detached() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            interrupted: rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    /// Whether this task has already been interrupted
    pub fn is_interrupted(&self) -> bool {
        *self.interrupted.borrow()
    }

    /// Suspend until a result arrives on `rx`, or until this task is
    /// interrupted, whichever comes first.
    ///
    /// A sender dropped without responding means the other side is gone;
    /// that surfaces as [`Status::Internal`] so the caller never hangs.
    pub async fn block_on<T>(&self, rx: oneshot::Receiver<T>) -> Result<T> {
        let mut interrupted = self.interrupted.clone();
        tokio::select! {
            result = rx => match result {
                Ok(value) => Ok(value),
                Err(_) => Err(Status::Internal(
                    "completion channel dropped before responding".to_string(),
                )),
            },
            // wait_for also completes with an error when the manager is
            // gone, which counts as interruption for a suspended task
            _ = interrupted.wait_for(|flag| *flag) => {
                debug!("TaskHandle::block_on: interrupted while suspended");
                Err(Status::Interrupted)
            }
        }
    }
}
