// pipeline/completion.rs — Completion signals for enqueued device work.
//
// Every enqueue on a `ComputeDevice` returns a `Completion`. It is the
// handle a later stage puts in its wait-list, and the handle the
// orchestrator blocks on before reading the descriptor back.
//
// A Completion is a shared (Arc) status cell plus a condition variable:
//
//   Pending ──complete()──▶ Complete
//      │  └───fail(msg)───▶ Failed(msg)
//      └──────cancel()────▶ Cancelled
//
// The first transition out of Pending wins; later ones are ignored. In
// particular a worker that finishes after the orchestrator cancelled the
// frame cannot flip the signal back to Complete. Handles are released when
// the last clone is dropped, so no explicit release call exists.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use thiserror::Error;

/// Observable state of a completion signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Pending,
    Complete,
    Failed(String),
    Cancelled,
}

/// Why waiting on a completion did not end in success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("device work failed: {0}")]
    Failed(String),
    #[error("device work was cancelled")]
    Cancelled,
    #[error("timed out waiting for device work")]
    TimedOut,
}

struct Shared {
    status: Mutex<CompletionStatus>,
    cond: Condvar,
}

/// Shared handle to the outcome of one enqueued operation.
#[derive(Clone)]
pub struct Completion {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Completion").field(&self.status()).finish()
    }
}

impl Completion {
    /// A fresh signal in the Pending state.
    pub fn pending() -> Self {
        Completion {
            shared: Arc::new(Shared {
                status: Mutex::new(CompletionStatus::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// A signal that is already complete (synchronous work).
    pub fn completed() -> Self {
        let c = Completion::pending();
        c.complete();
        c
    }

    /// A signal that has already failed.
    pub fn failed(reason: impl Into<String>) -> Self {
        let c = Completion::pending();
        c.fail(reason);
        c
    }

    pub fn complete(&self) {
        self.transition(CompletionStatus::Complete);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.transition(CompletionStatus::Failed(reason.into()));
    }

    /// Cancel the signal if it is still pending. Returns whether this call
    /// performed the transition.
    pub fn cancel(&self) -> bool {
        self.transition(CompletionStatus::Cancelled)
    }

    pub fn status(&self) -> CompletionStatus {
        self.lock().clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.lock(), CompletionStatus::Pending)
    }

    /// Block until the signal leaves Pending or `deadline` passes.
    /// `None` waits indefinitely.
    pub fn wait(&self, deadline: Option<Instant>) -> Result<(), WaitError> {
        let mut status = self.lock();
        loop {
            match &*status {
                CompletionStatus::Complete => return Ok(()),
                CompletionStatus::Failed(msg) => return Err(WaitError::Failed(msg.clone())),
                CompletionStatus::Cancelled => return Err(WaitError::Cancelled),
                CompletionStatus::Pending => {}
            }
            status = match deadline {
                None => self
                    .shared
                    .cond
                    .wait(status)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WaitError::TimedOut);
                    }
                    self.shared
                        .cond
                        .wait_timeout(status, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    /// Whether two handles refer to the same signal.
    pub fn same_signal(&self, other: &Completion) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn transition(&self, next: CompletionStatus) -> bool {
        let mut status = self.lock();
        if *status != CompletionStatus::Pending {
            return false;
        }
        *status = next;
        self.shared.cond.notify_all();
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CompletionStatus> {
        // A poisoned status cell still holds a valid enum value.
        self.shared
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Wait on every signal in `list`, returning the first failure.
pub fn wait_all(list: &[&Completion], deadline: Option<Instant>) -> Result<(), WaitError> {
    for c in list {
        c.wait(deadline)?;
    }
    Ok(())
}
