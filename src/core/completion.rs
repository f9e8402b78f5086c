//! Single-shot completion handles.
//!
//! A [`Completion`] is the resolving half of a promise/future pair: it can be
//! resolved exactly once, or canceled, and tracks which of
//! {Pending, Resolved, Canceled} it is in. The awaiting half is an
//! [`Awaitable`] whose `wait()` yields `Some(value)` on resolution and `None`
//! if the completion was canceled or dropped unresolved.
//!
//! Accept waiters and timers both ride on this type, so double-resolution is
//! guarded here once instead of at every call site.

use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Resolved,
    Canceled,
}

/// Resolving half of a single-shot completion.
pub struct Completion<T> {
    tx: Option<oneshot::Sender<T>>,
    state: CompletionState,
}

/// Awaiting half of a single-shot completion.
pub struct Awaitable<T> {
    rx: oneshot::Receiver<T>,
}

/// Create a linked completion/awaitable pair.
pub fn completion<T>() -> (Completion<T>, Awaitable<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completion {
            tx: Some(tx),
            state: CompletionState::Pending,
        },
        Awaitable { rx },
    )
}

impl<T> Completion<T> {
    pub fn state(&self) -> CompletionState {
        self.state
    }

    /// Resolve with `value`. Returns true if this call performed the
    /// resolution; resolving a non-pending completion is a no-op.
    pub fn resolve(&mut self, value: T) -> bool {
        if self.state != CompletionState::Pending {
            trace!(state = ?self.state, "ignoring resolve on settled completion");
            return false;
        }
        self.state = CompletionState::Resolved;
        match self.tx.take() {
            // A false send means the awaiting half is already gone; the
            // completion still counts as resolved.
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Cancel a pending completion. The awaiting half observes `None`.
    pub fn cancel(&mut self) {
        if self.state == CompletionState::Pending {
            self.state = CompletionState::Canceled;
            self.tx = None;
        }
    }
}

impl<T> Awaitable<T> {
    /// Wait for resolution. `None` means the completion was canceled or
    /// dropped before being resolved.
    pub async fn wait(self) -> Option<T> {
        self.rx.await.ok()
    }
}
