//! Cancellation support.
//!
//! `cancel` is the one operation callable from any thread at any time. It is
//! a best-effort suggestion: it wakes a pending reconnect wait, marks the
//! command as cancel-pending, and — when a session is already bound — asks
//! the session to send an out-of-band attention request. It never fails and
//! never blocks on I/O.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::parser::WireSession;

/// Shared cancellation state between a command, its executions and any
/// number of [`CancelHandle`] clones.
#[derive(Default)]
pub(crate) struct CancelState {
    pending: AtomicBool,
    notify: Notify,
    session: Mutex<Option<Weak<dyn WireSession>>>,
}

impl CancelState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether a cancel request is pending.
    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Consume a pending cancel request. Only the executing task does this,
    /// on entry to a new execution.
    pub(crate) fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Record the cancel request and wake any suspension point waiting on
    /// it.
    pub(crate) fn request(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_waiters();

        // Read the session slot under its lock so a concurrent close cannot
        // race the handle away mid-send.
        let bound = self.session.lock().clone();
        if let Some(session) = bound.and_then(|weak| weak.upgrade()) {
            if let Err(e) = session.send_attention() {
                tracing::warn!(error = %e, "attention request failed; cancel stays best-effort");
            }
        }
    }

    /// Bind the session the current operation runs on.
    pub(crate) fn bind_session(&self, session: Weak<dyn WireSession>) {
        *self.session.lock() = Some(session);
    }

    /// Unbind the session when the operation releases it.
    pub(crate) fn unbind_session(&self) {
        *self.session.lock() = None;
    }

    /// Resolve once a cancel request is pending.
    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_pending() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelState")
            .field("pending", &self.is_pending())
            .field("session_bound", &self.session.lock().is_some())
            .finish()
    }
}

/// Handle for cancelling a command from another task or thread.
///
/// The handle is cloneable and `Send + Sync`. Calling [`CancelHandle::cancel`]
/// is idempotent and never returns an error; a cancellation observed before
/// the command touches the network short-circuits the execution, one
/// observed later is forwarded to the server as an attention request.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub(crate) fn new(state: Arc<CancelState>) -> Self {
        Self { state }
    }

    /// Request cancellation of the command's current (or next) execution.
    pub fn cancel(&self) {
        tracing::debug!("cancel requested");
        self.state.request();
    }

    /// Whether a cancel request is pending.
    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        self.state.is_pending()
    }
}
