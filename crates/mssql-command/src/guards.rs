//! Scoped guards for the session borrow and the connection async counter.
//!
//! Every exit path of an execution — success, catchable error, cancellation
//! — must return the borrowed session to the connection and balance the
//! connection's async counter exactly once. Both obligations are carried by
//! guard types whose `Drop` does the release, so no exit path can forget.
//! The single exception is a fatal signal, which dooms the connection
//! instead of returning the session.

use std::sync::Arc;

use crate::cancel::CancelState;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::parser::WireSession;

/// Balances the connection async counter: increments on construction,
/// decrements on drop.
pub(crate) struct AsyncCountGuard {
    connection: Arc<dyn Connection>,
}

impl AsyncCountGuard {
    pub(crate) fn new(connection: &Arc<dyn Connection>) -> Self {
        connection.increment_async_count();
        Self {
            connection: Arc::clone(connection),
        }
    }
}

impl Drop for AsyncCountGuard {
    fn drop(&mut self) {
        self.connection.decrement_async_count();
    }
}

/// The session borrow for one operation.
///
/// Acquisition runs the cancellation gate: the pending-cancel flag is
/// sampled immediately before and immediately after taking the session, and
/// a set flag fails the acquisition with [`Error::Cancelled`]. On drop the
/// session goes back to the connection — or the connection is doomed when a
/// fatal signal was recorded or the session broke.
pub(crate) struct SessionGuard {
    connection: Arc<dyn Connection>,
    session: Option<Arc<dyn WireSession>>,
    cancel: Arc<CancelState>,
    doomed: bool,
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("session", &self.session.is_some())
            .field("doomed", &self.doomed)
            .finish()
    }
}

impl SessionGuard {
    /// Acquire the session through the cancellation gate.
    pub(crate) fn acquire(
        connection: &Arc<dyn Connection>,
        cancel: &Arc<CancelState>,
    ) -> Result<Self> {
        if cancel.is_pending() {
            return Err(Error::Cancelled);
        }

        let session = connection.open_session()?;
        cancel.bind_session(Arc::downgrade(&session));
        let guard = Self {
            connection: Arc::clone(connection),
            session: Some(session),
            cancel: Arc::clone(cancel),
            doomed: false,
        };

        // A cancel that arrived during acquisition is honored here; the
        // guard's drop returns the session and the session observes the
        // attention through its own path.
        if cancel.is_pending() {
            return Err(Error::Cancelled);
        }
        Ok(guard)
    }

    /// The borrowed session.
    ///
    /// The slot is only empty after drop.
    #[allow(clippy::unwrap_used)]
    pub(crate) fn session(&self) -> &Arc<dyn WireSession> {
        self.session.as_ref().unwrap()
    }

    /// Record a fatal signal: drop will doom the connection instead of
    /// returning the session.
    pub(crate) fn doom(&mut self) {
        self.doomed = true;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.cancel.unbind_session();
        if let Some(session) = self.session.take() {
            if self.doomed || session.is_broken() {
                tracing::warn!("dooming connection instead of returning session");
                self.connection.doom();
            } else {
                self.connection.return_session(session);
            }
        }
    }
}
