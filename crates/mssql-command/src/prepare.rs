//! The prepare/execute state machine.
//!
//! A text command moves through `Unprepared -> PreparePending -> Prepared`.
//! `Prepare` only records intent; the next execution sends the combined
//! prepare-execute shape and captures the server handle from its first
//! return value. Mutating the text or the parameter shape demotes a
//! prepared command back to pending, preserving the handle so the re-prepare
//! can reuse the server-side slot — unless the connection's close or
//! reconnect generation moved on, which invalidates the handle outright.

/// Prepared-plan state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrepareState {
    /// No prepared plan and none requested.
    #[default]
    Unprepared,
    /// A prepare was requested; the next execution sends prepare-execute.
    PreparePending {
        /// Prior handle to reuse server-side, if still valid.
        handle: Option<i32>,
    },
    /// A server-side plan exists.
    Prepared {
        /// The server-assigned plan handle.
        handle: i32,
        /// Connection close generation the handle was created under.
        close_count: u64,
        /// Connection reconnect generation the handle was created under.
        reconnect_count: u64,
    },
}

impl PrepareState {
    /// Whether a plan handle is live.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        matches!(self, Self::Prepared { .. })
    }

    /// Whether the next execution must send the prepare-execute shape.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PreparePending { .. })
    }

    /// The live handle, if prepared.
    #[must_use]
    pub fn handle(&self) -> Option<i32> {
        match self {
            Self::Prepared { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    /// Handle value to put in the prepare-execute shape's handle slot:
    /// a reusable prior handle, or `-1` to request a fresh one.
    #[must_use]
    pub fn reusable_handle(&self) -> i32 {
        match self {
            Self::PreparePending { handle: Some(h) } => *h,
            _ => -1,
        }
    }

    /// Demote to pending (dirty command, explicit unprepare). The handle
    /// survives only while the connection generations still match.
    pub(crate) fn demote(&mut self, close_count: u64, reconnect_count: u64) {
        if let Self::Prepared {
            handle,
            close_count: prepared_close,
            reconnect_count: prepared_reconnect,
        } = *self
        {
            let handle = (prepared_close == close_count && prepared_reconnect == reconnect_count)
                .then_some(handle);
            *self = Self::PreparePending { handle };
        }
    }

    /// Request preparation of an unprepared command.
    pub(crate) fn request(&mut self) {
        if matches!(self, Self::Unprepared) {
            *self = Self::PreparePending { handle: None };
        }
    }

    /// Record the handle the server returned for a prepare-execute.
    pub(crate) fn complete(&mut self, handle: i32, close_count: u64, reconnect_count: u64) {
        *self = Self::Prepared {
            handle,
            close_count,
            reconnect_count,
        };
    }
}
