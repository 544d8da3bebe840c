//! Narrow interfaces to the wire layer.
//!
//! The engine never frames packets or decodes tokens itself. It hands the
//! parser an invocation descriptor to write, then pulls [`TokenEvent`]s off
//! the session until the response is drained. The session object is owned by
//! the connection; the engine only ever borrows it for one operation.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tds_rpc::{RpcRecord, SqlValue, TdsType};

use crate::error::Result;
use crate::parameter::ParameterCollection;

/// How far the read phase runs before handing control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunBehavior {
    /// Drain the whole response.
    UntilDone,
    /// Stop at the first result set so a reader can take over.
    ReturnImmediately,
}

/// A server error or warning.
#[derive(Debug, Clone)]
pub struct ServerFault {
    /// Error number.
    pub number: i32,
    /// Error class/severity (0-25).
    pub class: u8,
    /// Error state.
    pub state: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: Option<String>,
    /// Stored procedure name, if applicable.
    pub procedure: Option<String>,
    /// Line number.
    pub line: u32,
}

/// A return-value token: an output parameter or the prepared handle.
#[derive(Debug, Clone)]
pub struct ReturnValueRecord {
    /// Parameter name as sent by the server (may be empty for unnamed
    /// return values).
    pub name: String,
    /// Wire type of the value.
    pub ty: TdsType,
    /// Precision, for decimal values.
    pub precision: u8,
    /// Scale, for decimal and temporal values.
    pub scale: u8,
    /// The decoded value. Encrypted return values arrive as
    /// [`SqlValue::Binary`] ciphertext.
    pub value: SqlValue,
}

/// One event pulled off the response token stream.
#[derive(Debug, Clone)]
pub enum TokenEvent {
    /// Column metadata: a new result set begins.
    ResultSetStart {
        /// Column names in order.
        columns: Vec<String>,
    },
    /// One data row of the current result set.
    Row(Vec<SqlValue>),
    /// A return-value token.
    ReturnValue(ReturnValueRecord),
    /// The procedure's return status.
    ReturnStatus(i32),
    /// End of one statement inside a procedure.
    DoneInProc {
        /// Rows affected by the statement.
        rows_affected: u64,
        /// More responses follow.
        more: bool,
    },
    /// End of a procedure invocation.
    DoneProc {
        /// Rows affected by the procedure.
        rows_affected: u64,
        /// More responses follow.
        more: bool,
    },
    /// End of the request.
    Done {
        /// Rows affected.
        rows_affected: u64,
        /// More responses follow.
        more: bool,
        /// The request ended in error.
        error: bool,
        /// The server acknowledged an attention (cancel) request.
        attention_ack: bool,
    },
    /// A server error token.
    ServerError(ServerFault),
    /// A server informational/warning token.
    Warning(ServerFault),
}

/// The per-connection I/O object that frames packets and tracks
/// diagnostics. Owned by the connection; borrowed by the command for the
/// duration of one operation.
pub trait WireSession: Send + Sync {
    /// Send an out-of-band attention (cancel) request.
    ///
    /// # Errors
    ///
    /// Returns an error when the attention cannot be written.
    fn send_attention(&self) -> Result<()>;

    /// Whether the session is broken and must not return to the pool.
    fn is_broken(&self) -> bool;

    /// Transition the session to broken.
    fn mark_broken(&self);

    /// The session's diagnostic buffers.
    fn diagnostics(&self) -> Arc<SessionDiagnostics>;
}

/// Error and warning buffers accumulated over a session's lifetime.
///
/// Batch accounting records half-open index ranges into these buffers, so
/// entries are only ever appended while a command runs.
#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    errors: RwLock<Vec<ServerFault>>,
    warnings: RwLock<Vec<ServerFault>>,
}

impl SessionDiagnostics {
    /// Create empty buffers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an error.
    pub fn push_error(&self, fault: ServerFault) {
        self.errors.write().push(fault);
    }

    /// Append a warning.
    pub fn push_warning(&self, fault: ServerFault) {
        self.warnings.write().push(fault);
    }

    /// Number of errors recorded so far.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors.read().len()
    }

    /// Number of warnings recorded so far.
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.warnings.read().len()
    }

    /// Copy of the errors in `[start, end)`.
    #[must_use]
    pub fn errors_in(&self, start: usize, end: usize) -> Vec<ServerFault> {
        let errors = self.errors.read();
        errors
            .get(start..end.min(errors.len()))
            .map(<[ServerFault]>::to_vec)
            .unwrap_or_default()
    }

    /// Copy of the warnings in `[start, end)`.
    #[must_use]
    pub fn warnings_in(&self, start: usize, end: usize) -> Vec<ServerFault> {
        let warnings = self.warnings.read();
        warnings
            .get(start..end.min(warnings.len()))
            .map(<[ServerFault]>::to_vec)
            .unwrap_or_default()
    }
}

/// The wire parser: writes requests, yields response tokens.
#[async_trait::async_trait]
pub trait WireParser: Send + Sync {
    /// Write a raw SQL batch.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails or the session is unusable.
    async fn execute_batch(
        &self,
        text: &str,
        timeout_seconds: u32,
        session: &Arc<dyn WireSession>,
        enclave_package: Option<Bytes>,
    ) -> Result<()>;

    /// Write one or more RPC invocations.
    ///
    /// `params` carries the user parameters the records reference through
    /// their option maps.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails or the session is unusable.
    #[allow(clippy::too_many_arguments)]
    async fn execute_rpc(
        &self,
        records: &[RpcRecord],
        params: &ParameterCollection,
        timeout_seconds: u32,
        in_schema: bool,
        session: &Arc<dyn WireSession>,
        is_proc: bool,
        enclave_package: Option<Bytes>,
    ) -> Result<()>;

    /// Pull the next token of the pending response, `None` at end of
    /// stream.
    ///
    /// # Errors
    ///
    /// Returns an error on protocol or transport failure; the session
    /// should be considered broken afterwards.
    async fn next_token(&self, session: &Arc<dyn WireSession>) -> Result<Option<TokenEvent>>;
}
