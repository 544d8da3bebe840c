//! The reader installed by `execute_reader`.
//!
//! The reader keeps the session borrowed while the caller pulls rows, then
//! returns it when closed (or dropped). Trailing return values, the return
//! status and a prepared handle captured mid-stream are surfaced through
//! [`ReaderOutcome`] so the command can bind them after the fact.

use std::sync::Arc;

use tds_rpc::SqlValue;

use crate::error::{Error, Result};
use crate::guards::SessionGuard;
use crate::parser::{ReturnValueRecord, TokenEvent, WireParser};

/// Everything a drained response carried besides rows.
#[derive(Debug, Default)]
pub struct ReaderOutcome {
    /// Total rows affected reported by the response.
    pub rows_affected: u64,
    /// Output parameter tokens, in arrival order.
    pub return_values: Vec<ReturnValueRecord>,
    /// The procedure's return status, if one arrived.
    pub return_status: Option<i32>,
    /// The prepared handle, when the execution sent a prepare-execute.
    pub prepared_handle: Option<i32>,
}

/// Streaming access to the pending result set of one execution.
pub struct CommandReader {
    parser: Arc<dyn WireParser>,
    guard: SessionGuard,
    columns: Vec<String>,
    reset_text: Option<String>,
    timeout_seconds: u32,
    expect_prepare_handle: bool,
    exhausted: bool,
    outcome: ReaderOutcome,
}

impl CommandReader {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        parser: Arc<dyn WireParser>,
        guard: SessionGuard,
        columns: Vec<String>,
        reset_text: Option<String>,
        timeout_seconds: u32,
        expect_prepare_handle: bool,
        exhausted: bool,
    ) -> Self {
        Self {
            parser,
            guard,
            columns,
            reset_text,
            timeout_seconds,
            expect_prepare_handle,
            exhausted,
            outcome: ReaderOutcome::default(),
        }
    }

    /// Column names of the current result set.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Whether the response is fully drained.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Pull the next row, or `None` at the end of the response.
    ///
    /// # Errors
    ///
    /// Surfaces server errors, cancellation acknowledgements and transport
    /// failures.
    pub async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            let Some(event) = self.parser.next_token(self.guard.session()).await? else {
                self.exhausted = true;
                return Ok(None);
            };
            match event {
                TokenEvent::Row(cells) => return Ok(Some(cells)),
                TokenEvent::ResultSetStart { columns } => self.columns = columns,
                TokenEvent::ReturnValue(rv) => {
                    if self.expect_prepare_handle && self.outcome.prepared_handle.is_none() {
                        self.outcome.prepared_handle = rv.value.as_i32();
                    } else {
                        self.outcome.return_values.push(rv);
                    }
                }
                TokenEvent::ReturnStatus(status) => self.outcome.return_status = Some(status),
                TokenEvent::DoneInProc { rows_affected, .. }
                | TokenEvent::DoneProc { rows_affected, .. } => {
                    self.outcome.rows_affected += rows_affected;
                }
                TokenEvent::Done {
                    rows_affected,
                    more,
                    attention_ack,
                    ..
                } => {
                    self.outcome.rows_affected += rows_affected;
                    if attention_ack {
                        self.exhausted = true;
                        return Err(Error::Cancelled);
                    }
                    if !more {
                        self.exhausted = true;
                        return Ok(None);
                    }
                }
                TokenEvent::ServerError(fault) => {
                    self.guard.session().diagnostics().push_error(fault.clone());
                    self.exhausted = true;
                    return Err(fault.into());
                }
                TokenEvent::Warning(fault) => {
                    self.guard.session().diagnostics().push_warning(fault);
                }
            }
        }
    }

    /// Drain the response, issue the options-reset batch when one is owed,
    /// and return the session to the connection.
    ///
    /// # Errors
    ///
    /// Surfaces errors hit while draining; the session still returns to the
    /// connection through the guard.
    pub async fn close(mut self) -> Result<ReaderOutcome> {
        while self.next_row().await?.is_some() {}

        if let Some(reset) = self.reset_text.take() {
            tracing::debug!(reset = %reset, "issuing reader reset options");
            self.parser
                .execute_batch(&reset, self.timeout_seconds, self.guard.session(), None)
                .await?;
            loop {
                match self.parser.next_token(self.guard.session()).await? {
                    None | Some(TokenEvent::Done { more: false, .. }) => break,
                    Some(_) => {}
                }
            }
        }
        Ok(std::mem::take(&mut self.outcome))
    }
}

impl std::fmt::Debug for CommandReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandReader")
            .field("columns", &self.columns)
            .field("exhausted", &self.exhausted)
            .field("pending_reset", &self.reset_text.is_some())
            .finish()
    }
}
