//! Completion plumbing for asynchronous executions.
//!
//! A begin method snapshots the command state into an execution task and
//! parks a single-assignment completion promise in the command's async
//! slot; the matching end method awaits the promise, restores the state and
//! surfaces the payload or error. End methods are name-paired with their
//! begin: calling the wrong one fails without consuming the operation.

use tokio::sync::oneshot;

use crate::batch::BatchMode;
use crate::command::EncryptionWorkspace;
use crate::error::Result;
use crate::parameter::ParameterCollection;
use crate::prepare::PrepareState;
use crate::reader::CommandReader;
use tds_rpc::SqlValue;

/// End-method name recorded for `begin_execute_non_query`.
pub(crate) const END_EXECUTE_NON_QUERY: &str = "end_execute_non_query";
/// End-method name recorded for `begin_execute_scalar`.
pub(crate) const END_EXECUTE_SCALAR: &str = "end_execute_scalar";
/// End-method name recorded for `begin_execute_reader`.
pub(crate) const END_EXECUTE_READER: &str = "end_execute_reader";
/// End-method name recorded for `begin_execute_xml_reader`.
pub(crate) const END_EXECUTE_XML_READER: &str = "end_execute_xml_reader";

/// What an execution produced.
pub(crate) enum ExecPayload {
    /// Rows affected (non-query).
    Rows(u64),
    /// First column of the first row, if any row came back.
    Scalar(Option<SqlValue>),
    /// An installed reader over the pending result set.
    Reader(CommandReader),
    /// A materialized XML document.
    Xml(String),
}

/// Command state threaded through an execution and handed back at its end.
pub(crate) struct RestoredState {
    pub params: ParameterCollection,
    pub prepare: PrepareState,
    pub batch: Option<BatchMode>,
    pub workspace: EncryptionWorkspace,
}

/// The value a completed execution delivers: the payload (or error) plus
/// the state to restore onto the command.
pub(crate) struct ExecutionResult {
    pub state: RestoredState,
    pub payload: Result<ExecPayload>,
}

/// Single-assignment completion promise.
pub(crate) struct CompletionSource<T> {
    tx: Option<oneshot::Sender<T>>,
}

impl<T> CompletionSource<T> {
    /// Create a promise and its receiving half.
    pub(crate) fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Assign the result. Returns `false` if the promise was already set or
    /// the receiver is gone.
    pub(crate) fn complete(&mut self, value: T) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

/// The one in-flight asynchronous operation of a command.
pub(crate) struct AsyncSlot {
    /// The completion to await in the end method.
    pub receiver: oneshot::Receiver<ExecutionResult>,
    /// End-method name recorded at begin.
    pub end_method: &'static str,
    /// Connection close generation at begin, for post-completion validity
    /// checks.
    pub close_count_at_begin: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completion_is_single_assignment() {
        let (mut source, rx) = CompletionSource::new();
        assert!(source.complete(1));
        assert!(!source.complete(2));
        assert_eq!(rx.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_completion_without_receiver() {
        let (mut source, rx) = CompletionSource::<i32>::new();
        drop(rx);
        assert!(!source.complete(1));
    }
}
