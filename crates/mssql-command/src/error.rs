//! Engine error types.

use thiserror::Error;

use crate::parser::ServerFault;
use tds_rpc::{MAX_RPC_NAME_CHARS, RpcError};

/// Server error number signalling a conversion failure the client should
/// retry after refreshing its parameter encryption metadata.
pub const TCE_CONVERSION_ERROR_CLIENT_RETRY: i32 = 33514;

/// Server error number signalling that the enclave session handle the
/// client presented is no longer valid.
pub const TCE_ENCLAVE_INVALID_SESSION_HANDLE: i32 = 33195;

/// Errors that can occur while executing a command.
#[derive(Debug, Error)]
pub enum Error {
    /// Process-fatal signal (out of memory and the like). The connection is
    /// doomed and the session is never returned to the pool.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// The session transitioned to broken (unacknowledged attention, parser
    /// in a closed state).
    #[error("connection broken: {0}")]
    ConnectionBroken(String),

    /// The operation observed a cancellation request.
    #[error("operation cancelled")]
    Cancelled,

    /// Server returned an error.
    #[error("server error {number}: {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Error class/severity (0-25).
        class: u8,
        /// Error state.
        state: u8,
        /// Error message.
        message: String,
        /// Server name where the error occurred.
        server: Option<String>,
        /// Stored procedure name, if applicable.
        procedure: Option<String>,
        /// Line number in the batch or procedure.
        line: u32,
    },

    /// Invalid argument or command state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An argument exceeded a protocol length cap.
    #[error("{argument} is {chars} UTF-16 units, maximum is {max}")]
    InvalidArgumentLength {
        /// Which argument was too long.
        argument: &'static str,
        /// Observed length in UTF-16 code units.
        chars: usize,
        /// The cap.
        max: usize,
    },

    /// The command has no connection.
    #[error("the command has no connection")]
    NoConnection,

    /// The server omitted cipher metadata for a parameter.
    #[error("no parameter encryption metadata received for parameter {parameter:?}")]
    ParameterEncryptionMetadataMissing {
        /// Name of the parameter without metadata.
        parameter: String,
    },

    /// A procedure invocation still required cipher metadata after the
    /// describe exchange.
    #[error("procedure encryption metadata was not fetched before execution")]
    ProcEncryptionMetadataMissing,

    /// An end method was paired with the wrong begin method.
    #[error("mismatched end method: expected {expected}, called {actual}")]
    MismatchedEndMethod {
        /// End method recorded at begin.
        expected: &'static str,
        /// End method actually called.
        actual: &'static str,
    },

    /// An end method was called without a pending begin.
    #[error("no asynchronous operation is in progress")]
    NoAsyncOperation,

    /// A second operation was started while one is in flight.
    #[error("an asynchronous operation is already in progress")]
    AsyncInProgress,

    /// The command's transaction or connection no longer matches.
    #[error("transaction mismatch: {0}")]
    TransactionMismatch(String),

    /// The server did not negotiate column encryption support.
    #[error("the server does not support column encryption")]
    TceNotSupported,

    /// Enclave computations are required but no attestation URL is
    /// configured.
    #[error("an enclave is required but no attestation URL is configured")]
    AttestationUrlMissing,

    /// The connection's reconnect did not finish within the command
    /// timeout.
    #[error("timed out waiting for the connection to reconnect")]
    ReconnectTimeout,

    /// Internal signal: re-enter execution after refreshing encryption
    /// state.
    #[error("parameter encryption state is stale; retry requested")]
    EncryptionRetry,

    /// Column encryption failure.
    #[error(transparent)]
    Crypto(#[from] mssql_crypto::CryptoError),
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::NameTooLong { chars } => Error::InvalidArgumentLength {
                argument: "procedure name",
                chars,
                max: MAX_RPC_NAME_CHARS,
            },
        }
    }
}

impl From<ServerFault> for Error {
    fn from(f: ServerFault) -> Self {
        Error::Server {
            number: f.number,
            class: f.class,
            state: f.state,
            message: f.message,
            server: f.server,
            procedure: f.procedure,
            line: f.line,
        }
    }
}

impl Error {
    /// Whether this error dooms the connection (session is never returned).
    #[must_use]
    pub fn dooms_connection(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Whether this error is a cancellation.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the protocol signalled a condition the engine may retry once
    /// after invalidating its cached encryption state.
    ///
    /// `cache_used` must reflect whether the attempt ran on cached cipher
    /// metadata; `enclave_mode` whether an enclave session was presented.
    #[must_use]
    pub fn is_encryption_retryable(&self, cache_used: bool, enclave_mode: bool) -> bool {
        match self {
            Self::Server { number, .. } if *number == TCE_CONVERSION_ERROR_CLIENT_RETRY => {
                cache_used
            }
            Self::Server { number, .. } if *number == TCE_ENCLAVE_INVALID_SESSION_HANDLE => {
                enclave_mode
            }
            Self::EncryptionRetry => true,
            _ => false,
        }
    }

    /// Whether this is a server error with the given number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        matches!(self, Self::Server { number: n, .. } if *n == number)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn server_error(number: i32) -> Error {
        Error::Server {
            number,
            class: 16,
            state: 1,
            message: "test".to_string(),
            server: None,
            procedure: None,
            line: 1,
        }
    }

    #[test]
    fn test_retry_classification_requires_cache_use() {
        let err = server_error(TCE_CONVERSION_ERROR_CLIENT_RETRY);
        assert!(err.is_encryption_retryable(true, false));
        assert!(!err.is_encryption_retryable(false, false));
    }

    #[test]
    fn test_retry_classification_enclave_handle() {
        let err = server_error(TCE_ENCLAVE_INVALID_SESSION_HANDLE);
        assert!(err.is_encryption_retryable(false, true));
        assert!(!err.is_encryption_retryable(true, false));
    }

    #[test]
    fn test_other_server_errors_never_retry() {
        assert!(!server_error(1205).is_encryption_retryable(true, true));
    }

    #[test]
    fn test_orchestrator_retry_signal() {
        assert!(Error::EncryptionRetry.is_encryption_retryable(false, false));
    }

    #[test]
    fn test_fatal_dooms_connection() {
        assert!(Error::Fatal("oom".into()).dooms_connection());
        assert!(!Error::Cancelled.dooms_connection());
    }

    #[test]
    fn test_rpc_length_error_mapping() {
        let err: Error = tds_rpc::RpcRecord::by_name("x".repeat(600))
            .unwrap_err()
            .into();
        assert!(matches!(
            err,
            Error::InvalidArgumentLength {
                argument: "procedure name",
                chars: 600,
                max: 523,
            }
        ));
    }
}
