//! The narrow connection interface the engine executes against.

use std::sync::Arc;

use bytes::Bytes;
use futures_core::future::BoxFuture;
use tds_rpc::SqlValue;

use crate::error::Result;
use crate::parser::{WireParser, WireSession};

/// A pending reconnect the command must await before writing.
pub type ReconnectFuture = BoxFuture<'static, Result<()>>;

/// The connection a command executes on.
///
/// The connection owns the session object and the wire parser; the command
/// borrows the session for one operation at a time and must return it on
/// every catchable exit path. The async counter tracks operations in flight
/// for pool accounting and must be balanced exactly once per execution.
pub trait Connection: Send + Sync {
    /// Server address, for cache fingerprints and diagnostics.
    fn data_source(&self) -> String;

    /// Current database, for cache fingerprints and diagnostics.
    fn database(&self) -> String;

    /// Number of times this connection's underlying transport was closed.
    /// Prepared handles from an earlier close generation are invalid.
    fn close_count(&self) -> u64;

    /// Number of completed transparent reconnects. Prepared handles from an
    /// earlier reconnect generation are invalid.
    fn reconnect_count(&self) -> u64;

    /// Whether the connection string enables column encryption by default.
    fn is_column_encryption_enabled(&self) -> bool;

    /// Whether the server negotiated column encryption support.
    fn supports_column_encryption(&self) -> bool;

    /// Attestation service URL for enclave computations, when configured.
    fn enclave_attestation_url(&self) -> Option<String>;

    /// Attestation protocol identifier, when configured.
    fn attestation_protocol(&self) -> Option<u8>;

    /// A future for the in-progress transparent reconnect, if one is
    /// running. The command awaits it (bounded by its timeout) before
    /// touching the session.
    fn validate_and_reconnect(&self) -> Option<ReconnectFuture>;

    /// Borrow the open session.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection is closed or broken.
    fn open_session(&self) -> Result<Arc<dyn WireSession>>;

    /// Return a borrowed session to the connection.
    fn return_session(&self, session: Arc<dyn WireSession>);

    /// The wire parser bound to this connection.
    fn parser(&self) -> Arc<dyn WireParser>;

    /// Note one more asynchronous operation in flight.
    fn increment_async_count(&self);

    /// Note one asynchronous operation completed.
    fn decrement_async_count(&self);

    /// Abort the connection after a fatal signal. The session is not
    /// returned.
    fn doom(&self);

    /// Materialize a UDT return value through the connection's UDT factory.
    ///
    /// The default keeps the payload opaque; connections with a registered
    /// factory override this to produce a typed value.
    fn materialize_udt(&self, type_name: &str, payload: Bytes) -> SqlValue {
        SqlValue::Udt {
            type_name: type_name.to_string(),
            payload,
        }
    }
}

/// A server transaction a command can be enlisted in.
///
/// The connection owns the transaction; commands hold a weak reference so a
/// completed transaction is observed rather than kept alive.
#[derive(Debug)]
pub struct Transaction {
    /// Server-assigned transaction descriptor.
    pub descriptor: u64,
}

impl Transaction {
    /// Create a transaction handle for a server descriptor.
    #[must_use]
    pub fn new(descriptor: u64) -> Self {
        Self { descriptor }
    }
}
