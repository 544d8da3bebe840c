//! # mssql-command
//!
//! The client-side command execution engine for SQL Server's TDS protocol.
//!
//! This crate owns the state machine between an application's command and
//! the wire layer: the prepare/execute lifecycle with hidden re-preparation
//! of dirty commands, parameter marshalling, transparent parameter
//! encryption (with a process-wide metadata cache and an
//! enclave-attestation side channel), RPC dispatch, synchronous and
//! asynchronous completion with cancellation, and a single classified retry
//! on stale encryption state.
//!
//! The wire parser, the connection pool, key-store backends and the
//! row-consuming reader are collaborators behind narrow traits
//! ([`WireParser`], [`Connection`], key stores and enclave providers from
//! `mssql-crypto`); the engine never frames a packet itself.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_command::{Command, CommandKind, SqlParameter};
//! use tds_rpc::TdsType;
//!
//! let mut cmd = Command::new("SELECT @x", CommandKind::TextBatch);
//! cmd.parameters_mut()
//!     .add(SqlParameter::new("x", TdsType::Int).with_value(5));
//! cmd.set_connection(Some(connection))?;
//!
//! cmd.prepare()?;
//! let value = cmd.execute_scalar().await?; // sp_prepexec, then sp_execute
//! ```
//!
//! ## Thread safety
//!
//! A command is single-writer: all mutating operations belong to one task.
//! The only exception is [`Command::cancel`] (and [`CancelHandle`]), which
//! any thread may call at any time as a best-effort suggestion.

pub mod batch;
pub mod cancel;
pub mod command;
pub mod connection;
pub mod error;
pub mod metadata_cache;
pub mod parameter;
pub mod parser;
pub mod prepare;
pub mod reader;

mod completion;
mod encryption;
mod executor;
mod guards;
mod output;

pub use batch::{BatchItem, BatchMode};
pub use cancel::CancelHandle;
pub use command::{
    ColumnEncryptionSetting, Command, CommandBehavior, CommandKind, UpdatedRowSource,
};
pub use connection::{Connection, ReconnectFuture, Transaction};
pub use error::{
    Error, Result, TCE_CONVERSION_ERROR_CLIENT_RETRY, TCE_ENCLAVE_INVALID_SESSION_HANDLE,
};
pub use metadata_cache::{
    CacheKey, CachedCommandMetadata, CachedParamCipher, QueryMetadataCache,
    global_query_metadata_cache,
};
pub use parameter::{ParamDirection, ParameterCollection, SqlParameter};
pub use parser::{
    ReturnValueRecord, RunBehavior, ServerFault, SessionDiagnostics, TokenEvent, WireParser,
    WireSession,
};
pub use prepare::PrepareState;
pub use reader::{CommandReader, ReaderOutcome};

// Re-export the crypto surface commands are configured with.
pub use mssql_crypto::{
    AttestationParams, EnclavePackage, EnclaveProvider, EnclaveSession, KeyStoreProvider,
    KeyStoreRegistry,
};
