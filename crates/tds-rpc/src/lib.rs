//! # tds-rpc
//!
//! In-memory RPC invocation descriptors for the MS-TDS protocol.
//!
//! This crate models what a command executor hands to the wire layer: the
//! procedure reference (well-known id or name), option bits, the fixed
//! system-parameter slice each invocation shape requires, and the packed
//! per-parameter option map for user parameters. The wire layer owns byte
//! serialization; everything here stays descriptive.
//!
//! ## Invocation shapes
//!
//! Four shapes cover parameterized execution against SQL Server:
//!
//! - raw SQL batch (no RPC at all),
//! - `sp_executesql(@stmt, @params, …)` for one-shot parameterized text,
//! - `sp_prepexec(@handle, @params, @stmt, …)` to prepare and execute in one
//!   round trip,
//! - `sp_execute(@handle, …)` to re-run a prepared plan.
//!
//! The crate also builds the two derived strings those shapes need: the
//! parameter-list signature (`@name type(modifiers)`) and the `EXEC` preview
//! used when a stored procedure call must be described as text.

pub mod flags;
pub mod record;
pub mod signature;
pub mod types;
pub mod value;

pub use flags::{PackedParamOptions, ParamOptions, RpcOptions};
pub use record::{
    MAX_RPC_NAME_BYTES, MAX_RPC_NAME_CHARS, ProcId, ProcRef, RpcError, RpcParam, RpcRecord,
};
pub use signature::{ParamShape, exec_preview, param_list_signature, quote_multipart_identifier};
pub use types::TdsType;
pub use value::SqlValue;
