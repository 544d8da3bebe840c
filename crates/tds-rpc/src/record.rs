//! The RPC invocation descriptor.
//!
//! An [`RpcRecord`] is what the command executor hands to the wire layer: a
//! procedure reference, option bits, the fixed system-parameter slice the
//! chosen shape requires, and the packed option map for user parameters. The
//! wire layer turns it into the server's remote-procedure-call token stream;
//! nothing here touches bytes.

use bytes::Bytes;
use thiserror::Error;

use crate::flags::{PackedParamOptions, ParamOptions, RpcOptions};
use crate::types::TdsType;
use crate::value::SqlValue;

/// Maximum procedure name length in bytes (UTF-16 encoding).
pub const MAX_RPC_NAME_BYTES: usize = 1046;

/// Maximum procedure name length in UTF-16 code units.
pub const MAX_RPC_NAME_CHARS: usize = MAX_RPC_NAME_BYTES / 2;

/// Errors raised while assembling an RPC record.
#[derive(Debug, Error)]
pub enum RpcError {
    /// A procedure name exceeded the protocol's length cap.
    #[error("procedure name is {chars} UTF-16 units, maximum is {MAX_RPC_NAME_CHARS}")]
    NameTooLong {
        /// Length of the offending name in UTF-16 code units.
        chars: usize,
    },
}

/// Well-known stored procedure ids the server recognizes without a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// sp_cursor (0x0001)
    Cursor = 0x0001,
    /// sp_cursoropen (0x0002)
    CursorOpen = 0x0002,
    /// sp_cursorprepare (0x0003)
    CursorPrepare = 0x0003,
    /// sp_cursorexecute (0x0004)
    CursorExecute = 0x0004,
    /// sp_cursorprepexec (0x0005)
    CursorPrepExec = 0x0005,
    /// sp_cursorunprepare (0x0006)
    CursorUnprepare = 0x0006,
    /// sp_cursorfetch (0x0007)
    CursorFetch = 0x0007,
    /// sp_cursoroption (0x0008)
    CursorOption = 0x0008,
    /// sp_cursorclose (0x0009)
    CursorClose = 0x0009,
    /// sp_executesql (0x000A)
    ExecuteSql = 0x000A,
    /// sp_prepare (0x000B)
    Prepare = 0x000B,
    /// sp_execute (0x000C)
    Execute = 0x000C,
    /// sp_prepexec (0x000D)
    PrepExec = 0x000D,
    /// sp_prepexecrpc (0x000E)
    PrepExecRpc = 0x000E,
    /// sp_unprepare (0x000F)
    Unprepare = 0x000F,
}

/// Procedure reference: a well-known id or a validated name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcRef {
    /// Invocation by well-known procedure id.
    Id(ProcId),
    /// Invocation by name (validated against [`MAX_RPC_NAME_BYTES`]).
    Name(String),
}

/// A system parameter carried inside an RPC record.
///
/// System parameters are the shape-defining slots (`@handle`, `@stmt`,
/// `@params`, …); user parameters stay in the command's collection and are
/// referenced by the record's option map instead.
#[derive(Debug, Clone)]
pub struct RpcParam {
    /// Parameter name, with the `@` prefix where the shape requires one.
    pub name: &'static str,
    /// Declared type.
    pub ty: TdsType,
    /// Current value.
    pub value: SqlValue,
    /// Option bits (`BY_REF` for the prepared-handle slot).
    pub options: ParamOptions,
}

impl RpcParam {
    /// Input system parameter.
    #[must_use]
    pub fn input(name: &'static str, ty: TdsType, value: SqlValue) -> Self {
        Self {
            name,
            ty,
            value,
            options: ParamOptions::empty(),
        }
    }

    /// Input-output system parameter.
    #[must_use]
    pub fn by_ref(name: &'static str, ty: TdsType, value: SqlValue) -> Self {
        Self {
            name,
            ty,
            value,
            options: ParamOptions::BY_REF,
        }
    }
}

/// In-memory descriptor of one RPC invocation.
#[derive(Debug, Clone)]
pub struct RpcRecord {
    /// Procedure id or name.
    pub proc: ProcRef,
    /// Invocation-level option bits.
    pub options: RpcOptions,
    /// Fixed system-parameter slice for the chosen shape.
    pub system_params: Vec<RpcParam>,
    /// Number of user parameters referenced by this record.
    pub user_param_count: usize,
    /// Packed per-user-parameter options, one entry per referenced parameter.
    pub user_param_options: Vec<PackedParamOptions>,
    /// Rows affected by this RPC alone.
    pub rows_affected: u64,
    /// Rows affected up to and including this RPC within a batch.
    pub cumulative_rows_affected: u64,
    /// Start of this RPC's slice in the session's error buffer.
    pub errors_start: usize,
    /// End of this RPC's slice in the session's error buffer.
    pub errors_end: usize,
    /// Start of this RPC's slice in the session's warning buffer.
    pub warnings_start: usize,
    /// End of this RPC's slice in the session's warning buffer.
    pub warnings_end: usize,
    /// Set when parameter cipher metadata must still be fetched for this
    /// record before it may be written.
    pub needs_fetch_parameter_encryption_metadata: bool,
}

impl RpcRecord {
    /// Create a record invoking a well-known procedure id.
    #[must_use]
    pub fn by_id(id: ProcId) -> Self {
        Self::with_proc(ProcRef::Id(id))
    }

    /// Create a record invoking a procedure by name.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::NameTooLong`] when the name exceeds 1046 bytes in
    /// its UTF-16 encoding.
    pub fn by_name(name: impl Into<String>) -> Result<Self, RpcError> {
        let name = name.into();
        let chars = name.encode_utf16().count();
        if chars > MAX_RPC_NAME_CHARS {
            return Err(RpcError::NameTooLong { chars });
        }
        Ok(Self::with_proc(ProcRef::Name(name)))
    }

    fn with_proc(proc: ProcRef) -> Self {
        Self {
            proc,
            options: RpcOptions::empty(),
            system_params: Vec::new(),
            user_param_count: 0,
            user_param_options: Vec::new(),
            rows_affected: 0,
            cumulative_rows_affected: 0,
            errors_start: 0,
            errors_end: 0,
            warnings_start: 0,
            warnings_end: 0,
            needs_fetch_parameter_encryption_metadata: false,
        }
    }

    /// `sp_executesql(@stmt, @params, …)` for one-shot parameterized text.
    #[must_use]
    pub fn execute_sql(stmt: impl Into<String>, param_list: Option<String>) -> Self {
        let mut record = Self::by_id(ProcId::ExecuteSql);
        record.system_params.push(RpcParam::input(
            "",
            TdsType::NVarChar,
            SqlValue::String(stmt.into()),
        ));
        if let Some(list) = param_list {
            record
                .system_params
                .push(RpcParam::input("", TdsType::NVarChar, SqlValue::String(list)));
        }
        record
    }

    /// `sp_prepexec(@handle, @params, @stmt, …)`: prepare and execute in one
    /// round trip. `handle` is the prior prepared handle to reuse, or `-1`.
    #[must_use]
    pub fn prep_exec(handle: i32, param_list: Option<String>, stmt: impl Into<String>) -> Self {
        let mut record = Self::by_id(ProcId::PrepExec);
        record
            .system_params
            .push(RpcParam::by_ref("@handle", TdsType::Int, SqlValue::Int(handle)));
        record.system_params.push(RpcParam::input(
            "@params",
            TdsType::NVarChar,
            param_list.map_or(SqlValue::Null, SqlValue::String),
        ));
        record.system_params.push(RpcParam::input(
            "@stmt",
            TdsType::NVarChar,
            SqlValue::String(stmt.into()),
        ));
        record
    }

    /// `sp_execute(@handle, …)`: re-run a prepared plan.
    #[must_use]
    pub fn execute(handle: i32) -> Self {
        let mut record = Self::by_id(ProcId::Execute);
        record
            .system_params
            .push(RpcParam::input("@handle", TdsType::Int, SqlValue::Int(handle)));
        record
    }

    /// `sp_unprepare(@handle)`: release a prepared plan.
    #[must_use]
    pub fn unprepare(handle: i32) -> Self {
        let mut record = Self::by_id(ProcId::Unprepare);
        record
            .system_params
            .push(RpcParam::input("@handle", TdsType::Int, SqlValue::Int(handle)));
        record
    }

    /// `sp_describe_parameter_encryption(@tsql, @params[, @attestation])`.
    ///
    /// # Errors
    ///
    /// Never fails today; kept fallible to match the by-name construction it
    /// wraps.
    pub fn describe_parameter_encryption(
        tsql: impl Into<String>,
        param_list: Option<String>,
        attestation: Option<Bytes>,
    ) -> Result<Self, RpcError> {
        let mut record = Self::by_name("sp_describe_parameter_encryption")?;
        record.system_params.push(RpcParam::input(
            "@tsql",
            TdsType::NVarChar,
            SqlValue::String(tsql.into()),
        ));
        record.system_params.push(RpcParam::input(
            "@params",
            TdsType::NVarChar,
            param_list.map_or(SqlValue::Null, SqlValue::String),
        ));
        if let Some(blob) = attestation {
            record.system_params.push(RpcParam::input(
                "@attestation_parameters",
                TdsType::VarBinary,
                SqlValue::Binary(blob),
            ));
        }
        Ok(record)
    }

    /// Declare the number of user parameters and reset their option map to
    /// the identity (no options, ordinal order).
    pub fn set_user_params(&mut self, count: usize) {
        self.user_param_count = count;
        self.user_param_options = (0..count)
            .map(|i| PackedParamOptions::pack(ParamOptions::empty(), i))
            .collect();
    }

    /// Set option bits for the user parameter at `index`.
    pub fn set_user_param_options(&mut self, index: usize, options: ParamOptions) {
        if let Some(slot) = self.user_param_options.get_mut(index) {
            *slot = PackedParamOptions::pack(options, index);
        }
    }

    /// Options recorded for the user parameter at `index`.
    #[must_use]
    pub fn user_param_options_at(&self, index: usize) -> ParamOptions {
        self.user_param_options
            .get(index)
            .map(|p| p.options())
            .unwrap_or_default()
    }

    /// Whether this record carries a mutable prepared-handle slot.
    #[must_use]
    pub fn has_handle_slot(&self) -> bool {
        matches!(self.proc, ProcRef::Id(ProcId::PrepExec))
    }

    /// Human-readable procedure label, for logging.
    #[must_use]
    pub fn proc_label(&self) -> &str {
        match &self.proc {
            ProcRef::Id(ProcId::ExecuteSql) => "sp_executesql",
            ProcRef::Id(ProcId::Prepare) => "sp_prepare",
            ProcRef::Id(ProcId::Execute) => "sp_execute",
            ProcRef::Id(ProcId::PrepExec) => "sp_prepexec",
            ProcRef::Id(ProcId::PrepExecRpc) => "sp_prepexecrpc",
            ProcRef::Id(ProcId::Unprepare) => "sp_unprepare",
            ProcRef::Id(ProcId::Cursor) => "sp_cursor",
            ProcRef::Id(ProcId::CursorOpen) => "sp_cursoropen",
            ProcRef::Id(ProcId::CursorPrepare) => "sp_cursorprepare",
            ProcRef::Id(ProcId::CursorExecute) => "sp_cursorexecute",
            ProcRef::Id(ProcId::CursorPrepExec) => "sp_cursorprepexec",
            ProcRef::Id(ProcId::CursorUnprepare) => "sp_cursorunprepare",
            ProcRef::Id(ProcId::CursorFetch) => "sp_cursorfetch",
            ProcRef::Id(ProcId::CursorOption) => "sp_cursoroption",
            ProcRef::Id(ProcId::CursorClose) => "sp_cursorclose",
            ProcRef::Name(name) => name,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_proc_id_values() {
        assert_eq!(ProcId::ExecuteSql as u16, 0x000A);
        assert_eq!(ProcId::Prepare as u16, 0x000B);
        assert_eq!(ProcId::Execute as u16, 0x000C);
        assert_eq!(ProcId::PrepExec as u16, 0x000D);
        assert_eq!(ProcId::Unprepare as u16, 0x000F);
    }

    #[test]
    fn test_by_name_length_cap() {
        let ok = "x".repeat(MAX_RPC_NAME_CHARS);
        assert!(RpcRecord::by_name(ok).is_ok());

        let too_long = "x".repeat(MAX_RPC_NAME_CHARS + 1);
        let err = RpcRecord::by_name(too_long).unwrap_err();
        assert!(matches!(err, RpcError::NameTooLong { chars } if chars == 524));
    }

    #[test]
    fn test_by_name_counts_utf16_units() {
        // Each of these is one char but two UTF-16 code units.
        let astral = "\u{1F600}".repeat(262);
        assert!(RpcRecord::by_name(astral).is_err());
    }

    #[test]
    fn test_execute_sql_shape() {
        let record = RpcRecord::execute_sql("SELECT @x", Some("@x int".to_string()));
        assert_eq!(record.proc, ProcRef::Id(ProcId::ExecuteSql));
        assert_eq!(record.system_params.len(), 2);
        assert_eq!(record.system_params[0].value.as_str(), Some("SELECT @x"));
    }

    #[test]
    fn test_prep_exec_shape() {
        let record = RpcRecord::prep_exec(-1, Some("@x int".to_string()), "SELECT @x");
        assert_eq!(record.proc, ProcRef::Id(ProcId::PrepExec));
        assert_eq!(record.system_params.len(), 3);
        assert_eq!(record.system_params[0].options, ParamOptions::BY_REF);
        assert_eq!(record.system_params[0].value.as_i32(), Some(-1));
        assert!(record.has_handle_slot());
    }

    #[test]
    fn test_execute_shape() {
        let record = RpcRecord::execute(7);
        assert_eq!(record.system_params.len(), 1);
        assert_eq!(record.system_params[0].value.as_i32(), Some(7));
        assert!(!record.has_handle_slot());
    }

    #[test]
    fn test_describe_shape_with_attestation() {
        let record = RpcRecord::describe_parameter_encryption(
            "SELECT @ssn",
            Some("@ssn varchar(11)".to_string()),
            Some(Bytes::from_static(b"attest")),
        )
        .unwrap();
        assert_eq!(record.proc_label(), "sp_describe_parameter_encryption");
        assert_eq!(record.system_params.len(), 3);
    }

    #[test]
    fn test_user_param_option_map() {
        let mut record = RpcRecord::execute_sql("SELECT @a, @b", None);
        record.set_user_params(2);
        record.set_user_param_options(1, ParamOptions::ENCRYPTED);
        assert_eq!(record.user_param_options_at(0), ParamOptions::empty());
        assert_eq!(record.user_param_options_at(1), ParamOptions::ENCRYPTED);
        assert_eq!(record.user_param_options[1].index(), 1);
    }
}
