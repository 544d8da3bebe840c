//! The command aggregate.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use bytes::Bytes;
use mssql_crypto::{
    AttestationParams, CipherKeyEntry, EnclavePackage, EnclaveProvider, KeyStoreRegistry,
};

use crate::batch::{BatchItem, BatchMode};
use crate::cancel::{CancelHandle, CancelState};
use crate::completion::AsyncSlot;
use crate::connection::{Connection, Transaction};
use crate::error::{Error, Result};
use crate::metadata_cache::{CacheKey, CachedCommandMetadata};
use crate::parameter::ParameterCollection;
use crate::prepare::PrepareState;
use tds_rpc::RpcRecord;

/// What the command's text is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Raw SQL text, possibly parameterized.
    TextBatch,
    /// A stored procedure name.
    StoredProcedure,
}

/// Per-command column encryption setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnEncryptionSetting {
    /// Follow the connection's setting.
    UseConnectionDefault = 0,
    /// Encrypt eligible input parameters and decrypt results.
    Enabled = 1,
    /// No parameter encryption and no result decryption.
    Disabled = 2,
    /// Decrypt results but never encrypt parameters.
    ResultSetOnly = 3,
}

/// How a data adapter applies returned data back to a row; carried for that
/// collaborator, unused by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatedRowSource {
    /// Ignore returned data.
    None,
    /// Map output parameters back.
    OutputParameters,
    /// Map the first returned record back.
    FirstReturnedRecord,
    /// Map both.
    #[default]
    Both,
}

bitflags! {
    /// Execution behavior requested by the caller.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CommandBehavior: u16 {
        /// Close the connection when the reader closes.
        const CLOSE_CONNECTION = 0x0001;
        /// Column metadata only; no rows are produced.
        const SCHEMA_ONLY = 0x0002;
        /// Include key and browse information in metadata.
        const KEY_INFO = 0x0004;
        /// At most one result set.
        const SINGLE_RESULT = 0x0008;
        /// At most one row.
        const SINGLE_ROW = 0x0010;
        /// Columns are read strictly left to right.
        const SEQUENTIAL_ACCESS = 0x0020;
    }
}

/// Scratch state the parameter encryption flow builds up for one execution.
#[derive(Default)]
pub(crate) struct EncryptionWorkspace {
    /// Keys the enclave asked for, by describe ordinal.
    pub keys_for_enclave: BTreeMap<u16, Arc<CipherKeyEntry>>,
    /// The package transmitted with the real request, once generated.
    pub enclave_package: Option<EnclavePackage>,
    /// Attestation parameters sent with the describe request.
    pub attestation_params: Option<AttestationParams>,
    /// Provider-specific attestation data.
    pub custom_data: Option<Bytes>,
    /// Whether the command requires enclave computations.
    pub requires_enclave: bool,
    /// Caching is deferred until the return-status discriminates the
    /// invocation.
    pub caching_postponed: bool,
    /// The deferred cache insertion, when postponed.
    pub pending_cache_insert: Option<(CacheKey, Arc<CachedCommandMetadata>)>,
}

impl EncryptionWorkspace {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A client-side command: SQL text or a stored procedure invocation, its
/// parameters, and the execution state machine that drives them to
/// completion on a connection's session.
///
/// All mutating operations are single-writer; only [`Command::cancel`] (via
/// a [`CancelHandle`]) may be called from other threads.
pub struct Command {
    text: String,
    kind: CommandKind,
    timeout_seconds: u32,
    updated_row_source: UpdatedRowSource,
    column_encryption_setting: ColumnEncryptionSetting,
    pub(crate) parameters: ParameterCollection,
    connection: Option<Arc<dyn Connection>>,
    transaction: Option<Weak<Transaction>>,
    pub(crate) prepare: PrepareState,
    pub(crate) dirty: bool,
    pub(crate) hidden_prepare: bool,
    pub(crate) cancel: Arc<CancelState>,
    pub(crate) async_slot: Option<AsyncSlot>,
    pub(crate) batch: Option<BatchMode>,
    pub(crate) workspace: EncryptionWorkspace,
    pub(crate) custom_key_stores: Option<Arc<KeyStoreRegistry>>,
    pub(crate) enclave_provider: Option<Arc<dyn EnclaveProvider>>,
}

impl Command {
    /// Create a detached command.
    #[must_use]
    pub fn new(text: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            text: text.into(),
            kind,
            timeout_seconds: 30,
            updated_row_source: UpdatedRowSource::default(),
            column_encryption_setting: ColumnEncryptionSetting::UseConnectionDefault,
            parameters: ParameterCollection::new(),
            connection: None,
            transaction: None,
            prepare: PrepareState::Unprepared,
            dirty: false,
            hidden_prepare: false,
            cancel: Arc::new(CancelState::new()),
            async_slot: None,
            batch: None,
            workspace: EncryptionWorkspace::default(),
            custom_key_stores: None,
            enclave_provider: None,
        }
    }

    /// The command text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Replace the command text. Invalidates any prepared plan.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AsyncInProgress`] while an operation is in
    /// flight.
    pub fn set_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.ensure_quiescent()?;
        self.text = text.into();
        self.dirty = true;
        Ok(())
    }

    /// Text batch or stored procedure.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Change the command kind. Invalidates any prepared plan.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AsyncInProgress`] while an operation is in
    /// flight.
    pub fn set_kind(&mut self, kind: CommandKind) -> Result<()> {
        self.ensure_quiescent()?;
        self.kind = kind;
        self.dirty = true;
        Ok(())
    }

    /// Command timeout in seconds; `0` means no timeout.
    #[must_use]
    pub fn timeout_seconds(&self) -> u32 {
        self.timeout_seconds
    }

    /// Set the command timeout in seconds; `0` means no timeout.
    pub fn set_timeout_seconds(&mut self, timeout_seconds: u32) {
        self.timeout_seconds = timeout_seconds;
    }

    /// The data-adapter row source tag.
    #[must_use]
    pub fn updated_row_source(&self) -> UpdatedRowSource {
        self.updated_row_source
    }

    /// Set the data-adapter row source tag.
    pub fn set_updated_row_source(&mut self, source: UpdatedRowSource) {
        self.updated_row_source = source;
    }

    /// The command's column encryption setting.
    #[must_use]
    pub fn column_encryption_setting(&self) -> ColumnEncryptionSetting {
        self.column_encryption_setting
    }

    /// Change the column encryption setting.
    ///
    /// # Errors
    ///
    /// Fails when a batch has locked a different setting.
    pub fn set_column_encryption_setting(
        &mut self,
        setting: ColumnEncryptionSetting,
    ) -> Result<()> {
        if let Some(batch) = &self.batch {
            if batch.setting() != setting {
                return Err(Error::InvalidArgument(format!(
                    "the batch locked the column encryption setting to {:?}",
                    batch.setting()
                )));
            }
        }
        self.column_encryption_setting = setting;
        Ok(())
    }

    /// The parameter collection.
    #[must_use]
    pub fn parameters(&self) -> &ParameterCollection {
        &self.parameters
    }

    /// Mutable access to the parameter collection.
    pub fn parameters_mut(&mut self) -> &mut ParameterCollection {
        &mut self.parameters
    }

    /// The connection, if attached.
    #[must_use]
    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.as_ref()
    }

    /// Attach or detach the connection. Any prepared plan is dropped, since
    /// handles are connection-scoped.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AsyncInProgress`] while an operation is in
    /// flight.
    pub fn set_connection(&mut self, connection: Option<Arc<dyn Connection>>) -> Result<()> {
        self.ensure_quiescent()?;
        self.connection = connection;
        self.prepare = PrepareState::Unprepared;
        Ok(())
    }

    /// Enlist in (or leave) a transaction.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AsyncInProgress`] while an operation is in
    /// flight.
    pub fn set_transaction(&mut self, transaction: Option<Weak<Transaction>>) -> Result<()> {
        self.ensure_quiescent()?;
        self.transaction = transaction;
        Ok(())
    }

    /// Register a command-local key store registry that shadows the global
    /// one.
    pub fn set_custom_key_store_registry(&mut self, registry: Arc<KeyStoreRegistry>) {
        self.custom_key_stores = Some(registry);
    }

    /// Register the enclave attestation collaborator.
    pub fn set_enclave_provider(&mut self, provider: Arc<dyn EnclaveProvider>) {
        self.enclave_provider = Some(provider);
    }

    /// The prepare/execute state.
    #[must_use]
    pub fn prepare_state(&self) -> PrepareState {
        self.prepare
    }

    /// Whether the pending re-prepare was driver-initiated (a dirty command
    /// demoted on execute) rather than requested through
    /// [`Command::prepare`].
    #[must_use]
    pub fn is_hidden_prepare(&self) -> bool {
        self.hidden_prepare
    }

    /// Request preparation of the command.
    ///
    /// No-op for stored procedures, for text with no parameters (nothing to
    /// prepare), and for an already prepared, clean command. Otherwise the
    /// next execution sends the combined prepare-execute shape.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AsyncInProgress`] while an operation is in
    /// flight.
    pub fn prepare(&mut self) -> Result<()> {
        self.ensure_quiescent()?;
        if self.kind == CommandKind::StoredProcedure || self.parameters.is_empty() {
            return Ok(());
        }
        if self.prepare.is_prepared() && !self.is_dirty() {
            return Ok(());
        }

        let (close, reconnect) = self.connection_generations();
        self.prepare.demote(close, reconnect);
        self.prepare.request();
        self.hidden_prepare = false;
        tracing::debug!(state = ?self.prepare, "prepare requested");
        Ok(())
    }

    /// Drop the prepared plan. The handle is preserved for server-side
    /// reuse while the connection generations still match.
    ///
    /// Failures releasing the server-side plan are swallowed; the plan dies
    /// with the connection at the latest.
    pub fn unprepare(&mut self) {
        let (close, reconnect) = self.connection_generations();
        self.prepare.demote(close, reconnect);
        self.hidden_prepare = true;
    }

    /// A handle for cancelling this command from another task or thread.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(Arc::clone(&self.cancel))
    }

    /// Request cancellation. Best-effort, idempotent, never fails.
    pub fn cancel(&self) {
        self.cancel.request();
    }

    /// Add a command to the batch. The first add locks the batch's column
    /// encryption setting; later adds must agree.
    ///
    /// # Errors
    ///
    /// Fails on setting disagreement or an over-long procedure name.
    pub fn add_batch_command(
        &mut self,
        text: impl Into<String>,
        kind: CommandKind,
        params: ParameterCollection,
    ) -> Result<()> {
        self.ensure_quiescent()?;
        let text = text.into();
        let setting = self.column_encryption_setting;

        let mut record = match kind {
            CommandKind::StoredProcedure => RpcRecord::by_name(text.clone())?,
            CommandKind::TextBatch => {
                let signature = (!params.is_empty())
                    .then(|| tds_rpc::param_list_signature(&params.shapes()));
                RpcRecord::execute_sql(text.clone(), signature)
            }
        };
        record.set_user_params(params.len());
        record.needs_fetch_parameter_encryption_metadata =
            setting == ColumnEncryptionSetting::Enabled;

        let item = BatchItem {
            text,
            kind,
            params,
            record,
        };
        match &mut self.batch {
            Some(batch) => batch.push(item, setting)?,
            None => {
                let mut batch = BatchMode::new(setting);
                batch.push(item, setting)?;
                self.batch = Some(batch);
            }
        }
        Ok(())
    }

    /// The batch state, if batch mode is active.
    #[must_use]
    pub fn batch(&self) -> Option<&BatchMode> {
        self.batch.as_ref()
    }

    /// Leave batch mode and drop all aggregated commands.
    pub fn clear_batch(&mut self) {
        self.batch = None;
    }

    /// Reset the command to a reusable detached-equivalent state: encryption
    /// scratch state and the async slot are cleared. Infallible.
    pub fn dispose(&mut self) {
        self.workspace.reset();
        self.async_slot = None;
        self.parameters.clear_ciphers();
    }

    /// Whether text or parameter shape changed since the last execution.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.parameters.is_dirty()
    }

    /// Provider-specific attestation data captured during the last
    /// describe round trip.
    #[must_use]
    pub fn enclave_custom_data(&self) -> Option<&Bytes> {
        self.workspace.custom_data.as_ref()
    }

    pub(crate) fn ensure_quiescent(&self) -> Result<()> {
        if self.async_slot.is_some() {
            return Err(Error::AsyncInProgress);
        }
        Ok(())
    }

    pub(crate) fn connection_generations(&self) -> (u64, u64) {
        self.connection
            .as_ref()
            .map_or((0, 0), |c| (c.close_count(), c.reconnect_count()))
    }

    /// Resolve the effective encryption setting against a connection.
    pub(crate) fn effective_encryption_enabled(&self, connection: &Arc<dyn Connection>) -> bool {
        match self.column_encryption_setting {
            ColumnEncryptionSetting::UseConnectionDefault => {
                connection.is_column_encryption_enabled()
            }
            ColumnEncryptionSetting::Enabled => true,
            ColumnEncryptionSetting::Disabled | ColumnEncryptionSetting::ResultSetOnly => false,
        }
    }

    /// Pre-execution validation shared by every entry point.
    pub(crate) fn validate_for_execute(&self) -> Result<Arc<dyn Connection>> {
        self.ensure_quiescent()?;
        let connection = self.connection.clone().ok_or(Error::NoConnection)?;

        if self.text.trim().is_empty() {
            return Err(match self.kind {
                CommandKind::StoredProcedure => {
                    Error::InvalidArgument("no stored procedure name was set".to_string())
                }
                CommandKind::TextBatch => {
                    Error::InvalidArgument("the command text is empty".to_string())
                }
            });
        }

        if let Some(weak) = &self.transaction {
            if weak.upgrade().is_none() {
                return Err(Error::TransactionMismatch(
                    "the command's transaction has already completed".to_string(),
                ));
            }
        }

        if self.effective_encryption_enabled(&connection)
            && !connection.supports_column_encryption()
        {
            return Err(Error::TceNotSupported);
        }

        Ok(connection)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("text", &self.text)
            .field("kind", &self.kind)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("parameters", &self.parameters.len())
            .field("prepare", &self.prepare)
            .field("dirty", &self.is_dirty())
            .field("async_in_flight", &self.async_slot.is_some())
            .field("batch", &self.batch.as_ref().map(BatchMode::len))
            .finish()
    }
}
