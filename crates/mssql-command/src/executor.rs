//! The execution driver.
//!
//! Every entry point — scalar, non-query, reader, XML, sync or async —
//! converges here. The driver consults the prepare/execute state machine,
//! runs the parameter encryption flow when enabled, picks the RPC shape,
//! writes through the wire parser and drains the response, binding output
//! parameters as their tokens arrive.
//!
//! The command's mutable state (parameters, prepare state, batch items,
//! encryption scratch) moves into an [`ExecutionContext`] for the duration
//! of the operation and is handed back when it completes, so an
//! asynchronous execution can run on its own task while the command object
//! stays untouched — and unmutable — until the matching end method.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mssql_crypto::{CellCipher, CipherKeyEntry, CryptoError, EnclaveProvider, KeyStoreRegistry};
use tds_rpc::{ParamOptions, RpcRecord, SqlValue, param_list_signature};

use crate::batch::{BatchItem, BatchMode};
use crate::cancel::CancelState;
use crate::command::{
    ColumnEncryptionSetting, Command, CommandBehavior, CommandKind, EncryptionWorkspace,
};
use crate::completion::{
    AsyncSlot, CompletionSource, END_EXECUTE_NON_QUERY, END_EXECUTE_READER, END_EXECUTE_SCALAR,
    END_EXECUTE_XML_READER, ExecPayload, ExecutionResult, RestoredState,
};
use crate::connection::Connection;
use crate::encryption;
use crate::error::{Error, Result};
use crate::guards::{AsyncCountGuard, SessionGuard};
use crate::metadata_cache::{CacheKey, global_query_metadata_cache};
use crate::output;
use crate::parameter::{ParamDirection, ParameterCollection};
use crate::parser::{RunBehavior, ServerFault, TokenEvent, WireParser, WireSession};
use crate::prepare::PrepareState;
use crate::reader::{CommandReader, ReaderOutcome};

/// What the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecMode {
    NonQuery,
    Scalar,
    Reader,
    Xml,
}

/// The RPC shape chosen for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    RawBatch,
    ExecuteSql,
    PrepExec,
    Execute,
    Proc,
}

/// Result of the read phase.
enum ReadResult {
    Complete(ExecPayload),
    ReaderPending { columns: Vec<String>, exhausted: bool },
}

/// Owned execution state for one operation.
pub(crate) struct ExecutionContext {
    pub(crate) text: String,
    pub(crate) kind: CommandKind,
    pub(crate) timeout_seconds: u32,
    pub(crate) behavior: CommandBehavior,
    pub(crate) setting: ColumnEncryptionSetting,
    pub(crate) params: ParameterCollection,
    pub(crate) prepare: PrepareState,
    pub(crate) batch: Option<BatchMode>,
    pub(crate) workspace: EncryptionWorkspace,
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) parser: Arc<dyn WireParser>,
    pub(crate) cancel: Arc<CancelState>,
    pub(crate) custom_key_stores: Option<Arc<KeyStoreRegistry>>,
    pub(crate) enclave_provider: Option<Arc<dyn EnclaveProvider>>,
    pub(crate) mode: ExecMode,
    pub(crate) started: Instant,
    pub(crate) cache_used: bool,
    pub(crate) in_prepare: bool,
}

impl Command {
    /// Execute and return the rows-affected count.
    ///
    /// # Errors
    ///
    /// See the crate error taxonomy; validation errors surface before any
    /// network write.
    pub async fn execute_non_query(&mut self) -> Result<u64> {
        let ctx = self.begin_core(ExecMode::NonQuery, CommandBehavior::default())?;
        match self.apply_result(ctx.drive().await)? {
            ExecPayload::Rows(n) => Ok(n),
            _ => Err(Error::Fatal("execution produced an unexpected payload".into())),
        }
    }

    /// Execute and return the first column of the first row, if any.
    ///
    /// # Errors
    ///
    /// See the crate error taxonomy.
    pub async fn execute_scalar(&mut self) -> Result<Option<SqlValue>> {
        let ctx = self.begin_core(ExecMode::Scalar, CommandBehavior::default())?;
        match self.apply_result(ctx.drive().await)? {
            ExecPayload::Scalar(v) => Ok(v),
            _ => Err(Error::Fatal("execution produced an unexpected payload".into())),
        }
    }

    /// Execute and install a streaming reader over the result set.
    ///
    /// # Errors
    ///
    /// See the crate error taxonomy.
    pub async fn execute_reader(&mut self) -> Result<CommandReader> {
        self.execute_reader_with_behavior(CommandBehavior::default())
            .await
    }

    /// Execute with explicit behavior flags and install a reader.
    ///
    /// `SCHEMA_ONLY` and `KEY_INFO` wrap stored procedure invocations in
    /// the matching `SET` options; the reset is issued when the reader
    /// closes.
    ///
    /// # Errors
    ///
    /// See the crate error taxonomy.
    pub async fn execute_reader_with_behavior(
        &mut self,
        behavior: CommandBehavior,
    ) -> Result<CommandReader> {
        let ctx = self.begin_core(ExecMode::Reader, behavior)?;
        match self.apply_result(ctx.drive().await)? {
            ExecPayload::Reader(reader) => Ok(reader),
            _ => Err(Error::Fatal("execution produced an unexpected payload".into())),
        }
    }

    /// Execute and materialize the response's XML document.
    ///
    /// # Errors
    ///
    /// See the crate error taxonomy.
    pub async fn execute_xml_reader(&mut self) -> Result<String> {
        let ctx = self.begin_core(ExecMode::Xml, CommandBehavior::default())?;
        match self.apply_result(ctx.drive().await)? {
            ExecPayload::Xml(doc) => Ok(doc),
            _ => Err(Error::Fatal("execution produced an unexpected payload".into())),
        }
    }

    /// Start an asynchronous non-query execution.
    ///
    /// # Errors
    ///
    /// Validation errors surface here; execution errors surface from the
    /// matching end method.
    pub fn begin_execute_non_query(&mut self) -> Result<()> {
        self.begin_async(ExecMode::NonQuery, CommandBehavior::default(), END_EXECUTE_NON_QUERY)
    }

    /// Complete an asynchronous non-query execution.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::MismatchedEndMethod`] when paired with a
    /// different begin, and otherwise surfaces the execution's result.
    pub async fn end_execute_non_query(&mut self) -> Result<u64> {
        match self.end_core(END_EXECUTE_NON_QUERY).await? {
            ExecPayload::Rows(n) => Ok(n),
            _ => Err(Error::Fatal("execution produced an unexpected payload".into())),
        }
    }

    /// Start an asynchronous scalar execution.
    ///
    /// # Errors
    ///
    /// Validation errors surface here.
    pub fn begin_execute_scalar(&mut self) -> Result<()> {
        self.begin_async(ExecMode::Scalar, CommandBehavior::default(), END_EXECUTE_SCALAR)
    }

    /// Complete an asynchronous scalar execution.
    ///
    /// # Errors
    ///
    /// See [`Command::end_execute_non_query`].
    pub async fn end_execute_scalar(&mut self) -> Result<Option<SqlValue>> {
        match self.end_core(END_EXECUTE_SCALAR).await? {
            ExecPayload::Scalar(v) => Ok(v),
            _ => Err(Error::Fatal("execution produced an unexpected payload".into())),
        }
    }

    /// Start an asynchronous reader execution.
    ///
    /// # Errors
    ///
    /// Validation errors surface here.
    pub fn begin_execute_reader(&mut self, behavior: CommandBehavior) -> Result<()> {
        self.begin_async(ExecMode::Reader, behavior, END_EXECUTE_READER)
    }

    /// Complete an asynchronous reader execution.
    ///
    /// # Errors
    ///
    /// See [`Command::end_execute_non_query`].
    pub async fn end_execute_reader(&mut self) -> Result<CommandReader> {
        match self.end_core(END_EXECUTE_READER).await? {
            ExecPayload::Reader(reader) => Ok(reader),
            _ => Err(Error::Fatal("execution produced an unexpected payload".into())),
        }
    }

    /// Start an asynchronous XML execution.
    ///
    /// # Errors
    ///
    /// Validation errors surface here.
    pub fn begin_execute_xml_reader(&mut self) -> Result<()> {
        self.begin_async(ExecMode::Xml, CommandBehavior::default(), END_EXECUTE_XML_READER)
    }

    /// Complete an asynchronous XML execution.
    ///
    /// # Errors
    ///
    /// See [`Command::end_execute_non_query`].
    pub async fn end_execute_xml_reader(&mut self) -> Result<String> {
        match self.end_core(END_EXECUTE_XML_READER).await? {
            ExecPayload::Xml(doc) => Ok(doc),
            _ => Err(Error::Fatal("execution produced an unexpected payload".into())),
        }
    }

    /// Bind the trailing tokens a closed reader collected: output
    /// parameters, return status and a captured prepared handle.
    ///
    /// # Errors
    ///
    /// Surfaces decryption failures for encrypted output parameters.
    pub fn bind_reader_outcome(&mut self, outcome: &ReaderOutcome) -> Result<()> {
        if let Some(handle) = outcome.prepared_handle {
            let (close, reconnect) = self.connection_generations();
            self.prepare.complete(handle, close, reconnect);
        }
        let connection = self.connection().cloned();
        let mut prepare = self.prepare;
        let mut in_prepare = false;
        for rv in &outcome.return_values {
            output::bind_return_value(
                &mut self.parameters,
                &mut prepare,
                &mut in_prepare,
                rv,
                0,
                0,
                connection.as_ref(),
            )?;
        }
        self.prepare = prepare;
        if let Some(status) = outcome.return_status {
            output::bind_return_status(&mut self.parameters, status);
            if let Some((key, entry)) = self.workspace.pending_cache_insert.take() {
                global_query_metadata_cache().add(key, entry);
            }
        }
        Ok(())
    }

    fn begin_async(
        &mut self,
        mode: ExecMode,
        behavior: CommandBehavior,
        end_method: &'static str,
    ) -> Result<()> {
        let ctx = self.begin_core(mode, behavior)?;
        let close_count_at_begin = ctx.connection.close_count();
        let (mut source, receiver) = CompletionSource::new();
        tokio::spawn(async move {
            let result = ctx.drive().await;
            source.complete(result);
        });
        self.async_slot = Some(AsyncSlot {
            receiver,
            end_method,
            close_count_at_begin,
        });
        Ok(())
    }

    async fn end_core(&mut self, method: &'static str) -> Result<ExecPayload> {
        let slot = self.async_slot.take().ok_or(Error::NoAsyncOperation)?;
        if slot.end_method != method {
            let expected = slot.end_method;
            self.async_slot = Some(slot);
            return Err(Error::MismatchedEndMethod {
                expected,
                actual: method,
            });
        }
        let close_count_at_begin = slot.close_count_at_begin;
        let result = slot
            .receiver
            .await
            .map_err(|_| Error::Fatal("the execution task terminated abnormally".into()))?;
        if let Some(connection) = self.connection() {
            if connection.close_count() != close_count_at_begin {
                tracing::warn!("connection close generation advanced while the operation ran");
            }
        }
        self.apply_result(result)
    }

    /// Shared begin path: validation, the entry cancellation check, dirty
    /// demotion, and the state snapshot.
    fn begin_core(&mut self, mode: ExecMode, behavior: CommandBehavior) -> Result<ExecutionContext> {
        let connection = self.validate_for_execute()?;

        // A cancel that arrived before this execution fails it before any
        // network traffic; taking the flag re-arms the command.
        if self.cancel.take_pending() {
            return Err(Error::Cancelled);
        }

        let dirty = self.dirty || self.parameters.take_dirty();
        self.dirty = false;
        if dirty && self.prepare.is_prepared() {
            let (close, reconnect) = (connection.close_count(), connection.reconnect_count());
            self.prepare.demote(close, reconnect);
            self.hidden_prepare = true;
            tracing::debug!(state = ?self.prepare, "dirty command demoted for re-prepare");
        }

        let parser = connection.parser();
        Ok(ExecutionContext {
            text: self.text().to_string(),
            kind: self.kind(),
            timeout_seconds: self.timeout_seconds(),
            behavior,
            setting: self.column_encryption_setting(),
            params: std::mem::take(&mut self.parameters),
            prepare: self.prepare,
            batch: self.batch.take(),
            workspace: std::mem::take(&mut self.workspace),
            connection,
            parser,
            cancel: Arc::clone(&self.cancel),
            custom_key_stores: self.custom_key_stores.clone(),
            enclave_provider: self.enclave_provider.clone(),
            mode,
            started: Instant::now(),
            cache_used: false,
            in_prepare: false,
        })
    }

    fn apply_result(&mut self, result: ExecutionResult) -> Result<ExecPayload> {
        self.parameters = result.state.params;
        self.prepare = result.state.prepare;
        self.batch = result.state.batch;
        self.workspace = result.state.workspace;
        self.hidden_prepare = false;
        result.payload
    }
}

impl ExecutionContext {
    /// Run the operation to completion and package the state hand-back.
    pub(crate) async fn drive(mut self) -> ExecutionResult {
        let payload = self.run().await;
        let Self {
            params,
            prepare,
            batch,
            workspace,
            ..
        } = self;
        ExecutionResult {
            state: RestoredState {
                params,
                prepare,
                batch,
                workspace,
            },
            payload,
        }
    }

    /// The retry loop: at most one re-entry, and only for the classified
    /// stale-encryption conditions, with cache and enclave state
    /// invalidated first.
    async fn run(&mut self) -> Result<ExecPayload> {
        let _count_guard = AsyncCountGuard::new(&self.connection);

        let mut attempt = 0u32;
        loop {
            self.cache_used = false;
            match self.attempt_once(attempt > 0).await {
                Ok(payload) => return Ok(payload),
                Err(error) => {
                    let enclave_mode = self.workspace.requires_enclave
                        || self.workspace.attestation_params.is_some();
                    if error.is_encryption_retryable(self.cache_used, enclave_mode) {
                        self.invalidate_encryption_state();
                        if attempt == 0 {
                            tracing::debug!(%error, "stale encryption state; retrying once");
                            attempt += 1;
                            continue;
                        }
                    }
                    return Err(error);
                }
            }
        }
    }

    async fn attempt_once(&mut self, is_retry: bool) -> Result<ExecPayload> {
        self.await_reconnect().await?;

        let enabled = self.encryption_enabled();
        if enabled && self.batch.is_none() && (!self.params.is_empty() || self.enclave_workflow()) {
            // The describe flow borrows and returns the session on its own;
            // the real execution acquires it again below.
            let guard = SessionGuard::acquire(&self.connection, &self.cancel)?;
            let session = Arc::clone(guard.session());
            let fetched = encryption::fetch_parameter_encryption_metadata(self, &session, is_retry)
                .await;
            drop(guard);
            self.cache_used = fetched?;
        }

        if self.batch.is_some() {
            return self.run_batch(is_retry, enabled).await;
        }

        self.prepare_enclave_package()?;

        let mut guard = SessionGuard::acquire(&self.connection, &self.cancel)?;
        let session = Arc::clone(guard.session());
        let read = self.write_and_read(&session).await;
        match read {
            Ok(ReadResult::Complete(payload)) => Ok(payload),
            Ok(ReadResult::ReaderPending { columns, exhausted }) => {
                let reader = CommandReader::new(
                    Arc::clone(&self.parser),
                    guard,
                    columns,
                    self.reset_options_text(),
                    self.timeout_seconds,
                    self.in_prepare,
                    exhausted,
                );
                Ok(ExecPayload::Reader(reader))
            }
            Err(error) => {
                if error.dooms_connection() {
                    guard.doom();
                }
                Err(error)
            }
        }
    }

    /// Wait out an in-progress transparent reconnect, bounded by the
    /// remaining command timeout and interruptible by cancel.
    async fn await_reconnect(&mut self) -> Result<()> {
        let Some(reconnect) = self.connection.validate_and_reconnect() else {
            return Ok(());
        };
        tracing::debug!("waiting for reconnect before writing");
        let remaining = self.remaining_timeout();
        let cancel = Arc::clone(&self.cancel);
        let bounded = async move {
            match remaining {
                Some(limit) => match tokio::time::timeout(limit, reconnect).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::ReconnectTimeout),
                },
                None => reconnect.await,
            }
        };
        tokio::select! {
            () = cancel.cancelled() => {
                cancel.take_pending();
                Err(Error::Cancelled)
            }
            result = bounded => result,
        }
    }

    fn remaining_timeout(&self) -> Option<Duration> {
        if self.timeout_seconds == 0 {
            return None;
        }
        let total = Duration::from_secs(u64::from(self.timeout_seconds));
        Some(total.saturating_sub(self.started.elapsed()))
    }

    /// How far the read phase runs: readers hand control back at the first
    /// result set, everything else drains the response.
    fn run_behavior(&self) -> RunBehavior {
        match self.mode {
            ExecMode::Reader => RunBehavior::ReturnImmediately,
            ExecMode::NonQuery | ExecMode::Scalar | ExecMode::Xml => RunBehavior::UntilDone,
        }
    }

    pub(crate) fn encryption_enabled(&self) -> bool {
        match self.setting {
            ColumnEncryptionSetting::UseConnectionDefault => {
                self.connection.is_column_encryption_enabled()
            }
            ColumnEncryptionSetting::Enabled => true,
            ColumnEncryptionSetting::Disabled | ColumnEncryptionSetting::ResultSetOnly => false,
        }
    }

    fn enclave_workflow(&self) -> bool {
        self.encryption_enabled() && self.connection.enclave_attestation_url().is_some()
    }

    pub(crate) fn fingerprint(&self) -> CacheKey {
        CacheKey::compute(
            &self.text,
            self.setting,
            &self.connection.database(),
            &self.connection.data_source(),
            &self.params,
        )
    }

    fn invalidate_encryption_state(&mut self) {
        global_query_metadata_cache().invalidate(self.fingerprint());
        if let Some(url) = self.connection.enclave_attestation_url() {
            if let Some(session) = encryption::enclave_session_cache().invalidate(&url) {
                if let Some(provider) = &self.enclave_provider {
                    provider.invalidate_session(&url, &session);
                }
            }
        }
        self.params.clear_ciphers();
        self.workspace.reset();
    }

    fn choose_shape(&self) -> Shape {
        if self.kind == CommandKind::StoredProcedure {
            return Shape::Proc;
        }
        if self.params.is_empty() && !self.enclave_workflow() {
            return Shape::RawBatch;
        }
        match self.prepare {
            PrepareState::Prepared { .. } => Shape::Execute,
            PrepareState::PreparePending { .. } => Shape::PrepExec,
            PrepareState::Unprepared => Shape::ExecuteSql,
        }
    }

    fn set_options_text(&self) -> Option<String> {
        if self.kind != CommandKind::StoredProcedure {
            return None;
        }
        let mut text = String::new();
        if self.behavior.contains(CommandBehavior::KEY_INFO) {
            text.push_str(" SET NO_BROWSETABLE ON;");
        }
        if self.behavior.contains(CommandBehavior::SCHEMA_ONLY) {
            text.push_str(" SET FMTONLY ON;");
        }
        (!text.is_empty()).then_some(text)
    }

    fn reset_options_text(&self) -> Option<String> {
        if self.kind != CommandKind::StoredProcedure {
            return None;
        }
        let mut text = String::new();
        if self.behavior.contains(CommandBehavior::KEY_INFO) {
            text.push_str(" SET NO_BROWSETABLE OFF;");
        }
        if self.behavior.contains(CommandBehavior::SCHEMA_ONLY) {
            text.push_str(" SET FMTONLY OFF;");
        }
        (!text.is_empty()).then_some(text)
    }

    fn prepare_enclave_package(&mut self) -> Result<()> {
        if !self.workspace.requires_enclave || self.workspace.keys_for_enclave.is_empty() {
            return Ok(());
        }
        let url = self
            .connection
            .enclave_attestation_url()
            .ok_or(Error::AttestationUrlMissing)?;
        let provider = self.enclave_provider.as_ref().ok_or_else(|| {
            Error::InvalidArgument("no enclave provider is registered".to_string())
        })?;
        let session = encryption::enclave_session_cache()
            .get(&url)
            .ok_or(Error::Crypto(CryptoError::EnclaveSessionMissing))?;
        let keys: Vec<Arc<CipherKeyEntry>> =
            self.workspace.keys_for_enclave.values().cloned().collect();
        let package = provider.generate_enclave_package(&keys, &self.text, &session)?;
        tracing::debug!(keys = keys.len(), "generated enclave package");
        self.workspace.enclave_package = Some(package);
        Ok(())
    }

    async fn write_and_read(&mut self, session: &Arc<dyn WireSession>) -> Result<ReadResult> {
        let shape = self.choose_shape();
        tracing::debug!(?shape, mode = ?self.mode, "executing");

        if let Some(preamble) = self.set_options_text() {
            self.parser
                .execute_batch(&preamble, self.timeout_seconds, session, None)
                .await?;
            drain_simple(&self.parser, session).await?;
        }

        self.in_prepare = shape == Shape::PrepExec;
        let package = self
            .workspace
            .enclave_package
            .take()
            .map(|p| p.payload);

        match shape {
            Shape::RawBatch => {
                self.parser
                    .execute_batch(&self.text, self.timeout_seconds, session, package)
                    .await?;
            }
            _ => {
                let record = self.build_record(shape)?;
                self.parser
                    .execute_rpc(
                        std::slice::from_ref(&record),
                        &self.params,
                        self.timeout_seconds,
                        self.behavior.contains(CommandBehavior::SCHEMA_ONLY),
                        session,
                        shape == Shape::Proc,
                        package,
                    )
                    .await?;
            }
        }

        self.read_response(session).await
    }

    fn build_record(&mut self, shape: Shape) -> Result<RpcRecord> {
        let signature = (!self.params.is_empty())
            .then(|| param_list_signature(&self.params.shapes()));
        let mut record = match shape {
            Shape::ExecuteSql => RpcRecord::execute_sql(self.text.clone(), signature),
            Shape::PrepExec => {
                RpcRecord::prep_exec(self.prepare.reusable_handle(), signature, self.text.clone())
            }
            Shape::Execute => {
                let handle = self.prepare.handle().ok_or_else(|| {
                    Error::Fatal("execute shape chosen without a prepared handle".into())
                })?;
                RpcRecord::execute(handle)
            }
            Shape::Proc => RpcRecord::by_name(self.text.clone())?,
            Shape::RawBatch => {
                return Err(Error::Fatal("raw batches do not build RPC records".into()));
            }
        };
        marshal_user_params(&mut record, &mut self.params)?;
        Ok(record)
    }

    async fn read_response(&mut self, session: &Arc<dyn WireSession>) -> Result<ReadResult> {
        let diagnostics = session.diagnostics();
        let (close, reconnect) = (
            self.connection.close_count(),
            self.connection.reconnect_count(),
        );
        let mut rows_affected = 0u64;
        let mut scalar: Option<SqlValue> = None;
        let mut saw_row = false;
        let mut xml = String::new();
        let mut fault: Option<ServerFault> = None;
        let mut attention = false;

        loop {
            let Some(event) = self.parser.next_token(session).await? else {
                break;
            };
            match event {
                TokenEvent::ResultSetStart { columns } => {
                    if self.run_behavior() == RunBehavior::ReturnImmediately && fault.is_none() {
                        return Ok(ReadResult::ReaderPending {
                            columns,
                            exhausted: false,
                        });
                    }
                }
                TokenEvent::Row(cells) => match self.mode {
                    ExecMode::Scalar => {
                        if !saw_row {
                            saw_row = true;
                            scalar = cells.into_iter().next();
                        }
                    }
                    ExecMode::Xml => {
                        if let Some(cell) = cells.first() {
                            if let Some(text) = cell.as_str() {
                                xml.push_str(text);
                            }
                        }
                    }
                    ExecMode::NonQuery | ExecMode::Reader => {}
                },
                TokenEvent::ReturnValue(rv) => {
                    output::bind_return_value(
                        &mut self.params,
                        &mut self.prepare,
                        &mut self.in_prepare,
                        &rv,
                        close,
                        reconnect,
                        Some(&self.connection),
                    )?;
                }
                TokenEvent::ReturnStatus(status) => {
                    output::bind_return_status(&mut self.params, status);
                    if let Some((key, entry)) = self.workspace.pending_cache_insert.take() {
                        global_query_metadata_cache().add(key, entry);
                    }
                }
                TokenEvent::DoneInProc { rows_affected: n, .. }
                | TokenEvent::DoneProc { rows_affected: n, .. } => rows_affected += n,
                TokenEvent::Done {
                    rows_affected: n,
                    more,
                    attention_ack,
                    ..
                } => {
                    rows_affected += n;
                    if attention_ack {
                        attention = true;
                    }
                    if !more {
                        break;
                    }
                }
                TokenEvent::ServerError(f) => {
                    diagnostics.push_error(f.clone());
                    if fault.is_none() {
                        fault = Some(f);
                    }
                }
                TokenEvent::Warning(f) => diagnostics.push_warning(f),
            }
        }

        if attention {
            return Err(Error::Cancelled);
        }
        if let Some(fault) = fault {
            return Err(fault.into());
        }

        Ok(match self.mode {
            ExecMode::NonQuery => ReadResult::Complete(ExecPayload::Rows(rows_affected)),
            ExecMode::Scalar => ReadResult::Complete(ExecPayload::Scalar(scalar)),
            ExecMode::Xml => ReadResult::Complete(ExecPayload::Xml(xml)),
            // No result set arrived; install an already-drained reader.
            ExecMode::Reader => ReadResult::ReaderPending {
                columns: Vec::new(),
                exhausted: true,
            },
        })
    }

    async fn run_batch(&mut self, is_retry: bool, enabled: bool) -> Result<ExecPayload> {
        let Some(mut batch) = self.batch.take() else {
            return Err(Error::Fatal("batch state missing".into()));
        };
        let result = self.run_batch_inner(&mut batch, is_retry, enabled).await;
        self.batch = Some(batch);
        result
    }

    async fn run_batch_inner(
        &mut self,
        batch: &mut BatchMode,
        is_retry: bool,
        enabled: bool,
    ) -> Result<ExecPayload> {
        let mut cumulative = 0u64;
        for index in 0..batch.items().len() {
            batch.set_current(index);

            if enabled {
                let guard = SessionGuard::acquire(&self.connection, &self.cancel)?;
                let session = Arc::clone(guard.session());
                let described = encryption::describe_batch_item(
                    self,
                    &mut batch.items_mut()[index],
                    &session,
                    is_retry,
                )
                .await;
                drop(guard);
                described?;
            }

            if batch.items()[index]
                .record
                .needs_fetch_parameter_encryption_metadata
            {
                return Err(Error::ProcEncryptionMetadataMissing);
            }

            let mut guard = SessionGuard::acquire(&self.connection, &self.cancel)?;
            let session = Arc::clone(guard.session());
            let diagnostics = session.diagnostics();
            batch.set_diagnostics(Arc::clone(&diagnostics));

            let item = &mut batch.items_mut()[index];
            item.record.errors_start = diagnostics.error_count();
            item.record.warnings_start = diagnostics.warning_count();

            let roundtrip = batch_item_roundtrip(
                &self.parser,
                &session,
                item,
                self.timeout_seconds,
                &self.connection,
            )
            .await;

            item.record.errors_end = diagnostics.error_count();
            item.record.warnings_end = diagnostics.warning_count();

            match roundtrip {
                Ok(rows) => {
                    item.record.rows_affected = rows;
                    cumulative += rows;
                    item.record.cumulative_rows_affected = cumulative;
                }
                Err(error) => {
                    if error.dooms_connection() {
                        guard.doom();
                    }
                    return Err(error);
                }
            }
        }
        Ok(ExecPayload::Rows(cumulative))
    }
}

/// Record per-parameter option bits and encrypt eligible input values.
pub(crate) fn marshal_user_params(
    record: &mut RpcRecord,
    params: &mut ParameterCollection,
) -> Result<()> {
    record.set_user_params(params.len());
    for (index, param) in params.iter_mut_internal().enumerate() {
        let mut options = ParamOptions::empty();
        if param.direction().is_output_bound() {
            options |= ParamOptions::BY_REF;
        }
        if param.value().is_null() && param.direction() == ParamDirection::Input {
            options |= ParamOptions::DEFAULT;
        }
        if param.is_encrypted() {
            options |= ParamOptions::ENCRYPTED;
            let metadata = param.cipher().cloned().ok_or_else(|| {
                Error::Fatal("encrypted parameter lost its cipher metadata".into())
            })?;
            metadata.require_supported_algorithm()?;
            let key = metadata.key.decrypted().ok_or_else(|| {
                Error::Crypto(CryptoError::KeyDecryptionFailed(
                    "column encryption key is not decrypted".to_string(),
                ))
            })?;
            let ciphertext = CellCipher::new(&key)?.encrypt(
                &param.value().normalized_bytes(),
                metadata.encryption_type,
            )?;
            param.set_encrypted_value(Bytes::from(ciphertext));
        }
        record.set_user_param_options(index, options);
    }
    Ok(())
}

/// One batch item: write its RPC, drain its response, bind its outputs.
async fn batch_item_roundtrip(
    parser: &Arc<dyn WireParser>,
    session: &Arc<dyn WireSession>,
    item: &mut BatchItem,
    timeout_seconds: u32,
    connection: &Arc<dyn Connection>,
) -> Result<u64> {
    marshal_user_params(&mut item.record, &mut item.params)?;
    parser
        .execute_rpc(
            std::slice::from_ref(&item.record),
            &item.params,
            timeout_seconds,
            false,
            session,
            item.kind == CommandKind::StoredProcedure,
            None,
        )
        .await?;

    let diagnostics = session.diagnostics();
    let mut rows_affected = 0u64;
    let mut fault: Option<ServerFault> = None;
    let mut attention = false;
    let mut prepare = PrepareState::Unprepared;
    let mut in_prepare = false;

    loop {
        let Some(event) = parser.next_token(session).await? else {
            break;
        };
        match event {
            TokenEvent::ReturnValue(rv) => {
                output::bind_return_value(
                    &mut item.params,
                    &mut prepare,
                    &mut in_prepare,
                    &rv,
                    0,
                    0,
                    Some(connection),
                )?;
            }
            TokenEvent::ReturnStatus(status) => output::bind_return_status(&mut item.params, status),
            TokenEvent::DoneInProc { rows_affected: n, .. }
            | TokenEvent::DoneProc { rows_affected: n, .. } => rows_affected += n,
            TokenEvent::Done {
                rows_affected: n,
                more,
                attention_ack,
                ..
            } => {
                rows_affected += n;
                if attention_ack {
                    attention = true;
                }
                if !more {
                    break;
                }
            }
            TokenEvent::ServerError(f) => {
                diagnostics.push_error(f.clone());
                if fault.is_none() {
                    fault = Some(f);
                }
            }
            TokenEvent::Warning(f) => diagnostics.push_warning(f),
            TokenEvent::ResultSetStart { .. } | TokenEvent::Row(_) => {}
        }
    }

    if attention {
        return Err(Error::Cancelled);
    }
    if let Some(fault) = fault {
        return Err(fault.into());
    }
    Ok(rows_affected)
}

/// Drain a trivial response (preambles, resets).
async fn drain_simple(
    parser: &Arc<dyn WireParser>,
    session: &Arc<dyn WireSession>,
) -> Result<()> {
    loop {
        match parser.next_token(session).await? {
            None | Some(TokenEvent::Done { more: false, .. }) => return Ok(()),
            Some(_) => {}
        }
    }
}
