//! Scripted wire doubles for integration tests.
//!
//! The mock parser records every write and replays canned token scripts,
//! one script per write, so a test can assert the exact wire conversation a
//! command produced without a server.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use mssql_command::connection::ReconnectFuture;
use mssql_command::{
    AttestationParams, Command, CommandKind, Connection, EnclavePackage, EnclaveProvider,
    EnclaveSession, KeyStoreProvider, KeyStoreRegistry, ParameterCollection, Result, ServerFault,
    SessionDiagnostics, SqlParameter, TokenEvent, WireParser, WireSession,
};
use mssql_crypto::{CipherKeyEntry, CryptoError};
use parking_lot::Mutex;
use tds_rpc::{ParamOptions, RpcRecord, SqlValue, TdsType};
use tokio::sync::oneshot;

/// Pad used by the XOR key store double.
pub const KEY_PAD: u8 = 0x5A;

/// One recorded write.
#[derive(Debug, Clone)]
pub enum Write {
    /// A raw SQL batch.
    Batch {
        text: String,
        with_enclave_package: bool,
    },
    /// An RPC invocation.
    Rpc {
        proc: String,
        system_values: Vec<SqlValue>,
        user_param_count: usize,
        encrypted: Vec<bool>,
        is_proc: bool,
        with_enclave_package: bool,
    },
}

impl Write {
    pub fn proc_name(&self) -> &str {
        match self {
            Write::Batch { .. } => "",
            Write::Rpc { proc, .. } => proc,
        }
    }

    pub fn system_value(&self, index: usize) -> Option<&SqlValue> {
        match self {
            Write::Batch { .. } => None,
            Write::Rpc { system_values, .. } => system_values.get(index),
        }
    }
}

#[derive(Default)]
pub struct MockSession {
    broken: AtomicBool,
    pub attentions: AtomicUsize,
    diagnostics: Arc<SessionDiagnostics>,
}

impl WireSession for MockSession {
    fn send_attention(&self) -> Result<()> {
        self.attentions.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    fn diagnostics(&self) -> Arc<SessionDiagnostics> {
        Arc::clone(&self.diagnostics)
    }
}

/// Scripted parser: every write consumes the next script off the queue.
#[derive(Default)]
pub struct MockParser {
    writes: Mutex<Vec<Write>>,
    scripts: Mutex<VecDeque<Vec<TokenEvent>>>,
    current: Mutex<VecDeque<TokenEvent>>,
}

impl MockParser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the response for the next write.
    pub fn push_script(&self, events: Vec<TokenEvent>) {
        self.scripts.lock().push_back(events);
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    fn begin_response(&self) {
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| vec![done(0)]);
        *self.current.lock() = script.into();
    }
}

#[async_trait::async_trait]
impl WireParser for MockParser {
    async fn execute_batch(
        &self,
        text: &str,
        _timeout_seconds: u32,
        _session: &Arc<dyn WireSession>,
        enclave_package: Option<Bytes>,
    ) -> Result<()> {
        self.writes.lock().push(Write::Batch {
            text: text.to_string(),
            with_enclave_package: enclave_package.is_some(),
        });
        self.begin_response();
        Ok(())
    }

    async fn execute_rpc(
        &self,
        records: &[RpcRecord],
        params: &ParameterCollection,
        _timeout_seconds: u32,
        _in_schema: bool,
        _session: &Arc<dyn WireSession>,
        is_proc: bool,
        enclave_package: Option<Bytes>,
    ) -> Result<()> {
        for record in records {
            let encrypted = (0..record.user_param_count)
                .map(|i| {
                    record
                        .user_param_options_at(i)
                        .contains(ParamOptions::ENCRYPTED)
                })
                .collect();
            self.writes.lock().push(Write::Rpc {
                proc: record.proc_label().to_string(),
                system_values: record.system_params.iter().map(|p| p.value.clone()).collect(),
                user_param_count: params.len(),
                encrypted,
                is_proc,
                with_enclave_package: enclave_package.is_some(),
            });
        }
        self.begin_response();
        Ok(())
    }

    async fn next_token(&self, _session: &Arc<dyn WireSession>) -> Result<Option<TokenEvent>> {
        Ok(self.current.lock().pop_front())
    }
}

/// Connection double with observable counters.
pub struct MockConnection {
    pub parser: Arc<MockParser>,
    pub session: Arc<MockSession>,
    pub async_count: AtomicI64,
    pub sessions_out: AtomicI64,
    pub close_count: AtomicU64,
    pub reconnect_count: AtomicU64,
    pub doomed: AtomicBool,
    pub encryption_enabled: bool,
    pub supports_encryption: bool,
    pub attestation_url: Option<String>,
    pub data_source: String,
    reconnect_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockConnection {
    pub fn new(data_source: &str) -> Arc<Self> {
        Arc::new(Self {
            parser: MockParser::new(),
            session: Arc::new(MockSession::default()),
            async_count: AtomicI64::new(0),
            sessions_out: AtomicI64::new(0),
            close_count: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
            doomed: AtomicBool::new(false),
            encryption_enabled: false,
            supports_encryption: true,
            attestation_url: None,
            data_source: data_source.to_string(),
            reconnect_gate: Mutex::new(None),
        })
    }

    pub fn with_encryption(data_source: &str, attestation_url: Option<&str>) -> Arc<Self> {
        let mut conn = Self::new(data_source);
        {
            let inner = Arc::get_mut(&mut conn).expect("fresh connection is unshared");
            inner.encryption_enabled = true;
            inner.attestation_url = attestation_url.map(str::to_string);
        }
        conn
    }

    /// Install a pending reconnect released by the returned sender.
    pub fn hold_reconnect(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.reconnect_gate.lock() = Some(rx);
        tx
    }

    pub fn balanced(&self) -> bool {
        self.async_count.load(Ordering::Acquire) == 0
            && self.sessions_out.load(Ordering::Acquire) == 0
    }
}

impl Connection for MockConnection {
    fn data_source(&self) -> String {
        self.data_source.clone()
    }

    fn database(&self) -> String {
        "testdb".to_string()
    }

    fn close_count(&self) -> u64 {
        self.close_count.load(Ordering::Acquire)
    }

    fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Acquire)
    }

    fn is_column_encryption_enabled(&self) -> bool {
        self.encryption_enabled
    }

    fn supports_column_encryption(&self) -> bool {
        self.supports_encryption
    }

    fn enclave_attestation_url(&self) -> Option<String> {
        self.attestation_url.clone()
    }

    fn attestation_protocol(&self) -> Option<u8> {
        self.attestation_url.as_ref().map(|_| 1)
    }

    fn validate_and_reconnect(&self) -> Option<ReconnectFuture> {
        let rx = self.reconnect_gate.lock().take()?;
        Some(Box::pin(async move {
            let _ = rx.await;
            Ok(())
        }))
    }

    fn open_session(&self) -> Result<Arc<dyn WireSession>> {
        self.sessions_out.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::clone(&self.session) as Arc<dyn WireSession>)
    }

    fn return_session(&self, _session: Arc<dyn WireSession>) {
        self.sessions_out.fetch_sub(1, Ordering::AcqRel);
    }

    fn parser(&self) -> Arc<dyn WireParser> {
        Arc::clone(&self.parser) as Arc<dyn WireParser>
    }

    fn increment_async_count(&self) {
        self.async_count.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement_async_count(&self) {
        self.async_count.fetch_sub(1, Ordering::AcqRel);
    }

    fn doom(&self) {
        self.doomed.store(true, Ordering::Release);
    }

    fn materialize_udt(&self, type_name: &str, payload: Bytes) -> SqlValue {
        // Tagged so tests can observe that the factory ran.
        SqlValue::String(format!("udt:{type_name}:{}", payload.len()))
    }
}

/// Key store double: "decrypts" by XOR with a fixed pad.
pub struct XorKeyStore {
    name: &'static str,
}

impl XorKeyStore {
    pub fn registry() -> Arc<KeyStoreRegistry> {
        let registry = KeyStoreRegistry::custom();
        registry
            .register(Arc::new(XorKeyStore {
                name: "TEST_KEY_STORE",
            }))
            .expect("test provider name is not reserved");
        Arc::new(registry)
    }
}

#[async_trait::async_trait]
impl KeyStoreProvider for XorKeyStore {
    fn provider_name(&self) -> &str {
        self.name
    }

    async fn decrypt_column_encryption_key(
        &self,
        _key_path: &str,
        _algorithm: &str,
        encrypted_key: &[u8],
    ) -> std::result::Result<Vec<u8>, CryptoError> {
        Ok(encrypted_key.iter().map(|b| b ^ KEY_PAD).collect())
    }

    async fn verify_column_master_key_signature(
        &self,
        _key_path: &str,
        _allow_enclave_computations: bool,
        _signature: &[u8],
    ) -> std::result::Result<bool, CryptoError> {
        Ok(true)
    }
}

/// Enclave collaborator double with call counters.
#[derive(Default)]
pub struct CountingEnclaveProvider {
    pub sessions_created: AtomicUsize,
    pub sessions_invalidated: AtomicUsize,
}

#[async_trait::async_trait]
impl EnclaveProvider for CountingEnclaveProvider {
    async fn get_attestation_parameters(
        &self,
        protocol: u8,
        url: &str,
    ) -> std::result::Result<AttestationParams, CryptoError> {
        Ok(AttestationParams {
            protocol,
            url: url.to_string(),
            payload: Bytes::from_static(b"client-nonce"),
        })
    }

    fn serialize_attestation_parameters(&self, params: &AttestationParams) -> Bytes {
        params.payload.clone()
    }

    async fn create_session(
        &self,
        _params: &AttestationParams,
        attestation_info: &[u8],
    ) -> std::result::Result<EnclaveSession, CryptoError> {
        let id = self.sessions_created.fetch_add(1, Ordering::AcqRel) as u64 + 1;
        let _ = attestation_info;
        Ok(EnclaveSession {
            session_id: id,
            session_key: Bytes::from_static(b"session-key"),
        })
    }

    fn invalidate_session(&self, _url: &str, _session: &EnclaveSession) {
        self.sessions_invalidated.fetch_add(1, Ordering::AcqRel);
    }

    fn generate_enclave_package(
        &self,
        _keys: &[Arc<CipherKeyEntry>],
        _text: &str,
        session: &EnclaveSession,
    ) -> std::result::Result<EnclavePackage, CryptoError> {
        Ok(EnclavePackage {
            payload: Bytes::from(session.session_id.to_le_bytes().to_vec()),
        })
    }
}

// --- token script helpers -------------------------------------------------

pub fn done(rows: u64) -> TokenEvent {
    TokenEvent::Done {
        rows_affected: rows,
        more: false,
        error: false,
        attention_ack: false,
    }
}

pub fn done_attention() -> TokenEvent {
    TokenEvent::Done {
        rows_affected: 0,
        more: false,
        error: false,
        attention_ack: true,
    }
}

pub fn server_error(number: i32) -> TokenEvent {
    TokenEvent::ServerError(ServerFault {
        number,
        class: 16,
        state: 1,
        message: format!("injected error {number}"),
        server: Some("mock".to_string()),
        procedure: None,
        line: 1,
    })
}

pub fn result_set(columns: &[&str]) -> TokenEvent {
    TokenEvent::ResultSetStart {
        columns: columns.iter().map(|c| (*c).to_string()).collect(),
    }
}

pub fn int_return_value(value: i32) -> TokenEvent {
    TokenEvent::ReturnValue(mssql_command::ReturnValueRecord {
        name: String::new(),
        ty: TdsType::Int,
        precision: 0,
        scale: 0,
        value: SqlValue::Int(value),
    })
}

/// Response for a prepare-execute returning one scalar row: the handle
/// return value, then the row.
pub fn prepexec_scalar_script(handle: i32, value: i32) -> Vec<TokenEvent> {
    vec![
        int_return_value(handle),
        result_set(&["value"]),
        TokenEvent::Row(vec![SqlValue::Int(value)]),
        done(0),
    ]
}

/// Response for an execute returning one scalar row.
pub fn scalar_script(value: i32) -> Vec<TokenEvent> {
    vec![
        result_set(&["value"]),
        TokenEvent::Row(vec![SqlValue::Int(value)]),
        done(0),
    ]
}

/// A 32-byte wrapped key whose XOR unwrap yields a valid cell key.
pub fn wrapped_key() -> Bytes {
    let material: Vec<u8> = (0u8..32).map(|b| b ^ KEY_PAD).collect();
    Bytes::from(material)
}

/// Result set 1 row: one column encryption key.
pub fn key_row(ordinal: i32, enclave: bool) -> TokenEvent {
    TokenEvent::Row(vec![
        SqlValue::Int(ordinal),
        SqlValue::Int(5),
        SqlValue::Int(1),
        SqlValue::Int(1),
        SqlValue::Binary(Bytes::from_static(&[1, 0, 0, 0, 0, 0, 0, 0])),
        SqlValue::Binary(wrapped_key()),
        SqlValue::String("TEST_KEY_STORE".to_string()),
        SqlValue::String("cmk/test".to_string()),
        SqlValue::String("RSA_OAEP".to_string()),
        SqlValue::Bit(enclave),
        if enclave {
            SqlValue::Binary(Bytes::from_static(b"signature"))
        } else {
            SqlValue::Null
        },
    ])
}

/// Result set 2 row: cipher metadata for one parameter.
pub fn param_row(name: &str, ordinal: i32) -> TokenEvent {
    TokenEvent::Row(vec![
        SqlValue::String(name.to_string()),
        SqlValue::TinyInt(2),
        SqlValue::TinyInt(1),
        SqlValue::Int(ordinal),
        SqlValue::TinyInt(1),
    ])
}

const KEY_COLUMNS: [&str; 11] = [
    "column_encryption_key_ordinal",
    "database_id",
    "column_encryption_key_id",
    "column_encryption_key_version",
    "column_encryption_key_metadata_version",
    "encrypted_column_encryption_key",
    "key_store_provider_name",
    "key_path",
    "key_encryption_algorithm",
    "is_requested_by_enclave",
    "column_master_key_signature",
];

const PARAM_COLUMNS: [&str; 5] = [
    "parameter_name",
    "column_encryption_algorithm",
    "column_encryption_type",
    "column_encryption_key_ordinal",
    "column_normalization_rule_version",
];

/// A full describe response: keys, per-parameter metadata, optional
/// attestation info.
pub fn describe_script(
    keys: Vec<TokenEvent>,
    params: Vec<TokenEvent>,
    attestation: Option<Bytes>,
) -> Vec<TokenEvent> {
    let mut events = vec![result_set(&KEY_COLUMNS)];
    events.extend(keys);
    events.push(result_set(&PARAM_COLUMNS));
    events.extend(params);
    if let Some(info) = attestation {
        events.push(result_set(&["attestation_info"]));
        events.push(TokenEvent::Row(vec![SqlValue::Binary(info)]));
    }
    events.push(done(0));
    events
}

// --- command helpers ------------------------------------------------------

pub fn text_command(conn: &Arc<MockConnection>, text: &str) -> Command {
    let mut cmd = Command::new(text, CommandKind::TextBatch);
    cmd.set_connection(Some(Arc::clone(conn) as Arc<dyn Connection>))
        .expect("fresh command accepts a connection");
    cmd
}

pub fn proc_command(conn: &Arc<MockConnection>, name: &str) -> Command {
    let mut cmd = Command::new(name, CommandKind::StoredProcedure);
    cmd.set_connection(Some(Arc::clone(conn) as Arc<dyn Connection>))
        .expect("fresh command accepts a connection");
    cmd
}

pub fn int_param(name: &str, value: i32) -> SqlParameter {
    SqlParameter::new(name, TdsType::Int).with_value(value)
}
