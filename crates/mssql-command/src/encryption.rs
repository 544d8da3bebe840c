//! The parameter encryption orchestrator.
//!
//! When column encryption is in effect, every execution is preceded by a
//! metadata phase: either a query metadata cache hit stamps the parameters
//! with their cipher descriptors, or a `sp_describe_parameter_encryption`
//! round trip fetches them. The describe response carries three result
//! sets — column encryption keys, per-parameter cipher metadata, and (when
//! an enclave participates) attestation evidence — read here off the same
//! pull-based token stream the driver uses everywhere else.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use mssql_crypto::{
    CipherKeyEntry, CipherMetadata, CryptoError, EnclaveSessionCache, EncryptedKeyValue,
    EncryptionType, KeyStoreRegistry, resolve_provider,
};
use once_cell::sync::Lazy;
use tds_rpc::{RpcRecord, SqlValue, exec_preview, param_list_signature};

use crate::batch::BatchItem;
use crate::command::CommandKind;
use crate::error::{Error, Result};
use crate::executor::ExecutionContext;
use crate::metadata_cache::{
    CachedCommandMetadata, CachedParamCipher, global_query_metadata_cache,
};
use crate::parameter::ParameterCollection;
use crate::parser::{ServerFault, TokenEvent, WireSession};

static ENCLAVE_SESSIONS: Lazy<EnclaveSessionCache> = Lazy::new(EnclaveSessionCache::new);

/// The process-wide enclave session cache, keyed by attestation URL.
pub(crate) fn enclave_session_cache() -> &'static EnclaveSessionCache {
    &ENCLAVE_SESSIONS
}

/// Run the metadata phase for a non-batch command.
///
/// Returns whether the cipher metadata came from the query metadata cache
/// (the fast path). The slow path performs the describe round trip, stamps
/// the parameters, and inserts into the cache — immediately, or deferred
/// until the return status discriminates the invocation.
pub(crate) async fn fetch_parameter_encryption_metadata(
    ctx: &mut ExecutionContext,
    session: &Arc<dyn WireSession>,
    is_retry: bool,
) -> Result<bool> {
    if !is_retry && !ctx.params.is_empty() {
        let key = ctx.fingerprint();
        let cache = global_query_metadata_cache();
        if cache.get_if_exists(key, &mut ctx.params) {
            if let Some(entry) = cache.peek_entry(key) {
                for (ordinal, key_entry) in &entry.keys_for_enclave {
                    ctx.workspace
                        .keys_for_enclave
                        .insert(*ordinal, Arc::clone(key_entry));
                }
                ctx.workspace.requires_enclave = entry.requires_enclave;
            }
            return Ok(true);
        }
    }

    let text = ctx.text.clone();
    let kind = ctx.kind;
    let mut params = std::mem::take(&mut ctx.params);
    let described = describe_core(ctx, session, &text, kind, &mut params, is_retry).await;
    ctx.params = params;
    described?;

    // Insert into the cache unless this is the post-invalidation retry or
    // the invocation still needs its return-status discrimination.
    if !is_retry {
        ctx.workspace.caching_postponed =
            kind == CommandKind::StoredProcedure && ctx.params.has_return_value();
        let entry = build_cache_entry(&ctx.params, &ctx.workspace);
        let key = ctx.fingerprint();
        if ctx.workspace.caching_postponed {
            ctx.workspace.pending_cache_insert = Some((key, entry));
        } else {
            global_query_metadata_cache().add(key, entry);
        }
    }
    Ok(false)
}

/// Run the describe round trip for one batch item. Batch items never use
/// the cache; success clears the item's fetch flag.
pub(crate) async fn describe_batch_item(
    ctx: &mut ExecutionContext,
    item: &mut BatchItem,
    session: &Arc<dyn WireSession>,
    is_retry: bool,
) -> Result<()> {
    let text = item.text.clone();
    describe_core(ctx, session, &text, item.kind, &mut item.params, is_retry).await?;
    item.record.needs_fetch_parameter_encryption_metadata = false;
    Ok(())
}

/// The describe round trip: write `sp_describe_parameter_encryption`, read
/// its three result sets, decrypt the referenced keys, stamp the
/// parameters, and (when asked) derive an enclave session.
async fn describe_core(
    ctx: &mut ExecutionContext,
    session: &Arc<dyn WireSession>,
    text: &str,
    kind: CommandKind,
    params: &mut ParameterCollection,
    is_retry: bool,
) -> Result<()> {
    let shapes = params.shapes();
    let (tsql, signature) = match kind {
        CommandKind::TextBatch => (
            text.to_string(),
            (!shapes.is_empty()).then(|| param_list_signature(&shapes)),
        ),
        CommandKind::StoredProcedure => (
            exec_preview(text, &shapes),
            Some(param_list_signature(&shapes)),
        ),
    };
    drop(shapes);

    // Attestation parameters ride along when an enclave session must be
    // (re)established.
    let mut attestation_blob: Option<Bytes> = None;
    if let (Some(url), Some(provider)) = (
        ctx.connection.enclave_attestation_url(),
        ctx.enclave_provider.as_ref(),
    ) {
        if is_retry || enclave_session_cache().get(&url).is_none() {
            let protocol = ctx.connection.attestation_protocol().unwrap_or(0);
            let attestation = provider.get_attestation_parameters(protocol, &url).await?;
            let blob = provider.serialize_attestation_parameters(&attestation);
            ctx.workspace.custom_data = Some(blob.clone());
            ctx.workspace.attestation_params = Some(attestation);
            attestation_blob = Some(blob);
        }
    }
    let attestation_sent = attestation_blob.is_some();

    let record =
        RpcRecord::describe_parameter_encryption(tsql, signature, attestation_blob)?;
    let no_user_params = ParameterCollection::new();
    ctx.parser
        .execute_rpc(
            std::slice::from_ref(&record),
            &no_user_params,
            ctx.timeout_seconds,
            false,
            session,
            true,
            None,
        )
        .await?;

    read_describe_response(ctx, session, params, attestation_sent).await?;

    if let Some(name) = params.first_missing_metadata() {
        return Err(Error::ParameterEncryptionMetadataMissing {
            parameter: name.to_string(),
        });
    }
    Ok(())
}

async fn read_describe_response(
    ctx: &mut ExecutionContext,
    session: &Arc<dyn WireSession>,
    params: &mut ParameterCollection,
    attestation_sent: bool,
) -> Result<()> {
    let diagnostics = session.diagnostics();
    let mut result_set = 0usize;
    let mut keys: BTreeMap<u16, Arc<CipherKeyEntry>> = BTreeMap::new();
    let mut attestation_info: Vec<Bytes> = Vec::new();
    let mut fault: Option<ServerFault> = None;

    loop {
        let Some(event) = ctx.parser.next_token(session).await? else {
            break;
        };
        match event {
            TokenEvent::ResultSetStart { .. } => result_set += 1,
            TokenEvent::Row(cells) => match result_set {
                1 => read_key_row(&cells, &mut keys)?,
                2 => {
                    stamp_parameter_row(
                        ctx.custom_key_stores.as_deref(),
                        params,
                        &cells,
                        &keys,
                    )
                    .await?;
                }
                3 => attestation_info.push(cell_bytes(&cells, 0)?),
                _ => {}
            },
            TokenEvent::Done { more, .. } => {
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
            _ => {}
        }
    }
    if let Some(fault) = fault {
        return Err(fault.into());
    }

    // Keys the enclave asked for must carry a verified master key
    // signature before any material is released.
    for (ordinal, key) in &keys {
        if key.is_requested_by_enclave() {
            verify_master_key_signature(ctx.custom_key_stores.as_deref(), key).await?;
            ctx.workspace
                .keys_for_enclave
                .insert(*ordinal, Arc::clone(key));
            ctx.workspace.requires_enclave = true;
        }
    }

    if ctx.workspace.requires_enclave {
        let url = ctx
            .connection
            .enclave_attestation_url()
            .ok_or(Error::AttestationUrlMissing)?;
        if attestation_sent {
            let provider = ctx.enclave_provider.as_ref().ok_or_else(|| {
                Error::InvalidArgument("no enclave provider is registered".to_string())
            })?;
            if attestation_info.len() != 1 {
                return Err(Error::Crypto(CryptoError::AttestationFailed(format!(
                    "expected one attestation info row, got {}",
                    attestation_info.len()
                ))));
            }
            let attestation = ctx.workspace.attestation_params.as_ref().ok_or_else(|| {
                Error::Crypto(CryptoError::AttestationFailed(
                    "attestation parameters were not recorded".to_string(),
                ))
            })?;
            let enclave_session = provider
                .create_session(attestation, &attestation_info[0])
                .await?;
            tracing::debug!(url = %url, "enclave session established");
            enclave_session_cache().insert(&url, enclave_session);
        } else if enclave_session_cache().get(&url).is_none() {
            return Err(Error::Crypto(CryptoError::EnclaveSessionMissing));
        }
    }
    Ok(())
}

/// Result set 1: column encryption keys, grouped by ordinal. A single
/// ordinal accumulates one encrypted copy per wrapping master key.
fn read_key_row(
    cells: &[SqlValue],
    keys: &mut BTreeMap<u16, Arc<CipherKeyEntry>>,
) -> Result<()> {
    let ordinal = cell_u16(cells, 0)?;
    let database_id = cell_i32(cells, 1)?;
    let key_id = cell_i32(cells, 2)?;
    let key_version = cell_i32(cells, 3)?;
    let metadata_version_bytes = cell_bytes(cells, 4)?;
    let mut metadata_version = [0u8; 8];
    let len = metadata_version_bytes.len().min(8);
    metadata_version[..len].copy_from_slice(&metadata_version_bytes[..len]);

    let value = EncryptedKeyValue {
        encrypted_key: cell_bytes(cells, 5)?,
        database_id,
        key_id,
        key_version,
        metadata_version,
        key_path: cell_string(cells, 7)?,
        provider_name: cell_string(cells, 6)?,
        algorithm_name: cell_string(cells, 8)?,
        signature: optional_bytes(cells, 10),
    };

    let entry = keys
        .entry(ordinal)
        .or_insert_with(|| Arc::new(CipherKeyEntry::new(ordinal)));
    entry.push_value(value);
    if let Some(SqlValue::Bit(true)) = cells.get(9) {
        entry.mark_requested_by_enclave();
    }
    Ok(())
}

/// Result set 2: per-parameter cipher metadata. Every described parameter
/// is marked metadata-received; encrypted ones get their descriptor and
/// their key is unwrapped immediately.
async fn stamp_parameter_row(
    local_stores: Option<&KeyStoreRegistry>,
    params: &mut ParameterCollection,
    cells: &[SqlValue],
    keys: &BTreeMap<u16, Arc<CipherKeyEntry>>,
) -> Result<()> {
    let name = cell_string(cells, 0)?;
    let algorithm_id = cell_u8(cells, 1)?;
    let encryption_type = EncryptionType::from_wire(cell_u8(cells, 2)?)?;
    let ordinal = cell_u16(cells, 3)?;
    let normalization_rule_version = cell_u8(cells, 4)?;

    if encryption_type == EncryptionType::PlainText {
        if let Some(param) = params.describe_target_mut(&name) {
            param.mark_metadata_received();
        }
        return Ok(());
    }

    let key = keys.get(&ordinal).ok_or_else(|| {
        Error::Crypto(CryptoError::Configuration(format!(
            "parameter {name:?} references key ordinal {ordinal} missing from the response"
        )))
    })?;
    ensure_key_decrypted(local_stores, key).await?;

    let Some(param) = params.describe_target_mut(&name) else {
        tracing::trace!(name = %name, "describe row matches no parameter");
        return Ok(());
    };
    let metadata = CipherMetadata {
        key: Arc::clone(key),
        algorithm_id,
        encryption_type,
        normalization_rule_version,
    };
    metadata.require_supported_algorithm()?;
    param.set_cipher(metadata);
    Ok(())
}

/// Unwrap a column encryption key through the first provider that can,
/// preferring the command-local registry over the global one.
async fn ensure_key_decrypted(
    local_stores: Option<&KeyStoreRegistry>,
    key: &CipherKeyEntry,
) -> Result<()> {
    if key.is_decrypted() {
        return Ok(());
    }
    let mut last_error: Option<CryptoError> = None;
    for value in key.values() {
        let Some(provider) = resolve_provider(local_stores, &value.provider_name) else {
            last_error = Some(CryptoError::ProviderNotFound(value.provider_name.clone()));
            continue;
        };
        match provider
            .decrypt_column_encryption_key(
                &value.key_path,
                &value.algorithm_name,
                &value.encrypted_key,
            )
            .await
        {
            Ok(material) => {
                key.set_decrypted(material);
                return Ok(());
            }
            Err(error) => {
                tracing::warn!(provider = %value.provider_name, %error, "key unwrap failed");
                last_error = Some(error);
            }
        }
    }
    Err(Error::Crypto(last_error.unwrap_or_else(|| {
        CryptoError::KeyDecryptionFailed("no encrypted key values were delivered".to_string())
    })))
}

/// Verify the column master key signature of every copy that carries one.
async fn verify_master_key_signature(
    local_stores: Option<&KeyStoreRegistry>,
    key: &CipherKeyEntry,
) -> Result<()> {
    for value in key.values() {
        let Some(signature) = value.signature.as_ref() else {
            continue;
        };
        let provider = resolve_provider(local_stores, &value.provider_name)
            .ok_or_else(|| CryptoError::ProviderNotFound(value.provider_name.clone()))?;
        let verified = provider
            .verify_column_master_key_signature(&value.key_path, true, signature)
            .await?;
        if !verified {
            return Err(Error::Crypto(CryptoError::SignatureVerificationFailed {
                key_path: value.key_path.clone(),
            }));
        }
    }
    Ok(())
}

/// Snapshot the stamped parameters into a cache entry.
fn build_cache_entry(
    params: &ParameterCollection,
    workspace: &crate::command::EncryptionWorkspace,
) -> Arc<CachedCommandMetadata> {
    let cached_params = params
        .iter()
        .filter_map(|p| {
            p.cipher().map(|cipher| CachedParamCipher {
                name: p.name().to_string(),
                cipher: cipher.clone(),
            })
        })
        .collect();
    Arc::new(CachedCommandMetadata {
        params: cached_params,
        keys_for_enclave: workspace
            .keys_for_enclave
            .iter()
            .map(|(ordinal, key)| (*ordinal, Arc::clone(key)))
            .collect(),
        requires_enclave: workspace.requires_enclave,
    })
}

fn malformed(index: usize, expected: &str) -> Error {
    Error::Crypto(CryptoError::Configuration(format!(
        "describe response malformed: column {index} is not {expected}"
    )))
}

fn cell_string(cells: &[SqlValue], index: usize) -> Result<String> {
    cells
        .get(index)
        .and_then(SqlValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| malformed(index, "a string"))
}

fn cell_i32(cells: &[SqlValue], index: usize) -> Result<i32> {
    cells
        .get(index)
        .and_then(SqlValue::as_i32)
        .ok_or_else(|| malformed(index, "an integer"))
}

fn cell_u16(cells: &[SqlValue], index: usize) -> Result<u16> {
    u16::try_from(cell_i32(cells, index)?).map_err(|_| malformed(index, "a key ordinal"))
}

fn cell_u8(cells: &[SqlValue], index: usize) -> Result<u8> {
    match cells.get(index) {
        Some(SqlValue::TinyInt(v)) => Ok(*v),
        Some(SqlValue::SmallInt(v)) => u8::try_from(*v).map_err(|_| malformed(index, "a byte")),
        Some(SqlValue::Int(v)) => u8::try_from(*v).map_err(|_| malformed(index, "a byte")),
        _ => Err(malformed(index, "a byte")),
    }
}

fn cell_bytes(cells: &[SqlValue], index: usize) -> Result<Bytes> {
    match cells.get(index) {
        Some(SqlValue::Binary(b)) => Ok(b.clone()),
        _ => Err(malformed(index, "varbinary")),
    }
}

fn optional_bytes(cells: &[SqlValue], index: usize) -> Option<Bytes> {
    match cells.get(index) {
        Some(SqlValue::Binary(b)) => Some(b.clone()),
        _ => None,
    }
}
