//! Output parameter binding.
//!
//! Return-value tokens carry the prepared handle (while a prepare-execute
//! is in flight), output parameter values, and — as a separate token — the
//! procedure's return status. Encrypted output values arrive as opaque
//! varbinary ciphertext and are decrypted with the parameter's cipher
//! metadata before binding; UDT payloads route through the connection's UDT
//! factory.

use std::sync::Arc;

use bytes::Bytes;
use mssql_crypto::{CellCipher, CryptoError};
use tds_rpc::{SqlValue, TdsType};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::parameter::{ParameterCollection, SqlParameter};
use crate::parser::ReturnValueRecord;
use crate::prepare::PrepareState;

/// Bind one return-value token.
///
/// While `in_prepare` is set the first return value is the server's plan
/// handle; it completes the prepare state instead of binding a parameter.
/// Named tokens bind to the matching output-bound parameter; unnamed tokens
/// bind to the first return-value parameter. Tokens that match nothing are
/// ignored.
pub(crate) fn bind_return_value(
    params: &mut ParameterCollection,
    prepare: &mut PrepareState,
    in_prepare: &mut bool,
    record: &ReturnValueRecord,
    close_count: u64,
    reconnect_count: u64,
    connection: Option<&Arc<dyn Connection>>,
) -> Result<()> {
    if *in_prepare {
        *in_prepare = false;
        let handle = record.value.as_i32().ok_or_else(|| {
            Error::InvalidArgument("the prepare handle return value was not an integer".to_string())
        })?;
        prepare.complete(handle, close_count, reconnect_count);
        tracing::debug!(handle, "captured prepared handle");
        return Ok(());
    }

    let target = if record.name.is_empty() {
        params.first_return_value_mut()
    } else {
        params.bind_target_mut(&record.name)
    };
    let Some(param) = target else {
        tracing::trace!(name = %record.name, "return value matches no parameter");
        return Ok(());
    };

    if param.is_encrypted() {
        let ciphertext = record.value.as_bytes().ok_or_else(|| {
            Error::Crypto(CryptoError::DecryptionFailed(
                "encrypted return value was not delivered as varbinary".to_string(),
            ))
        })?;
        // The cipher metadata was established by the describe round trip.
        #[allow(clippy::expect_used)]
        let cipher = param.cipher().expect("encrypted parameter has cipher metadata");
        let key = cipher.key.decrypted().ok_or_else(|| {
            Error::Crypto(CryptoError::KeyDecryptionFailed(
                "column encryption key is not decrypted".to_string(),
            ))
        })?;
        let plaintext = CellCipher::new(&key)?.decrypt(ciphertext)?;
        let value = if param.ty() == TdsType::Udt {
            materialize_udt(param.type_name(), Bytes::from(plaintext), connection)
        } else {
            decode_normalized(param.ty(), &plaintext, record.precision, record.scale)?
        };
        param.set_value(value);
        return Ok(());
    }

    let value = materialize(param, record, connection);
    if record.precision != 0 || record.scale != 0 {
        param.set_precision_scale(record.precision, record.scale);
    }
    param.set_value(value);
    Ok(())
}

/// Bind a return-status token into the first return-value parameter.
pub(crate) fn bind_return_status(params: &mut ParameterCollection, status: i32) {
    if let Some(param) = params.first_return_value_mut() {
        param.set_value(SqlValue::Int(status));
    }
}

/// Adapt a plaintext return value to the parameter's declared type.
///
/// XML responses can arrive as cached UTF-16 buffers; they are materialized
/// to strings here. UDT payloads go through the connection's UDT factory.
fn materialize(
    param: &SqlParameter,
    record: &ReturnValueRecord,
    connection: Option<&Arc<dyn Connection>>,
) -> SqlValue {
    match (param.ty(), &record.value) {
        (TdsType::Xml, SqlValue::Binary(buf)) => {
            let units: Vec<u16> = buf
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            SqlValue::Xml(String::from_utf16_lossy(&units))
        }
        (TdsType::Udt, SqlValue::Binary(buf)) => {
            materialize_udt(param.type_name(), buf.clone(), connection)
        }
        _ => record.value.clone(),
    }
}

/// Route a UDT payload through the connection's UDT factory. Without a
/// connection the payload stays opaque.
fn materialize_udt(
    type_name: Option<&str>,
    payload: Bytes,
    connection: Option<&Arc<dyn Connection>>,
) -> SqlValue {
    let type_name = type_name.unwrap_or("");
    match connection {
        Some(connection) => connection.materialize_udt(type_name, payload),
        None => SqlValue::Udt {
            type_name: type_name.to_string(),
            payload,
        },
    }
}

/// Decode the normalized little-endian layout produced by cell decryption
/// back into a typed value.
pub(crate) fn decode_normalized(
    ty: TdsType,
    bytes: &[u8],
    precision: u8,
    scale: u8,
) -> Result<SqlValue> {
    fn short(ty: TdsType) -> Error {
        Error::Crypto(CryptoError::DecryptionFailed(format!(
            "decrypted value too short for {ty:?}"
        )))
    }

    let value = match ty {
        TdsType::Bit => SqlValue::Bit(*bytes.first().ok_or_else(|| short(ty))? != 0),
        TdsType::TinyInt => SqlValue::TinyInt(*bytes.first().ok_or_else(|| short(ty))?),
        TdsType::SmallInt => {
            let arr: [u8; 2] = bytes.try_into().map_err(|_| short(ty))?;
            SqlValue::SmallInt(i16::from_le_bytes(arr))
        }
        TdsType::Int => {
            let arr: [u8; 4] = bytes.try_into().map_err(|_| short(ty))?;
            SqlValue::Int(i32::from_le_bytes(arr))
        }
        TdsType::BigInt => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| short(ty))?;
            SqlValue::BigInt(i64::from_le_bytes(arr))
        }
        TdsType::Real => {
            let arr: [u8; 4] = bytes.try_into().map_err(|_| short(ty))?;
            SqlValue::Real(f32::from_le_bytes(arr))
        }
        TdsType::Float => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| short(ty))?;
            SqlValue::Float(f64::from_le_bytes(arr))
        }
        TdsType::Decimal | TdsType::Numeric | TdsType::Money | TdsType::SmallMoney => {
            if bytes.len() < 17 {
                return Err(short(ty));
            }
            let positive = bytes[0] != 0;
            let mut magnitude = [0u8; 16];
            magnitude.copy_from_slice(&bytes[1..17]);
            let unscaled = i128::from_le_bytes(magnitude);
            SqlValue::Decimal {
                unscaled: if positive { unscaled } else { -unscaled },
                precision,
                scale,
            }
        }
        TdsType::Char
        | TdsType::VarChar
        | TdsType::Text
        | TdsType::NChar
        | TdsType::NVarChar
        | TdsType::NText => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            SqlValue::String(String::from_utf16_lossy(&units))
        }
        TdsType::Xml => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            SqlValue::Xml(String::from_utf16_lossy(&units))
        }
        TdsType::UniqueIdentifier => {
            let arr: [u8; 16] = bytes.try_into().map_err(|_| short(ty))?;
            SqlValue::Guid(arr)
        }
        TdsType::Date => {
            let arr: [u8; 4] = bytes.try_into().map_err(|_| short(ty))?;
            SqlValue::Date(i32::from_le_bytes(arr))
        }
        TdsType::Time => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| short(ty))?;
            SqlValue::Time {
                ticks: u64::from_le_bytes(arr),
                scale,
            }
        }
        TdsType::DateTime | TdsType::SmallDateTime | TdsType::DateTime2 => {
            if bytes.len() < 12 {
                return Err(short(ty));
            }
            let mut ticks = [0u8; 8];
            ticks.copy_from_slice(&bytes[..8]);
            let mut days = [0u8; 4];
            days.copy_from_slice(&bytes[8..12]);
            SqlValue::DateTime2 {
                days: i32::from_le_bytes(days),
                ticks: u64::from_le_bytes(ticks),
                scale,
            }
        }
        _ => SqlValue::Binary(Bytes::copy_from_slice(bytes)),
    };
    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::parameter::{ParamDirection, SqlParameter};
    use mssql_crypto::{
        ALGORITHM_AEAD_AES_256_CBC_HMAC_SHA256, CipherKeyEntry, CipherMetadata, EncryptionType,
    };
    use std::sync::Arc;

    fn rv(name: &str, value: SqlValue) -> ReturnValueRecord {
        ReturnValueRecord {
            name: name.to_string(),
            ty: TdsType::Int,
            precision: 0,
            scale: 0,
            value,
        }
    }

    #[test]
    fn test_in_prepare_captures_handle() {
        let mut params = ParameterCollection::new();
        let mut prepare = PrepareState::PreparePending { handle: None };
        let mut in_prepare = true;

        bind_return_value(
            &mut params,
            &mut prepare,
            &mut in_prepare,
            &rv("", SqlValue::Int(77)),
            2,
            3,
            None,
        )
        .unwrap();

        assert!(!in_prepare);
        assert_eq!(
            prepare,
            PrepareState::Prepared {
                handle: 77,
                close_count: 2,
                reconnect_count: 3
            }
        );
    }

    #[test]
    fn test_named_binding() {
        let mut params = ParameterCollection::new();
        params.add(
            SqlParameter::new("total", TdsType::Int).with_direction(ParamDirection::Output),
        );
        let mut prepare = PrepareState::Unprepared;
        let mut in_prepare = false;

        bind_return_value(
            &mut params,
            &mut prepare,
            &mut in_prepare,
            &rv("@total", SqlValue::Int(42)),
            0,
            0,
            None,
        )
        .unwrap();
        assert_eq!(params.by_name("total").unwrap().value().as_i32(), Some(42));
    }

    #[test]
    fn test_unnamed_binds_first_return_value() {
        let mut params = ParameterCollection::new();
        params.add(
            SqlParameter::new("ret", TdsType::Int).with_direction(ParamDirection::ReturnValue),
        );
        let mut prepare = PrepareState::Unprepared;
        let mut in_prepare = false;

        bind_return_value(
            &mut params,
            &mut prepare,
            &mut in_prepare,
            &rv("", SqlValue::Int(9)),
            0,
            0,
            None,
        )
        .unwrap();
        assert_eq!(params.by_name("ret").unwrap().value().as_i32(), Some(9));
    }

    #[test]
    fn test_return_status_into_first_return_value() {
        let mut params = ParameterCollection::new();
        params.add(
            SqlParameter::new("ret", TdsType::Int).with_direction(ParamDirection::ReturnValue),
        );
        bind_return_status(&mut params, 7);
        assert_eq!(params.by_name("ret").unwrap().value().as_i32(), Some(7));
    }

    #[test]
    fn test_encrypted_return_value_roundtrip() {
        let key_material: Vec<u8> = (0u8..32).collect();
        let entry = Arc::new(CipherKeyEntry::new(1));
        entry.set_decrypted(key_material.clone());

        let cipher = CellCipher::new(&key_material).unwrap();
        let ciphertext = cipher
            .encrypt(
                &SqlValue::Int(1234).normalized_bytes(),
                EncryptionType::Deterministic,
            )
            .unwrap();

        let mut params = ParameterCollection::new();
        let mut param =
            SqlParameter::new("secret", TdsType::Int).with_direction(ParamDirection::Output);
        param.set_cipher(CipherMetadata {
            key: entry,
            algorithm_id: ALGORITHM_AEAD_AES_256_CBC_HMAC_SHA256,
            encryption_type: EncryptionType::Deterministic,
            normalization_rule_version: 1,
        });
        params.add(param);

        let mut prepare = PrepareState::Unprepared;
        let mut in_prepare = false;
        bind_return_value(
            &mut params,
            &mut prepare,
            &mut in_prepare,
            &rv("secret", SqlValue::Binary(Bytes::from(ciphertext))),
            0,
            0,
            None,
        )
        .unwrap();

        assert_eq!(
            params.by_name("secret").unwrap().value().as_i32(),
            Some(1234)
        );
    }

    #[test]
    fn test_decode_normalized_string() {
        let bytes = SqlValue::from("hi").normalized_bytes();
        let value = decode_normalized(TdsType::NVarChar, &bytes, 0, 0).unwrap();
        assert_eq!(value.as_str(), Some("hi"));
    }

    #[test]
    fn test_decode_normalized_decimal_negative() {
        let original = SqlValue::Decimal {
            unscaled: -1234,
            precision: 10,
            scale: 2,
        };
        let decoded =
            decode_normalized(TdsType::Decimal, &original.normalized_bytes(), 10, 2).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_rejects_short_input() {
        assert!(decode_normalized(TdsType::Int, &[1, 2], 0, 0).is_err());
    }

    #[test]
    fn test_udt_return_value_stays_opaque_without_factory() {
        let mut params = ParameterCollection::new();
        params.add(
            SqlParameter::new("shape", TdsType::Udt)
                .with_type_name("dbo.Point")
                .with_direction(ParamDirection::Output),
        );
        let mut prepare = PrepareState::Unprepared;
        let mut in_prepare = false;

        let record = ReturnValueRecord {
            name: "shape".to_string(),
            ty: TdsType::Udt,
            precision: 0,
            scale: 0,
            value: SqlValue::Binary(Bytes::from_static(&[1, 2, 3])),
        };
        bind_return_value(
            &mut params,
            &mut prepare,
            &mut in_prepare,
            &record,
            0,
            0,
            None,
        )
        .unwrap();

        assert_eq!(
            params.by_name("shape").unwrap().value(),
            &SqlValue::Udt {
                type_name: "dbo.Point".to_string(),
                payload: Bytes::from_static(&[1, 2, 3]),
            }
        );
    }

    #[test]
    fn test_encrypted_udt_return_value_decrypts_to_opaque_payload() {
        let key_material: Vec<u8> = (0u8..32).collect();
        let entry = Arc::new(CipherKeyEntry::new(1));
        entry.set_decrypted(key_material.clone());

        let cipher = CellCipher::new(&key_material).unwrap();
        let ciphertext = cipher
            .encrypt(&[9, 9, 9], EncryptionType::Randomized)
            .unwrap();

        let mut params = ParameterCollection::new();
        let mut param = SqlParameter::new("shape", TdsType::Udt)
            .with_type_name("dbo.Point")
            .with_direction(ParamDirection::Output);
        param.set_cipher(CipherMetadata {
            key: entry,
            algorithm_id: ALGORITHM_AEAD_AES_256_CBC_HMAC_SHA256,
            encryption_type: EncryptionType::Randomized,
            normalization_rule_version: 1,
        });
        params.add(param);

        let mut prepare = PrepareState::Unprepared;
        let mut in_prepare = false;
        let record = ReturnValueRecord {
            name: "shape".to_string(),
            ty: TdsType::VarBinary,
            precision: 0,
            scale: 0,
            value: SqlValue::Binary(Bytes::from(ciphertext)),
        };
        bind_return_value(
            &mut params,
            &mut prepare,
            &mut in_prepare,
            &record,
            0,
            0,
            None,
        )
        .unwrap();

        assert_eq!(
            params.by_name("shape").unwrap().value(),
            &SqlValue::Udt {
                type_name: "dbo.Point".to_string(),
                payload: Bytes::from_static(&[9, 9, 9]),
            }
        );
    }

    #[test]
    fn test_xml_buffer_materializes_to_string() {
        let mut params = ParameterCollection::new();
        params.add(
            SqlParameter::new("doc", TdsType::Xml).with_direction(ParamDirection::Output),
        );
        let utf16: Vec<u8> = "<a/>"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        let mut prepare = PrepareState::Unprepared;
        let mut in_prepare = false;
        bind_return_value(
            &mut params,
            &mut prepare,
            &mut in_prepare,
            &rv("doc", SqlValue::Binary(Bytes::from(utf16))),
            0,
            0,
            None,
        )
        .unwrap();
        assert_eq!(params.by_name("doc").unwrap().value().as_str(), Some("<a/>"));
    }
}
