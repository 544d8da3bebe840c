//! Typed command parameters and the ordered parameter collection.

use bytes::Bytes;
use mssql_crypto::CipherMetadata;
use tds_rpc::{ParamShape, SqlValue, TdsType};

/// Direction a parameter is bound in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDirection {
    /// Value flows client to server only.
    Input,
    /// Value flows server to client only.
    Output,
    /// Value flows both ways.
    InputOutput,
    /// Receives the procedure's return status.
    ReturnValue,
}

impl ParamDirection {
    /// Whether the server writes this parameter back.
    #[must_use]
    pub fn is_output_bound(self) -> bool {
        matches!(self, Self::Output | Self::InputOutput | Self::ReturnValue)
    }
}

/// A typed command parameter.
#[derive(Debug, Clone)]
pub struct SqlParameter {
    name: String,
    direction: ParamDirection,
    ty: TdsType,
    size: Option<u64>,
    precision: u8,
    scale: u8,
    offset: usize,
    value: SqlValue,
    type_name: Option<String>,
    cipher: Option<CipherMetadata>,
    encrypted_value: Option<Bytes>,
    has_received_metadata: bool,
    is_derived_type_name: bool,
}

impl SqlParameter {
    /// Create an input parameter. Names are stored without the `@` prefix.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: TdsType) -> Self {
        let name = name.into();
        let name = name.strip_prefix('@').map(str::to_string).unwrap_or(name);
        Self {
            name,
            direction: ParamDirection::Input,
            ty,
            size: None,
            precision: 0,
            scale: 0,
            offset: 0,
            value: SqlValue::Null,
            type_name: None,
            cipher: None,
            encrypted_value: None,
            has_received_metadata: false,
            is_derived_type_name: false,
        }
    }

    /// Builder: set the value.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<SqlValue>) -> Self {
        self.value = value.into();
        self
    }

    /// Builder: set the direction.
    #[must_use]
    pub fn with_direction(mut self, direction: ParamDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Builder: set the declared size.
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Builder: set precision and scale.
    #[must_use]
    pub fn with_precision_scale(mut self, precision: u8, scale: u8) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    /// Builder: set the user-defined type name (UDT / table type).
    #[must_use]
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self.is_derived_type_name = false;
        self
    }

    /// Parameter name without the `@` prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direction.
    #[must_use]
    pub fn direction(&self) -> ParamDirection {
        self.direction
    }

    /// Declared type.
    #[must_use]
    pub fn ty(&self) -> TdsType {
        self.ty
    }

    /// Declared size, `None` meaning max/unspecified.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Declared precision.
    #[must_use]
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Declared scale.
    #[must_use]
    pub fn scale(&self) -> u8 {
        self.scale
    }

    /// User-defined type name (UDT / table type), when declared.
    #[must_use]
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    /// Value offset for partial updates; used by the data-adapter layer.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> &SqlValue {
        &self.value
    }

    /// Set the value. Value changes do not invalidate a prepared plan.
    pub fn set_value(&mut self, value: impl Into<SqlValue>) {
        self.value = value.into();
    }

    /// Set the declared size.
    pub fn set_size(&mut self, size: u64) {
        self.size = Some(size);
    }

    /// Set the declared precision and scale.
    pub fn set_precision_scale(&mut self, precision: u8, scale: u8) {
        self.precision = precision;
        self.scale = scale;
    }

    /// Set the direction.
    pub fn set_direction(&mut self, direction: ParamDirection) {
        self.direction = direction;
    }

    /// Cipher metadata attached by the describe round trip, if any.
    #[must_use]
    pub fn cipher(&self) -> Option<&CipherMetadata> {
        self.cipher.as_ref()
    }

    /// Whether the parameter's value travels encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.cipher.as_ref().is_some_and(CipherMetadata::is_encrypted)
    }

    /// Attach cipher metadata and mark metadata as received.
    pub fn set_cipher(&mut self, cipher: CipherMetadata) {
        self.cipher = Some(cipher);
        self.has_received_metadata = true;
    }

    /// Drop cipher state (stale metadata before a retry).
    pub fn clear_cipher(&mut self) {
        self.cipher = None;
        self.encrypted_value = None;
        self.has_received_metadata = false;
    }

    /// Whether the describe exchange covered this parameter.
    #[must_use]
    pub fn has_received_metadata(&self) -> bool {
        self.has_received_metadata
    }

    /// Mark the parameter as covered by the describe exchange.
    pub fn mark_metadata_received(&mut self) {
        self.has_received_metadata = true;
    }

    /// Whether the type name was derived rather than user-supplied.
    #[must_use]
    pub fn is_derived_type_name(&self) -> bool {
        self.is_derived_type_name
    }

    /// Ciphertext of the value, once input marshalling encrypted it.
    #[must_use]
    pub fn encrypted_value(&self) -> Option<&Bytes> {
        self.encrypted_value.as_ref()
    }

    /// Store the ciphertext produced for the current value.
    pub fn set_encrypted_value(&mut self, ciphertext: Bytes) {
        self.encrypted_value = Some(ciphertext);
    }

    /// Flattened view for the signature builders.
    #[must_use]
    pub fn shape(&self) -> ParamShape<'_> {
        ParamShape {
            name: &self.name,
            ty: self.ty,
            size: self.size,
            precision: self.precision,
            scale: self.scale,
            is_output: self.direction.is_output_bound()
                && self.direction != ParamDirection::ReturnValue,
            is_return_value: self.direction == ParamDirection::ReturnValue,
            value_byte_len: if self.ty.is_ansi_character() {
                self.value.ansi_byte_len()
            } else {
                Some(self.value.encoded_len())
            },
            type_name: self.type_name.as_deref(),
        }
    }

    /// Feed the shape-identifying fields into a fingerprint.
    pub(crate) fn fingerprint_into(&self, out: &mut String) {
        use std::fmt::Write as _;
        let _ = write!(
            out,
            "|{}:{:?}:{}:{}:{}:{:?}",
            self.name,
            self.ty,
            self.size.map_or(-1_i64, |s| s as i64),
            self.precision,
            self.scale,
            self.direction
        );
    }
}

/// Ordered collection of parameters, addressable by ordinal and by
/// case-insensitive name.
#[derive(Debug, Clone, Default)]
pub struct ParameterCollection {
    params: Vec<SqlParameter>,
    dirty: bool,
}

impl ParameterCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter.
    pub fn add(&mut self, param: SqlParameter) {
        self.params.push(param);
        self.dirty = true;
    }

    /// Remove all parameters.
    pub fn clear(&mut self) {
        self.params.clear();
        self.dirty = true;
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameter by ordinal.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&SqlParameter> {
        self.params.get(index)
    }

    /// Mutable parameter by ordinal. Marks the collection dirty, since the
    /// caller may change the parameter's shape.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut SqlParameter> {
        self.dirty = true;
        self.params.get_mut(index)
    }

    /// Parameter by case-insensitive name (with or without `@`).
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&SqlParameter> {
        let name = name.strip_prefix('@').unwrap_or(name);
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Mutable parameter by case-insensitive name. Marks the collection
    /// dirty.
    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut SqlParameter> {
        self.dirty = true;
        let name = name.strip_prefix('@').unwrap_or(name);
        self.params
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Iterate the parameters in order.
    pub fn iter(&self) -> impl Iterator<Item = &SqlParameter> {
        self.params.iter()
    }

    /// Whether the parameter shape changed since the flag was last taken.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Consume the dirty flag.
    pub(crate) fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Whether any parameter is a return value.
    #[must_use]
    pub fn has_return_value(&self) -> bool {
        self.params
            .iter()
            .any(|p| p.direction == ParamDirection::ReturnValue)
    }

    /// First return-value parameter, without dirtying the collection.
    pub(crate) fn first_return_value_mut(&mut self) -> Option<&mut SqlParameter> {
        self.params
            .iter_mut()
            .find(|p| p.direction == ParamDirection::ReturnValue)
    }

    /// Internal lookup that does not dirty the collection. Used by the
    /// output binder and the describe walk, which must not invalidate the
    /// prepared plan.
    pub(crate) fn bind_target_mut(&mut self, name: &str) -> Option<&mut SqlParameter> {
        let name = name.strip_prefix('@').unwrap_or(name);
        self.params
            .iter_mut()
            .filter(|p| p.direction.is_output_bound())
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Internal exact-name lookup (ordinal string equality), non-dirtying.
    pub(crate) fn describe_target_mut(&mut self, name: &str) -> Option<&mut SqlParameter> {
        let name = name.strip_prefix('@').unwrap_or(name);
        self.params.iter_mut().find(|p| p.name == name)
    }

    /// Internal mutable iteration that does not dirty the collection.
    pub(crate) fn iter_mut_internal(&mut self) -> impl Iterator<Item = &mut SqlParameter> {
        self.params.iter_mut()
    }

    /// Flattened views for the signature builders.
    #[must_use]
    pub fn shapes(&self) -> Vec<ParamShape<'_>> {
        self.params.iter().map(SqlParameter::shape).collect()
    }

    /// Name of the first non-return-value parameter the describe exchange
    /// did not cover, if any.
    #[must_use]
    pub fn first_missing_metadata(&self) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.direction != ParamDirection::ReturnValue && !p.has_received_metadata)
            .map(|p| p.name.as_str())
    }

    /// Drop cipher state on every parameter.
    pub(crate) fn clear_ciphers(&mut self) {
        for p in &mut self.params {
            p.clear_cipher();
        }
    }

    /// Feed every parameter's shape into a fingerprint.
    pub(crate) fn fingerprint_into(&self, out: &mut String) {
        for p in &self.params {
            p.fingerprint_into(out);
        }
    }
}

impl<'a> IntoIterator for &'a ParameterCollection {
    type Item = &'a SqlParameter;
    type IntoIter = std::slice::Iter<'a, SqlParameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}
