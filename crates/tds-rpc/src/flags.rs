//! RPC option bits and the packed per-parameter option map.

use bitflags::bitflags;

bitflags! {
    /// Option flags for a whole RPC invocation (2 bytes on the wire).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct RpcOptions: u16 {
        /// Recompile the procedure before executing.
        const WITH_RECOMPILE = 0x0001;
        /// Suppress metadata in the response.
        const NO_METADATA = 0x0002;
        /// Reuse metadata from the previous invocation.
        const REUSE_METADATA = 0x0004;
    }
}

bitflags! {
    /// Status flags for one RPC parameter (1 byte on the wire).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ParamOptions: u32 {
        /// Parameter is passed by reference (OUTPUT / INPUT-OUTPUT).
        const BY_REF = 0x01;
        /// Parameter value is elided so the server default applies.
        const DEFAULT = 0x02;
        /// Parameter value is encrypted client-side.
        const ENCRYPTED = 0x08;
    }
}

/// A parameter option word packed together with the parameter's ordinal.
///
/// The option bits occupy the high 32 bits and the ordinal the low 32, so a
/// whole user-parameter option map fits in a flat `Vec<u64>` that can be
/// sorted and scanned by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedParamOptions(u64);

impl PackedParamOptions {
    /// Pack option bits with a parameter ordinal.
    #[must_use]
    pub fn pack(options: ParamOptions, index: usize) -> Self {
        Self((u64::from(options.bits()) << 32) | index as u64)
    }

    /// The option bits.
    #[must_use]
    pub fn options(self) -> ParamOptions {
        ParamOptions::from_bits_truncate((self.0 >> 32) as u32)
    }

    /// The parameter ordinal.
    #[must_use]
    pub fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    /// The raw packed word.
    #[must_use]
    pub fn into_raw(self) -> u64 {
        self.0
    }

    /// Rebuild from a raw packed word.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Return a copy with additional option bits set.
    #[must_use]
    pub fn with(self, extra: ParamOptions) -> Self {
        Self::pack(self.options() | extra, self.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_options_bits() {
        assert_eq!(RpcOptions::WITH_RECOMPILE.bits(), 0x0001);
        assert_eq!(
            (RpcOptions::NO_METADATA | RpcOptions::REUSE_METADATA).bits(),
            0x0006
        );
    }

    #[test]
    fn test_param_options_bits() {
        assert_eq!(ParamOptions::BY_REF.bits(), 0x01);
        assert_eq!(ParamOptions::ENCRYPTED.bits(), 0x08);
    }

    #[test]
    fn test_pack_roundtrip() {
        let packed = PackedParamOptions::pack(ParamOptions::BY_REF | ParamOptions::ENCRYPTED, 42);
        assert_eq!(packed.index(), 42);
        assert_eq!(packed.options(), ParamOptions::BY_REF | ParamOptions::ENCRYPTED);
        assert_eq!(
            PackedParamOptions::from_raw(packed.into_raw()),
            packed
        );
    }

    #[test]
    fn test_pack_layout() {
        let packed = PackedParamOptions::pack(ParamOptions::ENCRYPTED, 3);
        assert_eq!(packed.into_raw(), (0x08u64 << 32) | 3);
    }

    #[test]
    fn test_with_adds_bits() {
        let packed = PackedParamOptions::pack(ParamOptions::BY_REF, 1);
        let both = packed.with(ParamOptions::ENCRYPTED);
        assert_eq!(both.options(), ParamOptions::BY_REF | ParamOptions::ENCRYPTED);
        assert_eq!(both.index(), 1);
    }
}
