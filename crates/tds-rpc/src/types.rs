//! The closed enumeration of SQL Server declared types.

/// Declared type of a command parameter.
///
/// This is the set of types a parameter can be declared as, independent of
/// the wire-level type id the serializer picks. Predicates on this enum feed
/// the parameter-list signature builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TdsType {
    /// BIT.
    Bit,
    /// TINYINT.
    TinyInt,
    /// SMALLINT.
    SmallInt,
    /// INT.
    Int,
    /// BIGINT.
    BigInt,
    /// REAL (4-byte float).
    Real,
    /// FLOAT (8-byte float).
    Float,
    /// DECIMAL.
    Decimal,
    /// NUMERIC.
    Numeric,
    /// MONEY.
    Money,
    /// SMALLMONEY.
    SmallMoney,
    /// CHAR (fixed, single-byte).
    Char,
    /// VARCHAR (variable, single-byte).
    VarChar,
    /// TEXT (legacy LOB, single-byte).
    Text,
    /// NCHAR (fixed, UTF-16).
    NChar,
    /// NVARCHAR (variable, UTF-16).
    NVarChar,
    /// NTEXT (legacy LOB, UTF-16).
    NText,
    /// BINARY (fixed).
    Binary,
    /// VARBINARY (variable).
    VarBinary,
    /// IMAGE (legacy LOB).
    Image,
    /// DATE.
    Date,
    /// TIME.
    Time,
    /// DATETIME.
    DateTime,
    /// SMALLDATETIME.
    SmallDateTime,
    /// DATETIME2.
    DateTime2,
    /// DATETIMEOFFSET.
    DateTimeOffset,
    /// UNIQUEIDENTIFIER.
    UniqueIdentifier,
    /// XML document.
    Xml,
    /// JSON document (SQL Server 2025+).
    Json,
    /// SQL_VARIANT.
    Variant,
    /// CLR user-defined type.
    Udt,
    /// Table-valued parameter.
    Structured,
}

impl TdsType {
    /// SQL name of the type as used in declarations.
    #[must_use]
    pub fn sql_name(self) -> &'static str {
        match self {
            Self::Bit => "bit",
            Self::TinyInt => "tinyint",
            Self::SmallInt => "smallint",
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::Real => "real",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Numeric => "numeric",
            Self::Money => "money",
            Self::SmallMoney => "smallmoney",
            Self::Char => "char",
            Self::VarChar => "varchar",
            Self::Text => "text",
            Self::NChar => "nchar",
            Self::NVarChar => "nvarchar",
            Self::NText => "ntext",
            Self::Binary => "binary",
            Self::VarBinary => "varbinary",
            Self::Image => "image",
            Self::Date => "date",
            Self::Time => "time",
            Self::DateTime => "datetime",
            Self::SmallDateTime => "smalldatetime",
            Self::DateTime2 => "datetime2",
            Self::DateTimeOffset => "datetimeoffset",
            Self::UniqueIdentifier => "uniqueidentifier",
            Self::Xml => "xml",
            Self::Json => "json",
            Self::Variant => "sql_variant",
            Self::Udt => "udt",
            Self::Structured => "structured",
        }
    }

    /// Whether the declared type carries `(precision, scale)` modifiers.
    #[must_use]
    pub fn has_precision_and_scale(self) -> bool {
        matches!(self, Self::Decimal | Self::Numeric)
    }

    /// Whether the declared type carries a `(scale)` modifier for
    /// fractional seconds.
    #[must_use]
    pub fn has_fractional_scale(self) -> bool {
        matches!(self, Self::Time | Self::DateTime2 | Self::DateTimeOffset)
    }

    /// Whether the type is variable-length and takes a `(length)` modifier
    /// when not promoted to a PLP (max) form.
    #[must_use]
    pub fn is_variable_length(self) -> bool {
        matches!(
            self,
            Self::Char
                | Self::VarChar
                | Self::NChar
                | Self::NVarChar
                | Self::Binary
                | Self::VarBinary
        )
    }

    /// Whether the type can be sent in the partially-length-prefixed (max)
    /// form.
    #[must_use]
    pub fn is_plp_capable(self) -> bool {
        matches!(
            self,
            Self::VarChar
                | Self::NVarChar
                | Self::VarBinary
                | Self::Text
                | Self::NText
                | Self::Image
                | Self::Xml
                | Self::Json
                | Self::Udt
        )
    }

    /// Whether the `(max)` modifier is spelled out in declarations.
    ///
    /// XML, JSON and UDT values are always PLP but their declarations never
    /// carry a modifier; legacy LOB types and table-valued parameters are
    /// sized by their type.
    #[must_use]
    pub fn spells_max_modifier(self) -> bool {
        matches!(self, Self::VarChar | Self::NVarChar | Self::VarBinary)
    }

    /// Whether the type holds single-byte (ANSI) character data whose
    /// declared size is measured in bytes.
    #[must_use]
    pub fn is_ansi_character(self) -> bool {
        matches!(self, Self::Char | Self::VarChar | Self::Text)
    }

    /// Whether the type holds UTF-16 character data.
    #[must_use]
    pub fn is_unicode_character(self) -> bool {
        matches!(self, Self::NChar | Self::NVarChar | Self::NText | Self::Xml)
    }

    /// Fixed wire size in bytes for fixed-size types.
    #[must_use]
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Bit | Self::TinyInt => Some(1),
            Self::SmallInt => Some(2),
            Self::Int | Self::Real | Self::SmallMoney | Self::SmallDateTime | Self::Date => Some(4),
            Self::BigInt | Self::Float | Self::Money | Self::DateTime | Self::Time => Some(8),
            Self::UniqueIdentifier => Some(16),
            Self::Decimal | Self::Numeric => Some(17),
            _ => None,
        }
    }
}
