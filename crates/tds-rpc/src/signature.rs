//! Derived strings for RPC shapes: the parameter-list signature and the
//! stored-procedure `EXEC` preview.

use crate::types::TdsType;

/// Borrowed view of one parameter, as the signature builders need it.
///
/// Higher layers own richer parameter types; they hand the builders this
/// flattened shape so this crate stays independent of them.
#[derive(Debug, Clone, Copy)]
pub struct ParamShape<'a> {
    /// Parameter name without the `@` prefix.
    pub name: &'a str,
    /// Declared type.
    pub ty: TdsType,
    /// Declared size; `None` means max / unspecified.
    pub size: Option<u64>,
    /// Declared precision for decimal types.
    pub precision: u8,
    /// Declared scale for decimal and fractional-second types.
    pub scale: u8,
    /// Whether the parameter is bound for output (`OUTPUT` suffix).
    pub is_output: bool,
    /// Whether the parameter is the procedure return value.
    pub is_return_value: bool,
    /// Byte length of the current value in its wire encoding, when known.
    pub value_byte_len: Option<usize>,
    /// User-defined type name for structured parameters.
    pub type_name: Option<&'a str>,
}

/// Build the comma-separated parameter-list signature used as the `@params`
/// argument of `sp_executesql` / `sp_prepexec` /
/// `sp_describe_parameter_encryption`.
///
/// Each entry is `@name type(modifiers)` with type-specific modifiers:
/// `(precision, scale)` for decimals, `(scale)` for fractional-second
/// temporals, `(length)` for non-PLP variable-length values, `(max)` for PLP
/// forms, ` READONLY` for table-valued parameters, ` OUTPUT` for anything
/// not plain input. Return-value parameters never appear.
#[must_use]
pub fn param_list_signature(params: &[ParamShape<'_>]) -> String {
    let mut out = String::new();
    for param in params.iter().filter(|p| !p.is_return_value) {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push('@');
        out.push_str(param.name);
        out.push(' ');
        append_type_declaration(&mut out, param);
        if param.is_output {
            out.push_str(" OUTPUT");
        }
    }
    out
}

fn append_type_declaration(out: &mut String, param: &ParamShape<'_>) {
    use std::fmt::Write as _;

    if param.ty == TdsType::Structured {
        out.push_str(param.type_name.unwrap_or("table"));
        out.push_str(" READONLY");
        return;
    }
    if param.ty == TdsType::Udt {
        out.push_str(param.type_name.unwrap_or(param.ty.sql_name()));
        return;
    }

    out.push_str(param.ty.sql_name());

    if param.ty.has_precision_and_scale() {
        let _ = write!(out, "({},{})", param.precision.max(1), param.scale);
    } else if param.ty.has_fractional_scale() {
        let _ = write!(out, "({})", param.scale);
    } else if param.ty.is_variable_length() {
        match effective_length(param) {
            Some(len) => {
                let _ = write!(out, "({len})");
            }
            None if param.ty.spells_max_modifier() => out.push_str("(max)"),
            None => {}
        }
    } else if param.size.is_none() && param.ty.spells_max_modifier() {
        out.push_str("(max)");
    }
}

/// Declared length for a variable-length parameter, recomputed from the
/// value when an ANSI value does not fit the declared byte size.
fn effective_length(param: &ParamShape<'_>) -> Option<u64> {
    let declared = param.size?;
    if param.ty.is_ansi_character() {
        if let Some(value_len) = param.value_byte_len {
            if value_len as u64 > declared {
                return Some(value_len as u64);
            }
        }
    }
    Some(declared.max(1))
}

/// Build the `EXEC` preview for a stored procedure call.
///
/// The preview mirrors the invocation as text so the server can describe its
/// parameter encryption: `EXEC [dbo].[proc] @a=@a, @b=@b OUTPUT`, prefixed
/// with `@return=` when a return-value parameter participates.
#[must_use]
pub fn exec_preview(proc_name: &str, params: &[ParamShape<'_>]) -> String {
    let mut out = String::from("EXEC ");
    if params.iter().any(|p| p.is_return_value) {
        out.push_str("@return=");
    }
    out.push_str(&quote_multipart_identifier(proc_name));

    let mut first = true;
    for param in params.iter().filter(|p| !p.is_return_value) {
        out.push_str(if first { " " } else { ", " });
        first = false;
        out.push('@');
        out.push_str(param.name);
        out.push_str("=@");
        out.push_str(param.name);
        if param.is_output {
            out.push_str(" OUTPUT");
        }
    }
    out
}

/// Quote a (possibly multi-part) identifier with `[` and `]`.
///
/// Parts already bracketed are re-quoted canonically; `]` inside a part is
/// escaped by doubling.
#[must_use]
pub fn quote_multipart_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, part) in split_identifier_parts(name).iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        out.push('[');
        for ch in part.chars() {
            if ch == ']' {
                out.push(']');
            }
            out.push(ch);
        }
        out.push(']');
    }
    out
}

/// Split a multi-part identifier on dots, honoring `[` `]` quoting.
fn split_identifier_parts(name: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = name.chars().peekable();
    let mut in_brackets = false;

    while let Some(ch) = chars.next() {
        match ch {
            '[' if !in_brackets && current.is_empty() => in_brackets = true,
            ']' if in_brackets => {
                if chars.peek() == Some(&']') {
                    chars.next();
                    current.push(']');
                } else {
                    in_brackets = false;
                }
            }
            '.' if !in_brackets => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    parts.push(current);
    parts
}
