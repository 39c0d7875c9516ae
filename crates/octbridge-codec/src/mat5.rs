//! MAT-file level 5 constants and small helpers.

use crate::CodecError;

/// Size of the file header.
pub const HEADER_LEN: usize = 128;
/// Length of the descriptive text at the start of the header.
pub const HEADER_TEXT_LEN: usize = 116;
/// Format version stored in the header.
pub const VERSION: u16 = 0x0100;
/// Longest variable or field name the format accepts.
pub const MAX_NAME_LEN: usize = 63;

// Data element types.
pub const MI_INT8: u32 = 1;
pub const MI_UINT8: u32 = 2;
pub const MI_INT16: u32 = 3;
pub const MI_UINT16: u32 = 4;
pub const MI_INT32: u32 = 5;
pub const MI_UINT32: u32 = 6;
pub const MI_SINGLE: u32 = 7;
pub const MI_DOUBLE: u32 = 9;
pub const MI_INT64: u32 = 12;
pub const MI_UINT64: u32 = 13;
pub const MI_MATRIX: u32 = 14;
pub const MI_COMPRESSED: u32 = 15;
pub const MI_UTF8: u32 = 16;
pub const MI_UTF16: u32 = 17;
pub const MI_UTF32: u32 = 18;

// Array classes.
pub const MX_CELL: u8 = 1;
pub const MX_STRUCT: u8 = 2;
pub const MX_OBJECT: u8 = 3;
pub const MX_CHAR: u8 = 4;
pub const MX_SPARSE: u8 = 5;
pub const MX_DOUBLE: u8 = 6;
pub const MX_SINGLE: u8 = 7;
pub const MX_INT8: u8 = 8;
pub const MX_UINT8: u8 = 9;
pub const MX_INT16: u8 = 10;
pub const MX_UINT16: u8 = 11;
pub const MX_INT32: u8 = 12;
pub const MX_UINT32: u8 = 13;
pub const MX_INT64: u8 = 14;
pub const MX_UINT64: u8 = 15;
pub const MX_FUNCTION: u8 = 16;
pub const MX_OPAQUE: u8 = 17;

// Array flag bits (second byte of the flags word).
pub const FLAG_COMPLEX: u32 = 0x0800;
pub const FLAG_GLOBAL: u32 = 0x0400;
pub const FLAG_LOGICAL: u32 = 0x0200;

/// Byte width of a numeric element type.
#[must_use]
pub const fn type_width(ty: u32) -> Option<usize> {
    match ty {
        MI_INT8 | MI_UINT8 | MI_UTF8 => Some(1),
        MI_INT16 | MI_UINT16 | MI_UTF16 => Some(2),
        MI_INT32 | MI_UINT32 | MI_SINGLE | MI_UTF32 => Some(4),
        MI_DOUBLE | MI_INT64 | MI_UINT64 => Some(8),
        _ => None,
    }
}

/// Round up to the next multiple of eight.
#[must_use]
pub const fn padded(len: usize) -> usize {
    (len + 7) & !7
}

/// Whether `name` is a valid engine identifier.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_NAME_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn check_name(name: &str) -> Result<(), CodecError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(CodecError::InvalidName(name.to_string()))
    }
}

/// Byte order of a file being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}
