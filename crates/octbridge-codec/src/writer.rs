//! MAT level 5 writer.
//!
//! Files are always written little-endian and uncompressed, the layout the
//! engine reads with `load -mat`. Numeric data is stored in the narrowest
//! element type that reproduces every value exactly; the array class is
//! never changed.

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};
use octbridge_core::{NumericArray, NumericData, NumericKind, SparseMatrix, Value};

use crate::{
    CodecError,
    mat5::{
        FLAG_COMPLEX, FLAG_LOGICAL, HEADER_TEXT_LEN, MI_DOUBLE, MI_INT8, MI_INT16, MI_INT32,
        MI_INT64, MI_MATRIX, MI_SINGLE, MI_UINT8, MI_UINT16, MI_UINT32, MI_UINT64, MI_UTF8,
        MX_CELL, MX_CHAR, MX_DOUBLE, MX_INT8, MX_INT16, MX_INT32, MX_INT64, MX_SINGLE,
        MX_SPARSE, MX_STRUCT, MX_UINT8, MX_UINT16, MX_UINT32, MX_UINT64, VERSION, check_name,
        padded, type_width,
    },
};

/// Options controlling how values are encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Send integer-class arrays as doubles.
    pub convert_to_float: bool,
}

/// Storage candidates narrower than a native type, smallest first.
const INT_CANDIDATES: [(u32, i128, i128); 6] = [
    (MI_UINT8, 0, u8::MAX as i128),
    (MI_INT8, i8::MIN as i128, i8::MAX as i128),
    (MI_UINT16, 0, u16::MAX as i128),
    (MI_INT16, i16::MIN as i128, i16::MAX as i128),
    (MI_UINT32, 0, u32::MAX as i128),
    (MI_INT32, i32::MIN as i128, i32::MAX as i128),
];

/// Encode one named value as a complete `miMATRIX` element.
///
/// # Errors
/// Returns error if the name is invalid or the value exceeds format limits.
pub fn encode_value(
    name: &str,
    value: &Value,
    options: EncodeOptions,
) -> Result<Vec<u8>, CodecError> {
    check_name(name)?;
    let mut buf = BytesMut::new();
    put_matrix(&mut buf, name, value, options)?;
    Ok(buf.to_vec())
}

pub(crate) fn put_header(buf: &mut BytesMut) {
    let mut text = format!(
        "MATLAB 5.0 MAT-file, Platform: {}, Created by: octbridge {}",
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION")
    )
    .into_bytes();
    text.resize(HEADER_TEXT_LEN, b' ');
    buf.put_slice(&text);
    buf.put_bytes(0, 8);
    buf.put_u16_le(VERSION);
    buf.put_slice(b"IM");
}

pub(crate) fn put_matrix(
    buf: &mut BytesMut,
    name: &str,
    value: &Value,
    options: EncodeOptions,
) -> Result<(), CodecError> {
    let mut body = BytesMut::new();
    match value {
        Value::Empty => {
            put_flags(&mut body, MX_DOUBLE, 0, 0);
            put_dims(&mut body, &[0, 0])?;
            put_name(&mut body, name);
            put_element(&mut body, MI_DOUBLE, &[])?;
        }
        Value::Numeric(array) => put_numeric_array(&mut body, name, array, options)?,
        Value::Char(text) => put_char(&mut body, name, text)?,
        Value::Cell(cell) => {
            put_flags(&mut body, MX_CELL, 0, 0);
            put_dims(&mut body, cell.dims())?;
            put_name(&mut body, name);
            for item in cell.values() {
                put_matrix(&mut body, "", item, options)?;
            }
        }
        Value::Struct(fields) => {
            put_flags(&mut body, MX_STRUCT, 0, 0);
            put_dims(&mut body, &[1, 1])?;
            put_name(&mut body, name);
            let names: Vec<String> = fields.keys().cloned().collect();
            put_struct_body(&mut body, &names, std::slice::from_ref(fields), options)?;
        }
        Value::StructArray(array) => {
            put_flags(&mut body, MX_STRUCT, 0, 0);
            put_dims(&mut body, array.dims())?;
            put_name(&mut body, name);
            put_struct_body(&mut body, array.fields(), array.elements(), options)?;
        }
        Value::Sparse(sparse) => put_sparse(&mut body, name, sparse)?,
        Value::Ref(r) => {
            return Err(CodecError::UnsupportedType(format!(
                "engine reference {} inside a container",
                r.name()
            )));
        }
    }
    put_element(buf, MI_MATRIX, &body)
}

fn put_numeric_array(
    body: &mut BytesMut,
    name: &str,
    array: &NumericArray,
    options: EncodeOptions,
) -> Result<(), CodecError> {
    let to_float = options.convert_to_float && array.kind().is_integer();
    let real = if to_float {
        NumericData::Double(array.real().to_f64_vec())
    } else {
        array.real().clone()
    };
    let imag = array.imag().map(|imag| {
        if to_float {
            NumericData::Double(imag.to_f64_vec())
        } else {
            imag.clone()
        }
    });

    let mut flags = 0;
    if real.kind() == NumericKind::Logical {
        flags |= FLAG_LOGICAL;
    }
    if imag.is_some() {
        flags |= FLAG_COMPLEX;
    }
    put_flags(body, class_of(real.kind()), flags, 0);
    put_dims(body, array.dims())?;
    put_name(body, name);
    put_numeric(body, &real)?;
    if let Some(imag) = &imag {
        put_numeric(body, imag)?;
    }
    Ok(())
}

fn put_char(body: &mut BytesMut, name: &str, text: &str) -> Result<(), CodecError> {
    put_flags(body, MX_CHAR, 0, 0);
    if text.is_empty() {
        put_dims(body, &[0, 0])?;
        put_name(body, name);
        return put_element(body, MI_UINT16, &[]);
    }
    if text.is_ascii() {
        put_dims(body, &[1, text.len()])?;
        put_name(body, name);
        put_ints(body, MI_UINT16, text.bytes().map(i128::from))
    } else {
        // Characters outside ASCII travel as UTF-8 bytes, one array element per byte.
        put_dims(body, &[1, text.len()])?;
        put_name(body, name);
        put_element(body, MI_UTF8, text.as_bytes())
    }
}

fn put_struct_body(
    body: &mut BytesMut,
    fields: &[String],
    elements: &[BTreeMap<String, Value>],
    options: EncodeOptions,
) -> Result<(), CodecError> {
    for field in fields {
        check_name(field)?;
    }
    let name_len = fields.iter().map(String::len).max().unwrap_or(0) + 1;
    let name_len_i32 = i32::try_from(name_len)
        .map_err(|_| CodecError::TooLarge(format!("field name length {name_len}")))?;
    put_small_element(body, MI_INT32, &name_len_i32.to_le_bytes());

    let mut names = vec![0u8; name_len * fields.len()];
    for (i, field) in fields.iter().enumerate() {
        names[i * name_len..i * name_len + field.len()].copy_from_slice(field.as_bytes());
    }
    put_element(body, MI_INT8, &names)?;

    for element in elements {
        for field in fields {
            let value = element.get(field).unwrap_or(&Value::Empty);
            put_matrix(body, "", value, options)?;
        }
    }
    Ok(())
}

fn put_sparse(body: &mut BytesMut, name: &str, sparse: &SparseMatrix) -> Result<(), CodecError> {
    let nnz = u32::try_from(sparse.nnz())
        .map_err(|_| CodecError::TooLarge(format!("{} nonzeros", sparse.nnz())))?;
    let flags = if sparse.values().kind() == NumericKind::Logical {
        FLAG_LOGICAL
    } else {
        0
    };
    let (rows, cols) = sparse.shape();
    put_flags(body, MX_SPARSE, flags, nnz);
    put_dims(body, &[rows, cols])?;
    put_name(body, name);
    put_index_vector(body, sparse.row_idx())?;
    put_index_vector(body, sparse.col_ptr())?;
    put_numeric(body, sparse.values())
}

fn put_index_vector(body: &mut BytesMut, indices: &[usize]) -> Result<(), CodecError> {
    let values = indices
        .iter()
        .map(|&i| {
            i32::try_from(i)
                .map(i128::from)
                .map_err(|_| CodecError::TooLarge(format!("sparse index {i}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    put_ints(body, MI_INT32, values.into_iter())
}

const fn class_of(kind: NumericKind) -> u8 {
    match kind {
        NumericKind::Double => MX_DOUBLE,
        NumericKind::Single => MX_SINGLE,
        NumericKind::Int8 => MX_INT8,
        NumericKind::UInt8 | NumericKind::Logical => MX_UINT8,
        NumericKind::Int16 => MX_INT16,
        NumericKind::UInt16 => MX_UINT16,
        NumericKind::Int32 => MX_INT32,
        NumericKind::UInt32 => MX_UINT32,
        NumericKind::Int64 => MX_INT64,
        NumericKind::UInt64 => MX_UINT64,
    }
}

fn put_numeric(body: &mut BytesMut, data: &NumericData) -> Result<(), CodecError> {
    match data {
        NumericData::Double(v) => match float_storage(v.iter().copied(), 8) {
            #[allow(clippy::cast_possible_truncation)]
            Some(ty) => put_ints(body, ty, v.iter().map(|&x| x as i128)),
            None => {
                let mut raw = BytesMut::with_capacity(v.len() * 8);
                v.iter().for_each(|&x| raw.put_f64_le(x));
                put_element(body, MI_DOUBLE, &raw)
            }
        },
        NumericData::Single(v) => match float_storage(v.iter().map(|&x| f64::from(x)), 4) {
            #[allow(clippy::cast_possible_truncation)]
            Some(ty) => put_ints(body, ty, v.iter().map(|&x| x as i128)),
            None => {
                let mut raw = BytesMut::with_capacity(v.len() * 4);
                v.iter().for_each(|&x| raw.put_f32_le(x));
                put_element(body, MI_SINGLE, &raw)
            }
        },
        NumericData::Int8(v) => put_int_slice(body, v, MI_INT8),
        NumericData::UInt8(v) => put_int_slice(body, v, MI_UINT8),
        NumericData::Int16(v) => put_int_slice(body, v, MI_INT16),
        NumericData::UInt16(v) => put_int_slice(body, v, MI_UINT16),
        NumericData::Int32(v) => put_int_slice(body, v, MI_INT32),
        NumericData::UInt32(v) => put_int_slice(body, v, MI_UINT32),
        NumericData::Int64(v) => put_int_slice(body, v, MI_INT64),
        NumericData::UInt64(v) => put_int_slice(body, v, MI_UINT64),
        NumericData::Logical(v) => put_ints(body, MI_UINT8, v.iter().map(|&b| i128::from(b))),
    }
}

fn put_int_slice<T: Copy + Into<i128>>(
    body: &mut BytesMut,
    values: &[T],
    native: u32,
) -> Result<(), CodecError> {
    let range = values.iter().map(|&x| x.into()).fold(None, |acc: Option<(i128, i128)>, x| {
        Some(acc.map_or((x, x), |(lo, hi)| (lo.min(x), hi.max(x))))
    });
    let native_width = type_width(native).unwrap_or(8);
    let ty = range
        .and_then(|(lo, hi)| narrowest(lo, hi, native_width))
        .unwrap_or(native);
    put_ints(body, ty, values.iter().map(|&x| x.into()))
}

/// Integer storage for float data, if every value is an exactly representable integer.
fn float_storage(values: impl Iterator<Item = f64>, native_width: usize) -> Option<u32> {
    let mut range: Option<(f64, f64)> = None;
    for x in values {
        let exact = x.is_finite()
            && x.fract() == 0.0
            && !(x == 0.0 && x.is_sign_negative())
            && x.abs() <= f64::from(u32::MAX);
        if !exact {
            return None;
        }
        range = Some(range.map_or((x, x), |(lo, hi)| (lo.min(x), hi.max(x))));
    }
    let (lo, hi) = range?;
    #[allow(clippy::cast_possible_truncation)]
    narrowest(lo as i128, hi as i128, native_width)
}

fn narrowest(lo: i128, hi: i128, native_width: usize) -> Option<u32> {
    INT_CANDIDATES
        .iter()
        .find(|&&(ty, min, max)| {
            lo >= min && hi <= max && type_width(ty).is_some_and(|w| w < native_width)
        })
        .map(|&(ty, _, _)| ty)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn put_ints(
    body: &mut BytesMut,
    ty: u32,
    values: impl ExactSizeIterator<Item = i128>,
) -> Result<(), CodecError> {
    let width = type_width(ty).unwrap_or(8);
    let len = values.len() * width;
    let mut raw = BytesMut::with_capacity(len);
    for v in values {
        match ty {
            MI_INT8 => raw.put_i8(v as i8),
            MI_UINT8 => raw.put_u8(v as u8),
            MI_INT16 => raw.put_i16_le(v as i16),
            MI_UINT16 => raw.put_u16_le(v as u16),
            MI_INT32 => raw.put_i32_le(v as i32),
            MI_UINT32 => raw.put_u32_le(v as u32),
            MI_INT64 => raw.put_i64_le(v as i64),
            _ => raw.put_u64_le(v as u64),
        }
    }
    put_element(body, ty, &raw)
}

fn put_flags(body: &mut BytesMut, class: u8, flags: u32, nzmax: u32) {
    body.put_u32_le(MI_UINT32);
    body.put_u32_le(8);
    body.put_u32_le(u32::from(class) | flags);
    body.put_u32_le(nzmax);
}

fn put_dims(body: &mut BytesMut, dims: &[usize]) -> Result<(), CodecError> {
    let mut raw = BytesMut::with_capacity(dims.len() * 4);
    for &d in dims {
        let d = i32::try_from(d).map_err(|_| CodecError::TooLarge(format!("dimension {d}")))?;
        raw.put_i32_le(d);
    }
    put_element(body, MI_INT32, &raw)
}

#[allow(clippy::cast_possible_truncation)]
fn put_name(body: &mut BytesMut, name: &str) {
    // Names are validated ASCII identifiers and never exceed the length limit.
    body.put_u32_le(MI_INT8);
    body.put_u32_le(name.len() as u32);
    body.put_slice(name.as_bytes());
    body.put_bytes(0, padded(name.len()) - name.len());
}

fn put_element(buf: &mut BytesMut, ty: u32, payload: &[u8]) -> Result<(), CodecError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CodecError::TooLarge(format!("{} byte element", payload.len())))?;
    buf.put_u32_le(ty);
    buf.put_u32_le(len);
    buf.put_slice(payload);
    buf.put_bytes(0, padded(payload.len()) - payload.len());
    Ok(())
}

/// Small data element: type and length share the first word, payload fits in four bytes.
fn put_small_element(buf: &mut BytesMut, ty: u32, payload: &[u8; 4]) {
    buf.put_u32_le((4 << 16) | ty);
    buf.put_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        put_header(&mut buf);
        assert_eq!(buf.len(), 128);
        assert!(buf.starts_with(b"MATLAB 5.0 MAT-file"));
        assert_eq!(&buf[124..128], &[0x00, 0x01, b'I', b'M']);
    }

    #[test]
    fn test_integral_doubles_are_narrowed() {
        let mut buf = BytesMut::new();
        put_numeric(&mut buf, &NumericData::Double(vec![1.0, 2.0, 200.0])).unwrap();
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), MI_UINT8);
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 3);
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn test_fractional_and_negative_zero_stay_double() {
        let mut buf = BytesMut::new();
        put_numeric(&mut buf, &NumericData::Double(vec![1.5])).unwrap();
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), MI_DOUBLE);

        let mut buf = BytesMut::new();
        put_numeric(&mut buf, &NumericData::Double(vec![-0.0])).unwrap();
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), MI_DOUBLE);
    }

    #[test]
    fn test_int64_extremes_keep_native_storage() {
        let mut buf = BytesMut::new();
        put_numeric(&mut buf, &NumericData::Int64(vec![i64::MIN, 0])).unwrap();
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), MI_INT64);

        let mut buf = BytesMut::new();
        put_numeric(&mut buf, &NumericData::Int64(vec![-5, 7])).unwrap();
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), MI_INT8);
    }

    #[test]
    fn test_matrix_element_is_aligned() {
        let bytes = encode_value("x", &Value::from("hello"), EncodeOptions::default()).unwrap();
        assert_eq!(bytes.len() % 8, 0);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), MI_MATRIX);
    }

    #[test]
    fn test_invalid_variable_name() {
        let err = encode_value("not valid", &Value::Empty, EncodeOptions::default()).unwrap_err();
        assert!(matches!(err, CodecError::InvalidName(_)));
    }
}
