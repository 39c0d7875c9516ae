//! MAT level 5 reader.
//!
//! Accepts either byte order and both tag formats. Numeric storage types are
//! widened back to the array class named in the flags.

use std::collections::BTreeMap;

use bytes::Buf;
use octbridge_core::{
    CellArray, NumericArray, NumericData, NumericKind, SparseMatrix, StructArray, Value,
    value::element_count,
};

use crate::{
    CodecError,
    error::malformed,
    mat5::{
        Endian, FLAG_COMPLEX, FLAG_LOGICAL, MI_COMPRESSED, MI_DOUBLE, MI_INT8, MI_INT16,
        MI_INT32, MI_INT64, MI_MATRIX, MI_SINGLE, MI_UINT8, MI_UINT16, MI_UINT32, MI_UINT64,
        MI_UTF8, MI_UTF16, MI_UTF32, MX_CELL, MX_CHAR, MX_DOUBLE, MX_FUNCTION, MX_INT8, MX_INT16,
        MX_INT32, MX_INT64, MX_OBJECT, MX_OPAQUE, MX_SINGLE, MX_SPARSE, MX_STRUCT, MX_UINT8,
        MX_UINT16, MX_UINT32, MX_UINT64, padded, type_width,
    },
};

macro_rules! get {
    ($buf:expr, $endian:expr, $le:ident, $be:ident) => {
        match $endian {
            Endian::Little => $buf.$le(),
            Endian::Big => $buf.$be(),
        }
    };
}

struct Element<'a> {
    ty: u32,
    data: &'a [u8],
}

struct Cursor<'a> {
    buf: &'a [u8],
    endian: Endian,
}

impl<'a> Cursor<'a> {
    const fn new(buf: &'a [u8], endian: Endian) -> Self {
        Self { buf, endian }
    }

    const fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        if self.buf.remaining() < 4 {
            return Err(malformed("truncated element tag"));
        }
        Ok(get!(self.buf, self.endian, get_u32_le, get_u32))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(malformed(format!(
                "element needs {n} bytes, {} left",
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn element(&mut self) -> Result<Element<'a>, CodecError> {
        let word = self.u32()?;
        let small_len = (word >> 16) as usize;
        if small_len != 0 {
            if small_len > 4 {
                return Err(malformed(format!("small element of {small_len} bytes")));
            }
            let raw = self.take(4)?;
            return Ok(Element {
                ty: word & 0xFFFF,
                data: &raw[..small_len],
            });
        }

        let ty = word;
        let len = self.u32()? as usize;
        if ty == MI_COMPRESSED {
            return Err(CodecError::UnsupportedType("compressed data element".into()));
        }
        let data = self.take(len)?;
        let pad = (padded(len) - len).min(self.buf.len());
        self.buf.advance(pad);
        Ok(Element { ty, data })
    }

    fn expect(&mut self, ty: u32, what: &str) -> Result<Element<'a>, CodecError> {
        let element = self.element()?;
        if element.ty == ty {
            Ok(element)
        } else {
            Err(malformed(format!(
                "{what}: expected element type {ty}, found {}",
                element.ty
            )))
        }
    }
}

/// Numeric payload in its widest lossless form.
enum Raw {
    Ints(Vec<i128>),
    F64(Vec<f64>),
    F32(Vec<f32>),
}

impl Raw {
    fn read(element: &Element<'_>, endian: Endian) -> Result<Self, CodecError> {
        let width = type_width(element.ty)
            .ok_or_else(|| malformed(format!("element type {} is not numeric", element.ty)))?;
        if element.data.len() % width != 0 {
            return Err(malformed(format!(
                "{} bytes is not a multiple of {width}",
                element.data.len()
            )));
        }
        let count = element.data.len() / width;
        let mut buf = element.data;
        let raw = match element.ty {
            MI_DOUBLE => {
                Self::F64((0..count).map(|_| get!(buf, endian, get_f64_le, get_f64)).collect())
            }
            MI_SINGLE => {
                Self::F32((0..count).map(|_| get!(buf, endian, get_f32_le, get_f32)).collect())
            }
            ty => Self::Ints(
                (0..count)
                    .map(|_| match ty {
                        MI_INT8 => i128::from(buf.get_i8()),
                        MI_UINT8 | MI_UTF8 => i128::from(buf.get_u8()),
                        MI_INT16 => i128::from(get!(buf, endian, get_i16_le, get_i16)),
                        MI_UINT16 | MI_UTF16 => i128::from(get!(buf, endian, get_u16_le, get_u16)),
                        MI_INT32 => i128::from(get!(buf, endian, get_i32_le, get_i32)),
                        MI_UINT32 | MI_UTF32 => i128::from(get!(buf, endian, get_u32_le, get_u32)),
                        MI_INT64 => i128::from(get!(buf, endian, get_i64_le, get_i64)),
                        _ => i128::from(get!(buf, endian, get_u64_le, get_u64)),
                    })
                    .collect(),
            ),
        };
        Ok(raw)
    }

    fn len(&self) -> usize {
        match self {
            Self::Ints(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::F32(v) => v.len(),
        }
    }

    fn truncate(&mut self, len: usize) {
        match self {
            Self::Ints(v) => v.truncate(len),
            Self::F64(v) => v.truncate(len),
            Self::F32(v) => v.truncate(len),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn into_f64(self) -> Vec<f64> {
        match self {
            Self::Ints(v) => v.into_iter().map(|x| x as f64).collect(),
            Self::F64(v) => v,
            Self::F32(v) => v.into_iter().map(f64::from).collect(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn into_ints(self) -> Vec<i128> {
        match self {
            Self::Ints(v) => v,
            Self::F64(v) => v.into_iter().map(|x| x as i128).collect(),
            Self::F32(v) => v.into_iter().map(|x| x as i128).collect(),
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn into_data(self, kind: NumericKind) -> NumericData {
        macro_rules! ints {
            ($variant:ident, $t:ty) => {
                NumericData::$variant(self.into_ints().into_iter().map(|v| v as $t).collect())
            };
        }
        match kind {
            NumericKind::Double => NumericData::Double(self.into_f64()),
            NumericKind::Single => match self {
                Self::F32(v) => NumericData::Single(v),
                other => {
                    NumericData::Single(other.into_f64().into_iter().map(|x| x as f32).collect())
                }
            },
            NumericKind::Int8 => ints!(Int8, i8),
            NumericKind::UInt8 => ints!(UInt8, u8),
            NumericKind::Int16 => ints!(Int16, i16),
            NumericKind::UInt16 => ints!(UInt16, u16),
            NumericKind::Int32 => ints!(Int32, i32),
            NumericKind::UInt32 => ints!(UInt32, u32),
            NumericKind::Int64 => ints!(Int64, i64),
            NumericKind::UInt64 => ints!(UInt64, u64),
            NumericKind::Logical => match self {
                Self::Ints(v) => NumericData::Logical(v.into_iter().map(|x| x != 0).collect()),
                other => {
                    NumericData::Logical(other.into_f64().into_iter().map(|x| x != 0.0).collect())
                }
            },
        }
    }
}

const fn numeric_kind(class: u8) -> Option<NumericKind> {
    Some(match class {
        MX_DOUBLE => NumericKind::Double,
        MX_SINGLE => NumericKind::Single,
        MX_INT8 => NumericKind::Int8,
        MX_UINT8 => NumericKind::UInt8,
        MX_INT16 => NumericKind::Int16,
        MX_UINT16 => NumericKind::UInt16,
        MX_INT32 => NumericKind::Int32,
        MX_UINT32 => NumericKind::UInt32,
        MX_INT64 => NumericKind::Int64,
        MX_UINT64 => NumericKind::UInt64,
        _ => return None,
    })
}

/// Decode one complete `miMATRIX` element, tag included.
///
/// # Errors
/// Returns error on malformed data or an array class with no value mapping.
pub fn decode_value(bytes: &[u8], endian: Endian) -> Result<(String, Value), CodecError> {
    let mut cursor = Cursor::new(bytes, endian);
    let element = cursor.expect(MI_MATRIX, "variable")?;
    decode_matrix(element.data, endian)
}

/// Decode every variable in a file body (everything after the header).
pub(crate) fn read_variables(
    body: &[u8],
    endian: Endian,
) -> Result<Vec<(String, Value)>, CodecError> {
    let mut cursor = Cursor::new(body, endian);
    let mut vars = Vec::new();
    while !cursor.is_empty() {
        let element = cursor.element()?;
        if element.ty != MI_MATRIX {
            tracing::debug!(ty = element.ty, "skipping top-level element");
            continue;
        }
        vars.push(decode_matrix(element.data, endian)?);
    }
    Ok(vars)
}

fn decode_matrix(data: &[u8], endian: Endian) -> Result<(String, Value), CodecError> {
    let mut cursor = Cursor::new(data, endian);
    if cursor.is_empty() {
        // Zero-length matrix elements appear for unset cell entries.
        return Ok((String::new(), Value::Empty));
    }

    let flags = cursor.expect(MI_UINT32, "array flags")?;
    if flags.data.len() != 8 {
        return Err(malformed("array flags must be 8 bytes"));
    }
    let mut flag_buf = flags.data;
    let word = get!(flag_buf, endian, get_u32_le, get_u32);
    let class = (word & 0xFF) as u8;
    let complex = word & FLAG_COMPLEX != 0;
    let logical = word & FLAG_LOGICAL != 0;

    match class {
        MX_OBJECT => return Err(CodecError::UnsupportedType("object".into())),
        MX_FUNCTION => return Err(CodecError::UnsupportedType("function handle".into())),
        MX_OPAQUE => return Err(CodecError::UnsupportedType("opaque object".into())),
        _ => {}
    }

    let dims = Raw::read(&cursor.expect(MI_INT32, "dimensions")?, endian)?
        .into_ints()
        .into_iter()
        .map(|d| usize::try_from(d).map_err(|_| malformed(format!("negative dimension {d}"))))
        .collect::<Result<Vec<_>, _>>()?;
    if dims.len() < 2 {
        return Err(malformed(format!("{} dimensions", dims.len())));
    }
    let name_el = cursor.element()?;
    if !matches!(name_el.ty, MI_INT8 | MI_UINT8) {
        return Err(malformed(format!("array name has element type {}", name_el.ty)));
    }
    let name = String::from_utf8_lossy(name_el.data).into_owned();

    let value = match class {
        MX_CELL => {
            let count = element_count(&dims);
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                let item = cursor.expect(MI_MATRIX, "cell element")?;
                values.push(decode_matrix(item.data, endian)?.1);
            }
            Value::Cell(CellArray::new(&dims, values)?)
        }
        MX_STRUCT => decode_struct(&mut cursor, &dims, endian)?,
        MX_CHAR => decode_char(&mut cursor, &dims, endian)?,
        MX_SPARSE => {
            if complex {
                return Err(CodecError::UnsupportedType("complex sparse matrix".into()));
            }
            decode_sparse(&mut cursor, &dims, logical, endian)?
        }
        class => {
            let kind = numeric_kind(class)
                .ok_or_else(|| malformed(format!("unknown array class {class}")))?;
            let kind = if logical { NumericKind::Logical } else { kind };
            let count = element_count(&dims);
            let real = read_numeric(&mut cursor, kind, count, endian)?;
            if complex {
                let imag = read_numeric(&mut cursor, kind, count, endian)?;
                Value::Numeric(NumericArray::complex(&dims, real, imag)?)
            } else if kind == NumericKind::Double && dims == [0, 0] {
                Value::Empty
            } else {
                Value::Numeric(NumericArray::new(&dims, real)?)
            }
        }
    };
    Ok((name, value))
}

fn read_numeric(
    cursor: &mut Cursor<'_>,
    kind: NumericKind,
    count: usize,
    endian: Endian,
) -> Result<NumericData, CodecError> {
    let raw = Raw::read(&cursor.element()?, endian)?;
    if raw.len() != count {
        return Err(malformed(format!(
            "expected {count} {} elements, found {}",
            kind.class_name(),
            raw.len()
        )));
    }
    Ok(raw.into_data(kind))
}

fn decode_struct(
    cursor: &mut Cursor<'_>,
    dims: &[usize],
    endian: Endian,
) -> Result<Value, CodecError> {
    let name_len = Raw::read(&cursor.expect(MI_INT32, "field name length")?, endian)?
        .into_ints()
        .first()
        .copied()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| malformed("field name length"))?;
    let names = cursor.element()?;
    let fields: Vec<String> = if name_len == 0 {
        Vec::new()
    } else {
        names
            .data
            .chunks(name_len)
            .map(|chunk| {
                let end = chunk.iter().position(|&b| b == 0).unwrap_or(chunk.len());
                String::from_utf8_lossy(&chunk[..end]).into_owned()
            })
            .collect()
    };

    let count = element_count(dims);
    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        let mut record = BTreeMap::new();
        for field in &fields {
            let item = cursor.expect(MI_MATRIX, "struct field")?;
            record.insert(field.clone(), decode_matrix(item.data, endian)?.1);
        }
        elements.push(record);
    }

    if dims == [1, 1] {
        Ok(Value::Struct(elements.pop().unwrap_or_default()))
    } else {
        Ok(Value::StructArray(StructArray::new(dims, fields, elements)?))
    }
}

fn decode_char(
    cursor: &mut Cursor<'_>,
    dims: &[usize],
    endian: Endian,
) -> Result<Value, CodecError> {
    let element = cursor.element()?;
    let encoding = TextEncoding::of(element.ty);
    let units: Vec<u32> = if element.ty == MI_UTF8 {
        element.data.iter().map(|&b| u32::from(b)).collect()
    } else {
        Raw::read(&element, endian)?
            .into_ints()
            .into_iter()
            .map(|u| u32::try_from(u).unwrap_or(u32::from(char::REPLACEMENT_CHARACTER)))
            .collect()
    };

    let rows = dims[0];
    if rows == 0 || units.is_empty() {
        return Ok(Value::Char(String::new()));
    }
    if units.len() % rows != 0 {
        return Err(malformed(format!("{} characters in {rows} rows", units.len())));
    }
    let cols = units.len() / rows;
    if rows == 1 {
        return Ok(Value::Char(encoding.decode(&units)));
    }

    // Column-major storage: row i is every rows-th unit starting at i.
    let lines = (0..rows)
        .map(|i| {
            let row: Vec<u32> = (0..cols).map(|j| units[i + j * rows]).collect();
            Value::Char(encoding.decode(&row))
        })
        .collect();
    Ok(Value::Cell(CellArray::new(&[rows, 1], lines)?))
}

/// How the units of a character element map to text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextEncoding {
    Utf8,
    Utf16,
    CodePoints,
    /// Untagged bytes: UTF-8 when valid, otherwise Latin-1.
    Bytes,
}

impl TextEncoding {
    const fn of(ty: u32) -> Self {
        match ty {
            MI_UTF8 => Self::Utf8,
            MI_UINT16 | MI_UTF16 | MI_INT16 => Self::Utf16,
            MI_UINT32 | MI_UTF32 | MI_INT32 | MI_UINT64 | MI_INT64 => Self::CodePoints,
            _ => Self::Bytes,
        }
    }

    fn decode(self, units: &[u32]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(&narrow(units)).into_owned(),
            Self::Bytes => match String::from_utf8(narrow(units)) {
                Ok(text) => text,
                Err(err) => err.into_bytes().into_iter().map(char::from).collect(),
            },
            Self::Utf16 => {
                let wide: Vec<u16> = units
                    .iter()
                    .map(|&u| u16::try_from(u).unwrap_or(0xFFFD))
                    .collect();
                String::from_utf16_lossy(&wide)
            }
            Self::CodePoints => units
                .iter()
                .map(|&u| char::from_u32(u).unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect(),
        }
    }
}

fn narrow(units: &[u32]) -> Vec<u8> {
    units
        .iter()
        .map(|&u| u8::try_from(u).unwrap_or(b'?'))
        .collect()
}

fn decode_sparse(
    cursor: &mut Cursor<'_>,
    dims: &[usize],
    logical: bool,
    endian: Endian,
) -> Result<Value, CodecError> {
    if dims.len() != 2 {
        return Err(malformed("sparse matrix must be two-dimensional"));
    }
    let (rows, cols) = (dims[0], dims[1]);
    let to_indices = |raw: Raw| {
        raw.into_ints()
            .into_iter()
            .map(|i| usize::try_from(i).map_err(|_| malformed(format!("sparse index {i}"))))
            .collect::<Result<Vec<_>, _>>()
    };
    let mut row_idx = to_indices(Raw::read(&cursor.element()?, endian)?)?;
    let col_ptr = to_indices(Raw::read(&cursor.element()?, endian)?)?;
    let mut values = Raw::read(&cursor.element()?, endian)?;

    // Storage may be allocated for more than the used nonzeros.
    let nnz = col_ptr
        .get(cols)
        .copied()
        .ok_or_else(|| malformed(format!("{} column pointers for {cols} columns", col_ptr.len())))?;
    row_idx.truncate(nnz);
    values.truncate(nnz);

    let kind = if logical {
        NumericKind::Logical
    } else {
        NumericKind::Double
    };
    let sparse = SparseMatrix::new(rows, cols, col_ptr, row_idx, values.into_data(kind))?;
    Ok(Value::Sparse(sparse))
}
