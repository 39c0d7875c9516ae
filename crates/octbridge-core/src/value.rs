//! Host-native values exchanged with the engine.
//!
//! Arrays are stored column-major, the way the engine lays them out, and
//! always carry at least two dimensions. Trailing singleton dimensions past
//! the second are dropped on construction so that a value read back from
//! the engine compares equal to the one that was sent.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

/// Value construction error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValueError {
    #[error("shape {dims:?} holds {expected} elements but {actual} were given")]
    ShapeMismatch {
        dims: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("imaginary part does not match real part: {0}")]
    ImagMismatch(String),
    #[error("struct array elements do not share the field set {0:?}")]
    FieldMismatch(Vec<String>),
    #[error("invalid sparse layout: {0}")]
    InvalidSparse(String),
    #[error("unsupported host type: {0}")]
    UnsupportedType(String),
}

/// Element kind of a dense numeric array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericKind {
    Double,
    Single,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Logical,
}

impl NumericKind {
    /// Class name the engine reports for this kind.
    #[must_use]
    pub const fn class_name(self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::Single => "single",
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
            Self::Logical => "logical",
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        !matches!(self, Self::Double | Self::Single | Self::Logical)
    }
}

/// Typed element storage of a numeric array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum NumericData {
    Double(Vec<f64>),
    Single(Vec<f32>),
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Logical(Vec<bool>),
}

macro_rules! each_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            NumericData::Double($v) => $body,
            NumericData::Single($v) => $body,
            NumericData::Int8($v) => $body,
            NumericData::UInt8($v) => $body,
            NumericData::Int16($v) => $body,
            NumericData::UInt16($v) => $body,
            NumericData::Int32($v) => $body,
            NumericData::UInt32($v) => $body,
            NumericData::Int64($v) => $body,
            NumericData::UInt64($v) => $body,
            NumericData::Logical($v) => $body,
        }
    };
}

impl NumericData {
    #[must_use]
    pub const fn kind(&self) -> NumericKind {
        match self {
            Self::Double(_) => NumericKind::Double,
            Self::Single(_) => NumericKind::Single,
            Self::Int8(_) => NumericKind::Int8,
            Self::UInt8(_) => NumericKind::UInt8,
            Self::Int16(_) => NumericKind::Int16,
            Self::UInt16(_) => NumericKind::UInt16,
            Self::Int32(_) => NumericKind::Int32,
            Self::UInt32(_) => NumericKind::UInt32,
            Self::Int64(_) => NumericKind::Int64,
            Self::UInt64(_) => NumericKind::UInt64,
            Self::Logical(_) => NumericKind::Logical,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        each_data!(self, v => v.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i` widened to `f64`. Large 64-bit integers lose precision.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_f64(&self, i: usize) -> Option<f64> {
        match self {
            Self::Double(v) => v.get(i).copied(),
            Self::Single(v) => v.get(i).map(|x| f64::from(*x)),
            Self::Int8(v) => v.get(i).map(|x| f64::from(*x)),
            Self::UInt8(v) => v.get(i).map(|x| f64::from(*x)),
            Self::Int16(v) => v.get(i).map(|x| f64::from(*x)),
            Self::UInt16(v) => v.get(i).map(|x| f64::from(*x)),
            Self::Int32(v) => v.get(i).map(|x| f64::from(*x)),
            Self::UInt32(v) => v.get(i).map(|x| f64::from(*x)),
            Self::Int64(v) => v.get(i).map(|x| *x as f64),
            Self::UInt64(v) => v.get(i).map(|x| *x as f64),
            Self::Logical(v) => v.get(i).map(|x| if *x { 1.0 } else { 0.0 }),
        }
    }

    /// All elements widened to `f64`.
    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.len()).filter_map(|i| self.get_f64(i)).collect()
    }

    /// Zero-filled storage of the given kind.
    #[must_use]
    pub fn zeros(kind: NumericKind, len: usize) -> Self {
        match kind {
            NumericKind::Double => Self::Double(vec![0.0; len]),
            NumericKind::Single => Self::Single(vec![0.0; len]),
            NumericKind::Int8 => Self::Int8(vec![0; len]),
            NumericKind::UInt8 => Self::UInt8(vec![0; len]),
            NumericKind::Int16 => Self::Int16(vec![0; len]),
            NumericKind::UInt16 => Self::UInt16(vec![0; len]),
            NumericKind::Int32 => Self::Int32(vec![0; len]),
            NumericKind::UInt32 => Self::UInt32(vec![0; len]),
            NumericKind::Int64 => Self::Int64(vec![0; len]),
            NumericKind::UInt64 => Self::UInt64(vec![0; len]),
            NumericKind::Logical => Self::Logical(vec![false; len]),
        }
    }
}

// Floats compare by bit pattern: NaN payloads and signed zeros must survive a round trip.
impl PartialEq for NumericData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Double(a), Self::Double(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Self::Single(a), Self::Single(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Self::Int8(a), Self::Int8(b)) => a == b,
            (Self::UInt8(a), Self::UInt8(b)) => a == b,
            (Self::Int16(a), Self::Int16(b)) => a == b,
            (Self::UInt16(a), Self::UInt16(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::UInt32(a), Self::UInt32(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::UInt64(a), Self::UInt64(b)) => a == b,
            (Self::Logical(a), Self::Logical(b)) => a == b,
            _ => false,
        }
    }
}

macro_rules! data_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Vec<$t>> for NumericData {
                fn from(v: Vec<$t>) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

data_from!(
    f64 => Double,
    f32 => Single,
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    bool => Logical,
);

/// Pad to two dimensions and drop trailing singletons past the second.
#[must_use]
pub fn normalize_dims(dims: &[usize]) -> Vec<usize> {
    let mut out: Vec<usize> = match dims.len() {
        0 => vec![1, 1],
        1 => vec![1, dims[0]],
        _ => dims.to_vec(),
    };
    while out.len() > 2 && out.last() == Some(&1) {
        out.pop();
    }
    out
}

/// Number of elements described by a shape.
#[must_use]
pub fn element_count(dims: &[usize]) -> usize {
    dims.iter().product()
}

fn check_len(dims: &[usize], actual: usize) -> Result<(), ValueError> {
    let expected = element_count(dims);
    if expected == actual {
        Ok(())
    } else {
        Err(ValueError::ShapeMismatch {
            dims: dims.to_vec(),
            expected,
            actual,
        })
    }
}

/// Dense N-dimensional numeric array, column-major.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray {
    dims: Vec<usize>,
    real: NumericData,
    imag: Option<NumericData>,
}

impl NumericArray {
    /// Create a real array.
    ///
    /// # Errors
    /// Returns error if the element count does not match the shape.
    pub fn new(dims: &[usize], real: impl Into<NumericData>) -> Result<Self, ValueError> {
        let dims = normalize_dims(dims);
        let real = real.into();
        check_len(&dims, real.len())?;
        Ok(Self {
            dims,
            real,
            imag: None,
        })
    }

    /// Create a complex array. Both parts must share kind and length.
    ///
    /// # Errors
    /// Returns error on a shape mismatch or a logical imaginary part.
    pub fn complex(
        dims: &[usize],
        real: impl Into<NumericData>,
        imag: impl Into<NumericData>,
    ) -> Result<Self, ValueError> {
        let mut array = Self::new(dims, real)?;
        let imag = imag.into();
        if imag.kind() != array.real.kind() {
            return Err(ValueError::ImagMismatch(format!(
                "{} real part with {} imaginary part",
                array.real.kind().class_name(),
                imag.kind().class_name()
            )));
        }
        if imag.kind() == NumericKind::Logical {
            return Err(ValueError::ImagMismatch("logical arrays cannot be complex".into()));
        }
        check_len(&array.dims, imag.len())?;
        array.imag = Some(imag);
        Ok(array)
    }

    /// A 1x1 double.
    #[must_use]
    pub fn scalar(x: f64) -> Self {
        Self {
            dims: vec![1, 1],
            real: NumericData::Double(vec![x]),
            imag: None,
        }
    }

    /// A 1xN row vector.
    #[must_use]
    pub fn row(data: impl Into<NumericData>) -> Self {
        let real = data.into();
        Self {
            dims: vec![1, real.len()],
            real,
            imag: None,
        }
    }

    /// An all-zero double matrix.
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            dims: vec![rows, cols],
            real: NumericData::Double(vec![0.0; rows * cols]),
            imag: None,
        }
    }

    /// Build a double matrix from row-major nested rows, e.g. `[[1, 2], [3, 4]]`.
    ///
    /// # Errors
    /// Returns error if the rows are ragged.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, ValueError> {
        let nrows = rows.len();
        let ncols = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|r| r.len() != ncols) {
            return Err(ValueError::ShapeMismatch {
                dims: vec![nrows, ncols],
                expected: ncols,
                actual: bad.len(),
            });
        }
        let mut data = Vec::with_capacity(nrows * ncols);
        for c in 0..ncols {
            for row in rows {
                data.push(row[c]);
            }
        }
        Self::new(&[nrows, ncols], data)
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub const fn kind(&self) -> NumericKind {
        self.real.kind()
    }

    #[must_use]
    pub const fn real(&self) -> &NumericData {
        &self.real
    }

    #[must_use]
    pub const fn imag(&self) -> Option<&NumericData> {
        self.imag.as_ref()
    }

    #[must_use]
    pub const fn is_complex(&self) -> bool {
        self.imag.is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.real.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.real.is_empty()
    }

    /// Real part of the element at a (row, col, ...) subscript, widened to `f64`.
    #[must_use]
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        let mut offset = 0;
        let mut stride = 1;
        for (axis, &extent) in self.dims.iter().enumerate() {
            let i = index.get(axis).copied().unwrap_or(0);
            if i >= extent {
                return None;
            }
            offset += i * stride;
            stride *= extent;
        }
        if index.len() > self.dims.len() && index[self.dims.len()..].iter().any(|&i| i != 0) {
            return None;
        }
        self.real.get_f64(offset)
    }

    /// Real part as a row-major vector of rows. Only meaningful for 2-D arrays.
    #[must_use]
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        let (nrows, ncols) = (self.dims[0], self.dims[1]);
        (0..nrows)
            .map(|r| {
                (0..ncols)
                    .filter_map(|c| self.real.get_f64(c * nrows + r))
                    .collect()
            })
            .collect()
    }

    /// Split into shape, real part and optional imaginary part.
    #[must_use]
    pub fn into_parts(self) -> (Vec<usize>, NumericData, Option<NumericData>) {
        (self.dims, self.real, self.imag)
    }
}

/// Cell array of heterogeneous values, column-major.
#[derive(Debug, Clone, PartialEq)]
pub struct CellArray {
    dims: Vec<usize>,
    values: Vec<Value>,
}

impl CellArray {
    /// Create a cell array with an explicit shape.
    ///
    /// # Errors
    /// Returns error if the element count does not match the shape.
    pub fn new(dims: &[usize], values: Vec<Value>) -> Result<Self, ValueError> {
        let dims = normalize_dims(dims);
        check_len(&dims, values.len())?;
        Ok(Self { dims, values })
    }

    /// A 1xN cell row.
    #[must_use]
    pub fn row(values: Vec<Value>) -> Self {
        Self {
            dims: vec![1, values.len()],
            values,
        }
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Array of records sharing one field set.
#[derive(Debug, Clone, PartialEq)]
pub struct StructArray {
    dims: Vec<usize>,
    fields: Vec<String>,
    elements: Vec<BTreeMap<String, Value>>,
}

impl StructArray {
    /// Create a struct array with an explicit shape and field set.
    ///
    /// # Errors
    /// Returns error on a shape mismatch or an element with a different field set.
    pub fn new(
        dims: &[usize],
        fields: Vec<String>,
        elements: Vec<BTreeMap<String, Value>>,
    ) -> Result<Self, ValueError> {
        let dims = normalize_dims(dims);
        check_len(&dims, elements.len())?;
        let fields: Vec<String> = fields.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        for element in &elements {
            if !element.keys().eq(fields.iter()) {
                return Err(ValueError::FieldMismatch(fields));
            }
        }
        Ok(Self {
            dims,
            fields,
            elements,
        })
    }

    /// A 1xN struct array; the field set is taken from the first record.
    ///
    /// # Errors
    /// Returns error if the records do not share the same fields.
    pub fn from_records(records: Vec<BTreeMap<String, Value>>) -> Result<Self, ValueError> {
        let fields = records
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        Self::new(&[1, records.len()], fields, records)
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    #[must_use]
    pub fn elements(&self) -> &[BTreeMap<String, Value>] {
        &self.elements
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn into_elements(self) -> Vec<BTreeMap<String, Value>> {
        self.elements
    }
}

/// Two-dimensional sparse matrix in compressed sparse column layout.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    values: NumericData,
}

impl SparseMatrix {
    /// Create from raw CSC parts. Values must be double or logical.
    ///
    /// # Errors
    /// Returns error if the layout is inconsistent.
    pub fn new(
        rows: usize,
        cols: usize,
        col_ptr: Vec<usize>,
        row_idx: Vec<usize>,
        values: impl Into<NumericData>,
    ) -> Result<Self, ValueError> {
        let values = values.into();
        if !matches!(values.kind(), NumericKind::Double | NumericKind::Logical) {
            return Err(ValueError::UnsupportedType(format!(
                "{} sparse matrix",
                values.kind().class_name()
            )));
        }
        if col_ptr.len() != cols + 1 || col_ptr.first() != Some(&0) {
            return Err(ValueError::InvalidSparse(format!(
                "column pointer length {} for {cols} columns",
                col_ptr.len()
            )));
        }
        let nnz = col_ptr[cols];
        if row_idx.len() != nnz || values.len() != nnz {
            return Err(ValueError::InvalidSparse(format!(
                "{nnz} nonzeros but {} row indices and {} values",
                row_idx.len(),
                values.len()
            )));
        }
        if col_ptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(ValueError::InvalidSparse("decreasing column pointers".into()));
        }
        for c in 0..cols {
            let (start, end) = (col_ptr[c], col_ptr[c + 1]);
            let column = &row_idx[start..end];
            if column.iter().any(|&r| r >= rows) || column.windows(2).any(|w| w[0] >= w[1]) {
                return Err(ValueError::InvalidSparse(format!(
                    "row indices of column {c} out of range or unsorted"
                )));
            }
        }
        Ok(Self {
            rows,
            cols,
            col_ptr,
            row_idx,
            values,
        })
    }

    /// Build a double sparse matrix from `(row, col, value)` triplets.
    ///
    /// # Errors
    /// Returns error on out-of-range or duplicate entries.
    pub fn from_triplets(
        rows: usize,
        cols: usize,
        triplets: &[(usize, usize, f64)],
    ) -> Result<Self, ValueError> {
        let mut sorted = triplets.to_vec();
        sorted.sort_by_key(|&(r, c, _)| (c, r));
        let mut col_ptr = vec![0; cols + 1];
        let mut row_idx = Vec::with_capacity(sorted.len());
        let mut values = Vec::with_capacity(sorted.len());
        for &(r, c, v) in &sorted {
            if c >= cols {
                return Err(ValueError::InvalidSparse(format!("column {c} out of range")));
            }
            col_ptr[c + 1] += 1;
            row_idx.push(r);
            values.push(v);
        }
        for c in 0..cols {
            col_ptr[c + 1] += col_ptr[c];
        }
        Self::new(rows, cols, col_ptr, row_idx, values)
    }

    #[must_use]
    pub const fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[must_use]
    pub fn nnz(&self) -> usize {
        self.row_idx.len()
    }

    #[must_use]
    pub fn col_ptr(&self) -> &[usize] {
        &self.col_ptr
    }

    #[must_use]
    pub fn row_idx(&self) -> &[usize] {
        &self.row_idx
    }

    #[must_use]
    pub const fn values(&self) -> &NumericData {
        &self.values
    }

    /// Value at `(row, col)`, zero when not stored.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        let (start, end) = (self.col_ptr[col], self.col_ptr[col + 1]);
        Some(
            self.row_idx[start..end]
                .binary_search(&row)
                .ok()
                .and_then(|k| self.values.get_f64(start + k))
                .unwrap_or(0.0),
        )
    }

    /// Expand to a dense double array.
    #[must_use]
    pub fn to_dense(&self) -> NumericArray {
        let mut data = vec![0.0; self.rows * self.cols];
        for c in 0..self.cols {
            for k in self.col_ptr[c]..self.col_ptr[c + 1] {
                data[c * self.rows + self.row_idx[k]] = self.values.get_f64(k).unwrap_or(0.0);
            }
        }
        NumericArray {
            dims: vec![self.rows, self.cols],
            real: NumericData::Double(data),
            imag: None,
        }
    }
}

/// What an [`EngineRef`] stands for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefKind {
    /// A base-workspace variable whose value cannot be transferred.
    Variable,
    /// A function on the engine's path, passed as a handle.
    Function,
    /// A class instance held in a base-workspace variable.
    Object { class: String },
}

/// A value that stays inside the engine, named rather than copied.
///
/// Passed as a call argument, the engine substitutes the value it names
/// before the call runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineRef {
    name: String,
    kind: RefKind,
}

impl EngineRef {
    #[must_use]
    pub fn variable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RefKind::Variable,
        }
    }

    #[must_use]
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RefKind::Function,
        }
    }

    #[must_use]
    pub fn object(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RefKind::Object {
                class: class.into(),
            },
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn kind(&self) -> &RefKind {
        &self.kind
    }

    /// Engine expression that yields the referenced value in the base workspace.
    #[must_use]
    pub fn address(&self) -> String {
        match self.kind {
            RefKind::Function => format!("@{}", self.name),
            RefKind::Variable | RefKind::Object { .. } => self.name.clone(),
        }
    }
}

/// A value that can cross the bridge.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// The engine's canonical empty matrix (`[]`).
    #[default]
    Empty,
    Numeric(NumericArray),
    /// A single-row character array.
    Char(String),
    Cell(CellArray),
    Struct(BTreeMap<String, Value>),
    StructArray(StructArray),
    Sparse(SparseMatrix),
    /// Something left in the engine. Only valid as a top-level call argument.
    Ref(EngineRef),
}

impl Value {
    /// Engine class name of this value.
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Empty => "double",
            Self::Numeric(a) => a.kind().class_name(),
            Self::Char(_) => "char",
            Self::Cell(_) => "cell",
            Self::Struct(_) | Self::StructArray(_) => "struct",
            Self::Sparse(s) => s.values().kind().class_name(),
            Self::Ref(r) => match r.kind() {
                RefKind::Function => "function_handle",
                RefKind::Object { .. } => "object",
                RefKind::Variable => "reference",
            },
        }
    }

    #[must_use]
    pub const fn is_empty_placeholder(&self) -> bool {
        matches!(self, Self::Empty)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Char(s) => Some(s),
            _ => None,
        }
    }

    /// Real 1x1 numeric value widened to `f64`.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Numeric(a) if a.len() == 1 => a.real().get_f64(0),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_engine_ref(&self) -> Option<&EngineRef> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_numeric(&self) -> Option<&NumericArray> {
        match self {
            Self::Numeric(a) => Some(a),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_cell(&self) -> Option<&CellArray> {
        match self {
            Self::Cell(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// Field of a scalar struct.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Self> {
        self.as_struct().and_then(|s| s.get(name))
    }

    /// Convert a JSON document into a value.
    ///
    /// Numbers become doubles, arrays of numbers become row vectors, arrays of
    /// equal-length numeric rows become matrices, arrays of objects sharing
    /// their keys become struct arrays, and other arrays become cell rows.
    ///
    /// # Errors
    /// Returns error if a nested struct array cannot be built.
    pub fn from_json(json: &JsonValue) -> Result<Self, ValueError> {
        Ok(match json {
            JsonValue::Null => Self::Empty,
            JsonValue::Bool(b) => Self::from(*b),
            JsonValue::Number(n) => n
                .as_f64()
                .map(Self::from)
                .ok_or_else(|| ValueError::UnsupportedType(format!("json number {n}")))?,
            JsonValue::String(s) => Self::Char(s.clone()),
            JsonValue::Array(items) => json_array(items)?,
            JsonValue::Object(map) => Self::Struct(json_object(map)?),
        })
    }

    /// Render as JSON for display. Non-finite numbers become `null`.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Empty => JsonValue::Null,
            Self::Numeric(a) => numeric_json(a),
            Self::Char(s) => JsonValue::String(s.clone()),
            Self::Cell(c) => JsonValue::Array(c.values().iter().map(Self::to_json).collect()),
            Self::Struct(s) => struct_json(s),
            Self::StructArray(a) => {
                JsonValue::Array(a.elements().iter().map(struct_json).collect())
            }
            Self::Sparse(s) => {
                let mut entries = Vec::with_capacity(s.nnz());
                for c in 0..s.cols {
                    for k in s.col_ptr[c]..s.col_ptr[c + 1] {
                        entries.push(serde_json::json!([
                            s.row_idx[k],
                            c,
                            s.values.get_f64(k).map_or(JsonValue::Null, number)
                        ]));
                    }
                }
                serde_json::json!({
                    "sparse": { "rows": s.rows, "cols": s.cols, "entries": entries }
                })
            }
            Self::Ref(r) => serde_json::json!({ "ref": r.address() }),
        }
    }
}

fn number(x: f64) -> JsonValue {
    Number::from_f64(x).map_or(JsonValue::Null, JsonValue::Number)
}

fn numeric_json(a: &NumericArray) -> JsonValue {
    let part = |data: &NumericData| -> JsonValue {
        let dims = a.dims();
        if a.len() == 1 {
            return data.get_f64(0).map_or(JsonValue::Null, number);
        }
        if dims.len() == 2 && (dims[0] == 1 || dims[1] == 1) {
            return JsonValue::Array(data.to_f64_vec().into_iter().map(number).collect());
        }
        if dims.len() == 2 {
            let rows = (0..dims[0])
                .map(|r| {
                    JsonValue::Array(
                        (0..dims[1])
                            .map(|c| data.get_f64(c * dims[0] + r).map_or(JsonValue::Null, number))
                            .collect(),
                    )
                })
                .collect();
            return JsonValue::Array(rows);
        }
        serde_json::json!({
            "dims": dims,
            "data": data.to_f64_vec().into_iter().map(number).collect::<Vec<_>>(),
        })
    };
    match a.imag() {
        None => part(a.real()),
        Some(imag) => serde_json::json!({ "re": part(a.real()), "im": part(imag) }),
    }
}

fn struct_json(s: &BTreeMap<String, Value>) -> JsonValue {
    JsonValue::Object(s.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

fn json_object(map: &Map<String, JsonValue>) -> Result<BTreeMap<String, Value>, ValueError> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), Value::from_json(v)?)))
        .collect()
}

fn json_array(items: &[JsonValue]) -> Result<Value, ValueError> {
    if items.is_empty() {
        return Ok(Value::Cell(CellArray::row(Vec::new())));
    }
    if items.iter().all(JsonValue::is_number) {
        let data: Vec<f64> = items.iter().filter_map(JsonValue::as_f64).collect();
        return Ok(Value::Numeric(NumericArray::row(data)));
    }
    if items.iter().all(JsonValue::is_boolean) {
        let data: Vec<bool> = items.iter().filter_map(JsonValue::as_bool).collect();
        return Ok(Value::Numeric(NumericArray::row(data)));
    }
    let rows: Option<Vec<Vec<f64>>> = items
        .iter()
        .map(|item| {
            let row = item.as_array()?;
            if row.is_empty() || !row.iter().all(JsonValue::is_number) {
                return None;
            }
            Some(row.iter().filter_map(JsonValue::as_f64).collect())
        })
        .collect();
    if let Some(rows) = rows {
        if let Ok(matrix) = NumericArray::from_rows(&rows) {
            return Ok(Value::Numeric(matrix));
        }
    }
    if let Some(first) = items[0].as_object() {
        let same_keys = items.iter().all(|item| {
            item.as_object()
                .is_some_and(|o| o.len() == first.len() && o.keys().all(|k| first.contains_key(k)))
        });
        if same_keys && items.len() > 1 {
            let records = items
                .iter()
                .filter_map(JsonValue::as_object)
                .map(json_object)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Value::StructArray(StructArray::from_records(records)?));
        }
    }
    let values = items.iter().map(Value::from_json).collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Cell(CellArray::row(values)))
}

macro_rules! scalar_from {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(x: $t) -> Self {
                    Self::Numeric(NumericArray::row(vec![x]))
                }
            }
        )*
    };
}

scalar_from!(f64, f32, i8, u8, i16, u16, i32, u32, i64, u64, bool);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Char(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Char(s)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Self::Numeric(NumericArray::row(v))
    }
}

impl From<Vec<Self>> for Value {
    fn from(v: Vec<Self>) -> Self {
        Self::Cell(CellArray::row(v))
    }
}

impl From<NumericArray> for Value {
    fn from(a: NumericArray) -> Self {
        Self::Numeric(a)
    }
}

impl From<CellArray> for Value {
    fn from(c: CellArray) -> Self {
        Self::Cell(c)
    }
}

impl From<StructArray> for Value {
    fn from(s: StructArray) -> Self {
        Self::StructArray(s)
    }
}

impl From<SparseMatrix> for Value {
    fn from(s: SparseMatrix) -> Self {
        Self::Sparse(s)
    }
}

impl From<BTreeMap<String, Self>> for Value {
    fn from(s: BTreeMap<String, Self>) -> Self {
        Self::Struct(s)
    }
}

impl From<EngineRef> for Value {
    fn from(r: EngineRef) -> Self {
        Self::Ref(r)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Empty, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dims_are_normalized() {
        assert_eq!(normalize_dims(&[]), vec![1, 1]);
        assert_eq!(normalize_dims(&[4]), vec![1, 4]);
        assert_eq!(normalize_dims(&[2, 3, 1, 1]), vec![2, 3]);
        assert_eq!(normalize_dims(&[2, 1, 4]), vec![2, 1, 4]);
    }

    #[test]
    fn test_from_rows_is_column_major() {
        let a = NumericArray::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(a.dims(), &[2, 2]);
        assert_eq!(a.real(), &NumericData::Double(vec![1.0, 3.0, 2.0, 4.0]));
        assert_eq!(a.get(&[0, 1]), Some(2.0));
        assert_eq!(a.to_rows(), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let err = NumericArray::new(&[2, 2], vec![1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, ValueError::ShapeMismatch { expected: 4, actual: 3, .. }));
        assert!(NumericArray::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        let nan = NumericData::Double(vec![f64::NAN]);
        assert_eq!(nan, nan.clone());
        assert_ne!(NumericData::Double(vec![0.0]), NumericData::Double(vec![-0.0]));
        assert_ne!(NumericData::Double(vec![1.0]), NumericData::Single(vec![1.0]));
    }

    #[test]
    fn test_struct_array_fields_must_match() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), Value::from(1.0));
        let mut b = BTreeMap::new();
        b.insert("y".to_string(), Value::from(2.0));
        assert!(StructArray::from_records(vec![a.clone(), a.clone()]).is_ok());
        assert!(matches!(
            StructArray::from_records(vec![a, b]),
            Err(ValueError::FieldMismatch(_))
        ));
    }

    #[test]
    fn test_sparse_from_triplets() {
        let triplets = [(2, 1, 5.0), (0, 0, 1.0), (1, 1, -2.0)];
        let s = SparseMatrix::from_triplets(3, 2, &triplets).unwrap();
        assert_eq!(s.col_ptr(), &[0, 1, 3]);
        assert_eq!(s.row_idx(), &[0, 1, 2]);
        assert_eq!(s.get(2, 1), Some(5.0));
        assert_eq!(s.get(1, 0), Some(0.0));
        assert_eq!(s.get(3, 0), None);
        assert_eq!(s.to_dense().to_rows(), vec![vec![1.0, 0.0], vec![0.0, -2.0], vec![0.0, 5.0]]);
    }

    #[test]
    fn test_sparse_rejects_unsorted_rows() {
        let err = SparseMatrix::new(3, 1, vec![0, 2], vec![2, 0], vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, ValueError::InvalidSparse(_)));
    }

    #[test]
    fn test_sparse_rejects_falling_column_pointers() {
        let err = SparseMatrix::new(3, 2, vec![0, 5, 2], vec![0, 1], vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, ValueError::InvalidSparse(_)));
    }

    #[test]
    fn test_engine_ref_addresses() {
        let handle = Value::from(EngineRef::function("sin"));
        assert_eq!(handle.class_name(), "function_handle");
        assert_eq!(handle.as_engine_ref().unwrap().address(), "@sin");
        assert_eq!(handle.to_json(), serde_json::json!({ "ref": "@sin" }));

        let obj = EngineRef::object("pt", "Point");
        assert_eq!(obj.address(), "pt");
        assert_eq!(obj.kind(), &RefKind::Object { class: "Point".into() });
        assert_eq!(EngineRef::variable("x").address(), "x");
        assert!(Value::from(1.0).as_engine_ref().is_none());
    }

    #[test]
    fn test_from_json() {
        let json = serde_json::json!({
            "name": "sensor",
            "matrix": [[1, 2], [3, 4]],
            "items": [1, "two", null],
            "records": [{"a": 1}, {"a": 2}],
        });
        let value = Value::from_json(&json).unwrap();
        assert_eq!(value.field("name").and_then(Value::as_str), Some("sensor"));
        let matrix = value.field("matrix").and_then(Value::as_numeric).unwrap();
        assert_eq!(matrix.dims(), &[2, 2]);
        let items = value.field("items").and_then(Value::as_cell).unwrap();
        assert_eq!(items.values()[2], Value::Empty);
        assert!(matches!(value.field("records"), Some(Value::StructArray(a)) if a.len() == 2));
    }

    #[test]
    fn test_to_json_matrix_rows() {
        let a = NumericArray::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(Value::from(a).to_json(), serde_json::json!([[1.0, 2.0], [3.0, 4.0]]));
        assert_eq!(Value::from(f64::NAN).to_json(), JsonValue::Null);
    }
}
