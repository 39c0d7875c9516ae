//! Envelopes: named values stored as one MAT-file.
//!
//! Every command exchanges exactly two envelopes with the engine, a request
//! holding the arguments and a response holding the outputs or error details.

use std::path::Path;

use bytes::BytesMut;
use octbridge_core::Value;

use crate::{
    CodecError, EncodeOptions,
    error::malformed,
    mat5::{Endian, HEADER_LEN, VERSION, check_name},
    reader::read_variables,
    writer::{put_header, put_matrix},
};

/// An ordered set of named values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    vars: Vec<(String, Value)>,
}

impl Envelope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `value` to `name`, replacing any previous binding.
    ///
    /// # Errors
    /// Returns error if `name` is not a valid engine identifier.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Result<(), CodecError> {
        let name = name.into();
        check_name(&name)?;
        if let Some(slot) = self.vars.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.vars.push((name, value));
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.vars.iter().position(|(n, _)| n == name)?;
        Some(self.vars.remove(pos).1)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.iter().map(|(n, _)| n.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    #[must_use]
    pub fn into_vars(self) -> Vec<(String, Value)> {
        self.vars
    }

    /// Serialize to MAT-file bytes.
    ///
    /// # Errors
    /// Returns error if a value exceeds format limits or holds an invalid field name.
    pub fn encode(&self, options: EncodeOptions) -> Result<Vec<u8>, CodecError> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64 * self.vars.len());
        put_header(&mut buf);
        for (name, value) in &self.vars {
            put_matrix(&mut buf, name, value, options)?;
        }
        Ok(buf.to_vec())
    }

    /// Parse MAT-file bytes in either byte order.
    ///
    /// # Errors
    /// Returns error on a bad header, malformed data, or an unsupported value class.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(malformed(format!("{} byte file is shorter than the header", bytes.len())));
        }
        let endian = match &bytes[126..128] {
            b"IM" => Endian::Little,
            b"MI" => Endian::Big,
            other => return Err(malformed(format!("bad endian indicator {other:?}"))),
        };
        let version = match endian {
            Endian::Little => u16::from_le_bytes([bytes[124], bytes[125]]),
            Endian::Big => u16::from_be_bytes([bytes[124], bytes[125]]),
        };
        if version != VERSION {
            tracing::debug!(version, "unexpected MAT-file version");
        }
        Ok(Self {
            vars: read_variables(&bytes[HEADER_LEN..], endian)?,
        })
    }

    /// Encode and write to `path`.
    ///
    /// # Errors
    /// Returns error on encoding or I/O failure.
    pub fn write_to(&self, path: &Path, options: EncodeOptions) -> Result<(), CodecError> {
        let bytes = self.encode(options)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Read and decode the file at `path`.
    ///
    /// # Errors
    /// Returns error on I/O failure or malformed content.
    pub fn read_from(path: &Path) -> Result<Self, CodecError> {
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes)
    }
}

/// Write a request envelope binding each name to its value.
///
/// # Errors
/// Returns error on an invalid name, encoding failure, or I/O failure.
pub fn write_request(
    path: &Path,
    bindings: &[(&str, &Value)],
    options: EncodeOptions,
) -> Result<(), CodecError> {
    let mut envelope = Envelope::new();
    for (name, value) in bindings {
        envelope.insert(*name, (*value).clone())?;
    }
    envelope.write_to(path, options)
}

/// Read a response envelope.
///
/// # Errors
/// Returns error on I/O failure or malformed content.
pub fn read_response(path: &Path) -> Result<Envelope, CodecError> {
    Envelope::read_from(path)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use octbridge_core::{CellArray, NumericArray};

    use super::*;

    #[test]
    fn test_insert_replaces() {
        let mut env = Envelope::new();
        env.insert("a", Value::from(1.0)).unwrap();
        env.insert("b", Value::from("x")).unwrap();
        env.insert("a", Value::from(2.0)).unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("a"), Some(&Value::from(2.0)));
        assert_eq!(env.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(env.insert("bad name", Value::Empty).is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req.mat");

        let mut record = BTreeMap::new();
        record.insert("gain".to_string(), Value::from(0.5));
        record.insert("label".to_string(), Value::from("sensor"));
        let args = Value::Cell(CellArray::row(vec![
            Value::Numeric(NumericArray::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap()),
            Value::Struct(record),
            Value::from(true),
        ]));
        write_request(&path, &[("ob_args", &args)], EncodeOptions::default()).unwrap();

        let env = read_response(&path).unwrap();
        assert_eq!(env.get("ob_args"), Some(&args));
    }

    #[test]
    fn test_convert_to_float() {
        let ints = Value::Numeric(NumericArray::row(vec![1i16, -2, 3]));
        let mut env = Envelope::new();
        env.insert("x", ints).unwrap();
        let bytes = env
            .encode(EncodeOptions {
                convert_to_float: true,
            })
            .unwrap();
        let back = Envelope::decode(&bytes).unwrap();
        assert_eq!(back.get("x"), Some(&Value::from(vec![1.0, -2.0, 3.0])));
    }

    #[test]
    fn test_bad_header() {
        assert!(matches!(Envelope::decode(&[0u8; 10]), Err(CodecError::Malformed(_))));
        let mut bytes = vec![b' '; 128];
        bytes[126] = b'X';
        bytes[127] = b'Y';
        assert!(matches!(Envelope::decode(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_response(&dir.path().join("absent.mat")).unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }
}
