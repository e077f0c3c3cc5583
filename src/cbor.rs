//! Thin wrappers around [ciborium] so the rest of the crate never touches
//! the reader/writer plumbing directly.
use std::io::Cursor;

use serde::{de, Serialize};
use thiserror::Error;

pub use ciborium::Value;

#[derive(Debug, Error)]
pub enum CborError {
    /// CBOR decoding failure.
    #[error("CBOR decoding failure: {0}")]
    DecodeFailed(String),
    /// CBOR encoding failure.
    #[error("CBOR encoding failure: {0}")]
    EncodeFailed(String),
    /// CBOR input had extra data.
    #[error("extraneous data")]
    ExtraneousData,
    /// Unexpected CBOR item encountered (got, want).
    #[error("unexpected item: {0}, want {1}")]
    UnexpectedItem(&'static str, &'static str),
}

pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, CborError>
where
    T: Serialize,
{
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CborError::EncodeFailed(e.to_string()))?;
    Ok(buf)
}

pub fn from_slice<T>(slice: &[u8]) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    let mut cursor = Cursor::new(slice);
    let value = ciborium::from_reader(&mut cursor)
        .map_err(|e| CborError::DecodeFailed(e.to_string()))?;
    if (cursor.position() as usize) < slice.len() {
        return Err(CborError::ExtraneousData);
    }
    Ok(value)
}

/// Convert a `ciborium::Value` into a type `T`
#[allow(clippy::needless_pass_by_value)]
pub fn from_value<T>(value: Value) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    value
        .deserialized()
        .map_err(|e| CborError::DecodeFailed(e.to_string()))
}

pub fn into_value<S>(v: S) -> Result<Value, CborError>
where
    S: Serialize,
{
    Value::serialized(&v).map_err(|e| CborError::EncodeFailed(e.to_string()))
}
