//! Decoding of text-format column values.
//!
//! Simple-query results always arrive in text format, so a single
//! [`FromText`] trait covers every value a pipeline can return.

mod primitives;
mod string;

use crate::error::{Error, Result};
use crate::protocol::types::Oid;

/// Trait for decoding PostgreSQL text-format values into Rust types.
///
/// The OID parameter allows implementations to check the PostgreSQL type
/// and reject incompatible types with clear error messages.
pub trait FromText<'a>: Sized {
    /// Decode from NULL value.
    ///
    /// Default implementation returns an error. Override for types that can
    /// represent NULL (like `Option<T>`).
    fn from_null() -> Result<Self> {
        Err(Error::Decode("unexpected NULL value".into()))
    }

    /// Decode from text format bytes.
    fn from_text(oid: Oid, bytes: &'a [u8]) -> Result<Self>;
}

impl<'a, T: FromText<'a>> FromText<'a> for Option<T> {
    fn from_null() -> Result<Self> {
        Ok(None)
    }

    fn from_text(oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        T::from_text(oid, bytes).map(Some)
    }
}

/// Validate text bytes as UTF-8.
pub(crate) fn text(bytes: &[u8]) -> Result<&str> {
    simdutf8::compat::from_utf8(bytes).map_err(|e| Error::Decode(format!("invalid UTF-8: {}", e)))
}
