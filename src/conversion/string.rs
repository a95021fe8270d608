//! String type implementations (&str, String).
//!
//! Every text-format value is a valid string, so these accept any OID.

use crate::error::Result;
use crate::protocol::types::Oid;

use super::{FromText, text};

impl<'a> FromText<'a> for &'a str {
    fn from_text(_oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        text(bytes)
    }
}

impl FromText<'_> for String {
    fn from_text(_oid: Oid, bytes: &[u8]) -> Result<Self> {
        text(bytes).map(|s| s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;

    #[test]
    fn test_string_text() {
        assert_eq!(String::from_text(oid::TEXT, b"hello").unwrap(), "hello");
        assert_eq!(<&str>::from_text(oid::INT4, b"42").unwrap(), "42");
    }

    #[test]
    fn test_invalid_utf8() {
        assert!(String::from_text(oid::TEXT, &[0xc3, 0x28]).is_err());
    }
}
