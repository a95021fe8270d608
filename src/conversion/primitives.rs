//! Primitive type implementations (bool, integers, floats).

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::{FromText, text};

// === Boolean ===

impl FromText<'_> for bool {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::BOOL {
            return Err(Error::Decode(format!("cannot decode oid {} as bool", oid)));
        }
        match bytes {
            b"t" | b"true" | b"TRUE" | b"T" | b"1" => Ok(true),
            b"f" | b"false" | b"FALSE" | b"F" | b"0" => Ok(false),
            _ => Err(Error::Decode(format!(
                "invalid boolean: {:?}",
                String::from_utf8_lossy(bytes)
            ))),
        }
    }
}

// === Integer types ===

macro_rules! impl_int {
    ($ty:ty, $name:literal, $($oid:path)|+) => {
        impl FromText<'_> for $ty {
            fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
                if !matches!(oid, $($oid)|+) {
                    return Err(Error::Decode(format!(
                        concat!("cannot decode oid {} as ", $name),
                        oid
                    )));
                }
                text(bytes)?
                    .parse()
                    .map_err(|e| Error::Decode(format!(concat!("invalid ", $name, ": {}"), e)))
            }
        }
    };
}

impl_int!(i16, "i16", oid::INT2);
impl_int!(i32, "i32", oid::INT2 | oid::INT4);
impl_int!(i64, "i64", oid::INT2 | oid::INT4 | oid::INT8);
impl_int!(u32, "u32", oid::OID);

// === Floats ===

fn parse_float(oid: Oid, bytes: &[u8], name: &str) -> Result<f64> {
    if !matches!(
        oid,
        oid::FLOAT4 | oid::FLOAT8 | oid::NUMERIC | oid::INT2 | oid::INT4 | oid::INT8
    ) {
        return Err(Error::Decode(format!("cannot decode oid {} as {}", oid, name)));
    }
    match text(bytes)? {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        s => s
            .parse()
            .map_err(|e| Error::Decode(format!("invalid {}: {}", name, e))),
    }
}

impl FromText<'_> for f64 {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        parse_float(oid, bytes, "f64")
    }
}

impl FromText<'_> for f32 {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        let value = parse_float(oid, bytes, "f32")?;
        if value.is_finite() && (value > f32::MAX as f64 || value < f32::MIN as f64) {
            return Err(Error::Decode(format!("value {} overflows f32", value)));
        }
        Ok(value as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_spellings() {
        assert!(bool::from_text(oid::BOOL, b"t").unwrap());
        assert!(!bool::from_text(oid::BOOL, b"false").unwrap());
        assert!(bool::from_text(oid::BOOL, b"yes").is_err());
        assert!(bool::from_text(oid::INT4, b"t").is_err());
    }

    #[test]
    fn integers_widen_but_do_not_narrow() {
        assert_eq!(i64::from_text(oid::INT4, b"-42").unwrap(), -42);
        assert_eq!(i32::from_text(oid::INT2, b"7").unwrap(), 7);
        assert!(i16::from_text(oid::INT4, b"7").is_err());
        assert!(i32::from_text(oid::INT4, b"seven").is_err());
        assert_eq!(u32::from_text(oid::OID, b"3000000000").unwrap(), 3_000_000_000);
    }

    #[test]
    fn float_specials() {
        assert!(f64::from_text(oid::FLOAT8, b"NaN").unwrap().is_nan());
        assert_eq!(f64::from_text(oid::FLOAT8, b"-Infinity").unwrap(), f64::NEG_INFINITY);
        assert_eq!(f64::from_text(oid::NUMERIC, b"1.25").unwrap(), 1.25);
        assert_eq!(f32::from_text(oid::FLOAT4, b"Infinity").unwrap(), f32::INFINITY);
        assert!(f32::from_text(oid::FLOAT8, b"1e300").is_err());
        assert!(f64::from_text(oid::TEXT, b"1").is_err());
    }
}
