//! CBOR-based structured pickling for tree nodes and leaves (§4.5).
//!
//! Every node/leaf type has two encodings:
//!
//! - the **content pickle**: the full serialized body written as a standalone
//!   block, read back when a value/node is loaded fresh from the store;
//! - the **reference pickle**: a compact form embedded inside a parent's
//!   content pickle when the child is small enough to inline rather than
//!   live behind its own block id.
//!
//! Both ride on `ciborium`'s CBOR implementation over integer-keyed maps
//! (field numbers, not names) so unknown fields are ignored on read and
//! schemas can gain fields without breaking old blocks.

use std::io::Cursor;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ForestError, ForestResult};

/// Serialize `value` to a CBOR byte string.
pub fn to_bytes<T: Serialize>(value: &T) -> ForestResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out)
        .map_err(|e| ForestError::corruption(format!("cbor encode: {e}")))?;
    Ok(out)
}

/// Deserialize `T` from a CBOR byte string. Fields present in the bytes but
/// absent from `T` are silently dropped by `ciborium`; fields absent from the
/// bytes but present (and `#[serde(default)]`-annotated) in `T` take their
/// default, giving forward- and backward-compatible schemas.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> ForestResult<T> {
    ciborium::from_reader(Cursor::new(bytes))
        .map_err(|e| ForestError::corruption(format!("cbor decode: {e}")))
}

/// A type with distinct reference (inline, parent-embedded) and content
/// (standalone block) pickle forms (§4.5). Node and leaf types that are
/// always stored as standalone blocks can let `Reference = Self` and derive
/// the default `to_reference`/`from_reference`.
pub trait Pickle: Sized {
    /// The compact form embedded in a parent's content pickle.
    type Reference: Serialize + DeserializeOwned;

    fn to_reference(&self) -> Self::Reference;
    fn from_reference(r: Self::Reference) -> Self;

    fn encode_reference(&self) -> ForestResult<Vec<u8>> {
        to_bytes(&self.to_reference())
    }

    fn decode_reference(bytes: &[u8]) -> ForestResult<Self> {
        Ok(Self::from_reference(from_bytes(bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Example {
        #[serde(rename = "1")]
        a: u64,
        #[serde(rename = "2", default)]
        b: String,
    }

    #[test]
    fn round_trips_through_cbor() {
        let value = Example {
            a: 42,
            b: "hello".into(),
        };
        let bytes = to_bytes(&value).unwrap();
        let back: Example = from_bytes(&bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn unknown_fields_are_ignored_on_read() {
        #[derive(Serialize)]
        struct Extended {
            #[serde(rename = "1")]
            a: u64,
            #[serde(rename = "2")]
            b: String,
            #[serde(rename = "3")]
            extra: u64,
        }

        let bytes = to_bytes(&Extended {
            a: 7,
            b: "x".into(),
            extra: 999,
        })
        .unwrap();

        let back: Example = from_bytes(&bytes).unwrap();
        assert_eq!(back.a, 7);
        assert_eq!(back.b, "x");
    }

    #[test]
    fn missing_fields_fall_back_to_default() {
        #[derive(Serialize)]
        struct Narrow {
            #[serde(rename = "1")]
            a: u64,
        }

        let bytes = to_bytes(&Narrow { a: 9 }).unwrap();
        let back: Example = from_bytes(&bytes).unwrap();
        assert_eq!(back.a, 9);
        assert_eq!(back.b, "");
    }
}
