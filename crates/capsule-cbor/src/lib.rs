//! Deterministic CBOR and the digest built on it.
//!
//! Every byte string that gets hashed (ledger payloads, state records, code
//! descriptors) goes through [`to_canonical_cbor`] first, so two runtimes that
//! hold equal values always agree on the [`Hash`].

mod hash;

pub use hash::{Hash, HashError};

use serde::Serialize;

/// Encode `value` with map keys sorted, behind the self-describe tag.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    // serde_cbor's Value keeps maps in a BTreeMap, which fixes key order.
    let sorted = serde_cbor::value::to_value(value)?;
    let mut out = Vec::with_capacity(128);
    let mut serializer = serde_cbor::Serializer::new(&mut out);
    serializer.self_describe()?;
    sorted.serialize(&mut serializer)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_the_encoding() {
        let mut forward = serde_json::Map::new();
        forward.insert("units".into(), json!(3));
        forward.insert("owner".into(), json!("alice"));
        let mut backward = serde_json::Map::new();
        backward.insert("owner".into(), json!("alice"));
        backward.insert("units".into(), json!(3));

        let a = to_canonical_cbor(&forward).unwrap();
        let b = to_canonical_cbor(&backward).unwrap();
        assert_eq!(a, b);
        assert_eq!(Hash::of_bytes(&a), Hash::of_cbor(&backward).unwrap());
    }

    #[test]
    fn encoding_starts_with_the_self_describe_tag() {
        let bytes = to_canonical_cbor(&7u32).unwrap();
        assert_eq!(&bytes[..3], &[0xd9, 0xd9, 0xf7]);
        let back: u32 = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(back, 7);
    }
}
