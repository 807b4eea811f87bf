//! Canonical encodings
//!
//! Two encodings are used and they never mix:
//!
//! - **Canonical JSON** for everything that is hashed or signed. Field order
//!   is the Rust struct field order, maps are `BTreeMap` (sorted keys), fixed
//!   byte values are lowercase hex strings, decimals are 18-digit strings.
//!   Other implementations MUST produce identical bytes.
//! - **Storage bytes** (postcard) for the local sled cache. Never hashed.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to canonical JSON bytes.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(Error::from)
}

/// Serialize a value for the persistent cache.
pub fn storage_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Decode a value written by [`storage_bytes`].
pub fn from_storage_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_canonical_json_field_order() {
        let meta = RelayMeta { block_height: 7 };
        let bytes = canonical_json(&meta).unwrap();
        assert_eq!(bytes, br#"{"block_height":7}"#.to_vec());
    }

    #[test]
    fn test_header_map_is_sorted() {
        let mut headers = BTreeMap::new();
        headers.insert("z-last".to_string(), "1".to_string());
        headers.insert("a-first".to_string(), "2".to_string());
        let payload = RelayPayload {
            data: "{}".into(),
            method: "POST".into(),
            path: String::new(),
            headers,
        };
        let json = String::from_utf8(canonical_json(&payload).unwrap()).unwrap();
        assert!(json.find("a-first").unwrap() < json.find("z-last").unwrap());
    }

    #[test]
    fn test_storage_roundtrip_header() {
        let header = SessionHeader {
            requestor_pubkey: PublicKey([3; 32]),
            chain: ChainId::new("0001").unwrap(),
            geo_zone: GeoZoneId::new("0001").unwrap(),
            num_servicers: 5,
            session_block_height: 1,
        };
        let bytes = storage_bytes(&header).unwrap();
        let decoded: SessionHeader = from_storage_bytes(&bytes).unwrap();
        assert_eq!(decoded, header);
    }
}
