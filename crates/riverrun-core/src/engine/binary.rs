//! Variable-blob codec.
//!
//! The variable scope is persisted as a marker-prefixed opaque blob:
//! marker `1` is a raw zlib-compressed JSON serialization of the map,
//! marker `2` is the same payload hex-encoded (for stores that cannot carry
//! raw bytes). Absent or empty input decodes to an empty map; an unknown
//! marker is a fatal consistency error.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use riverrun_types::error::ConsistencyError;
use serde_json::Value;

/// Marker byte: zlib payload follows as raw bytes.
pub const MARKER_RAW: u8 = 1;

/// Marker byte: zlib payload follows hex-encoded.
pub const MARKER_HEX: u8 = 2;

/// Encode a variable map as a marker-prefixed compressed blob.
///
/// The map is ordered (`BTreeMap`), so encoding is deterministic and a
/// re-encoded unchanged scope compares byte-equal to its last snapshot.
pub fn encode(variables: &BTreeMap<String, Value>) -> Result<Vec<u8>, ConsistencyError> {
    let json = serde_json::to_vec(variables)
        .map_err(|e| ConsistencyError::MalformedBlob(e.to_string()))?;

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2 + 1), Compression::fast());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map(|compressed| {
            let mut blob = Vec::with_capacity(compressed.len() + 1);
            blob.push(MARKER_RAW);
            blob.extend_from_slice(&compressed);
            blob
        })
        .map_err(|e| ConsistencyError::MalformedBlob(e.to_string()))
}

/// Decode a marker-prefixed blob back into a variable map.
pub fn decode(blob: &[u8]) -> Result<BTreeMap<String, Value>, ConsistencyError> {
    let Some((&marker, payload)) = blob.split_first() else {
        return Ok(BTreeMap::new());
    };

    let compressed = match marker {
        MARKER_RAW => payload.to_vec(),
        MARKER_HEX => hex::decode(payload)
            .map_err(|e| ConsistencyError::MalformedBlob(format!("invalid hex payload: {e}")))?,
        other => return Err(ConsistencyError::UnknownBlobMarker(other)),
    };

    let mut json = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| ConsistencyError::MalformedBlob(e.to_string()))?;

    serde_json::from_slice(&json).map_err(|e| ConsistencyError::MalformedBlob(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip() {
        let mut vars = BTreeMap::new();
        vars.insert("x".to_string(), json!(1));
        vars.insert("y".to_string(), json!("a"));

        let blob = encode(&vars).unwrap();
        assert_eq!(blob[0], MARKER_RAW);
        assert_eq!(decode(&blob).unwrap(), vars);
    }

    #[test]
    fn empty_input_decodes_to_empty_map() {
        assert!(decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn encoding_is_deterministic() {
        let mut vars = BTreeMap::new();
        vars.insert("b".to_string(), json!(2));
        vars.insert("a".to_string(), json!([1, 2, 3]));

        assert_eq!(encode(&vars).unwrap(), encode(&vars).unwrap());
    }

    #[test]
    fn hex_marker_decodes() {
        let mut vars = BTreeMap::new();
        vars.insert("k".to_string(), json!(true));

        let raw = encode(&vars).unwrap();
        let mut hexed = vec![MARKER_HEX];
        hexed.extend_from_slice(hex::encode(&raw[1..]).as_bytes());

        assert_eq!(decode(&hexed).unwrap(), vars);
    }

    #[test]
    fn unknown_marker_is_fatal() {
        let err = decode(&[9, 0, 0]).unwrap_err();
        assert!(matches!(err, ConsistencyError::UnknownBlobMarker(9)));
    }
}
