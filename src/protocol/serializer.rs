use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::protocol::error::{ProtocolError, Result};

/// upper bound for an inflated payload; with 65535 fragments of a few hundred bytes each
///  this is what a maximal message can reach in practice
pub const MAX_INFLATED_SIZE: usize = 32 * 1024 * 1024;

/// Converts payload values to and from their wire bytes.
///
/// The engine never looks inside a payload; this trait is the seam where applications
///  plug in their own encoding. `params` are resolved from the configuration per
///  (type, command) and are opaque to the engine.
pub trait PayloadSerializer: Send + Sync {
    fn serialize(&self, value: &serde_json::Value, params: &serde_json::Value) -> Result<Vec<u8>>;

    fn unserialize(&self, buf: &[u8], params: &serde_json::Value) -> Result<serde_json::Value>;
}

/// Default serializer: compact JSON. Ignores its params.
pub struct JsonSerializer;

impl PayloadSerializer for JsonSerializer {
    fn serialize(&self, value: &serde_json::Value, _params: &serde_json::Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| ProtocolError::Codec(e.to_string()))
    }

    fn unserialize(&self, buf: &[u8], _params: &serde_json::Value) -> Result<serde_json::Value> {
        serde_json::from_slice(buf).map_err(|e| ProtocolError::Codec(e.to_string()))
    }
}

/// raw deflate, no zlib or gzip wrapper
pub fn deflate(buf: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(buf)
        .map_err(|e| ProtocolError::Codec(format!("deflate failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::Codec(format!("deflate failed: {}", e)))
}

/// Inverse of [deflate]. Output is capped at [MAX_INFLATED_SIZE] so a hostile peer
///  cannot make us allocate arbitrary memory from a small datagram.
pub fn inflate(buf: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = DeflateDecoder::new(buf).take(MAX_INFLATED_SIZE as u64 + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Codec(format!("inflate failed: {}", e)))?;
    if out.len() > MAX_INFLATED_SIZE {
        return Err(ProtocolError::Codec(format!(
            "inflated payload exceeds the {} byte bound",
            MAX_INFLATED_SIZE
        )));
    }
    Ok(out)
}
