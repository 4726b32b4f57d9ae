//! LZ4 framing for increment files and manifests
//!
//! Every stored blob starts with a 4-byte header:
//! - `LZ4R`: an LZ4 block with prepended length follows
//! - `\0\0\0\0`: the raw bytes follow
//!
//! The header makes decoding independent of configuration, so a repository
//! whose compression setting changed can still read its older increments.

use crate::error::{Result, RetrobakError};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};
use tracing::trace;

const LZ4_MAGIC: &[u8; 4] = b"LZ4R";
const RAW_MAGIC: &[u8; 4] = &[0, 0, 0, 0];

/// Payloads shorter than this are always stored raw
const MIN_COMPRESS_LEN: usize = 64;

/// Compression setting for a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadCompression {
    /// Store increments as written
    None,
    /// LZ4 block compression
    #[default]
    Lz4,
}

impl PayloadCompression {
    /// Frame `data`, compressing when enabled and beneficial
    ///
    /// Returns the framed bytes and whether LZ4 was actually used.
    pub fn encode(&self, data: &[u8]) -> (Vec<u8>, bool) {
        if *self == PayloadCompression::Lz4 && data.len() >= MIN_COMPRESS_LEN {
            let compressed = compress_prepend_size(data);
            if compressed.len() < data.len() {
                trace!("lz4 {} -> {} bytes", data.len(), compressed.len());
                let mut out = Vec::with_capacity(4 + compressed.len());
                out.extend_from_slice(LZ4_MAGIC);
                out.extend_from_slice(&compressed);
                return (out, true);
            }
        }
        let mut out = Vec::with_capacity(4 + data.len());
        out.extend_from_slice(RAW_MAGIC);
        out.extend_from_slice(data);
        (out, false)
    }

    /// Strip the frame and decompress if needed
    pub fn decode(framed: &[u8]) -> Result<Vec<u8>> {
        if framed.len() < 4 {
            return Err(RetrobakError::Compression(format!(
                "frame too short: {} bytes",
                framed.len()
            )));
        }
        let (magic, body) = framed.split_at(4);
        if magic == LZ4_MAGIC {
            decompress_size_prepended(body)
                .map_err(|e| RetrobakError::Compression(format!("lz4 decode failed: {e}")))
        } else if magic == RAW_MAGIC {
            Ok(body.to_vec())
        } else {
            Err(RetrobakError::Compression("unknown frame header".to_string()))
        }
    }
}
