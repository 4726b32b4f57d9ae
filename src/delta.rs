//! Signature / delta / patch on top of `fast_rsync`
//!
//! The engine uses deltas in two directions for a changed regular file:
//!
//! - **forward**: signature of the mirror content, delta of the source
//!   content against it; patching the mirror with it yields the new content.
//!   This is what a remote transport would ship.
//! - **reverse**: signature of the new content, delta of the old mirror
//!   content against it; patching the new mirror content with it yields the
//!   old content. This is what a `diff` increment stores.

use crate::error::{Result, RetrobakError};
use fast_rsync::{apply, diff, Signature, SignatureOptions};
use tracing::trace;

/// Default block size for signatures (16KB)
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Strong hash bytes per block
const CRYPTO_HASH_SIZE: u32 = 8;

/// rsync-style delta codec with a fixed block size
#[derive(Debug, Clone, Copy)]
pub struct DeltaCodec {
    block_size: u32,
}

impl Default for DeltaCodec {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl DeltaCodec {
    /// Codec with the given block size (clamped to at least 64 bytes)
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size: block_size.max(64),
        }
    }

    /// Block size in use
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Signature of a byte buffer
    pub fn signature(&self, data: &[u8]) -> Signature {
        Signature::calculate(
            data,
            SignatureOptions {
                block_size: self.block_size,
                crypto_hash_size: CRYPTO_HASH_SIZE,
            },
        )
    }

    /// Delta of `new_data` against a base signature
    pub fn delta(&self, base: &Signature, new_data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        diff(&base.index(), new_data, &mut out)
            .map_err(|e| RetrobakError::delta(format!("delta computation failed: {e}")))?;
        Ok(out)
    }

    /// Apply a delta to its base
    pub fn patch(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        apply(base, delta, &mut out)
            .map_err(|e| RetrobakError::delta(format!("patch failed: {e}")))?;
        Ok(out)
    }

    /// Delta that turns `old` into `new`
    pub fn forward_delta(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
        let delta = self.delta(&self.signature(old), new)?;
        trace!("forward delta {} -> {} bytes: {} bytes", old.len(), new.len(), delta.len());
        Ok(delta)
    }

    /// Delta that turns `new` back into `old`
    pub fn reverse_delta(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
        let delta = self.delta(&self.signature(new), old)?;
        trace!("reverse delta {} <- {} bytes: {} bytes", old.len(), new.len(), delta.len());
        Ok(delta)
    }
}
