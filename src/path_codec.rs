//! Reversible encoding of path segments
//!
//! Every name that reaches the mirror, the increments area or a serialized
//! manifest passes through [`PathCodec`]. The scheme is a single escape byte
//! (`;`) followed by exactly three decimal digits giving the raw byte value:
//!
//! ```text
//! "a;b"      -> "a;059b"
//! "x/y"      -> "x;047y"
//! b"\xff.txt" -> ";255.txt"
//! ```
//!
//! Always escaped: the escape byte itself, `/`, control characters and bytes
//! that are not part of valid UTF-8. A repository may ask for more (for
//! example `A`-`Z` on a case-insensitive mirror filesystem). Encoded output
//! is always valid UTF-8.
//!
//! Decoding is strict: an input that is not the canonical encoding of some
//! raw segment is rejected, which makes the mapping a bijection between raw
//! segments and canonical encoded segments.

use crate::error::{Result, RetrobakError};
use crate::types::RepoPath;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

const ESCAPE: u8 = b';';

/// Segment encoder/decoder with a configurable set of extra quoted bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathCodec {
    extra: [bool; 128],
}

impl Default for PathCodec {
    fn default() -> Self {
        Self::minimal()
    }
}

impl PathCodec {
    /// Codec that only escapes what is always unsafe
    pub fn minimal() -> Self {
        Self { extra: [false; 128] }
    }

    /// Codec that additionally escapes the given ASCII characters
    pub fn with_extra(chars: &str) -> Result<Self> {
        let mut codec = Self::minimal();
        for c in chars.chars() {
            if !c.is_ascii() {
                return Err(RetrobakError::InvalidConfiguration(format!(
                    "quoting table only accepts ASCII characters, got {c:?}"
                )));
            }
            codec.extra[c as usize] = true;
        }
        Ok(codec)
    }

    /// Codec for mirrors on case-insensitive filesystems: upper case is escaped
    pub fn case_insensitive() -> Self {
        let mut codec = Self::minimal();
        for b in b'A'..=b'Z' {
            codec.extra[b as usize] = true;
        }
        codec
    }

    /// Extra quoted characters, in byte order
    pub fn extra_chars(&self) -> String {
        (0u8..128)
            .filter(|b| self.extra[*b as usize])
            .map(char::from)
            .collect()
    }

    fn must_escape(&self, c: char) -> bool {
        c == ESCAPE as char
            || c == '/'
            || c.is_control()
            || (c.is_ascii() && self.extra[c as usize])
    }

    /// Encode one raw segment
    pub fn encode_segment(&self, raw: &OsStr) -> String {
        let bytes = os_to_bytes(raw);
        let mut out = String::with_capacity(bytes.len());
        for chunk in bytes.utf8_chunks() {
            for c in chunk.valid().chars() {
                if self.must_escape(c) {
                    let mut buf = [0u8; 4];
                    for b in c.encode_utf8(&mut buf).bytes() {
                        push_escape(&mut out, b);
                    }
                } else {
                    out.push(c);
                }
            }
            for &b in chunk.invalid() {
                push_escape(&mut out, b);
            }
        }
        out
    }

    /// Decode one encoded segment, rejecting non-canonical input
    pub fn decode_segment(&self, encoded: &str) -> Result<OsString> {
        if encoded.is_empty() {
            return Err(RetrobakError::PathCodec("empty segment".to_string()));
        }
        let input = encoded.as_bytes();
        let mut raw = Vec::with_capacity(input.len());
        let mut i = 0;
        while i < input.len() {
            if input[i] == ESCAPE {
                let digits = input
                    .get(i + 1..i + 4)
                    .filter(|d| d.iter().all(u8::is_ascii_digit))
                    .ok_or_else(|| {
                        RetrobakError::PathCodec(format!("truncated escape in {encoded:?}"))
                    })?;
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0'));
                let byte = u8::try_from(value).map_err(|_| {
                    RetrobakError::PathCodec(format!("escape out of range in {encoded:?}"))
                })?;
                raw.push(byte);
                i += 4;
            } else {
                raw.push(input[i]);
                i += 1;
            }
        }

        let decoded = bytes_to_os(&raw);
        if self.encode_segment(&decoded) != encoded {
            return Err(RetrobakError::PathCodec(format!(
                "non-canonical encoding {encoded:?}"
            )));
        }
        Ok(decoded)
    }

    /// Encode every segment of an entry path
    pub fn encode_path(&self, path: &RepoPath) -> PathBuf {
        path.segments().map(|s| self.encode_segment(s)).collect()
    }

    /// Decode an encoded relative path back into an entry path
    pub fn decode_path(&self, encoded: &Path) -> Result<RepoPath> {
        let mut path = RepoPath::root();
        for seg in encoded.iter() {
            let seg = seg.to_str().ok_or_else(|| {
                RetrobakError::PathCodec(format!("encoded path is not UTF-8: {encoded:?}"))
            })?;
            path = path.join(self.decode_segment(seg)?);
        }
        Ok(path)
    }
}

fn push_escape(out: &mut String, byte: u8) {
    out.push(ESCAPE as char);
    out.push_str(&format!("{byte:03}"));
}

/// Raw bytes of an OS string
#[cfg(unix)]
pub fn os_to_bytes(s: &OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    s.as_bytes().to_vec()
}

/// Raw bytes of an OS string
#[cfg(not(unix))]
pub fn os_to_bytes(s: &OsStr) -> Vec<u8> {
    s.to_string_lossy().into_owned().into_bytes()
}

/// OS string from raw bytes
#[cfg(unix)]
pub fn bytes_to_os(bytes: &[u8]) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(bytes.to_vec())
}

/// OS string from raw bytes
#[cfg(not(unix))]
pub fn bytes_to_os(bytes: &[u8]) -> OsString {
    OsString::from(String::from_utf8_lossy(bytes).into_owned())
}
