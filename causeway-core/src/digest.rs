//! Bounded value digests.
//!
//! Producers never hand full argument, result or state values to the
//! engine. They hand a `Digest`: a prefix of the serialized value capped to
//! a budget, plus the original length so readers can tell when something
//! was cut off.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a hashed digest (blake3 output).
pub const HASH_LEN: usize = 32;

/// Largest digest the wire format can carry (u16 length prefix).
pub const MAX_DIGEST_LEN: usize = u16::MAX as usize;

/// A bounded, possibly truncated representation of a value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// Captured bytes (a prefix of the value, or its fingerprint)
    pub bytes: Vec<u8>,
    /// Length of the value before capture
    pub original_len: u32,
}

impl Digest {
    /// The empty digest.
    pub const fn empty() -> Self {
        Self {
            bytes: Vec::new(),
            original_len: 0,
        }
    }

    /// Capture a prefix of `value` no longer than `budget` bytes.
    pub fn capture(value: &[u8], budget: usize) -> Self {
        let budget = budget.min(MAX_DIGEST_LEN);
        let take = value.len().min(budget);
        Self {
            bytes: value[..take].to_vec(),
            original_len: clamp_len(value.len()),
        }
    }

    /// Fingerprint `value` with blake3.
    ///
    /// Useful for large state values where equality across snapshots
    /// matters more than the content.
    pub fn hashed(value: &[u8]) -> Self {
        Self {
            bytes: blake3::hash(value).as_bytes().to_vec(),
            original_len: clamp_len(value.len()),
        }
    }

    /// Rebuild a digest from its parts (codec use).
    pub fn from_parts(bytes: Vec<u8>, original_len: u32) -> Self {
        Self {
            bytes,
            original_len,
        }
    }

    /// True when fewer bytes were kept than the value had.
    pub fn is_truncated(&self) -> bool {
        self.original_len as usize > self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.original_len == 0
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Cut the captured bytes down to `budget`. Returns true if anything
    /// was removed.
    pub fn truncate_to(&mut self, budget: usize) -> bool {
        if self.bytes.len() > budget {
            self.bytes.truncate(budget);
            true
        } else {
            false
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.bytes) {
            Ok(s) => write!(f, "{:?}", s)?,
            Err(_) => {
                for b in self.bytes.iter().take(16) {
                    write!(f, "{:02x}", b)?;
                }
                if self.bytes.len() > 16 {
                    f.write_str("..")?;
                }
            }
        }
        if self.is_truncated() {
            write!(f, " ({}/{} bytes)", self.bytes.len(), self.original_len)?;
        }
        Ok(())
    }
}

impl From<&str> for Digest {
    fn from(value: &str) -> Self {
        Self::capture(value.as_bytes(), MAX_DIGEST_LEN)
    }
}

fn clamp_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_within_budget() {
        let d = Digest::capture(b"hello", 16);
        assert_eq!(d.bytes, b"hello");
        assert_eq!(d.original_len, 5);
        assert!(!d.is_truncated());
    }

    #[test]
    fn test_capture_truncates() {
        let d = Digest::capture(&[7u8; 100], 10);
        assert_eq!(d.len(), 10);
        assert_eq!(d.original_len, 100);
        assert!(d.is_truncated());
    }

    #[test]
    fn test_hashed_is_stable() {
        let a = Digest::hashed(b"state-v1");
        let b = Digest::hashed(b"state-v1");
        let c = Digest::hashed(b"state-v2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), HASH_LEN);
    }

    #[test]
    fn test_truncate_to() {
        let mut d = Digest::capture(b"abcdef", 64);
        assert!(!d.truncate_to(10));
        assert!(d.truncate_to(3));
        assert_eq!(d.bytes, b"abc");
        assert!(d.is_truncated());
    }

    #[test]
    fn test_display() {
        let d = Digest::capture(b"abcdef", 3);
        assert_eq!(d.to_string(), "\"abc\" (3/6 bytes)");
    }
}
