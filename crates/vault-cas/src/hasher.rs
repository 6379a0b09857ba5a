//! Streaming BLAKE3 fingerprints.
//!
//! Uploads arrive as readers of unknown length. `StreamHasher` pulls them
//! through a fixed-size buffer exactly once, so memory use stays bounded
//! regardless of file size. The same pass can tee bytes into a sink, which
//! is how the blob store stages an upload while hashing it.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{CasError, Result};

/// Read buffer size for streaming hashes
const CHUNK_SIZE: usize = 64 * 1024;

/// Bytes retained from the start of a stream for media type sniffing
pub const SNIFF_LEN: usize = 512;

/// BLAKE3 digest identifying byte-identical content (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const LEN: usize = 32;

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Fingerprint an in-memory buffer.
    #[inline]
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    #[inline]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != Self::LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s).ok_or_else(|| CasError::InvalidFingerprint(s.to_string()))
    }
}

// Hex in human-readable formats (TOML, JSON), raw bytes in bincode.
impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_hex(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint: {s}")))
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Self)
        }
    }
}

/// Result of hashing a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub fingerprint: Fingerprint,
    /// Total bytes consumed
    pub size: u64,
    /// First `SNIFF_LEN` bytes of the stream (fewer for short streams)
    pub head: Vec<u8>,
}

/// Single-pass stream hasher with an optional size ceiling.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamHasher {
    limit: Option<u64>,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self { limit: None }
    }

    /// Reject streams longer than `limit` bytes with `CasError::TooLarge`.
    pub fn with_limit(limit: Option<u64>) -> Self {
        Self { limit }
    }

    /// Hash a stream, discarding its bytes.
    pub fn digest<R: Read>(&self, reader: R) -> Result<Digest> {
        self.digest_into(reader, io::sink())
    }

    /// Hash a stream while copying every byte into `sink`.
    ///
    /// On error nothing is returned; whatever reached the sink is the
    /// caller's to throw away.
    pub fn digest_into<R: Read, W: Write>(&self, mut reader: R, mut sink: W) -> Result<Digest> {
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut head = Vec::with_capacity(SNIFF_LEN);
        let mut size = 0u64;

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            size += n as u64;
            if let Some(limit) = self.limit {
                if size > limit {
                    return Err(CasError::TooLarge { limit });
                }
            }

            if head.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - head.len()).min(n);
                head.extend_from_slice(&buf[..take]);
            }

            hasher.update(&buf[..n]);
            sink.write_all(&buf[..n])?;
        }
        sink.flush()?;

        Ok(Digest {
            fingerprint: Fingerprint(*hasher.finalize().as_bytes()),
            size,
            head,
        })
    }
}

/// Reader that hashes what passes through it and fails at end of stream if
/// the bytes do not match the expected fingerprint.
///
/// Used for streaming downloads, where the whole blob is never in memory
/// to check up front.
pub struct VerifyingReader<R> {
    inner: R,
    expected: Fingerprint,
    hasher: blake3::Hasher,
    done: bool,
}

impl<R: Read> VerifyingReader<R> {
    pub fn new(inner: R, expected: Fingerprint) -> Self {
        Self {
            inner,
            expected,
            hasher: blake3::Hasher::new(),
            done: false,
        }
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            return Ok(n);
        }

        self.done = true;
        let actual = Fingerprint(*self.hasher.finalize().as_bytes());
        if actual != self.expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                CasError::HashMismatch {
                    expected: self.expected.to_hex(),
                    actual: actual.to_hex(),
                },
            ));
        }
        Ok(0)
    }
}
