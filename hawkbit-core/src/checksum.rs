//! Checksum accumulator: incremental SHA-1, MD5 and SHA-256 over a byte stream.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Digest algorithms the update server may publish for an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha1,
    Md5,
    Sha256,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Md5 => "md5",
            Algorithm::Sha256 => "sha256",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lowercase hex digests of a finished stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digests {
    pub sha1: String,
    pub md5: String,
    pub sha256: String,
}

impl Digests {
    pub fn get(&self, algorithm: Algorithm) -> &str {
        match algorithm {
            Algorithm::Sha1 => &self.sha1,
            Algorithm::Md5 => &self.md5,
            Algorithm::Sha256 => &self.sha256,
        }
    }
}

/// Expected digest of an artifact, as announced by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedDigest {
    pub algorithm: Algorithm,
    /// Lowercase hex.
    pub hex: String,
}

impl ExpectedDigest {
    pub fn new(algorithm: Algorithm, hex: &str) -> Self {
        Self {
            algorithm,
            hex: hex.trim().to_ascii_lowercase(),
        }
    }

    /// True if the matching digest in `digests` equals this one.
    pub fn matches(&self, digests: &Digests) -> bool {
        digests.get(self.algorithm) == self.hex
    }
}

/// Running digest state. Feed every received chunk once, in receipt order.
#[derive(Clone, Default)]
pub struct Checksum {
    sha1: Sha1,
    md5: Md5,
    sha256: Sha256,
    bytes: u64,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a chunk into all running digests.
    pub fn update(&mut self, chunk: &[u8]) {
        self.sha1.update(chunk);
        self.md5.update(chunk);
        self.sha256.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes folded in so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> Digests {
        Digests {
            sha1: hex::encode(self.sha1.finalize()),
            md5: hex::encode(self.md5.finalize()),
            sha256: hex::encode(self.sha256.finalize()),
        }
    }
}

/// One-shot digests of a complete buffer.
pub fn digest(payload: &[u8]) -> Digests {
    let mut checksum = Checksum::new();
    checksum.update(payload);
    checksum.finalize()
}
