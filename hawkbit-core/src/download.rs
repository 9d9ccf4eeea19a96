//! Download accounting: write received chunks to a sink while hashing them, then verify
//! size and digest. The sink is any `Write`; the host decides where bytes land.

use std::io::{self, Write};

use crate::checksum::{Algorithm, Checksum, Digests, ExpectedDigest};

/// Why a finished (or overflowing) download was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("received more than the declared {expected} bytes")]
    SizeExceeded { expected: u64 },
    #[error("size mismatch: declared {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("{algorithm} mismatch: expected {expected}, computed {actual}")]
    DigestMismatch {
        algorithm: Algorithm,
        expected: String,
        actual: String,
    },
}

/// Failure while feeding or finishing a download.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Verification(#[from] VerificationError),
}

/// State of one artifact transfer: destination, expected size, progress, running checksum.
pub struct DownloadState<W: Write> {
    sink: W,
    expected_size: u64,
    written: u64,
    checksum: Checksum,
}

impl<W: Write> DownloadState<W> {
    pub fn new(sink: W, expected_size: u64) -> Self {
        Self {
            sink,
            expected_size,
            written: 0,
            checksum: Checksum::new(),
        }
    }

    /// Write one received chunk and fold it into the checksum. Rejects a chunk that would
    /// push the total past the declared size; nothing of that chunk is written.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StreamError> {
        let total = self.written + chunk.len() as u64;
        if total > self.expected_size {
            return Err(VerificationError::SizeExceeded {
                expected: self.expected_size,
            }
            .into());
        }
        self.sink.write_all(chunk)?;
        self.checksum.update(chunk);
        self.written = total;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    /// Whole percent received, 0..=100.
    pub fn percent(&self) -> u32 {
        if self.expected_size == 0 {
            return 100;
        }
        ((self.written.saturating_mul(100)) / self.expected_size).min(100) as u32
    }

    /// Flush the sink and check size, then digest. Returns the sink and all digests on success.
    pub fn finish(mut self, expected: &ExpectedDigest) -> Result<(W, Digests), StreamError> {
        self.sink.flush()?;
        if self.written != self.expected_size {
            return Err(VerificationError::SizeMismatch {
                expected: self.expected_size,
                actual: self.written,
            }
            .into());
        }
        let digests = self.checksum.finalize();
        if !expected.matches(&digests) {
            return Err(VerificationError::DigestMismatch {
                algorithm: expected.algorithm,
                expected: expected.hex.clone(),
                actual: digests.get(expected.algorithm).to_string(),
            }
            .into());
        }
        Ok((self.sink, digests))
    }
}
