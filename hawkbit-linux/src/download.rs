//! Download & verify: stream an artifact to disk through `DownloadState`, then check
//! size and digest. Any failure removes the file.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use hawkbit_core::{
    Artifact, CycleError, DownloadState, Failure, StreamError, VerificationError,
};
use tracing::{debug, info, warn};

use crate::transport::{StreamFailure, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("cannot create download destination {path}: {source}")]
    Destination { path: PathBuf, source: io::Error },
    #[error("insufficient disk space for {needed} bytes ({available} available)")]
    InsufficientSpace { needed: u64, available: u64 },
    #[error("artifact {0} carries no usable checksum")]
    NoChecksum(String),
    #[error("writing {path} failed: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
}

impl DownloadError {
    pub fn failure(&self) -> Failure {
        match self {
            DownloadError::Destination { .. } => Failure::Fatal,
            DownloadError::Transport(e) => e.failure(),
            DownloadError::InsufficientSpace { .. }
            | DownloadError::NoChecksum(_)
            | DownloadError::Write { .. }
            | DownloadError::Verification(_) => Failure::Rejected,
        }
    }
}

impl From<DownloadError> for CycleError {
    fn from(e: DownloadError) -> Self {
        CycleError::new(e.failure(), e.to_string())
    }
}

/// Download `artifact` to `dest`. Returns `dest` once size and digest check out.
pub async fn download_artifact(
    transport: &Transport,
    artifact: &Artifact,
    dest: &Path,
) -> Result<PathBuf, DownloadError> {
    let expected = artifact
        .expected_digest()
        .ok_or_else(|| DownloadError::NoChecksum(artifact.filename.clone()))?;
    let dir = prepare_dir(dest)?;
    let available = available_space(&dir, dest)?;
    if available < artifact.size {
        return Err(DownloadError::InsufficientSpace {
            needed: artifact.size,
            available,
        });
    }
    let file = File::create(dest).map_err(|source| DownloadError::Destination {
        path: dest.to_path_buf(),
        source,
    })?;
    info!(
        artifact = %artifact.name,
        size = artifact.size,
        url = %artifact.download_url,
        dest = %dest.display(),
        "downloading"
    );

    let mut state = DownloadState::new(BufWriter::new(file), artifact.size);
    let mut last_logged = 0u32;
    let streamed = transport
        .stream(&artifact.download_url, |chunk| {
            state.write_chunk(chunk)?;
            let pct = state.percent();
            if pct >= last_logged + 10 {
                last_logged = pct - pct % 10;
                debug!(percent = pct, "download progress");
            }
            Ok::<(), StreamError>(())
        })
        .await;

    let result = match streamed {
        Ok(_) => state.finish(&expected).map(|_| ()).map_err(|e| stream_error(e, dest)),
        Err(StreamFailure::Transport(e)) => Err(e.into()),
        Err(StreamFailure::Sink(e)) => Err(stream_error(e, dest)),
    };
    match result {
        Ok(()) => {
            info!(artifact = %artifact.name, "download verified");
            Ok(dest.to_path_buf())
        }
        Err(e) => {
            discard(dest);
            Err(e)
        }
    }
}

fn stream_error(e: StreamError, dest: &Path) -> DownloadError {
    match e {
        StreamError::Io(source) => DownloadError::Write {
            path: dest.to_path_buf(),
            source,
        },
        StreamError::Verification(v) => DownloadError::Verification(v),
    }
}

fn prepare_dir(dest: &Path) -> Result<PathBuf, DownloadError> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|source| DownloadError::Destination {
        path: dest.to_path_buf(),
        source,
    })?;
    Ok(dir)
}

/// Free bytes in `dir`, counting an existing `dest` as reclaimable.
fn available_space(dir: &Path, dest: &Path) -> Result<u64, DownloadError> {
    let st = nix::sys::statvfs::statvfs(dir).map_err(|errno| DownloadError::Destination {
        path: dest.to_path_buf(),
        source: io::Error::from(errno),
    })?;
    let free = (st.blocks_available() as u64).saturating_mul(st.fragment_size() as u64);
    let existing = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
    Ok(free.saturating_add(existing))
}

fn discard(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "partial download removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove partial download: {}", e),
    }
}
