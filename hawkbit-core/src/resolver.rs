//! Deployment resolver: turn raw server replies into typed actions. No I/O.

use std::time::Duration;

use crate::checksum::{Algorithm, ExpectedDigest};
use crate::ddi::{ArtifactSection, CancelResponse, DeploymentBaseResponse, PollResponse};
use crate::endpoint::Endpoint;

/// What the server wants the device to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollAction {
    /// Nothing pending.
    NoAction,
    /// A deployment is assigned; `href` is its deployment-base resource.
    DeploymentBase { href: String },
    /// A running action must be cancelled; `href` is the cancel resource.
    CancelAction { href: String },
}

/// A decoded poll reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReply {
    /// Server-suggested interval until the next poll.
    pub sleep: Option<Duration>,
    pub action: PollAction,
    /// The server asked for the device attributes (`configData` link present).
    pub config_data_requested: bool,
}

/// The downloadable payload of a deployment and its integrity metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub version: String,
    pub filename: String,
    /// Declared size in bytes.
    pub size: u64,
    pub download_url: String,
    pub feedback_url: String,
    pub sha1: Option<String>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
}

impl Artifact {
    /// Digest the download is checked against: SHA-1 if present, else MD5, else SHA-256.
    pub fn expected_digest(&self) -> Option<ExpectedDigest> {
        if let Some(h) = &self.sha1 {
            return Some(ExpectedDigest::new(Algorithm::Sha1, h));
        }
        if let Some(h) = &self.md5 {
            return Some(ExpectedDigest::new(Algorithm::Md5, h));
        }
        self.sha256
            .as_ref()
            .map(|h| ExpectedDigest::new(Algorithm::Sha256, h))
    }
}

/// An assigned deployment: one artifact under one action id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub action_id: String,
    pub feedback_url: String,
    pub artifact: Artifact,
}

/// A cancel request for a running action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancel {
    pub action_id: String,
    pub stop_id: String,
    pub feedback_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid sleep interval {0:?}, expected HH:MM:SS")]
    InvalidSleep(String),
    #[error("deployment {0} carries no artifact")]
    NoArtifact(String),
    #[error("artifact {0} has no download link")]
    NoDownloadLink(String),
    #[error("artifact {0} has no usable checksum")]
    NoChecksum(String),
    #[error("artifact {filename} has invalid {algorithm} checksum {value:?}")]
    InvalidChecksum {
        filename: String,
        algorithm: Algorithm,
        value: String,
    },
    #[error("empty {0}")]
    EmptyField(&'static str),
}

/// Longest sleep hint accepted from the server (30 days).
pub const MAX_SLEEP: Duration = Duration::from_secs(30 * 24 * 3600);

/// Parse `HH:MM:SS` into a duration, at most [`MAX_SLEEP`].
pub fn parse_sleep(s: &str) -> Result<Duration, ResolverError> {
    let invalid = || ResolverError::InvalidSleep(s.to_string());
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }
    let mut fields = [0u64; 3];
    for (field, part) in fields.iter_mut().zip(&parts) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        *field = part.parse().map_err(|_| invalid())?;
    }
    let [h, m, sec] = fields;
    if m >= 60 || sec >= 60 {
        return Err(invalid());
    }
    let secs = h
        .checked_mul(3600)
        .and_then(|s| s.checked_add(m * 60 + sec))
        .ok_or_else(invalid)?;
    let sleep = Duration::from_secs(secs);
    if sleep > MAX_SLEEP {
        return Err(invalid());
    }
    Ok(sleep)
}

/// Decode a poll reply. An empty body means nothing is pending.
pub fn resolve_poll(body: &[u8]) -> Result<PollReply, ResolverError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(PollReply {
            sleep: None,
            action: PollAction::NoAction,
            config_data_requested: false,
        });
    }
    let resp: PollResponse = serde_json::from_slice(body)?;
    let sleep = resp
        .config
        .and_then(|c| c.polling)
        .and_then(|p| p.sleep)
        .map(|s| parse_sleep(&s))
        .transpose()?;
    let links = resp.links.unwrap_or_default();
    // Cancellation wins over a new deployment: the running action has to be acknowledged first.
    let action = match (links.cancel_action, links.deployment_base) {
        (Some(cancel), _) => PollAction::CancelAction {
            href: non_empty(cancel.href, "cancelAction href")?,
        },
        (None, Some(base)) => PollAction::DeploymentBase {
            href: non_empty(base.href, "deploymentBase href")?,
        },
        (None, None) => PollAction::NoAction,
    };
    Ok(PollReply {
        sleep,
        action,
        config_data_requested: links.config_data.is_some(),
    })
}

/// Decode a deployment-base reply into its single artifact.
/// `prefer_https` selects the `download` link over `download-http` when both exist.
pub fn resolve_deployment(
    body: &[u8],
    endpoint: &Endpoint,
    prefer_https: bool,
) -> Result<Deployment, ResolverError> {
    let resp: DeploymentBaseResponse = serde_json::from_slice(body)?;
    let action_id = non_empty(resp.id, "action id")?;
    let feedback_url = endpoint.deployment_feedback_url(&action_id);

    let (chunk, section) = resp
        .deployment
        .chunks
        .into_iter()
        .find_map(|mut c| {
            if c.artifacts.is_empty() {
                None
            } else {
                let first = c.artifacts.remove(0);
                Some((c, first))
            }
        })
        .ok_or_else(|| ResolverError::NoArtifact(action_id.clone()))?;

    let ArtifactSection {
        filename,
        size,
        hashes,
        links,
    } = section;
    let filename = non_empty(filename, "artifact filename")?;

    let https = links.download.map(|l| l.href);
    let http = links.download_http.map(|l| l.href);
    let preferred = if prefer_https { https.or(http) } else { http.or(https) };
    let download_url = preferred
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ResolverError::NoDownloadLink(filename.clone()))?;

    let sha1 = checked_hex(hashes.sha1, Algorithm::Sha1, 40, &filename)?;
    let md5 = checked_hex(hashes.md5, Algorithm::Md5, 32, &filename)?;
    let sha256 = checked_hex(hashes.sha256, Algorithm::Sha256, 64, &filename)?;
    if sha1.is_none() && md5.is_none() && sha256.is_none() {
        return Err(ResolverError::NoChecksum(filename));
    }

    let artifact = Artifact {
        name: chunk.name.unwrap_or_else(|| filename.clone()),
        version: chunk.version.unwrap_or_default(),
        filename,
        size,
        download_url,
        feedback_url: feedback_url.clone(),
        sha1,
        md5,
        sha256,
    };
    Ok(Deployment {
        action_id,
        feedback_url,
        artifact,
    })
}

/// Decode a cancel-action reply.
pub fn resolve_cancel(body: &[u8], endpoint: &Endpoint) -> Result<Cancel, ResolverError> {
    let resp: CancelResponse = serde_json::from_slice(body)?;
    let action_id = non_empty(resp.id, "action id")?;
    Ok(Cancel {
        feedback_url: endpoint.cancel_feedback_url(&action_id),
        stop_id: resp.cancel_action.stop_id,
        action_id,
    })
}

fn non_empty(value: String, what: &'static str) -> Result<String, ResolverError> {
    if value.trim().is_empty() {
        Err(ResolverError::EmptyField(what))
    } else {
        Ok(value)
    }
}

fn checked_hex(
    value: Option<String>,
    algorithm: Algorithm,
    len: usize,
    filename: &str,
) -> Result<Option<String>, ResolverError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let v = raw.trim().to_ascii_lowercase();
    if v.is_empty() {
        return Ok(None);
    }
    if v.len() != len || !v.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ResolverError::InvalidChecksum {
            filename: filename.to_string(),
            algorithm,
            value: raw,
        });
    }
    Ok(Some(v))
}
