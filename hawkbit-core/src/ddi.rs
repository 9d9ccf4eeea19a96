//! hawkBit Direct Device Integration (DDI) wire types: JSON bodies exchanged with the server.
//!
//! Inbound types are lenient (unknown fields ignored, optional sections defaulted); the
//! resolver decides which missing fields are fatal. Outbound types serialize to the exact
//! shapes the server expects.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// `GET {tenant}/controller/v1/{controller}` reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub config: Option<PollConfig>,
    #[serde(rename = "_links", default)]
    pub links: Option<PollLinks>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollConfig {
    #[serde(default)]
    pub polling: Option<Polling>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Polling {
    /// Suggested poll interval, `HH:MM:SS`.
    #[serde(default)]
    pub sleep: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollLinks {
    #[serde(rename = "deploymentBase", default)]
    pub deployment_base: Option<Link>,
    #[serde(rename = "cancelAction", default)]
    pub cancel_action: Option<Link>,
    #[serde(rename = "configData", default)]
    pub config_data: Option<Link>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub href: String,
}

/// `GET .../deploymentBase/{id}` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentBaseResponse {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub deployment: DeploymentSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentSection {
    #[serde(default)]
    pub chunks: Vec<ChunkSection>,
}

/// A software module of the deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkSection {
    #[serde(default)]
    pub part: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactSection {
    pub filename: String,
    pub size: u64,
    #[serde(default)]
    pub hashes: Hashes,
    #[serde(rename = "_links", default)]
    pub links: ArtifactLinks,
}

/// Checksums keyed by algorithm.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Hashes {
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactLinks {
    #[serde(default)]
    pub download: Option<Link>,
    #[serde(rename = "download-http", default)]
    pub download_http: Option<Link>,
}

/// `GET .../cancelAction/{id}` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct CancelResponse {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "cancelAction")]
    pub cancel_action: CancelSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelSection {
    #[serde(rename = "stopId", deserialize_with = "string_or_number")]
    pub stop_id: String,
}

/// Execution status of an action, as reported in feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    Closed,
    Proceeding,
    Canceled,
    Scheduled,
    Rejected,
    Resumed,
}

/// Result of an action, as reported in feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Finished {
    Success,
    Failure,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub cnt: u32,
    pub of: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultBody {
    pub finished: Finished,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusBody {
    pub execution: Execution,
    pub result: ResultBody,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

/// `POST .../{deploymentBase|cancelAction}/{id}/feedback` body.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackBody {
    pub id: String,
    pub time: String,
    pub status: StatusBody,
}

/// `PUT .../configData` body.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigDataBody {
    pub id: String,
    pub time: String,
    pub status: StatusBody,
    pub mode: &'static str,
    pub data: BTreeMap<String, String>,
}

/// Action ids are strings in DDI, but some servers emit bare numbers.
fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(u64),
    }
    Ok(match Id::deserialize(d)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
