//! Device identity: controller id and the attribute map sent on identification.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::Config;

/// Attribute value when its source file is missing or empty.
pub const UNKNOWN_VERSION: &str = "0.0.0";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("device id file {path} cannot be read: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("device id file {0} is empty")]
    Empty(PathBuf),
    #[error("device id in {0} is not alphanumeric")]
    NotAlphanumeric(PathBuf),
    #[error("no controller id configured")]
    Missing,
}

/// Controller id from `device_id_file` when set, else `target_name`.
pub fn controller_id(config: &Config) -> Result<String, IdentityError> {
    if let Some(path) = &config.client.device_id_file {
        return read_device_id(path);
    }
    config
        .client
        .target_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or(IdentityError::Missing)
}

/// Read an ASCII-alphanumeric device id. Trailing whitespace is ignored.
pub fn read_device_id(path: &Path) -> Result<String, IdentityError> {
    let raw = std::fs::read_to_string(path).map_err(|source| IdentityError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let id = raw.trim_end();
    if id.is_empty() {
        return Err(IdentityError::Empty(path.to_path_buf()));
    }
    if !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(IdentityError::NotAlphanumeric(path.to_path_buf()));
    }
    Ok(id.to_string())
}

/// Attribute from a file: `VERSION_ID` for os-release style content, else the trimmed
/// contents. Falls back to [`UNKNOWN_VERSION`].
pub fn read_attribute(path: &Path) -> String {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), "attribute file unreadable: {}", e);
            return UNKNOWN_VERSION.to_string();
        }
    };
    let value = content
        .lines()
        .find_map(|l| l.trim().strip_prefix("VERSION_ID="))
        .map(|v| v.trim().trim_matches('"').trim_matches('\''))
        .unwrap_or_else(|| content.trim());
    if value.is_empty() {
        UNKNOWN_VERSION.to_string()
    } else {
        value.to_string()
    }
}

/// Static `[device]` attributes plus those read from `[attribute_files]`. File values win.
pub fn device_attributes(config: &Config) -> BTreeMap<String, String> {
    let mut attrs = config.device.clone();
    for (name, path) in &config.attribute_files {
        attrs.insert(name.clone(), read_attribute(path));
    }
    attrs
}
