//! Join metadata handed from the bootstrap server to every other node.

use std::net::Ipv4Addr;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::files::{self, FileError};

/// Port the k3s supervisor listens on.
pub const K3S_API_PORT: u16 = 6443;

/// Where a joining node finds the cluster and the secret it presents.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct JoinMetadata {
    /// Supervisor URL, `https://<cluster-ip>:6443`.
    pub url: String,
    /// Contents of the bootstrap server's `node-token`.
    pub token: String,
}

impl JoinMetadata {
    /// Builds metadata for a cluster reachable on `cluster_ip`.
    #[must_use]
    pub fn for_cluster(cluster_ip: Ipv4Addr, token: impl Into<String>) -> Self {
        Self {
            url: format!("https://{cluster_ip}:{K3S_API_PORT}"),
            token: token.into(),
        }
    }
}

/// Errors raised while reading or writing join metadata.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JoinError {
    /// Raised when a joining node finds no metadata; the bootstrap server
    /// has to be created first.
    #[error("join metadata not found at {path}; create the cluster-init server first")]
    Missing {
        /// Path that was looked up.
        path: String,
    },
    /// Raised when the file exists but cannot be read or written.
    #[error("failed to access join metadata: {0}")]
    File(#[from] FileError),
    /// Raised when the file is not valid join metadata.
    #[error("invalid join metadata at {path}: {message}")]
    Parse {
        /// Path that was parsed.
        path: String,
        /// Parser error message.
        message: String,
    },
}

/// Reads join metadata.
///
/// # Errors
///
/// Returns [`JoinError::Missing`] when the file does not exist, and
/// [`JoinError::Parse`] when it is malformed or has an empty field.
pub fn read(path: &Utf8Path) -> Result<JoinMetadata, JoinError> {
    let contents = files::read_to_string(path).map_err(|err| {
        if err.not_found {
            JoinError::Missing {
                path: path.to_string(),
            }
        } else {
            JoinError::File(err)
        }
    })?;
    let metadata: JoinMetadata =
        serde_json::from_str(&contents).map_err(|err| JoinError::Parse {
            path: path.to_string(),
            message: err.to_string(),
        })?;
    ensure_complete(path, &metadata)?;
    Ok(metadata)
}

fn ensure_complete(path: &Utf8Path, metadata: &JoinMetadata) -> Result<(), JoinError> {
    if metadata.url.trim().is_empty() || metadata.token.trim().is_empty() {
        return Err(JoinError::Parse {
            path: path.to_string(),
            message: String::from("url and token must not be empty"),
        });
    }
    Ok(())
}

/// Writes join metadata, creating parent directories.
///
/// # Errors
///
/// Returns [`JoinError::Parse`] without touching the file when the url or
/// token is empty, and [`JoinError::File`] when the file cannot be written.
pub fn write(path: &Utf8Path, metadata: &JoinMetadata) -> Result<(), JoinError> {
    ensure_complete(path, metadata)?;
    let mut contents =
        serde_json::to_string_pretty(metadata).map_err(|err| JoinError::Parse {
            path: path.to_string(),
            message: err.to_string(),
        })?;
    contents.push('\n');
    files::write(path, &contents)?;
    Ok(())
}
