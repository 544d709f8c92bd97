//! Credential archive client.
//!
//! Captured credential artifacts are shipped off-box to a blob store before
//! local state is discarded. The store is consumed through a trait so tests
//! and alternative backends can swap it out; the shipped implementation talks
//! to an HTTP blob store with an optional bearer token.

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::{ArchiveError, ConfigError};

/// Remote archive for credential artifacts.
#[async_trait]
pub trait CredentialArchive: Send + Sync + 'static {
    /// Upload the file at `local_path` under `remote_name`, returning a
    /// shareable locator for the stored object.
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<String, ArchiveError>;
}

/// Extract the short file reference from a share-link locator.
///
/// Locators of the form `https://host/file/<id>#<key>` yield `<id>#<key>`;
/// anything else yields `None` and callers fall back to the raw locator.
pub fn file_reference(locator: &str) -> Option<String> {
    static SHARE_LINK: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"/file/([^#/]+#[^/]+)").expect("share-link pattern"));
    SHARE_LINK
        .captures(locator)
        .map(|caps| caps[1].to_string())
}

/// Settings for the HTTP blob store.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Base URL objects are uploaded under.
    pub base_url: Url,
    /// Optional bearer token.
    pub token: Option<SecretString>,
}

impl ArchiveConfig {
    /// Read `ARCHIVE_URL` and `ARCHIVE_TOKEN` from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = std::env::var("ARCHIVE_URL").map_err(|_| ConfigError::MissingRequired {
            key: "ARCHIVE_URL".to_string(),
            hint: "Set ARCHIVE_URL to the blob store base URL".to_string(),
        })?;
        let base_url = Url::parse(&raw).map_err(|e| ConfigError::InvalidValue {
            key: "ARCHIVE_URL".to_string(),
            message: e.to_string(),
        })?;
        let token = std::env::var("ARCHIVE_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(SecretString::from);
        Ok(Self { base_url, token })
    }
}

/// HTTP blob store client.
pub struct HttpArchive {
    client: reqwest::Client,
    config: ArchiveConfig,
}

impl HttpArchive {
    /// Create a client for the given store.
    pub fn new(config: ArchiveConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl CredentialArchive for HttpArchive {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<String, ArchiveError> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| ArchiveError::MissingArtifact {
                path: local_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let url = self
            .config
            .base_url
            .join(remote_name)
            .map_err(|e| ArchiveError::InvalidUrl(e.to_string()))?;

        let mut request = self.client.put(url.clone()).body(bytes);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::Upload {
                name: remote_name.to_string(),
                reason: format!("status {status}"),
            });
        }

        // Stores that mint share links return the locator in the body;
        // otherwise the object URL itself is the locator.
        let body = response.text().await?;
        let locator = body.trim();
        if locator.is_empty() {
            Ok(url.to_string())
        } else {
            Ok(locator.to_string())
        }
    }
}
