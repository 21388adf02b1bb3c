//! Release fetching from a remote URL or a local archive
//!
//! Both sources land in a temporary file so extraction behaves identically:
//! - Remote: streams the archive over HTTP(S)
//! - Local: copies the archive from disk (offline builds, tests)

use crate::error::ProvisionError;
use crate::product::ReleaseConfig;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use url::Url;

/// Where release archives come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseSource {
    Remote(Url),
    Local(PathBuf),
}

impl ReleaseSource {
    /// Expand a URL template for a version. Plain paths and `file://` URLs become local sources.
    pub fn from_template(template: &str, version: &str) -> Result<Self, ProvisionError> {
        let location = template.replace("{version}", version);
        if location.starts_with("http://") || location.starts_with("https://") {
            let url = Url::parse(&location).map_err(|e| ProvisionError::Fetch {
                version: version.to_string(),
                location: location.clone(),
                reason: format!("invalid release URL: {}", e),
            })?;
            return Ok(Self::Remote(url));
        }
        if location.starts_with("file://") {
            let path = Url::parse(&location)
                .ok()
                .and_then(|url| url.to_file_path().ok())
                .ok_or_else(|| ProvisionError::Fetch {
                    version: version.to_string(),
                    location: location.clone(),
                    reason: "invalid file:// URL".to_string(),
                })?;
            return Ok(Self::Local(path));
        }
        Ok(Self::Local(PathBuf::from(location)))
    }

    /// Resolve the source for a product, honouring its URL override variable
    pub fn from_config<C: ReleaseConfig>(
        config: &C,
        version: &str,
    ) -> Result<Self, ProvisionError> {
        let template = std::env::var(config.release_url_env())
            .ok()
            .or_else(|| config.default_release_url().map(str::to_string))
            .ok_or_else(|| ProvisionError::Fetch {
                version: version.to_string(),
                location: "<unset>".to_string(),
                reason: format!(
                    "no release URL configured; set {} to a template containing {{version}}",
                    config.release_url_env()
                ),
            })?;
        Self::from_template(&template, version)
    }

    pub fn display(&self) -> String {
        match self {
            Self::Remote(url) => url.to_string(),
            Self::Local(path) => path.display().to_string(),
        }
    }

    /// Name of the archive file, used as a format hint
    pub fn file_name(&self) -> Option<String> {
        match self {
            Self::Remote(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(str::to_string),
            Self::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
        }
    }
}

/// A downloaded archive. The temporary file is removed when this is dropped.
#[derive(Debug)]
pub struct FetchedArchive {
    pub file: NamedTempFile,
    pub file_name: Option<String>,
    pub size: u64,
}

/// Release fetcher - retrieves release archives from remote or local sources
pub struct ReleaseFetcher {
    client: reqwest::Client,
}

impl ReleaseFetcher {
    /// Create a new fetcher with a custom user agent
    pub fn new(user_agent: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(user_agent)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Fetch the archive for `version` into a temporary file
    pub async fn fetch(
        &self,
        source: &ReleaseSource,
        version: &str,
    ) -> Result<FetchedArchive, ProvisionError> {
        let fail = |reason: String| ProvisionError::Fetch {
            version: version.to_string(),
            location: source.display(),
            reason,
        };

        let mut file = NamedTempFile::new()
            .map_err(|e| fail(format!("failed to allocate temp file: {}", e)))?;

        let size = match source {
            ReleaseSource::Remote(url) => {
                info!(url = %url, "downloading release archive");
                let mut response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| fail(e.to_string()))?;

                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Err(fail("release does not exist (HTTP 404)".to_string()));
                }
                if !response.status().is_success() {
                    return Err(fail(format!("HTTP {}", response.status())));
                }

                let mut size = 0u64;
                while let Some(chunk) = response.chunk().await.map_err(|e| fail(e.to_string()))? {
                    file.write_all(&chunk)
                        .map_err(|e| fail(format!("failed to write archive: {}", e)))?;
                    size += chunk.len() as u64;
                }
                size
            }
            ReleaseSource::Local(path) => {
                info!(path = %path.display(), "copying local release archive");
                if !path.is_file() {
                    return Err(fail("release does not exist".to_string()));
                }
                let mut input = std::fs::File::open(path)
                    .map_err(|e| fail(format!("failed to open archive: {}", e)))?;
                std::io::copy(&mut input, file.as_file_mut())
                    .map_err(|e| fail(format!("failed to copy archive: {}", e)))?
            }
        };

        file.flush()
            .map_err(|e| fail(format!("failed to write archive: {}", e)))?;
        debug!(bytes = size, path = %file.path().display(), "archive stored");

        Ok(FetchedArchive {
            file,
            file_name: source.file_name(),
            size,
        })
    }
}
