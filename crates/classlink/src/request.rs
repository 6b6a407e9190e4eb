//
// request.rs
//
// Content retrieval for unopened reference documents
//

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tower_lsp::lsp_types::Url;

use crate::remote_cache::{Lookup, RemoteCache};
use crate::uri;

/// Why a reference document's content could not be obtained.
///
/// Cloneable so that every awaiter of the same pending fetch sees the same
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to read {uri}: {message}")]
    Io { uri: String, message: String },

    #[error("{uri} responded with HTTP {status}")]
    Http { uri: String, status: u16 },

    #[error("request to {uri} failed: {message}")]
    Transport { uri: String, message: String },

    #[error("no content provider for {0}")]
    UnsupportedScheme(String),

    #[error("request canceled")]
    Canceled,
}

/// Supplies the text of documents the editor has not opened.
#[async_trait]
pub trait RequestService: Send + Sync {
    async fn get_file_content(&self, uri: &Url) -> Result<String, FetchError>;

    /// `uri` is a plain `http`/`https` URL.
    async fn get_http_content(&self, uri: &Url) -> Result<String, FetchError>;

    /// Route by scheme: `file` to the filesystem, the virtual schemes to
    /// the network.
    async fn fetch(&self, uri: &Url) -> Result<String, FetchError> {
        match uri.scheme() {
            "file" => self.get_file_content(uri).await,
            "http" | "https" => self.get_http_content(uri).await,
            uri::HTTP_SCHEME | uri::HTTPS_SCHEME => match uri::to_remote(uri) {
                Some(remote) => self.get_http_content(&remote).await,
                None => Err(FetchError::UnsupportedScheme(uri.to_string())),
            },
            _ => Err(FetchError::UnsupportedScheme(uri.to_string())),
        }
    }
}

/// Filesystem reads via tokio and HTTP via `ureq` on the blocking pool,
/// with an optional persisted cache for remote stylesheets.
pub struct DefaultRequestService {
    agent: ureq::Agent,
    remote_cache: Option<Arc<RemoteCache>>,
    remote_enabled: bool,
    max_file_size: u64,
}

impl DefaultRequestService {
    pub fn new(
        remote_cache: Option<Arc<RemoteCache>>,
        remote_enabled: bool,
        max_file_size: u64,
    ) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(15)))
            .build();
        Self {
            agent: config.into(),
            remote_cache,
            remote_enabled,
            max_file_size,
        }
    }

    pub fn remote_cache(&self) -> Option<&Arc<RemoteCache>> {
        self.remote_cache.as_ref()
    }
}

#[async_trait]
impl RequestService for DefaultRequestService {
    async fn get_file_content(&self, uri: &Url) -> Result<String, FetchError> {
        let path = uri
            .to_file_path()
            .map_err(|_| FetchError::UnsupportedScheme(uri.to_string()))?;
        let io_error = |e: std::io::Error| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FetchError::NotFound(uri.to_string())
            } else {
                FetchError::Io {
                    uri: uri.to_string(),
                    message: e.to_string(),
                }
            }
        };

        let metadata = tokio::fs::metadata(&path).await.map_err(io_error)?;
        if metadata.len() > self.max_file_size {
            return Err(FetchError::Io {
                uri: uri.to_string(),
                message: format!("file exceeds {} bytes", self.max_file_size),
            });
        }
        tokio::fs::read_to_string(&path).await.map_err(io_error)
    }

    async fn get_http_content(&self, uri: &Url) -> Result<String, FetchError> {
        if !self.remote_enabled {
            return Err(FetchError::UnsupportedScheme(uri.to_string()));
        }
        let agent = self.agent.clone();
        let cache = self.remote_cache.clone();
        let url = uri.to_string();

        tokio::task::spawn_blocking(move || fetch_http(&agent, cache.as_deref(), &url))
            .await
            .map_err(|e| FetchError::Transport {
                uri: uri.to_string(),
                message: format!("task join error: {}", e),
            })?
    }
}

fn fetch_http(agent: &ureq::Agent, cache: Option<&RemoteCache>, url: &str) -> Result<String, FetchError> {
    let stale = match cache.map(|c| c.lookup(url)) {
        Some(Lookup::Fresh(text)) => {
            log::trace!("Remote cache hit for {}", url);
            return Ok(text);
        }
        Some(Lookup::Stale { text, entry }) => Some((text, entry)),
        Some(Lookup::Missing) | None => None,
    };

    let mut request = agent.get(url);
    if let Some((_, entry)) = &stale {
        if let Some(etag) = &entry.etag {
            request = request.header("If-None-Match", etag);
        }
        if let Some(last_modified) = &entry.last_modified {
            request = request.header("If-Modified-Since", last_modified);
        }
    }

    let response = match request.call() {
        Ok(response) => response,
        Err(e) => {
            let error = match e {
                ureq::Error::StatusCode(status) => FetchError::Http {
                    uri: url.to_string(),
                    status,
                },
                other => FetchError::Transport {
                    uri: url.to_string(),
                    message: other.to_string(),
                },
            };
            // Stale content beats no content
            return match stale {
                Some((text, _)) => {
                    log::warn!("{}; serving cached copy", error);
                    Ok(text)
                }
                None => Err(error),
            };
        }
    };

    if response.status().as_u16() == 304 {
        if let Some((text, _)) = stale {
            if let Some(cache) = cache {
                if let Err(e) = cache.touch(url) {
                    log::warn!("Failed to update cache index for {}: {}", url, e);
                }
            }
            return Ok(text);
        }
    }

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    let etag = header("etag");
    let last_modified = header("last-modified");

    let text = response
        .into_body()
        .read_to_string()
        .map_err(|e| FetchError::Transport {
            uri: url.to_string(),
            message: e.to_string(),
        })?;

    if let Some(cache) = cache {
        if let Err(e) = cache.store(url, &text, etag, last_modified) {
            log::warn!("Failed to cache {}: {}", url, e);
        }
    }
    Ok(text)
}
