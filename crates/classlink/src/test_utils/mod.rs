//
// test_utils/mod.rs
//
// In-memory request service and document helpers for unit tests
//

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tower_lsp::lsp_types::Url;

use crate::document::TextDocument;
use crate::language::LanguageId;
use crate::request::{FetchError, RequestService};

/// Serves registered texts and failures; unknown URIs are `NotFound`.
#[derive(Default)]
pub struct MemoryRequestService {
    contents: Mutex<HashMap<Url, Result<String, FetchError>>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl MemoryRequestService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, uri: &Url, text: &str) {
        if let Ok(mut contents) = self.contents.lock() {
            contents.insert(uri.clone(), Ok(text.to_string()));
        }
    }

    pub fn fail(&self, uri: &Url, error: FetchError) {
        if let Ok(mut contents) = self.contents.lock() {
            contents.insert(uri.clone(), Err(error));
        }
    }

    /// Delay every response; uses tokio time so paused tests stay fast.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.delay.lock() {
            *slot = delay;
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, uri: &Url) -> Result<String, FetchError> {
        self.contents
            .lock()
            .ok()
            .and_then(|contents| contents.get(uri).cloned())
            .unwrap_or_else(|| Err(FetchError::NotFound(uri.to_string())))
    }

    async fn respond(&self, uri: &Url) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.lookup(uri)
    }
}

#[async_trait]
impl RequestService for MemoryRequestService {
    async fn get_file_content(&self, uri: &Url) -> Result<String, FetchError> {
        self.respond(uri).await
    }

    async fn get_http_content(&self, uri: &Url) -> Result<String, FetchError> {
        self.respond(uri).await
    }

    /// Keyed by the URI as tracked, so virtual-scheme URIs are registered
    /// as-is.
    async fn fetch(&self, uri: &Url) -> Result<String, FetchError> {
        self.respond(uri).await
    }
}

pub fn url(path: &str) -> Url {
    Url::parse(&format!("file:///project/{}", path.trim_start_matches('/'))).unwrap()
}

pub fn document(path: &str, version: i32, text: &str) -> TextDocument {
    let uri = url(path);
    let language = LanguageId::from_uri(&uri).unwrap_or(LanguageId::Html);
    TextDocument::new(uri, language, version, text)
}
