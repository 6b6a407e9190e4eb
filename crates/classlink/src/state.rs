//
// state.rs
//
// Server state: configuration, caches, reference graph and documents
//

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tower_lsp::lsp_types::{TextDocumentContentChangeEvent, Url};
use walkdir::WalkDir;

use crate::config::ServerConfig;
use crate::document::TextDocument;
use crate::document_store::DocumentStore;
use crate::entry::build_entry;
use crate::language::{is_stylesheet_path, LanguageId, SCANNED_EXTENSIONS};
use crate::model_cache::LanguageCaches;
use crate::modes::ModeRegistry;
use crate::reference_map::ReferenceMap;
use crate::remote_cache::RemoteCache;
use crate::request::{DefaultRequestService, RequestService};

/// Global LSP state
pub struct WorldState {
    pub config: ServerConfig,
    pub caches: LanguageCaches,
    pub reference_map: ReferenceMap,
    pub documents: DocumentStore,
    pub modes: ModeRegistry,
    pub service: Arc<dyn RequestService>,
    pub remote_cache: Option<Arc<RemoteCache>>,
    pub workspace_folders: Vec<Url>,
    /// Whether `service` was built from the config and should follow it.
    owns_default_service: bool,
}

impl std::fmt::Debug for WorldState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldState")
            .field("config", &self.config)
            .field("documents", &self.documents)
            .field("workspace_folders", &self.workspace_folders)
            .finish_non_exhaustive()
    }
}

impl WorldState {
    /// State with an injected request service and no persisted remote cache.
    pub fn new(config: ServerConfig, service: Arc<dyn RequestService>) -> Self {
        Self {
            caches: LanguageCaches::new(config.cache_max_entries, config.cleanup_interval()),
            reference_map: ReferenceMap::new(),
            documents: DocumentStore::new(Arc::clone(&service)),
            modes: ModeRegistry::default(),
            service,
            remote_cache: None,
            workspace_folders: Vec::new(),
            owns_default_service: false,
            config,
        }
    }

    /// State backed by the filesystem, the network and the persisted cache.
    pub fn with_default_service(config: ServerConfig) -> Self {
        let (service, remote_cache) = default_request_service(&config);
        let mut state = Self::new(config, service);
        state.remote_cache = remote_cache;
        state.owns_default_service = true;
        state
    }

    /// Apply new settings. Language caches are rebuilt when their bounds
    /// change; the reference map is kept unless scanning was turned off.
    pub fn apply_config(&mut self, config: ServerConfig) {
        if self.config.caches_differ(&config) {
            self.caches.dispose();
            self.caches = LanguageCaches::new(config.cache_max_entries, config.cleanup_interval());
        }
        if !config.workspace_scan {
            self.reference_map.clear();
        }
        let remote_changed = self.config.remote_enabled != config.remote_enabled
            || self.config.remote_cache_expiry_secs != config.remote_cache_expiry_secs
            || self.config.remote_cache_path != config.remote_cache_path
            || self.config.max_file_size_bytes != config.max_file_size_bytes;
        self.config = config;
        if remote_changed && self.owns_default_service {
            let (service, remote_cache) = default_request_service(&self.config);
            self.documents.set_service(Arc::clone(&service));
            self.service = service;
            self.remote_cache = remote_cache;
        }
    }

    pub fn open_document(&mut self, document: TextDocument) {
        let uri = document.uri.clone();
        // Editor versions restart on reopen; drop whatever was memoized
        self.caches.on_document_removed(&uri);
        self.documents.open(document);
        self.refresh_references(&uri);
    }

    pub fn change_document(
        &mut self,
        uri: &Url,
        version: i32,
        changes: Vec<TextDocumentContentChangeEvent>,
    ) {
        if self.documents.update(uri, version, changes) {
            self.refresh_references(uri);
        }
    }

    pub fn close_document(&mut self, uri: &Url) {
        self.documents.close(uri);
        self.caches.on_document_removed(uri);
    }

    /// Keep the graph in step with an edited document once a scan has
    /// populated it.
    pub fn refresh_references(&mut self, uri: &Url) {
        if !self.reference_map.is_scanned() {
            return;
        }
        let Some(document) = self.documents.document(uri).cloned() else {
            return;
        };
        let entry = self.caches.get(&document);
        self.reference_map
            .update(uri, entry.references.iter().cloned());
    }

    /// Settle finished fetches into the document store.
    pub fn settle_fetches(&mut self) {
        for uri in self.documents.settle_ready() {
            log::trace!("Resolved reference document {}", uri);
        }
    }

    /// Install a completed workspace scan, then overlay the editor's own
    /// text for open documents. A scan that lost a race is dropped.
    pub fn apply_scan(&mut self, scanned: Vec<(Url, Vec<Url>)>) {
        if self.reference_map.is_scanned() {
            log::trace!("Discarding duplicate workspace scan");
            return;
        }
        self.reference_map.rebuild(scanned);
        let open: Vec<Url> = self.documents.main_uris().cloned().collect();
        for uri in &open {
            self.refresh_references(uri);
        }
    }

    /// A watched file was created or changed on disk. `references` is its
    /// freshly extracted reference list when it is not open in the editor.
    pub fn on_file_changed(&mut self, uri: &Url, references: Option<Vec<Url>>) {
        if self.documents.opened_document(uri).is_some() {
            return;
        }
        if self.documents.refetch(uri) {
            log::trace!("Refetching changed reference document {}", uri);
        }
        if let Some(references) = references {
            if self.reference_map.is_scanned() {
                self.reference_map.update(uri, references);
            }
        }
    }

    pub fn on_file_deleted(&mut self, uri: &Url) {
        self.reference_map.remove(uri);
        if self.documents.source_deleted(uri) {
            log::trace!("Dropped text of deleted reference document {}", uri);
        }
    }

    /// Replace the edges a closed document's editor text contributed with
    /// those of its saved file, or drop them when there is no file.
    pub fn restore_disk_references(&mut self, uri: &Url, references: Option<Vec<Url>>) {
        if !self.reference_map.is_scanned() || self.documents.opened_document(uri).is_some() {
            return;
        }
        match references {
            Some(references) => self.reference_map.update(uri, references),
            None => self.reference_map.remove(uri),
        }
    }

    /// Tear down caches and tracked state.
    pub fn shutdown(&mut self) {
        self.caches.dispose();
        self.documents.clear();
        self.reference_map.clear();
    }

    fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            folders: self.workspace_folders.clone(),
            exclude: self.config.scan_exclude.clone(),
            max_files: self.config.max_scan_files,
            max_file_size: self.config.max_file_size_bytes,
        }
    }
}

/// Build the filesystem/network request service and its persisted cache.
pub fn default_request_service(
    config: &ServerConfig,
) -> (Arc<dyn RequestService>, Option<Arc<RemoteCache>>) {
    let remote_cache = if config.remote_enabled {
        let dir = config
            .remote_cache_path
            .clone()
            .unwrap_or_else(RemoteCache::default_dir);
        match RemoteCache::open(dir, config.remote_cache_expiry()) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                log::warn!("Remote cache unavailable, downloads will not persist: {}", e);
                None
            }
        }
    } else {
        None
    };
    let service = DefaultRequestService::new(
        remote_cache.clone(),
        config.remote_enabled,
        config.max_file_size_bytes,
    );
    (Arc::new(service), remote_cache)
}

/// Make sure the reference map is populated, scanning the workspace on
/// first use. Returns `false` when scanning is disabled.
///
/// The scan runs on the blocking pool without holding the state lock; the
/// result is applied under a brief write lock.
pub async fn ensure_scanned(state: &Arc<RwLock<WorldState>>) -> bool {
    let settings = {
        let state = state.read().await;
        if !state.config.workspace_scan {
            return false;
        }
        if state.reference_map.is_scanned() {
            return true;
        }
        state.scan_settings()
    };

    let scanned = tokio::task::spawn_blocking(move || scan_workspace(&settings))
        .await
        .unwrap_or_else(|e| {
            log::warn!("Workspace scan task failed: {}", e);
            Vec::new()
        });

    let mut state = state.write().await;
    // Scanning may have been turned off while we were away
    if !state.config.workspace_scan {
        return false;
    }
    state.apply_scan(scanned);
    true
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub folders: Vec<Url>,
    pub exclude: Vec<String>,
    pub max_files: usize,
    pub max_file_size: u64,
}

/// Whether a path takes part in the reference graph.
pub fn is_scanned_path(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
        return false;
    };
    SCANNED_EXTENSIONS
        .iter()
        .any(|candidate| ext.eq_ignore_ascii_case(candidate))
        || path.to_str().map(is_stylesheet_path).unwrap_or(false)
}

/// Enumerate the workspace and extract each document's references.
///
/// Unreadable or oversized files are skipped and logged.
pub fn scan_workspace(settings: &ScanSettings) -> Vec<(Url, Vec<Url>)> {
    let mut result = Vec::new();

    'folders: for folder in &settings.folders {
        let Ok(root) = folder.to_file_path() else {
            log::warn!("Skipping non-file workspace folder {}", folder);
            continue;
        };
        log::info!("Scanning folder: {}", root.display());

        let walker = WalkDir::new(&root).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !settings
                    .exclude
                    .iter()
                    .any(|name| entry.file_name().to_str() == Some(name.as_str()))
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Scan error: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_scanned_path(entry.path()) {
                continue;
            }
            if result.len() >= settings.max_files {
                log::warn!("Workspace scan stopped at {} files", settings.max_files);
                break 'folders;
            }
            if let Some(references) = scan_file(entry.path(), settings.max_file_size) {
                result.push(references);
            }
        }
    }

    log::info!("Scanned {} workspace files", result.len());
    result
}

/// Read one file and extract its references.
pub fn scan_file(path: &Path, max_file_size: u64) -> Option<(Url, Vec<Url>)> {
    let uri = Url::from_file_path(path).ok()?;
    let language = LanguageId::from_uri(&uri)?;
    match fs::metadata(path) {
        Ok(metadata) if metadata.len() > max_file_size => {
            log::trace!("Skipping oversized file {}", path.display());
            return None;
        }
        Ok(_) => {}
        Err(e) => {
            log::warn!("Skipping {}: {}", path.display(), e);
            return None;
        }
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Skipping {}: {}", path.display(), e);
            return None;
        }
    };
    let entry = build_entry(&TextDocument::new(uri.clone(), language, 0, &text));
    log::trace!("Scanned {}: {} references", uri, entry.references.len());
    Some((uri, entry.references.into_iter().collect()))
}
