//
// document_store.rs
//
// Editor-owned main documents and reference-counted stylesheet documents
//

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexSet;
use tokio::sync::watch;
use tower_lsp::lsp_types::{TextDocumentContentChangeEvent, Url};

use crate::document::TextDocument;
use crate::language::{DocumentRole, LanguageId};
use crate::request::{FetchError, RequestService};

pub type FetchResult = Result<Arc<String>, FetchError>;

// ============================================================================
// Reference state machine
// ============================================================================

/// Where a reference document's text comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    /// A fetch is in flight (or failed)
    Unresolved,
    /// Fetched from disk or network, not open in the editor
    ResolvedLocal,
    /// Open in the editor; the editor's text is authoritative
    Opened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefEvent {
    /// A main document started referencing it
    Acquire,
    /// A main document stopped referencing it (or closed)
    Release,
    /// Its fetch completed successfully
    Resolved,
    EditorOpened,
    EditorClosed,
    /// Its backing file changed on disk
    Refetch,
}

/// Reference state crossed with the number of main documents pointing at
/// the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefStatus {
    pub state: RefState,
    pub count: usize,
}

impl RefStatus {
    pub fn unresolved() -> Self {
        Self {
            state: RefState::Unresolved,
            count: 0,
        }
    }

    /// Next status after `event`, or `None` when the document should be
    /// dropped from the store.
    pub fn apply(self, event: RefEvent) -> Option<RefStatus> {
        let next = match event {
            RefEvent::Acquire => Self {
                count: self.count + 1,
                ..self
            },
            RefEvent::Release => Self {
                count: self.count.saturating_sub(1),
                ..self
            },
            RefEvent::Resolved => match self.state {
                RefState::Unresolved => Self {
                    state: RefState::ResolvedLocal,
                    ..self
                },
                // A late fetch never overrides editor text
                _ => self,
            },
            RefEvent::EditorOpened => Self {
                state: RefState::Opened,
                ..self
            },
            RefEvent::EditorClosed => match self.state {
                RefState::Opened => Self {
                    state: RefState::ResolvedLocal,
                    ..self
                },
                _ => self,
            },
            RefEvent::Refetch => match self.state {
                RefState::ResolvedLocal => Self {
                    state: RefState::Unresolved,
                    ..self
                },
                _ => self,
            },
        };
        if next.count == 0 && next.state != RefState::Opened {
            None
        } else {
            Some(next)
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

type FetchSlot = Option<FetchResult>;

/// A fetch that has not been settled into the store yet.
#[derive(Debug, Clone)]
pub struct PendingReference {
    pub uri: Url,
    pub generation: u64,
    /// Text from before a refetch, if any
    pub stale: Option<TextDocument>,
    rx: watch::Receiver<FetchSlot>,
}

impl PendingReference {
    /// Wait for the fetch to finish. Pass the result to
    /// [`DocumentStore::settle`] to make it visible to later requests.
    pub async fn wait(&mut self) -> FetchResult {
        match self.rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => match &*slot {
                Some(result) => result.clone(),
                None => Err(FetchError::Canceled),
            },
            // The fetch task ended without reporting
            Err(_) => Err(FetchError::Canceled),
        }
    }
}

/// A reference document as seen by one request.
#[derive(Debug, Clone)]
pub enum ReferenceHandle {
    Ready(TextDocument),
    Pending(PendingReference),
    Failed {
        uri: Url,
        error: FetchError,
        stale: Option<TextDocument>,
    },
}

impl ReferenceHandle {
    pub fn uri(&self) -> &Url {
        match self {
            ReferenceHandle::Ready(document) => &document.uri,
            ReferenceHandle::Pending(pending) => &pending.uri,
            ReferenceHandle::Failed { uri, .. } => uri,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug)]
struct MainDocument {
    document: TextDocument,
    /// Reference set recorded by the last `change_ref`
    references: IndexSet<Url>,
}

#[derive(Debug)]
struct PendingFetch {
    generation: u64,
    rx: watch::Receiver<FetchSlot>,
}

#[derive(Debug)]
struct ReferenceDocument {
    status: RefStatus,
    /// Current text; kept across a refetch as stale content
    document: Option<TextDocument>,
    pending: Option<PendingFetch>,
    failed: Option<FetchError>,
}

/// Open main documents plus the stylesheets they reference.
pub struct DocumentStore {
    main: HashMap<Url, MainDocument>,
    references: HashMap<Url, ReferenceDocument>,
    service: Arc<dyn RequestService>,
    next_generation: u64,
    /// Versions for fetched text count down from -1 so they never collide
    /// with editor versions
    next_local_version: i32,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("main", &self.main.len())
            .field("references", &self.references.len())
            .finish_non_exhaustive()
    }
}

impl DocumentStore {
    pub fn new(service: Arc<dyn RequestService>) -> Self {
        Self {
            main: HashMap::new(),
            references: HashMap::new(),
            service,
            next_generation: 0,
            next_local_version: -1,
        }
    }

    /// Fetches started after this call use `service`.
    pub fn set_service(&mut self, service: Arc<dyn RequestService>) {
        self.service = service;
    }

    /// Track an editor-opened document.
    pub fn open(&mut self, document: TextDocument) {
        let uri = document.uri.clone();
        match document.language.role() {
            DocumentRole::Referencing => {
                log::trace!("Opened main document {}", uri);
                let previous = self.main.insert(
                    uri,
                    MainDocument {
                        document,
                        references: IndexSet::new(),
                    },
                );
                // Reopened without a close: its references are recomputed
                if let Some(previous) = previous {
                    for reference in &previous.references {
                        self.release(reference);
                    }
                }
            }
            DocumentRole::Referenced => {
                let entry = self.references.entry(uri).or_insert_with(|| ReferenceDocument {
                    status: RefStatus::unresolved(),
                    document: None,
                    pending: None,
                    failed: None,
                });
                if let Some(next) = entry.status.apply(RefEvent::EditorOpened) {
                    entry.status = next;
                }
                entry.document = Some(document);
                entry.pending = None;
                entry.failed = None;
            }
        }
    }

    /// Apply editor changes. Returns `false` for documents this store does
    /// not own.
    pub fn update(
        &mut self,
        uri: &Url,
        version: i32,
        changes: Vec<TextDocumentContentChangeEvent>,
    ) -> bool {
        let document = if let Some(main) = self.main.get_mut(uri) {
            &mut main.document
        } else {
            match self.references.get_mut(uri) {
                Some(ReferenceDocument {
                    status:
                        RefStatus {
                            state: RefState::Opened,
                            ..
                        },
                    document: Some(document),
                    ..
                }) => document,
                _ => {
                    log::warn!("Ignoring change for untracked document {}", uri);
                    return false;
                }
            }
        };
        for change in changes {
            document.apply_change(change);
        }
        document.version = version;
        true
    }

    /// Stop tracking an editor-closed document.
    pub fn close(&mut self, uri: &Url) {
        if let Some(main) = self.main.remove(uri) {
            for reference in &main.references {
                self.release(reference);
            }
            return;
        }

        let Some(entry) = self.references.get_mut(uri) else {
            log::warn!("Close for untracked document {}", uri);
            return;
        };
        if entry.status.state != RefState::Opened {
            return;
        }
        match entry.status.apply(RefEvent::EditorClosed) {
            Some(next) => {
                entry.status = next;
                let version = next_version(&mut self.next_local_version);
                if let Some(document) = entry.document.as_mut() {
                    document.version = version;
                }
                log::trace!("{} closed but still referenced ({})", uri, next.count);
            }
            None => {
                self.references.remove(uri);
            }
        }
    }

    /// Any editor-open document.
    pub fn opened_document(&self, uri: &Url) -> Option<&TextDocument> {
        if let Some(main) = self.main.get(uri) {
            return Some(&main.document);
        }
        self.references
            .get(uri)
            .filter(|r| r.status.state == RefState::Opened)
            .and_then(|r| r.document.as_ref())
    }

    /// Any document with text available: opened or resolved.
    pub fn document(&self, uri: &Url) -> Option<&TextDocument> {
        self.main
            .get(uri)
            .map(|m| &m.document)
            .or_else(|| self.references.get(uri).and_then(|r| r.document.as_ref()))
    }

    pub fn main_uris(&self) -> impl Iterator<Item = &Url> {
        self.main.keys()
    }

    pub fn main_references(&self, uri: &Url) -> Option<&IndexSet<Url>> {
        self.main.get(uri).map(|m| &m.references)
    }

    pub fn ref_status(&self, uri: &Url) -> Option<RefStatus> {
        self.references.get(uri).map(|r| r.status)
    }

    /// Record the current reference set of a main document and return a
    /// handle per reference. Newly referenced documents start fetching.
    pub fn change_ref(&mut self, uri: &Url, refs: &IndexSet<Url>) -> Vec<ReferenceHandle> {
        let previous = match self.main.get_mut(uri) {
            Some(main) => std::mem::replace(&mut main.references, refs.clone()),
            None => {
                log::warn!("change_ref for {} which is not an open main document", uri);
                return Vec::new();
            }
        };

        for removed in previous.difference(refs) {
            self.release(removed);
        }
        for added in refs.difference(&previous) {
            self.acquire(added);
        }

        refs.iter().filter_map(|r| self.handle(r)).collect()
    }

    /// Store a fetch result unless the fetch was superseded. Returns whether
    /// it was applied.
    pub fn settle(&mut self, uri: &Url, generation: u64, result: FetchResult) -> bool {
        let Some(entry) = self.references.get_mut(uri) else {
            return false;
        };
        if entry.pending.as_ref().map(|p| p.generation) != Some(generation) {
            return false;
        }
        entry.pending = None;
        match result {
            Ok(text) => {
                let language = LanguageId::from_uri(uri).unwrap_or(LanguageId::Css);
                let version = next_version(&mut self.next_local_version);
                entry.document = Some(TextDocument::new(uri.clone(), language, version, &text));
                entry.failed = None;
                if let Some(next) = entry.status.apply(RefEvent::Resolved) {
                    entry.status = next;
                }
            }
            Err(error) => {
                log::warn!("Failed to load {}: {}", uri, error);
                // A missing source is gone for good; stale text only covers
                // transient failures
                if matches!(error, FetchError::NotFound(_)) {
                    entry.document = None;
                }
                entry.failed = Some(error);
            }
        }
        true
    }

    /// Settle every fetch that has already finished. Returns the URIs whose
    /// content changed.
    pub fn settle_ready(&mut self) -> Vec<Url> {
        let ready: Vec<(Url, u64, FetchResult)> = self
            .references
            .iter()
            .filter_map(|(uri, entry)| {
                let pending = entry.pending.as_ref()?;
                let result = pending.rx.borrow().clone()?;
                Some((uri.clone(), pending.generation, result))
            })
            .collect();
        ready
            .into_iter()
            .filter_map(|(uri, generation, result)| {
                self.settle(&uri, generation, result).then_some(uri)
            })
            .collect()
    }

    /// Start a new fetch for an unopened reference whose source changed.
    pub fn refetch(&mut self, uri: &Url) -> bool {
        let Some(status) = self.references.get(uri).map(|r| r.status) else {
            return false;
        };
        if status.state == RefState::Opened {
            return false;
        }
        let pending = self.launch_fetch(uri);
        if let Some(entry) = self.references.get_mut(uri) {
            if let Some(next) = entry.status.apply(RefEvent::Refetch) {
                entry.status = next;
            }
            entry.pending = Some(pending);
            entry.failed = None;
        }
        true
    }

    /// The source of an unopened reference was deleted: forget its text and
    /// fetch again so a recreated file is picked up.
    pub fn source_deleted(&mut self, uri: &Url) -> bool {
        match self.references.get_mut(uri) {
            Some(entry) if entry.status.state != RefState::Opened => entry.document = None,
            _ => return false,
        }
        self.refetch(uri)
    }

    /// Drop all documents.
    pub fn clear(&mut self) {
        self.main.clear();
        self.references.clear();
    }

    /// Current view of a tracked reference document.
    pub fn handle(&self, uri: &Url) -> Option<ReferenceHandle> {
        let entry = self.references.get(uri)?;
        if let Some(pending) = &entry.pending {
            return Some(ReferenceHandle::Pending(PendingReference {
                uri: uri.clone(),
                generation: pending.generation,
                stale: entry.document.clone(),
                rx: pending.rx.clone(),
            }));
        }
        if let Some(error) = &entry.failed {
            return Some(ReferenceHandle::Failed {
                uri: uri.clone(),
                error: error.clone(),
                stale: entry.document.clone(),
            });
        }
        entry.document.clone().map(ReferenceHandle::Ready)
    }

    fn acquire(&mut self, uri: &Url) {
        if let Some(entry) = self.references.get_mut(uri) {
            if let Some(next) = entry.status.apply(RefEvent::Acquire) {
                entry.status = next;
            }
            return;
        }

        let pending = self.launch_fetch(uri);
        let status = RefStatus::unresolved()
            .apply(RefEvent::Acquire)
            .unwrap_or(RefStatus {
                state: RefState::Unresolved,
                count: 1,
            });
        self.references.insert(
            uri.clone(),
            ReferenceDocument {
                status,
                document: None,
                pending: Some(pending),
                failed: None,
            },
        );
    }

    fn release(&mut self, uri: &Url) {
        let Some(entry) = self.references.get_mut(uri) else {
            return;
        };
        match entry.status.apply(RefEvent::Release) {
            Some(next) => entry.status = next,
            None => {
                log::trace!("Dropping unreferenced document {}", uri);
                self.references.remove(uri);
            }
        }
    }

    fn launch_fetch(&mut self, uri: &Url) -> PendingFetch {
        self.next_generation += 1;
        let generation = self.next_generation;
        let (tx, rx) = watch::channel(None);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let service = Arc::clone(&self.service);
                let uri = uri.clone();
                runtime.spawn(async move {
                    let result = service.fetch(&uri).await.map(Arc::new);
                    // Nobody listening is fine; the store may have dropped it
                    let _ = tx.send(Some(result));
                });
            }
            Err(_) => {
                let _ = tx.send(Some(Err(FetchError::Transport {
                    uri: uri.to_string(),
                    message: "no async runtime".to_string(),
                })));
            }
        }
        log::trace!("Fetching {} (generation {})", uri, generation);
        PendingFetch { generation, rx }
    }
}

fn next_version(counter: &mut i32) -> i32 {
    let version = *counter;
    *counter = counter.checked_sub(1).unwrap_or(-1);
    version
}
