//
// model_cache.rs
//
// Version-checked, bounded memoization of per-document cache entries
//

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Url;

use crate::document::TextDocument;
use crate::entry::{build_entry, LanguageCacheEntry};
use crate::language::{DocumentRole, LanguageId};

/// Pure function deriving an entry from a document revision.
pub type ParseFn<T> = Box<dyn Fn(&TextDocument) -> T + Send + Sync>;

struct Slot<T> {
    version: i32,
    language: LanguageId,
    last_access: Instant,
    entry: Arc<T>,
}

/// `None` once the cache has been disposed.
type Slots<T> = Option<LruCache<Url, Slot<T>>>;

/// Memoizes `parse` per URI, keyed on the exact (version, language) pair.
///
/// Slots are bounded by `max_entries` with least-recently-accessed eviction
/// and, when `cleanup_interval` is non-zero, swept periodically once they
/// have gone unaccessed for longer than the interval.
pub struct LanguageModelCache<T> {
    slots: Arc<Mutex<Slots<T>>>,
    parse: ParseFn<T>,
    sweep: CancellationToken,
}

impl<T> std::fmt::Debug for LanguageModelCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageModelCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> LanguageModelCache<T> {
    /// Create a cache. The sweep task is only started when called from
    /// within a tokio runtime and `cleanup_interval` is non-zero.
    pub fn new(max_entries: usize, cleanup_interval: Duration, parse: ParseFn<T>) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        let slots = Arc::new(Mutex::new(Some(LruCache::new(cap))));
        let sweep = CancellationToken::new();

        if !cleanup_interval.is_zero() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(sweep_loop(
                        Arc::downgrade(&slots),
                        cleanup_interval,
                        sweep.clone(),
                    ));
                }
                Err(_) => log::warn!("No runtime available; cache sweep disabled"),
            }
        }

        Self {
            slots,
            parse,
            sweep,
        }
    }

    /// Return the entry for this exact document revision, deriving it if the
    /// slot is missing or was built from another version or language.
    pub fn get(&self, document: &TextDocument) -> Arc<T> {
        if let Ok(mut guard) = self.slots.lock() {
            let hit = guard.as_mut().and_then(|lru| lru.get_mut(&document.uri)).and_then(|slot| {
                if slot.version == document.version && slot.language == document.language {
                    slot.last_access = Instant::now();
                    Some(Arc::clone(&slot.entry))
                } else {
                    None
                }
            });
            if let Some(entry) = hit {
                return entry;
            }
        }

        let entry = Arc::new((self.parse)(document));

        if let Ok(mut guard) = self.slots.lock() {
            if let Some(lru) = guard.as_mut() {
                let slot = Slot {
                    version: document.version,
                    language: document.language,
                    last_access: Instant::now(),
                    entry: Arc::clone(&entry),
                };
                if let Some((evicted, _)) = lru.push(document.uri.clone(), slot) {
                    if evicted != document.uri {
                        log::trace!("Evicted {} from language cache (capacity)", evicted);
                    }
                }
            }
        }
        entry
    }

    pub fn on_document_removed(&self, uri: &Url) {
        if let Ok(mut guard) = self.slots.lock() {
            if let Some(lru) = guard.as_mut() {
                lru.pop(uri);
            }
        }
    }

    /// Cancel the sweep and drop all slots. Later `get` calls recompute
    /// without memoizing.
    pub fn dispose(&self) {
        self.sweep.cancel();
        if let Ok(mut guard) = self.slots.lock() {
            *guard = None;
        }
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.slots
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|lru| lru.contains(uri)))
            .unwrap_or(false)
    }
}

impl<T> LanguageModelCache<T> {
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|lru| lru.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for LanguageModelCache<T> {
    fn drop(&mut self) {
        self.sweep.cancel();
    }
}

async fn sweep_loop<T>(slots: Weak<Mutex<Slots<T>>>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(slots) = slots.upgrade() else {
                    break;
                };
                sweep_expired(&slots, period);
            }
        }
    }
    log::trace!("Language cache sweep stopped");
}

fn sweep_expired<T>(slots: &Mutex<Slots<T>>, max_idle: Duration) {
    let Ok(mut guard) = slots.lock() else {
        return;
    };
    let Some(lru) = guard.as_mut() else {
        return;
    };
    let now = Instant::now();
    let expired: Vec<Url> = lru
        .iter()
        .filter(|(_, slot)| now.duration_since(slot.last_access) > max_idle)
        .map(|(uri, _)| uri.clone())
        .collect();
    for uri in &expired {
        lru.pop(uri);
    }
    if !expired.is_empty() {
        log::trace!("Swept {} idle language cache entries", expired.len());
    }
}

/// One cache per document kind, both deriving [`LanguageCacheEntry`].
#[derive(Debug)]
pub struct LanguageCaches {
    markup: LanguageModelCache<LanguageCacheEntry>,
    stylesheet: LanguageModelCache<LanguageCacheEntry>,
}

impl LanguageCaches {
    pub fn new(max_entries: usize, cleanup_interval: Duration) -> Self {
        Self {
            markup: LanguageModelCache::new(max_entries, cleanup_interval, Box::new(build_entry)),
            stylesheet: LanguageModelCache::new(
                max_entries,
                cleanup_interval,
                Box::new(build_entry),
            ),
        }
    }

    fn cache_for(&self, language: LanguageId) -> &LanguageModelCache<LanguageCacheEntry> {
        match language.role() {
            DocumentRole::Referencing => &self.markup,
            DocumentRole::Referenced => &self.stylesheet,
        }
    }

    pub fn get(&self, document: &TextDocument) -> Arc<LanguageCacheEntry> {
        self.cache_for(document.language).get(document)
    }

    pub fn on_document_removed(&self, uri: &Url) {
        self.markup.on_document_removed(uri);
        self.stylesheet.on_document_removed(uri);
    }

    pub fn dispose(&self) {
        self.markup.dispose();
        self.stylesheet.dispose();
    }
}
