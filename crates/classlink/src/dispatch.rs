//
// dispatch.rs
//
// Completion, references and rename across linked documents
//

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{
    CompletionItem, CompletionItemKind, CompletionList, CompletionResponse, Location, Position,
    PrepareRenameResponse, TextEdit, Url, WorkspaceEdit,
};

use crate::document::TextDocument;
use crate::document_store::{FetchResult, PendingReference, ReferenceHandle};
use crate::entry::{build_entry, LanguageCacheEntry, NameAt};
use crate::language::LanguageId;
use crate::modes::{LanguageMode, SymbolAtFn};
use crate::names::{NameKind, TextRange};
use crate::state::{ensure_scanned, WorldState};
use crate::uri;

/// Result of a cancellable request. `Canceled` is distinct from an empty
/// `Done` so the editor can tell "nothing found" from "aborted".
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Done(T),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }
}

// ============================================================================
// Completion
// ============================================================================

struct CompletionRequest {
    kind: NameKind,
    offset: usize,
    entry: Arc<LanguageCacheEntry>,
    handles: Vec<ReferenceHandle>,
    wait: Duration,
}

/// Class or id names for the attribute value under `position`.
///
/// Pending reference documents are awaited for at most `fetchWaitMs`; any
/// still pending after that mark the list incomplete.
pub async fn do_complete(
    state: &Arc<RwLock<WorldState>>,
    uri: &Url,
    position: Position,
    cancel: &CancellationToken,
) -> Outcome<Option<CompletionResponse>> {
    let request = {
        let mut world = state.write().await;
        world.settle_fetches();
        prepare_completion(&mut world, uri, position)
    };
    let Some(request) = request else {
        return Outcome::Done(None);
    };

    let pending: Vec<PendingReference> = request
        .handles
        .iter()
        .filter_map(|handle| match handle {
            ReferenceHandle::Pending(pending) => Some(pending.clone()),
            _ => None,
        })
        .collect();
    let finished = match wait_for_fetches(pending, request.wait, cancel).await {
        Outcome::Done(finished) => finished,
        Outcome::Canceled => return Outcome::Canceled,
    };

    let mut world = state.write().await;
    for (reference, generation, result) in finished {
        world.documents.settle(&reference, generation, result);
    }

    let mut incomplete = false;
    let mut sources: Vec<(String, Arc<LanguageCacheEntry>)> = Vec::new();
    for handle in &request.handles {
        // Re-read: the store may have moved on while we waited
        let current = world.documents.handle(handle.uri());
        let document = match current {
            Some(ReferenceHandle::Ready(document)) => Some(document),
            Some(ReferenceHandle::Pending(pending)) => {
                incomplete = true;
                pending.stale
            }
            Some(ReferenceHandle::Failed { error, stale, .. }) => {
                log::trace!("Omitting {} from completion: {}", handle.uri(), error);
                stale
            }
            None => None,
        };
        if let Some(document) = document {
            sources.push((source_label(&document.uri), world.caches.get(&document)));
        }
    }
    drop(world);

    let items = completion_items(&request, &sources);
    Outcome::Done(Some(CompletionResponse::List(CompletionList {
        is_incomplete: incomplete,
        items,
    })))
}

fn prepare_completion(
    world: &mut WorldState,
    uri: &Url,
    position: Position,
) -> Option<CompletionRequest> {
    let document = world.documents.opened_document(uri)?.clone();
    let complete = world.modes.get_mode(document.language)?.complete?;
    let entry = world.caches.get(&document);
    let offset = document.offset_at(position);
    let context = complete(&entry, offset)?;

    let refs = completion_references(world, &entry);
    let handles = world.documents.change_ref(uri, &refs);
    Some(CompletionRequest {
        kind: context.kind,
        offset,
        entry,
        handles,
        wait: world.config.fetch_wait(),
    })
}

/// Direct references plus the `@import`s of referenced stylesheets whose
/// text is already known, up to the configured depth.
fn completion_references(world: &WorldState, entry: &LanguageCacheEntry) -> IndexSet<Url> {
    let mut refs = entry.references.clone();
    let mut frontier: Vec<Url> = refs.iter().cloned().collect();
    for _ in 1..world.config.reference_depth {
        let mut next = Vec::new();
        for reference in &frontier {
            let Some(document) = world.documents.document(reference) else {
                continue;
            };
            for imported in &world.caches.get(document).references {
                if refs.insert(imported.clone()) {
                    next.push(imported.clone());
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }
    refs
}

async fn wait_for_fetches(
    mut pending: Vec<PendingReference>,
    wait: Duration,
    cancel: &CancellationToken,
) -> Outcome<Vec<(Url, u64, FetchResult)>> {
    let mut finished = Vec::new();
    if !pending.is_empty() {
        let wait_all = async {
            for reference in pending.iter_mut() {
                let result = reference.wait().await;
                finished.push((reference.uri.clone(), reference.generation, result));
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => return Outcome::Canceled,
            _ = tokio::time::timeout(wait, wait_all) => {}
        }
    }
    if cancel.is_cancelled() {
        return Outcome::Canceled;
    }
    Outcome::Done(finished)
}

fn completion_items(
    request: &CompletionRequest,
    sources: &[(String, Arc<LanguageCacheEntry>)],
) -> Vec<CompletionItem> {
    let kind = request.kind;
    let mut items: IndexMap<String, CompletionItem> = IndexMap::new();
    let mut add = |name: &str, detail: &str| {
        items
            .entry(name.to_string())
            .or_insert_with(|| completion_item(name, kind, detail));
    };

    for name in request.entry.declared.names(kind) {
        add(name, "this document");
    }
    for (label, entry) in sources {
        for name in entry.declared.names(kind) {
            add(name, label.as_str());
        }
    }
    // The token being typed is not a suggestion for itself
    for (name, ranges) in request.entry.used.iter(kind) {
        if ranges.iter().all(|range| range.contains(request.offset)) {
            continue;
        }
        add(name, "used in this document");
    }

    items.into_values().collect()
}

fn completion_item(name: &str, kind: NameKind, detail: &str) -> CompletionItem {
    CompletionItem {
        label: name.to_string(),
        kind: Some(match kind {
            NameKind::Class => CompletionItemKind::CLASS,
            NameKind::Id => CompletionItemKind::VALUE,
        }),
        detail: Some(detail.to_string()),
        ..Default::default()
    }
}

fn source_label(uri: &Url) -> String {
    uri.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
        .unwrap_or_else(|| uri.to_string())
}

// ============================================================================
// References and rename
// ============================================================================

type Linked = Vec<(TextDocument, Arc<LanguageCacheEntry>)>;

fn locate_symbol(
    world: &WorldState,
    uri: &Url,
    position: Position,
    select: fn(&LanguageMode) -> Option<SymbolAtFn>,
) -> Option<(TextDocument, Arc<LanguageCacheEntry>, NameAt)> {
    let document = world.documents.opened_document(uri)?.clone();
    let symbol_at = select(world.modes.get_mode(document.language)?)?;
    let entry = world.caches.get(&document);
    let name = symbol_at(&entry, document.offset_at(position))?;
    Some((document, entry, name))
}

/// Documents reachable from `origin` within the configured number of hops,
/// following references both ways. Backward edges need the workspace scan
/// and are skipped when it is disabled.
async fn linked_documents(
    state: &Arc<RwLock<WorldState>>,
    origin: TextDocument,
    origin_entry: Arc<LanguageCacheEntry>,
    cancel: &CancellationToken,
) -> Outcome<Linked> {
    let scanned = tokio::select! {
        _ = cancel.cancelled() => return Outcome::Canceled,
        scanned = ensure_scanned(state) => scanned,
    };
    if !scanned {
        log::trace!("Workspace scan disabled; following forward references only");
    }

    let (depth, service) = {
        let world = state.read().await;
        (world.config.reference_depth, Arc::clone(&world.service))
    };

    let mut visited: IndexSet<Url> = IndexSet::new();
    visited.insert(origin.uri.clone());
    let mut frontier = vec![(origin.uri.clone(), Arc::clone(&origin_entry))];
    let mut linked = vec![(origin, origin_entry)];

    for _ in 0..depth {
        // Neighbors and any text already held in memory, under one read lock
        let mut known = Vec::new();
        let mut unknown = Vec::new();
        {
            let world = state.read().await;
            for (uri, entry) in &frontier {
                let backward = world.reference_map.dependents(uri).into_iter().flatten();
                for neighbor in entry.references.iter().chain(backward) {
                    if !visited.insert(neighbor.clone()) {
                        continue;
                    }
                    match world.documents.document(neighbor) {
                        Some(document) => {
                            let entry = world.caches.get(document);
                            known.push((document.clone(), entry));
                        }
                        None => unknown.push(neighbor.clone()),
                    }
                }
            }
        }

        for neighbor in unknown {
            let Some(language) = LanguageId::from_uri(&neighbor) else {
                continue;
            };
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Outcome::Canceled,
                fetched = service.fetch(&neighbor) => fetched,
            };
            match fetched {
                Ok(text) => {
                    // Not editor-versioned, so never memoized
                    let document = TextDocument::new(neighbor, language, 0, &text);
                    let entry = Arc::new(build_entry(&document));
                    known.push((document, entry));
                }
                Err(e) => log::warn!("Skipping {}: {}", neighbor, e),
            }
        }

        if known.is_empty() {
            break;
        }
        frontier = known
            .iter()
            .map(|(document, entry)| (document.uri.clone(), Arc::clone(entry)))
            .collect();
        linked.extend(known);
    }

    if cancel.is_cancelled() {
        return Outcome::Canceled;
    }
    Outcome::Done(linked)
}

fn symbol_ranges(entry: &LanguageCacheEntry, name: &NameAt, declarations: bool) -> Vec<TextRange> {
    let mut ranges: Vec<TextRange> = entry.used.ranges(name.kind, &name.name).to_vec();
    if declarations {
        ranges.extend_from_slice(entry.declared.ranges(name.kind, &name.name));
    }
    ranges.sort();
    ranges.dedup();
    ranges
}

/// Every usage (and optionally declaration) of the class or id under the
/// cursor across linked documents.
pub async fn find_references(
    state: &Arc<RwLock<WorldState>>,
    uri: &Url,
    position: Position,
    include_declaration: bool,
    cancel: &CancellationToken,
) -> Outcome<Option<Vec<Location>>> {
    let located = {
        let mut world = state.write().await;
        world.settle_fetches();
        locate_symbol(&world, uri, position, |mode| mode.find_references)
    };
    let Some((origin, entry, name)) = located else {
        return Outcome::Done(None);
    };

    let linked = match linked_documents(state, origin, entry, cancel).await {
        Outcome::Done(linked) => linked,
        Outcome::Canceled => return Outcome::Canceled,
    };

    let locations = linked
        .iter()
        .flat_map(|(document, entry)| {
            symbol_ranges(entry, &name, include_declaration)
                .into_iter()
                .map(|range| Location::new(document.uri.clone(), document.range_of(range)))
        })
        .collect();
    Outcome::Done(Some(locations))
}

/// Whether `name` can stand in a class or id attribute and selector as-is.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.chars().any(|c| {
            c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>' | '{' | '}' | '.' | '#' | ',')
        })
}

pub async fn prepare_rename(
    state: &Arc<RwLock<WorldState>>,
    uri: &Url,
    position: Position,
) -> Option<PrepareRenameResponse> {
    if uri::is_remote(uri) {
        return None;
    }
    let world = state.read().await;
    let (document, _, name) = locate_symbol(&world, uri, position, |mode| mode.rename)?;
    Some(PrepareRenameResponse::RangeWithPlaceholder {
        range: document.range_of(name.range),
        placeholder: name.name,
    })
}

/// One edit per usage and declaration of the name under the cursor in
/// every linked document that is writable.
pub async fn do_rename(
    state: &Arc<RwLock<WorldState>>,
    uri: &Url,
    position: Position,
    new_name: &str,
    cancel: &CancellationToken,
) -> Outcome<Option<WorkspaceEdit>> {
    if !is_valid_name(new_name) {
        log::warn!("Rejecting rename to invalid name '{}'", new_name);
        return Outcome::Done(None);
    }
    let located = {
        let mut world = state.write().await;
        world.settle_fetches();
        locate_symbol(&world, uri, position, |mode| mode.rename)
    };
    let Some((origin, entry, name)) = located else {
        return Outcome::Done(None);
    };

    let linked = match linked_documents(state, origin, entry, cancel).await {
        Outcome::Done(linked) => linked,
        Outcome::Canceled => return Outcome::Canceled,
    };

    let mut changes: HashMap<Url, Vec<TextEdit>> = HashMap::new();
    for (document, entry) in &linked {
        if uri::is_remote(&document.uri) {
            log::trace!("Not editing read-only {}", document.uri);
            continue;
        }
        let edits: Vec<TextEdit> = symbol_ranges(entry, &name, true)
            .into_iter()
            .map(|range| TextEdit::new(document.range_of(range), new_name.to_string()))
            .collect();
        if !edits.is_empty() {
            changes.insert(document.uri.clone(), edits);
        }
    }

    Outcome::Done(Some(WorkspaceEdit {
        changes: Some(changes),
        ..Default::default()
    }))
}
