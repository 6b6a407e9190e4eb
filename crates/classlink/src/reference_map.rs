//
// reference_map.rs
//
// Bidirectional href/import graph between workspace documents
//

use std::collections::{HashMap, HashSet};

use tower_lsp::lsp_types::Url;

/// Forward and backward reference edges.
///
/// `backward[b]` contains `a` exactly when `forward[a]` contains `b`. Empty
/// sets are pruned so that an absent key and an empty set never coexist.
#[derive(Debug, Default)]
pub struct ReferenceMap {
    /// Referencing document -> documents it links to
    forward: HashMap<Url, HashSet<Url>>,
    /// Referenced document -> documents linking to it
    backward: HashMap<Url, HashSet<Url>>,
    scanned: bool,
}

impl ReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a full workspace scan has populated the map.
    pub fn is_scanned(&self) -> bool {
        self.scanned
    }

    /// Replace the outbound references of `uri`, touching only the backward
    /// sets of targets that were added or removed.
    pub fn update(&mut self, uri: &Url, refs: impl IntoIterator<Item = Url>) {
        let new_refs: HashSet<Url> = refs.into_iter().filter(|target| target != uri).collect();
        let old_refs = self.forward.remove(uri).unwrap_or_default();

        for removed in old_refs.difference(&new_refs) {
            log::trace!("Reference removed: {} -> {}", uri, removed);
            self.unlink_backward(removed, uri);
        }
        for added in new_refs.difference(&old_refs) {
            log::trace!("Reference added: {} -> {}", uri, added);
            self.backward
                .entry(added.clone())
                .or_default()
                .insert(uri.clone());
        }

        if !new_refs.is_empty() {
            self.forward.insert(uri.clone(), new_refs);
        }
    }

    /// Drop every edge that starts at `uri`. Edges pointing at `uri` belong
    /// to their sources and stay until those sources change.
    pub fn remove(&mut self, uri: &Url) {
        if let Some(targets) = self.forward.remove(uri) {
            for target in &targets {
                self.unlink_backward(target, uri);
            }
        }
    }

    /// Discard all edges and repopulate from a full set of documents.
    pub fn rebuild(&mut self, documents: impl IntoIterator<Item = (Url, Vec<Url>)>) {
        self.forward.clear();
        self.backward.clear();
        for (uri, refs) in documents {
            self.update(&uri, refs);
        }
        self.scanned = true;
        log::info!(
            "Reference map rebuilt: {} documents with references, {} referenced",
            self.forward.len(),
            self.backward.len()
        );
    }

    /// Documents referencing `uri`.
    pub fn dependents(&self, uri: &Url) -> Option<&HashSet<Url>> {
        self.backward.get(uri)
    }

    /// Documents `uri` references.
    pub fn dependencies(&self, uri: &Url) -> Option<&HashSet<Url>> {
        self.forward.get(uri)
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.backward.clear();
        self.scanned = false;
    }

    fn unlink_backward(&mut self, target: &Url, source: &Url) {
        if let Some(sources) = self.backward.get_mut(target) {
            sources.remove(source);
            if sources.is_empty() {
                self.backward.remove(target);
            }
        }
    }
}
