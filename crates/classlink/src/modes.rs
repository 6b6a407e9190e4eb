//
// modes.rs
//
// Per-language capability records
//

use std::collections::HashMap;

use crate::entry::{LanguageCacheEntry, NameAt, NameRole, UsageContext};
use crate::language::LanguageId;

/// Finds the attribute value a completion request sits in.
pub type CompletionContextFn = fn(&LanguageCacheEntry, usize) -> Option<UsageContext>;
/// Finds the class or id name a references/rename request targets.
pub type SymbolAtFn = fn(&LanguageCacheEntry, usize) -> Option<NameAt>;

/// What a language supports. A `None` operation is unsupported and the
/// request yields an empty result.
#[derive(Clone, Copy)]
pub struct LanguageMode {
    pub name: &'static str,
    pub complete: Option<CompletionContextFn>,
    pub find_references: Option<SymbolAtFn>,
    pub rename: Option<SymbolAtFn>,
}

impl std::fmt::Debug for LanguageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageMode")
            .field("name", &self.name)
            .field("complete", &self.complete.is_some())
            .field("find_references", &self.find_references.is_some())
            .field("rename", &self.rename.is_some())
            .finish()
    }
}

/// Markup: complete inside class/id values; names under the cursor may be
/// usages or declarations from an embedded `<style>`.
pub const MARKUP: LanguageMode = LanguageMode {
    name: "markup",
    complete: Some(markup_completion_context),
    find_references: Some(markup_symbol_at),
    rename: Some(markup_symbol_at),
};

/// Stylesheets: only selectors are symbols; nothing to complete.
pub const STYLESHEET: LanguageMode = LanguageMode {
    name: "stylesheet",
    complete: None,
    find_references: Some(stylesheet_symbol_at),
    rename: Some(stylesheet_symbol_at),
};

fn markup_completion_context(entry: &LanguageCacheEntry, offset: usize) -> Option<UsageContext> {
    entry.usage_context_at(offset)
}

fn markup_symbol_at(entry: &LanguageCacheEntry, offset: usize) -> Option<NameAt> {
    entry.name_at(offset)
}

fn stylesheet_symbol_at(entry: &LanguageCacheEntry, offset: usize) -> Option<NameAt> {
    entry
        .name_at(offset)
        .filter(|name| name.role == NameRole::Declared)
}

/// Language identifier to mode.
#[derive(Debug, Clone)]
pub struct ModeRegistry {
    modes: HashMap<LanguageId, LanguageMode>,
}

impl Default for ModeRegistry {
    /// Plain TypeScript has no markup, so it only contributes imports and is
    /// left unregistered.
    fn default() -> Self {
        let mut modes = HashMap::new();
        for language in [
            LanguageId::Html,
            LanguageId::Vue,
            LanguageId::Javascript,
            LanguageId::JavascriptReact,
            LanguageId::TypescriptReact,
        ] {
            modes.insert(language, MARKUP);
        }
        for language in [LanguageId::Css, LanguageId::Scss, LanguageId::Less] {
            modes.insert(language, STYLESHEET);
        }
        Self { modes }
    }
}

impl ModeRegistry {
    pub fn get_mode(&self, language: LanguageId) -> Option<&LanguageMode> {
        self.modes.get(&language)
    }

    pub fn register(&mut self, language: LanguageId, mode: LanguageMode) {
        self.modes.insert(language, mode);
    }
}
