//
// language.rs
//
// Language identifiers and their roles in the reference graph
//

use std::fmt;

use tower_lsp::lsp_types::Url;

use crate::syntax::Grammar;

/// Which side of a reference edge a language sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentRole {
    /// Markup or script documents that link to stylesheets (HTML, Vue, JSX)
    Referencing,
    /// Stylesheets pointed at by referencing documents (CSS, SCSS, LESS)
    Referenced,
}

/// Languages the server understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LanguageId {
    Html,
    Vue,
    Javascript,
    JavascriptReact,
    Typescript,
    TypescriptReact,
    Css,
    Scss,
    Less,
}

/// Referencing-document extensions enumerated by the workspace scan.
/// Stylesheets are matched separately by [`is_stylesheet_path`] so their
/// `@import`s become edges too.
pub const SCANNED_EXTENSIONS: &[&str] = &["html", "htm", "vue", "jsx", "tsx", "js", "mjs", "ts"];

impl LanguageId {
    /// Map an LSP `languageId` to a language.
    pub fn from_lsp(id: &str) -> Option<Self> {
        match id {
            "html" => Some(Self::Html),
            "vue" => Some(Self::Vue),
            "javascript" => Some(Self::Javascript),
            "javascriptreact" => Some(Self::JavascriptReact),
            "typescript" => Some(Self::Typescript),
            "typescriptreact" => Some(Self::TypescriptReact),
            "css" => Some(Self::Css),
            "scss" => Some(Self::Scss),
            "less" => Some(Self::Less),
            _ => None,
        }
    }

    /// Guess the language from a path or URI path by its extension.
    pub fn from_path(path: &str) -> Option<Self> {
        let (_, ext) = path.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "html" | "htm" => Some(Self::Html),
            "vue" => Some(Self::Vue),
            "js" | "mjs" | "cjs" => Some(Self::Javascript),
            "jsx" => Some(Self::JavascriptReact),
            "ts" | "mts" | "cts" => Some(Self::Typescript),
            "tsx" => Some(Self::TypescriptReact),
            "css" => Some(Self::Css),
            "scss" => Some(Self::Scss),
            "less" => Some(Self::Less),
            _ => None,
        }
    }

    pub fn from_uri(uri: &Url) -> Option<Self> {
        Self::from_path(uri.path())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Vue => "vue",
            Self::Javascript => "javascript",
            Self::JavascriptReact => "javascriptreact",
            Self::Typescript => "typescript",
            Self::TypescriptReact => "typescriptreact",
            Self::Css => "css",
            Self::Scss => "scss",
            Self::Less => "less",
        }
    }

    pub fn role(&self) -> DocumentRole {
        match self {
            Self::Css | Self::Scss | Self::Less => DocumentRole::Referenced,
            _ => DocumentRole::Referencing,
        }
    }

    pub fn is_stylesheet(&self) -> bool {
        self.role() == DocumentRole::Referenced
    }

    /// Grammar used for the document's top-level tree.
    ///
    /// Vue single-file components are close enough to HTML for the HTML
    /// grammar to recover templates, `<style>` and `<script>` blocks. SCSS
    /// and LESS go through the CSS grammar; nested rules degrade to error
    /// nodes but plain selectors still surface.
    pub fn grammar(&self) -> Grammar {
        match self {
            Self::Html | Self::Vue => Grammar::Html,
            Self::Javascript | Self::JavascriptReact => Grammar::Javascript,
            Self::Typescript => Grammar::Typescript,
            Self::TypescriptReact => Grammar::Tsx,
            Self::Css | Self::Scss | Self::Less => Grammar::Css,
        }
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a path names a stylesheet that can be linked or imported.
pub fn is_stylesheet_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".css") || lower.ends_with(".scss") || lower.ends_with(".less")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsp_ids_round_trip() {
        for id in [
            "html",
            "vue",
            "javascript",
            "javascriptreact",
            "typescript",
            "typescriptreact",
            "css",
            "scss",
            "less",
        ] {
            let lang = LanguageId::from_lsp(id).unwrap();
            assert_eq!(lang.as_str(), id);
        }
        assert_eq!(LanguageId::from_lsp("plaintext"), None);
    }

    #[test]
    fn test_from_path_is_case_insensitive() {
        assert_eq!(LanguageId::from_path("/a/INDEX.HTML"), Some(LanguageId::Html));
        assert_eq!(LanguageId::from_path("/a/App.tsx"), Some(LanguageId::TypescriptReact));
        assert_eq!(LanguageId::from_path("/a/theme.less"), Some(LanguageId::Less));
        assert_eq!(LanguageId::from_path("/a/README"), None);
    }

    #[test]
    fn test_roles() {
        assert_eq!(LanguageId::Vue.role(), DocumentRole::Referencing);
        assert_eq!(LanguageId::Scss.role(), DocumentRole::Referenced);
        assert!(LanguageId::Css.is_stylesheet());
        assert!(!LanguageId::JavascriptReact.is_stylesheet());
    }

    #[test]
    fn test_stylesheet_paths() {
        assert!(is_stylesheet_path("./b.css"));
        assert!(is_stylesheet_path("theme.SCSS"));
        assert!(!is_stylesheet_path("app.js"));
    }
}
