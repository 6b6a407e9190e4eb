//
// syntax.rs
//
// Thread-local parser pool and the node-kind boundary to tree-sitter
//

use std::cell::RefCell;
use std::collections::HashMap;

use tree_sitter::{Language, Node, Parser, Tree};

/// Grammars backing the supported languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grammar {
    Html,
    Css,
    Javascript,
    Typescript,
    Tsx,
}

impl Grammar {
    fn language(&self) -> Language {
        match self {
            Grammar::Html => tree_sitter_html::LANGUAGE.into(),
            Grammar::Css => tree_sitter_css::LANGUAGE.into(),
            Grammar::Javascript => tree_sitter_javascript::LANGUAGE.into(),
            Grammar::Typescript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Grammar::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
        }
    }
}

thread_local! {
    static PARSERS: RefCell<HashMap<Grammar, Parser>> = RefCell::new(HashMap::new());
}

/// Execute a function with a thread-local parser for `grammar`.
///
/// Parsers are created on first use and reused across calls on the same
/// thread. Returns `None` if the grammar cannot be loaded.
pub fn with_parser<F, R>(grammar: Grammar, f: F) -> Option<R>
where
    F: FnOnce(&mut Parser) -> R,
{
    PARSERS.with(|parsers| {
        let mut parsers = parsers.borrow_mut();
        if !parsers.contains_key(&grammar) {
            let mut parser = Parser::new();
            if let Err(e) = parser.set_language(&grammar.language()) {
                log::error!("Failed to load {:?} grammar: {}", grammar, e);
                return None;
            }
            parsers.insert(grammar, parser);
        }
        parsers.get_mut(&grammar).map(f)
    })
}

/// Parse a whole document.
pub fn parse(grammar: Grammar, text: &str) -> Option<Tree> {
    with_parser(grammar, |parser| parser.parse(text, None)).flatten()
}

/// Parse only the given byte ranges of `text` with `grammar`.
///
/// Node offsets in the returned tree are relative to the full text, so an
/// embedded `<style>` block can be handed to the CSS grammar without
/// slicing. Returns `None` when `ranges` is empty.
pub fn parse_embedded(grammar: Grammar, text: &str, ranges: &[tree_sitter::Range]) -> Option<Tree> {
    if ranges.is_empty() {
        return None;
    }
    with_parser(grammar, |parser| {
        if let Err(e) = parser.set_included_ranges(ranges) {
            log::warn!("Rejected embedded ranges for {:?}: {}", grammar, e);
            return None;
        }
        let tree = parser.parse(text, None);
        // An empty list restores whole-document parsing for the next caller
        let _ = parser.set_included_ranges(&[]);
        tree
    })
    .flatten()
}

/// Node kinds this crate cares about.
///
/// tree-sitter exposes kinds as grammar-specific strings; they are mapped
/// here once so that extraction logic never matches on a grammar's
/// internal naming directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    // HTML
    StartTag,
    SelfClosingTag,
    TagName,
    Attribute,
    AttributeName,
    AttributeValue,
    QuotedAttributeValue,
    StyleElement,
    ScriptElement,
    RawText,
    // CSS
    ClassName,
    IdName,
    StylesheetImport,
    // JavaScript / TypeScript
    ScriptImport,
    JsxAttribute,
    PropertyIdentifier,
    StringLiteral,
    // Shared
    Comment,
    Other,
}

impl NodeKind {
    pub fn classify(grammar: Grammar, kind: &str) -> Self {
        match grammar {
            Grammar::Html => match kind {
                "start_tag" => Self::StartTag,
                "self_closing_tag" => Self::SelfClosingTag,
                "tag_name" => Self::TagName,
                "attribute" => Self::Attribute,
                "attribute_name" => Self::AttributeName,
                "attribute_value" => Self::AttributeValue,
                "quoted_attribute_value" => Self::QuotedAttributeValue,
                "style_element" => Self::StyleElement,
                "script_element" => Self::ScriptElement,
                "raw_text" => Self::RawText,
                "comment" => Self::Comment,
                _ => Self::Other,
            },
            Grammar::Css => match kind {
                "class_name" => Self::ClassName,
                "id_name" => Self::IdName,
                "import_statement" => Self::StylesheetImport,
                "comment" | "js_comment" => Self::Comment,
                _ => Self::Other,
            },
            Grammar::Javascript | Grammar::Typescript | Grammar::Tsx => match kind {
                "import_statement" => Self::ScriptImport,
                "jsx_attribute" => Self::JsxAttribute,
                "property_identifier" => Self::PropertyIdentifier,
                "string" => Self::StringLiteral,
                "comment" => Self::Comment,
                _ => Self::Other,
            },
        }
    }

    pub fn of(grammar: Grammar, node: Node) -> Self {
        Self::classify(grammar, node.kind())
    }
}

/// Whether the traversal should enter a node's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descend {
    Yes,
    No,
}

/// Depth-first pre-order walk over `tree` with a single cursor.
///
/// `visit` decides per node whether its subtree is entered, which lets
/// extractors stop at nodes whose contents they have already consumed.
pub fn walk<'t, F>(tree: &'t Tree, mut visit: F)
where
    F: FnMut(Node<'t>) -> Descend,
{
    let mut cursor = tree.walk();
    loop {
        let descend = visit(cursor.node());
        if descend == Descend::Yes && cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return;
            }
        }
    }
}

/// Convert a byte span into a tree-sitter range for included-range parsing.
pub fn included_range(node: Node) -> tree_sitter::Range {
    tree_sitter::Range {
        start_byte: node.start_byte(),
        end_byte: node.end_byte(),
        start_point: node.start_position(),
        end_point: node.end_position(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsers_initialize_for_every_grammar() {
        for (grammar, text) in [
            (Grammar::Html, "<div></div>"),
            (Grammar::Css, ".a {}"),
            (Grammar::Javascript, "import './a.css';"),
            (Grammar::Typescript, "import './a.css';"),
            (Grammar::Tsx, "const a = <div className=\"x\" />;"),
        ] {
            assert!(parse(grammar, text).is_some(), "{:?} failed to parse", grammar);
        }
    }

    #[test]
    fn test_walk_visits_in_document_order() {
        let tree = parse(Grammar::Css, ".a {} .b {}").unwrap();
        let text = ".a {} .b {}";
        let mut names = Vec::new();
        walk(&tree, |node| {
            if NodeKind::of(Grammar::Css, node) == NodeKind::ClassName {
                names.push(text[node.byte_range()].to_string());
                return Descend::No;
            }
            Descend::Yes
        });
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_walk_respects_descend_no() {
        let tree = parse(Grammar::Html, "<div class=\"x\"><span></span></div>").unwrap();
        let mut tags = 0;
        walk(&tree, |node| {
            if NodeKind::of(Grammar::Html, node) == NodeKind::StartTag {
                tags += 1;
            }
            // Never enter the root, so nothing beyond it is visited
            Descend::No
        });
        assert_eq!(tags, 0);
    }

    #[test]
    fn test_embedded_parse_keeps_document_offsets() {
        let html = "<style>.inner { }</style>";
        let html_tree = parse(Grammar::Html, html).unwrap();
        let mut ranges = Vec::new();
        walk(&html_tree, |node| {
            if NodeKind::of(Grammar::Html, node) == NodeKind::RawText {
                ranges.push(included_range(node));
            }
            Descend::Yes
        });
        assert_eq!(ranges.len(), 1);

        let css_tree = parse_embedded(Grammar::Css, html, &ranges).unwrap();
        let mut found = None;
        walk(&css_tree, |node| {
            if NodeKind::of(Grammar::Css, node) == NodeKind::ClassName {
                found = Some(node.byte_range());
            }
            Descend::Yes
        });
        let range = found.unwrap();
        assert_eq!(&html[range], "inner");

        // The pooled parser is back to whole-document mode afterwards
        let plain = parse(Grammar::Css, ".x {}").unwrap();
        assert_eq!(plain.root_node().start_byte(), 0);
    }

    #[test]
    fn test_embedded_parse_without_ranges() {
        assert!(parse_embedded(Grammar::Css, "", &[]).is_none());
    }
}
