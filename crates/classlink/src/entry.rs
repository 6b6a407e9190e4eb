//
// entry.rs
//
// Per-document cache entries: declared names, used names and outbound references
//

use std::sync::OnceLock;

use indexmap::IndexSet;
use regex::Regex;
use tower_lsp::lsp_types::Url;
use tree_sitter::{Node, Tree};

use crate::document::TextDocument;
use crate::language::is_stylesheet_path;
use crate::names::{split_tokens, NameKind, NameTable, TextRange};
use crate::syntax::{self, Descend, Grammar, NodeKind};
use crate::uri::resolve_reference;

/// An attribute value where class or id names are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageContext {
    pub kind: NameKind,
    /// Interior of the value, without quote delimiters
    pub range: TextRange,
}

/// Whether a name occurrence declares or uses the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameRole {
    Declared,
    Used,
}

/// The name occurrence under a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAt {
    pub kind: NameKind,
    pub name: String,
    pub range: TextRange,
    pub role: NameRole,
}

/// Immutable analysis of one document revision.
#[derive(Debug, Clone, Default)]
pub struct LanguageCacheEntry {
    /// Top-level syntax tree (`None` if parsing failed)
    pub tree: Option<Tree>,
    /// Names declared by selectors, including embedded `<style>` blocks
    pub declared: NameTable,
    /// Names written in class/id attributes
    pub used: NameTable,
    /// Normalized URIs this document links to or imports, excluding itself
    pub references: IndexSet<Url>,
    /// Attribute values in document order
    pub usage_contexts: Vec<UsageContext>,
}

impl LanguageCacheEntry {
    pub fn usage_context_at(&self, offset: usize) -> Option<UsageContext> {
        self.usage_contexts
            .iter()
            .find(|ctx| ctx.range.contains(offset))
            .copied()
    }

    pub fn name_at(&self, offset: usize) -> Option<NameAt> {
        self.used
            .name_at(offset)
            .map(|(kind, name, range)| (kind, name, range, NameRole::Used))
            .or_else(|| {
                self.declared
                    .name_at(offset)
                    .map(|(kind, name, range)| (kind, name, range, NameRole::Declared))
            })
            .map(|(kind, name, range, role)| NameAt {
                kind,
                name: name.to_string(),
                range,
                role,
            })
    }
}

/// Parse a document and extract its entry.
///
/// A document whose grammar cannot produce a tree yields an empty entry;
/// callers treat that as "no known names".
pub fn build_entry(document: &TextDocument) -> LanguageCacheEntry {
    let text = document.text();
    let grammar = document.language.grammar();
    let Some(tree) = syntax::parse(grammar, &text) else {
        log::warn!("Failed to parse {} as {}", document.uri, document.language);
        return LanguageCacheEntry::default();
    };

    let mut builder = EntryBuilder::new(&document.uri, &text);
    match grammar {
        Grammar::Html => builder.visit_markup(&tree),
        Grammar::Css => builder.visit_stylesheet(&tree),
        Grammar::Javascript | Grammar::Typescript | Grammar::Tsx => {
            builder.visit_script(&tree, grammar)
        }
    }

    let entry = builder.finish(tree);
    log::trace!(
        "Built entry for {} v{}: {} declared, {} used, {} references",
        document.uri,
        document.version,
        entry.declared.len(),
        entry.used.len(),
        entry.references.len()
    );
    entry
}

struct Patterns {
    css_import: Regex,
    css_module: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        // Groups: 1=double-quoted, 2=single-quoted, 3=bare
        css_import: Regex::new(
            r#"(?i)^@import\s+(?:url\(\s*)?(?:"([^"]*)"|'([^']*)'|([^\s'"();]+))"#,
        )
        .unwrap(),
        css_module: Regex::new(r"(?i)\.module\.(?:css|scss|less)$").unwrap(),
    })
}

/// Target of a CSS `@import` rule, with quotes and `url()` removed.
pub fn css_import_target(rule: &str) -> Option<&str> {
    let caps = patterns().css_import.captures(rule.trim_start())?;
    (1..=3)
        .filter_map(|group| caps.get(group))
        .map(|m| m.as_str())
        .find(|s| !s.is_empty())
}

/// Whether a script import names a stylesheet this server should follow.
///
/// CSS modules are scoped per component and never contribute global class
/// names. Bare package specifiers would need node module resolution.
pub fn is_followed_script_import(source: &str) -> bool {
    if !is_stylesheet_path(source) || patterns().css_module.is_match(source) {
        return false;
    }
    source.starts_with("./")
        || source.starts_with("../")
        || source.starts_with('/')
        || source.starts_with("http://")
        || source.starts_with("https://")
}

struct AttributeValue<'a> {
    text: &'a str,
    inner: TextRange,
}

struct Attribute<'a> {
    name: &'a str,
    value: Option<AttributeValue<'a>>,
}

fn find_attribute<'b, 'a>(attributes: &'b [Attribute<'a>], name: &str) -> Option<&'b Attribute<'a>> {
    attributes
        .iter()
        .find(|a| a.name.eq_ignore_ascii_case(name))
}

struct EntryBuilder<'a> {
    uri: &'a Url,
    text: &'a str,
    declared: NameTable,
    used: NameTable,
    references: IndexSet<Url>,
    usage_contexts: Vec<UsageContext>,
}

impl<'a> EntryBuilder<'a> {
    fn new(uri: &'a Url, text: &'a str) -> Self {
        Self {
            uri,
            text,
            declared: NameTable::new(),
            used: NameTable::new(),
            references: IndexSet::new(),
            usage_contexts: Vec::new(),
        }
    }

    fn finish(self, tree: Tree) -> LanguageCacheEntry {
        LanguageCacheEntry {
            tree: Some(tree),
            declared: self.declared,
            used: self.used,
            references: self.references,
            usage_contexts: self.usage_contexts,
        }
    }

    fn node_text(&self, node: Node) -> &'a str {
        self.text.get(node.byte_range()).unwrap_or("")
    }

    fn add_reference(&mut self, href: &str) {
        match resolve_reference(self.uri, href) {
            Some(target) if &target != self.uri => {
                self.references.insert(target);
            }
            Some(_) => log::trace!("Skipping self-reference in {}", self.uri),
            None => {}
        }
    }

    fn record_usage(&mut self, kind: NameKind, value: &AttributeValue<'a>) {
        self.usage_contexts.push(UsageContext {
            kind,
            range: value.inner,
        });
        for (token, range) in split_tokens(value.text, value.inner.start) {
            self.used.insert(kind, token, range);
        }
    }

    // ------------------------------------------------------------------
    // HTML / Vue
    // ------------------------------------------------------------------

    fn visit_markup(&mut self, tree: &Tree) {
        let mut style_ranges = Vec::new();
        let mut script_ranges: Vec<(Grammar, tree_sitter::Range)> = Vec::new();

        syntax::walk(tree, |node| match NodeKind::of(Grammar::Html, node) {
            NodeKind::StartTag | NodeKind::SelfClosingTag => {
                self.visit_tag(node);
                Descend::No
            }
            NodeKind::RawText => {
                let parent = node.parent().map(|p| NodeKind::of(Grammar::Html, p));
                match parent {
                    Some(NodeKind::StyleElement) => style_ranges.push(syntax::included_range(node)),
                    Some(NodeKind::ScriptElement) => {
                        let grammar = node
                            .parent()
                            .map(|element| self.script_grammar(element))
                            .unwrap_or(Grammar::Javascript);
                        script_ranges.push((grammar, syntax::included_range(node)));
                    }
                    _ => {}
                }
                Descend::No
            }
            NodeKind::Comment => Descend::No,
            _ => Descend::Yes,
        });

        if let Some(css) = syntax::parse_embedded(Grammar::Css, self.text, &style_ranges) {
            self.visit_stylesheet(&css);
        }
        for grammar in [Grammar::Javascript, Grammar::Typescript] {
            let ranges: Vec<_> = script_ranges
                .iter()
                .filter(|(g, _)| *g == grammar)
                .map(|(_, range)| *range)
                .collect();
            if let Some(script) = syntax::parse_embedded(grammar, self.text, &ranges) {
                self.visit_script(&script, grammar);
            }
        }
    }

    fn visit_tag(&mut self, tag: Node) {
        let attributes = self.attributes(tag);
        for attribute in &attributes {
            let Some(value) = &attribute.value else {
                continue;
            };
            if attribute.name.eq_ignore_ascii_case("class") {
                self.record_usage(NameKind::Class, value);
            } else if attribute.name.eq_ignore_ascii_case("id") {
                self.record_usage(NameKind::Id, value);
            }
        }

        let is_link = self
            .tag_name(tag)
            .map(|name| name.eq_ignore_ascii_case("link"))
            .unwrap_or(false);
        if !is_link {
            return;
        }
        let is_stylesheet = match find_attribute(&attributes, "rel") {
            None => true,
            Some(rel) => rel.value.as_ref().map(|v| v.text) == Some("stylesheet"),
        };
        if !is_stylesheet {
            return;
        }
        let href = find_attribute(&attributes, "href")
            .and_then(|a| a.value.as_ref())
            .map(|v| v.text);
        if let Some(href) = href {
            self.add_reference(href);
        }
    }

    fn tag_name(&self, tag: Node) -> Option<&'a str> {
        let mut cursor = tag.walk();
        let name = tag
            .named_children(&mut cursor)
            .find(|child| NodeKind::of(Grammar::Html, *child) == NodeKind::TagName)
            .map(|child| self.node_text(child));
        name
    }

    fn attributes(&self, tag: Node) -> Vec<Attribute<'a>> {
        let mut cursor = tag.walk();
        let attributes = tag
            .named_children(&mut cursor)
            .filter(|child| NodeKind::of(Grammar::Html, *child) == NodeKind::Attribute)
            .filter_map(|attribute| self.attribute(attribute))
            .collect();
        attributes
    }

    fn attribute(&self, attribute: Node) -> Option<Attribute<'a>> {
        let mut name = None;
        let mut value = None;
        let mut cursor = attribute.walk();
        for child in attribute.named_children(&mut cursor) {
            match NodeKind::of(Grammar::Html, child) {
                NodeKind::AttributeName => name = Some(self.node_text(child)),
                NodeKind::AttributeValue => {
                    let inner = TextRange::new(child.start_byte(), child.end_byte());
                    value = Some(AttributeValue {
                        text: self.node_text(child),
                        inner,
                    });
                }
                NodeKind::QuotedAttributeValue => {
                    let inner = self.unquoted(child);
                    value = Some(AttributeValue {
                        text: self.text.get(inner.start..inner.end).unwrap_or(""),
                        inner,
                    });
                }
                _ => {}
            }
        }
        Some(Attribute { name: name?, value })
    }

    /// Range inside a quoted literal. An unterminated literal runs to the
    /// end of the node.
    fn unquoted(&self, node: Node) -> TextRange {
        let start = node.start_byte();
        let end = node.end_byte();
        let raw = self.node_text(node);
        let Some(quote) = raw.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            return TextRange::new(start, end);
        };
        let inner_end = if raw.len() >= 2 && raw.ends_with(quote) {
            end - 1
        } else {
            end
        };
        TextRange::new(start + 1, inner_end)
    }

    fn script_grammar(&self, element: Node) -> Grammar {
        let mut cursor = element.walk();
        let start_tag = element
            .named_children(&mut cursor)
            .find(|child| NodeKind::of(Grammar::Html, *child) == NodeKind::StartTag);
        let is_typescript = start_tag
            .map(|tag| {
                self.attributes(tag).iter().any(|a| {
                    a.name.eq_ignore_ascii_case("lang")
                        && a.value.as_ref().map(|v| v.text) == Some("ts")
                })
            })
            .unwrap_or(false);
        if is_typescript {
            Grammar::Typescript
        } else {
            Grammar::Javascript
        }
    }

    // ------------------------------------------------------------------
    // CSS / SCSS / LESS
    // ------------------------------------------------------------------

    fn visit_stylesheet(&mut self, tree: &Tree) {
        syntax::walk(tree, |node| match NodeKind::of(Grammar::Css, node) {
            NodeKind::ClassName => {
                let name = self.node_text(node);
                self.declared
                    .insert(NameKind::Class, name, TextRange::new(node.start_byte(), node.end_byte()));
                Descend::No
            }
            NodeKind::IdName => {
                let name = self.node_text(node);
                self.declared
                    .insert(NameKind::Id, name, TextRange::new(node.start_byte(), node.end_byte()));
                Descend::No
            }
            NodeKind::StylesheetImport => {
                if let Some(target) = css_import_target(self.node_text(node)) {
                    self.add_reference(target);
                }
                Descend::No
            }
            NodeKind::Comment => Descend::No,
            _ => Descend::Yes,
        });
    }

    // ------------------------------------------------------------------
    // JavaScript / TypeScript / JSX
    // ------------------------------------------------------------------

    fn visit_script(&mut self, tree: &Tree, grammar: Grammar) {
        syntax::walk(tree, |node| match NodeKind::of(grammar, node) {
            NodeKind::ScriptImport => {
                let source = node
                    .child_by_field_name("source")
                    .filter(|s| NodeKind::of(grammar, *s) == NodeKind::StringLiteral);
                if let Some(source) = source {
                    let range = self.unquoted(source);
                    let specifier = self.text.get(range.start..range.end).unwrap_or("");
                    if is_followed_script_import(specifier) {
                        self.add_reference(specifier);
                    } else {
                        log::trace!("Not following script import '{}' in {}", specifier, self.uri);
                    }
                }
                Descend::No
            }
            NodeKind::JsxAttribute => {
                self.visit_jsx_attribute(node, grammar);
                Descend::No
            }
            NodeKind::Comment => Descend::No,
            _ => Descend::Yes,
        });
    }

    fn visit_jsx_attribute(&mut self, attribute: Node, grammar: Grammar) {
        let mut cursor = attribute.walk();
        let children: Vec<Node> = attribute.named_children(&mut cursor).collect();
        let Some(name) = children
            .first()
            .filter(|n| NodeKind::of(grammar, **n) == NodeKind::PropertyIdentifier)
            .map(|n| self.node_text(*n))
        else {
            return;
        };
        let kind = match name {
            "className" | "class" => NameKind::Class,
            "id" => NameKind::Id,
            _ => return,
        };
        // Only string literals; expressions are opaque
        let Some(literal) = children
            .iter()
            .skip(1)
            .find(|n| NodeKind::of(grammar, **n) == NodeKind::StringLiteral)
        else {
            return;
        };
        let inner = self.unquoted(*literal);
        let value = AttributeValue {
            text: self.text.get(inner.start..inner.end).unwrap_or(""),
            inner,
        };
        self.record_usage(kind, &value);
    }
}
