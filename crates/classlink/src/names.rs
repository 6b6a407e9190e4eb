//
// names.rs
//
// Class and id name tables with source ranges
//

use indexmap::IndexMap;

/// Half-open byte span in a document's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl TextRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Inclusive of `end`, so a cursor sitting right after a token still
    /// counts as inside it.
    pub fn contains(&self, offset: usize) -> bool {
        self.start <= offset && offset <= self.end
    }
}

/// Selector namespace a name belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    Class,
    Id,
}

/// Names mapped to every range they occur at, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameTable {
    classes: IndexMap<String, Vec<TextRange>>,
    ids: IndexMap<String, Vec<TextRange>>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: NameKind, name: &str, range: TextRange) {
        if name.is_empty() {
            return;
        }
        let table = self.table_mut(kind);
        if let Some(ranges) = table.get_mut(name) {
            ranges.push(range);
        } else {
            table.insert(name.to_string(), vec![range]);
        }
    }

    pub fn ranges(&self, kind: NameKind, name: &str) -> &[TextRange] {
        self.table(kind)
            .get(name)
            .map(|ranges| ranges.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, kind: NameKind, name: &str) -> bool {
        self.table(kind).contains_key(name)
    }

    pub fn names(&self, kind: NameKind) -> impl Iterator<Item = &str> {
        self.table(kind).keys().map(|name| name.as_str())
    }

    pub fn iter(&self, kind: NameKind) -> impl Iterator<Item = (&str, &[TextRange])> {
        self.table(kind)
            .iter()
            .map(|(name, ranges)| (name.as_str(), ranges.as_slice()))
    }

    /// Find the name whose occurrence covers `offset`.
    pub fn name_at(&self, offset: usize) -> Option<(NameKind, &str, TextRange)> {
        [NameKind::Class, NameKind::Id].into_iter().find_map(|kind| {
            self.iter(kind).find_map(|(name, ranges)| {
                ranges
                    .iter()
                    .find(|range| range.contains(offset))
                    .map(|range| (kind, name, *range))
            })
        })
    }

    pub fn len(&self) -> usize {
        self.classes.len() + self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.ids.is_empty()
    }

    fn table(&self, kind: NameKind) -> &IndexMap<String, Vec<TextRange>> {
        match kind {
            NameKind::Class => &self.classes,
            NameKind::Id => &self.ids,
        }
    }

    fn table_mut(&mut self, kind: NameKind) -> &mut IndexMap<String, Vec<TextRange>> {
        match kind {
            NameKind::Class => &mut self.classes,
            NameKind::Id => &mut self.ids,
        }
    }
}

/// Split a multi-valued attribute value on runs of whitespace.
///
/// `base` is the byte offset of `value` in the document; each token comes
/// back with its own document range.
pub fn split_tokens(value: &str, base: usize) -> Vec<(&str, TextRange)> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (idx, ch) in value.char_indices() {
        match (ch.is_whitespace(), start) {
            (true, Some(s)) => {
                tokens.push((&value[s..idx], TextRange::new(base + s, base + idx)));
                start = None;
            }
            (false, None) => start = Some(idx),
            _ => {}
        }
    }
    if let Some(s) = start {
        tokens.push((&value[s..], TextRange::new(base + s, base + value.len())));
    }
    tokens
}
