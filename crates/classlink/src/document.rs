//
// document.rs
//
// Versioned text documents backed by a rope
//

use ropey::Rope;
use tower_lsp::lsp_types::{Position, Range, TextDocumentContentChangeEvent, Url};

use crate::language::LanguageId;
use crate::names::TextRange;

/// A document revision: URI, version, language and text.
///
/// Two documents are the same revision when URI, version and language all
/// match. Cloning is cheap because the rope shares its chunks.
#[derive(Debug, Clone)]
pub struct TextDocument {
    pub uri: Url,
    pub language: LanguageId,
    pub version: i32,
    pub contents: Rope,
}

impl TextDocument {
    pub fn new(uri: Url, language: LanguageId, version: i32, text: &str) -> Self {
        Self {
            uri,
            language,
            version,
            contents: Rope::from_str(text),
        }
    }

    /// Apply one LSP content change. A change without a range replaces the
    /// whole text.
    pub fn apply_change(&mut self, change: TextDocumentContentChangeEvent) {
        if let Some(range) = change.range {
            let start_idx = self.char_index(range.start);
            let end_idx = self.char_index(range.end).max(start_idx);
            self.contents.remove(start_idx..end_idx);
            self.contents.insert(start_idx, &change.text);
        } else {
            self.contents = Rope::from_str(&change.text);
        }
    }

    pub fn text(&self) -> String {
        self.contents.to_string()
    }

    /// Byte offset of an LSP position (UTF-16 columns), clamped to the
    /// document and to the end of the addressed line.
    pub fn offset_at(&self, position: Position) -> usize {
        self.contents.char_to_byte(self.char_index(position))
    }

    /// LSP position of a byte offset.
    pub fn position_at(&self, offset: usize) -> Position {
        let offset = offset.min(self.contents.len_bytes());
        let char_idx = self.contents.byte_to_char(offset);
        let line = self.contents.char_to_line(char_idx);
        let line_start = self.contents.line_to_char(line);
        let column =
            self.contents.char_to_utf16_cu(char_idx) - self.contents.char_to_utf16_cu(line_start);
        Position::new(line as u32, column as u32)
    }

    pub fn range_of(&self, range: TextRange) -> Range {
        Range::new(self.position_at(range.start), self.position_at(range.end))
    }

    fn char_index(&self, position: Position) -> usize {
        let line = position.line as usize;
        if line >= self.contents.len_lines() {
            return self.contents.len_chars();
        }
        let line_start = self.contents.line_to_char(line);
        let mut utf16_count = 0;
        let mut char_count = 0;
        for ch in self.contents.line(line).chars() {
            if ch == '\n' || ch == '\r' || utf16_count >= position.character as usize {
                break;
            }
            utf16_count += ch.len_utf16();
            char_count += 1;
        }
        line_start + char_count
    }
}
