// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Minimal editor-side document model: text buffers, edits and positions.
//!
//! The host editor owns the real document; it hands snapshots of it to the
//! synchronizer through [`TextBuffer`]. Offsets are byte offsets into UTF-8
//! text; LSP positions use UTF-16 code units per line.

use std::path::{Path, PathBuf};

use lsp_types::{Position, Uri};

use crate::error::{LspError, LspResult};
use crate::registry::Language;

/// A replacement of `old_len` bytes at `offset` by `new_text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEdit {
    /// Byte offset in the pre-edit text.
    pub offset: usize,
    /// Number of bytes replaced.
    pub old_len: usize,
    /// Inserted text.
    pub new_text: String,
}

impl DocumentEdit {
    /// Insertion of `text` at `offset`.
    #[must_use]
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            old_len: 0,
            new_text: text.into(),
        }
    }

    /// Deletion of `len` bytes at `offset`.
    #[must_use]
    pub const fn delete(offset: usize, len: usize) -> Self {
        Self {
            offset,
            old_len: len,
            new_text: String::new(),
        }
    }

    /// Replacement of `len` bytes at `offset` by `text`.
    #[must_use]
    pub fn replace(offset: usize, len: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            old_len: len,
            new_text: text.into(),
        }
    }
}

/// Snapshot of a document's text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    text: String,
}

impl TextBuffer {
    /// Wraps `text`.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// The full text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.text.len()
    }

    /// True for an empty document.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Converts a byte offset to an LSP position.
    ///
    /// Returns `None` when the offset is past the end or splits a character.
    #[must_use]
    pub fn position_at(&self, offset: usize) -> Option<Position> {
        if offset > self.text.len() || !self.text.is_char_boundary(offset) {
            return None;
        }
        let before = &self.text[..offset];
        let line = before.matches('\n').count();
        let line_start = before.rfind('\n').map_or(0, |i| i + 1);
        let character = before[line_start..].encode_utf16().count();
        Some(Position::new(
            u32::try_from(line).ok()?,
            u32::try_from(character).ok()?,
        ))
    }

    /// Converts an LSP position to a byte offset.
    ///
    /// Characters past the end of a line clamp to the line end, as the
    /// protocol requires; lines past the end of the document return `None`.
    #[must_use]
    pub fn offset_at(&self, position: Position) -> Option<usize> {
        let target_line = usize::try_from(position.line).ok()?;
        let mut line_start = 0;
        for _ in 0..target_line {
            let newline = self.text[line_start..].find('\n')?;
            line_start += newline + 1;
        }
        let line_end = self.text[line_start..]
            .find('\n')
            .map_or(self.text.len(), |i| line_start + i);

        let wanted = usize::try_from(position.character).ok()?;
        let mut units = 0;
        for (index, ch) in self.text[line_start..line_end].char_indices() {
            if units >= wanted {
                return Some(line_start + index);
            }
            units += ch.len_utf16();
        }
        Some(line_end)
    }

    /// Applies an edit in place.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::InvalidEdit`] when the edit range is outside the
    /// text or not on character boundaries.
    pub fn apply(&mut self, edit: &DocumentEdit) -> LspResult<()> {
        let end = edit
            .offset
            .checked_add(edit.old_len)
            .filter(|end| *end <= self.text.len())
            .ok_or_else(|| LspError::InvalidEdit(format!("{edit:?} exceeds document")))?;
        if !self.text.is_char_boundary(edit.offset) || !self.text.is_char_boundary(end) {
            return Err(LspError::InvalidEdit(format!(
                "{edit:?} splits a character"
            )));
        }
        self.text.replace_range(edit.offset..end, &edit.new_text);
        Ok(())
    }
}

/// Converts a filesystem path to a `file://` URI.
///
/// # Errors
///
/// Returns [`LspError::InvalidPath`] for relative paths or paths the URI
/// grammar cannot express.
pub fn path_to_uri(path: &Path) -> LspResult<Uri> {
    let url = url::Url::from_file_path(path)
        .map_err(|()| LspError::InvalidPath(path.display().to_string()))?;
    url.as_str()
        .parse()
        .map_err(|e| LspError::InvalidPath(format!("{}: {e:?}", path.display())))
}

/// Everything the runtime needs to know about one editor document.
#[derive(Debug, Clone)]
pub struct DocumentRef {
    /// Protocol identifier of the document.
    pub uri: Uri,
    /// Filesystem path, used for glob matching and scope resolution.
    pub path: PathBuf,
    /// Editor language of the document.
    pub language: Language,
}

impl DocumentRef {
    /// Builds a reference from a path, deriving the URI.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::InvalidPath`] if the path cannot become a URI.
    pub fn from_path(path: impl Into<PathBuf>, language: Language) -> LspResult<Self> {
        let path = path.into();
        let uri = path_to_uri(&path)?;
        Ok(Self {
            uri,
            path,
            language,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[test]
    fn test_position_at_counts_utf16_units() -> Result<()> {
        let buffer = TextBuffer::new("fn main() {}\nlet é = \"😀\";\n");
        assert_eq!(buffer.position_at(0), Some(Position::new(0, 0)));
        assert_eq!(buffer.position_at(13), Some(Position::new(1, 0)));

        let emoji_end = buffer.text().find("\";").context("missing quote")?;
        // "let é = \"" is 9 UTF-16 units, the emoji adds two more.
        assert_eq!(buffer.position_at(emoji_end), Some(Position::new(1, 11)));
        assert_eq!(buffer.position_at(buffer.len()), Some(Position::new(2, 0)));
        Ok(())
    }

    #[test]
    fn test_position_at_rejects_bad_offsets() {
        let buffer = TextBuffer::new("é");
        assert_eq!(buffer.position_at(1), None);
        assert_eq!(buffer.position_at(5), None);
    }

    #[test]
    fn test_offset_at_round_trips_and_clamps() {
        let buffer = TextBuffer::new("ab\ncdé\n");
        assert_eq!(buffer.offset_at(Position::new(1, 1)), Some(4));
        assert_eq!(buffer.offset_at(Position::new(1, 3)), Some(7));
        assert_eq!(buffer.offset_at(Position::new(0, 40)), Some(2));
        assert_eq!(buffer.offset_at(Position::new(2, 0)), Some(buffer.len()));
        assert_eq!(buffer.offset_at(Position::new(9, 0)), None);
    }

    #[test]
    fn test_apply_edits() -> Result<()> {
        let mut buffer = TextBuffer::new("hello");
        buffer.apply(&DocumentEdit::insert(0, "x"))?;
        assert_eq!(buffer.text(), "xhello");
        buffer.apply(&DocumentEdit::delete(1, 1))?;
        assert_eq!(buffer.text(), "xello");
        buffer.apply(&DocumentEdit::replace(1, 4, "yz"))?;
        assert_eq!(buffer.text(), "xyz");
        assert!(buffer.apply(&DocumentEdit::delete(2, 5)).is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_path_to_uri() -> Result<()> {
        let uri = path_to_uri(Path::new("/home/user/my project/a.py"))?;
        assert_eq!(uri.as_str(), "file:///home/user/my%20project/a.py");
        assert!(path_to_uri(Path::new("relative.py")).is_err());
        Ok(())
    }
}
