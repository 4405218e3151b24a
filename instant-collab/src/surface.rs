//! Editing-surface seam.
//!
//! The coordinator never touches a visible buffer directly. It asks an
//! [`EditSurface`] to perform a [`SurfaceEdit`] and listens for the
//! [`SurfaceChange`] notifications the surface emits, whether they come from
//! the user or echo its own writes.
//!
//! All offsets and lengths count Unicode scalar values, not bytes.

use std::fmt;

/// Change notification from the surface: `removed` characters at `offset`
/// were replaced by `inserted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceChange {
    pub offset: usize,
    pub removed: usize,
    pub inserted: String,
}

impl SurfaceChange {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            removed: 0,
            inserted: text.into(),
        }
    }

    pub fn delete(offset: usize, removed: usize) -> Self {
        Self {
            offset,
            removed,
            inserted: String::new(),
        }
    }

    pub fn replace(offset: usize, removed: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            removed,
            inserted: text.into(),
        }
    }

    /// This change as it reads in a text that also holds `edit`, when the
    /// change was made first and `edit` was then written at its own offset.
    pub fn after(&self, edit: &SurfaceEdit) -> SurfaceChange {
        let mut shifted = self.clone();
        match edit {
            SurfaceEdit::Insert { offset, text } => {
                if self.offset >= *offset {
                    shifted.offset += text.chars().count();
                }
            }
            SurfaceEdit::Delete { offset, text } => {
                let n = text.chars().count();
                if self.offset >= offset + n {
                    shifted.offset -= n;
                } else if self.offset > *offset {
                    // Started inside the deleted region.
                    shifted.offset = *offset;
                }
            }
        }
        shifted
    }
}

/// Programmatic write requested by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEdit {
    Insert { offset: usize, text: String },
    /// `text` is what the model held at the region before removal.
    Delete { offset: usize, text: String },
}

impl SurfaceEdit {
    pub fn offset(&self) -> usize {
        match self {
            Self::Insert { offset, .. } | Self::Delete { offset, .. } => *offset,
        }
    }

    /// The notification a surface emits after performing this edit.
    pub fn to_change(&self) -> SurfaceChange {
        match self {
            Self::Insert { offset, text } => SurfaceChange::insert(*offset, text.clone()),
            Self::Delete { offset, text } => SurfaceChange::delete(*offset, text.chars().count()),
        }
    }

    /// Whether `change` is the echo of this edit: same kind, region and text.
    pub fn matches(&self, change: &SurfaceChange) -> bool {
        match self {
            Self::Insert { offset, text } => {
                change.offset == *offset && change.removed == 0 && change.inserted == *text
            }
            Self::Delete { offset, text } => {
                change.offset == *offset
                    && change.removed == text.chars().count()
                    && change.inserted.is_empty()
            }
        }
    }
}

/// A change that does not fit the current text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeError {
    pub offset: usize,
    pub removed: usize,
    pub len: usize,
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Range {}..{} out of bounds for text of length {}",
            self.offset,
            self.offset + self.removed,
            self.len
        )
    }
}

impl std::error::Error for RangeError {}

/// Host editing surface.
pub trait EditSurface {
    /// Current visible text.
    fn text(&self) -> String;

    /// Perform `edit` and return the change notification it produced.
    fn apply(&mut self, edit: &SurfaceEdit) -> Result<SurfaceChange, RangeError>;
}

/// In-memory surface for headless sessions and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    text: String,
}

impl TextBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    fn byte_offset(&self, offset: usize) -> Option<usize> {
        if offset == 0 {
            return Some(0);
        }
        match self.text.char_indices().nth(offset) {
            Some((b, _)) => Some(b),
            None if offset == self.len() => Some(self.text.len()),
            None => None,
        }
    }

    /// Apply `change` to the text. Used both for user typing and for
    /// programmatic writes.
    pub fn replace(&mut self, change: &SurfaceChange) -> Result<(), RangeError> {
        let out_of_range = || RangeError {
            offset: change.offset,
            removed: change.removed,
            len: self.len(),
        };
        let start = self.byte_offset(change.offset).ok_or_else(out_of_range)?;
        let end = self
            .byte_offset(change.offset + change.removed)
            .ok_or_else(out_of_range)?;
        self.text.replace_range(start..end, &change.inserted);
        Ok(())
    }

    /// `(line, column)` of character `offset`, both 0-based.
    pub fn offset_to_position(&self, offset: usize) -> Option<(usize, usize)> {
        let (mut line, mut col) = (0, 0);
        for (i, c) in self.text.chars().enumerate() {
            if i == offset {
                return Some((line, col));
            }
            if c == '\n' {
                line += 1;
                col = 0;
            } else {
                col += 1;
            }
        }
        (offset == self.len()).then_some((line, col))
    }

    /// Character offset of `(line, column)`. The column may point one past
    /// the last character of the line.
    pub fn position_to_offset(&self, line: usize, column: usize) -> Option<usize> {
        let mut offset = 0;
        for (i, text) in self.text.split('\n').enumerate() {
            let width = text.chars().count();
            if i == line {
                return (column <= width).then_some(offset + column);
            }
            offset += width + 1;
        }
        None
    }
}

impl EditSurface for TextBuffer {
    fn text(&self) -> String {
        self.text.clone()
    }

    fn apply(&mut self, edit: &SurfaceEdit) -> Result<SurfaceChange, RangeError> {
        let change = edit.to_change();
        self.replace(&change)?;
        Ok(change)
    }
}
