//! Position-indexed character store ordered by [`Pid`].
//!
//! ```text
//!  low ─┬─ (p0,'h') ─ (p1,'i') ─ (p2,'\n') ─ … ─┬─ high
//!       │        sorted by Pid == reading order  │
//!  sentinel                                   sentinel
//! ```
//!
//! Content lives in a `Vec` sorted by identifier. Lookups (index of a PID,
//! character at a PID) are binary searches; insert and delete splice the
//! vector and cost O(n). That is fine for editor-sized buffers but is the
//! scaling limit of this type: a rank-augmented tree would make mutation
//! O(log n) as well.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pid::{self, Pid, PidError, SiteId, MAX_DIGIT};

/// Everything a guest needs to seed its model: both sentinels plus one PID
/// per character, and the text split into lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub pids: Vec<Pid>,
    pub lines: Vec<String>,
}

/// Document model errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Snapshot PID count is not `chars + 2`.
    SnapshotMismatch { expected: usize, actual: usize },
    /// Snapshot PIDs are not strictly ascending at `index`.
    SnapshotUnordered { index: usize },
    /// Delete of an identifier that is not present.
    NotFound(Pid),
    /// Insert of an identifier that is already present with the same character.
    AlreadyPresent { pid: Pid, index: usize },
    /// Insert of an identifier that is already bound to another character.
    Conflict { pid: Pid, existing: char, incoming: char },
    /// Identifier does not sort strictly between the sentinels.
    OutOfBounds(Pid),
    /// Content index past the end of the document.
    IndexOutOfRange { index: usize, len: usize },
    /// Identifier generation failed.
    Pid(PidError),
}

impl DocumentError {
    /// True for the outcomes that mean "this operation already happened".
    pub fn is_already_applied(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::AlreadyPresent { .. })
    }
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SnapshotMismatch { expected, actual } => write!(
                f,
                "Snapshot mismatch: expected {expected} identifiers, got {actual}"
            ),
            Self::SnapshotUnordered { index } => {
                write!(f, "Snapshot identifiers out of order at {index}")
            }
            Self::NotFound(pid) => write!(f, "Identifier not found: {pid}"),
            Self::AlreadyPresent { pid, index } => {
                write!(f, "Identifier {pid} already present at {index}")
            }
            Self::Conflict { pid, existing, incoming } => write!(
                f,
                "Identifier {pid} holds {existing:?}, refusing {incoming:?}"
            ),
            Self::OutOfBounds(pid) => write!(f, "Identifier {pid} outside document bounds"),
            Self::IndexOutOfRange { index, len } => {
                write!(f, "Index {index} out of range for document of length {len}")
            }
            Self::Pid(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

impl From<PidError> for DocumentError {
    fn from(e: PidError) -> Self {
        DocumentError::Pid(e)
    }
}

/// Replicated text document.
#[derive(Debug, Clone)]
pub struct Document {
    host_id: SiteId,
    low: Pid,
    high: Pid,
    entries: Vec<(Pid, char)>,
}

impl Document {
    /// Seed a host document from its current text, one identifier per
    /// character, spread evenly across the top level.
    pub fn new_host(site: SiteId, text: &str) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let step = (MAX_DIGIT / (chars.len() as u64 + 1)).max(1);
        let entries = chars
            .into_iter()
            .enumerate()
            .map(|(i, c)| (Pid::single((i as u64 + 1) * step, site), c))
            .collect();
        Self {
            host_id: site,
            low: Pid::low(site),
            high: Pid::high(site),
            entries,
        }
    }

    /// Seed a guest document from a received snapshot.
    ///
    /// `pids` holds the low sentinel, one identifier per character of
    /// `lines.join("\n")`, then the high sentinel.
    pub fn from_snapshot(
        host_id: SiteId,
        pids: Vec<Pid>,
        lines: &[String],
    ) -> Result<Self, DocumentError> {
        let joined = lines.join("\n");
        let expected = joined.chars().count() + 2;
        if pids.len() != expected {
            return Err(DocumentError::SnapshotMismatch {
                expected,
                actual: pids.len(),
            });
        }
        if let Some(i) = pids.windows(2).position(|w| w[0] >= w[1]) {
            return Err(DocumentError::SnapshotUnordered { index: i + 1 });
        }

        let mut pids = pids.into_iter();
        // Length checked above: at least the two sentinels are present.
        let low = pids.next().ok_or(DocumentError::SnapshotMismatch { expected, actual: 0 })?;
        let mut content: Vec<Pid> = pids.collect();
        let high = content
            .pop()
            .ok_or(DocumentError::SnapshotMismatch { expected, actual: 1 })?;
        let entries = content.into_iter().zip(joined.chars()).collect();

        Ok(Self {
            host_id,
            low,
            high,
            entries,
        })
    }

    /// Serializable form of the whole document, sentinels included.
    pub fn snapshot(&self) -> Snapshot {
        let mut pids = Vec::with_capacity(self.entries.len() + 2);
        pids.push(self.low.clone());
        pids.extend(self.entries.iter().map(|(p, _)| p.clone()));
        pids.push(self.high.clone());
        Snapshot {
            pids,
            lines: self.linearize().split('\n').map(str::to_owned).collect(),
        }
    }

    pub fn host_id(&self) -> SiteId {
        self.host_id
    }

    pub fn low(&self) -> &Pid {
        &self.low
    }

    pub fn high(&self) -> &Pid {
        &self.high
    }

    /// Number of content characters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn search(&self, pid: &Pid) -> Result<usize, usize> {
        self.entries.binary_search_by(|(p, _)| p.cmp(pid))
    }

    /// Identifier of the character at `index`.
    pub fn pid_at(&self, index: usize) -> Option<&Pid> {
        self.entries.get(index).map(|(p, _)| p)
    }

    /// Content index of `pid`, if present.
    pub fn index_of(&self, pid: &Pid) -> Option<usize> {
        self.search(pid).ok()
    }

    pub fn char_at(&self, pid: &Pid) -> Option<char> {
        self.search(pid).ok().map(|i| self.entries[i].1)
    }

    /// Fresh identifier for a character inserted at content `index`.
    pub fn pid_for_insert(&self, site: SiteId, index: usize) -> Result<Pid, DocumentError> {
        if index > self.entries.len() {
            return Err(DocumentError::IndexOutOfRange {
                index,
                len: self.entries.len(),
            });
        }
        let left = match index {
            0 => &self.low,
            i => &self.entries[i - 1].0,
        };
        let right = self.entries.get(index).map_or(&self.high, |(p, _)| p);
        Ok(pid::generate(site, left, right)?)
    }

    /// `count` fresh identifiers, ascending, for characters that will take
    /// the place of content `start..end`. The document is not modified, so a
    /// failure here leaves it untouched.
    pub fn pids_for_replace(
        &self,
        site: SiteId,
        start: usize,
        end: usize,
        count: usize,
    ) -> Result<Vec<Pid>, DocumentError> {
        let len = self.entries.len();
        if start > end || end > len {
            return Err(DocumentError::IndexOutOfRange { index: end, len });
        }
        let right = self.entries.get(end).map_or(&self.high, |(p, _)| p);
        let mut left = match start {
            0 => self.low.clone(),
            i => self.entries[i - 1].0.clone(),
        };
        let mut pids = Vec::with_capacity(count);
        for _ in 0..count {
            let pid = pid::generate(site, &left, right)?;
            left = pid.clone();
            pids.push(pid);
        }
        Ok(pids)
    }

    /// Insert `ch` under `pid`, returning its content index.
    pub fn insert(&mut self, pid: Pid, ch: char) -> Result<usize, DocumentError> {
        if pid <= self.low || pid >= self.high {
            return Err(DocumentError::OutOfBounds(pid));
        }
        match self.search(&pid) {
            Ok(index) => {
                let existing = self.entries[index].1;
                if existing == ch {
                    Err(DocumentError::AlreadyPresent { pid, index })
                } else {
                    Err(DocumentError::Conflict {
                        pid,
                        existing,
                        incoming: ch,
                    })
                }
            }
            Err(index) => {
                self.entries.insert(index, (pid, ch));
                Ok(index)
            }
        }
    }

    /// Remove `pid`, returning the index it occupied.
    pub fn delete(&mut self, pid: &Pid) -> Result<usize, DocumentError> {
        match self.search(pid) {
            Ok(index) => {
                self.entries.remove(index);
                Ok(index)
            }
            Err(_) => Err(DocumentError::NotFound(pid.clone())),
        }
    }

    /// Characters in identifier order.
    pub fn linearize(&self) -> String {
        self.entries.iter().map(|(_, c)| *c).collect()
    }

    /// Iterate `(pid, char)` pairs in reading order.
    pub fn iter(&self) -> impl Iterator<Item = (&Pid, char)> + '_ {
        self.entries.iter().map(|(p, c)| (p, *c))
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (_, c) in &self.entries {
            write!(f, "{c}")?;
        }
        Ok(())
    }
}
