//! Edit coordinator: serializes local and remote edits against one document.
//!
//! ```text
//!   user typing ──► local_change ──┬── echo of active edit? ──► discard
//!                                  ├── Applying? ─────────────► defer
//!                                  └── model + TEXT batch ────► network
//!
//!   network TEXT ─► remote_text ─► pending_remote (FIFO)
//!                                        │ begin_next (only when Idle)
//!                                        ▼
//!                         model ─► Applying(edit) ─► surface write
//!                                                        │ finish_edit
//!                                                        ▼
//!                                          Idle, replay deferred locals
//! ```
//!
//! Remote operations are applied one character at a time and strictly in
//! arrival order. While an edit is being written to the surface, the only
//! change that is swallowed is the single notification matching it; any
//! other local change waits for [`Coordinator::finish_edit`]. Changes
//! reported after the echo already read against the written text. Changes
//! reported before it were made against the text without the write, so
//! their offsets are moved past the active edit before they are replayed.

use std::collections::VecDeque;
use std::fmt;

use instant_core::{Document, DocumentError, Pid, SiteId};

use crate::protocol::{BufferId, ClientId, Message, OpKind, TextOp};
use crate::surface::{EditSurface, RangeError, SurfaceChange, SurfaceEdit};

/// Coordinator errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// Model rejected a local operation.
    Document(DocumentError),
    /// Local change does not fit the current text.
    RangeOutOfBounds(RangeError),
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document(e) => write!(f, "Document error: {e}"),
            Self::RangeOutOfBounds(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<DocumentError> for CoordinatorError {
    fn from(e: DocumentError) -> Self {
        CoordinatorError::Document(e)
    }
}

impl From<RangeError> for CoordinatorError {
    fn from(e: RangeError) -> Self {
        CoordinatorError::RangeOutOfBounds(e)
    }
}

/// The edit currently being written to the surface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ActiveEdit {
    #[default]
    Idle,
    Applying {
        edit: SurfaceEdit,
        /// The matching notification has been seen.
        echoed: bool,
    },
}

/// One remote character operation waiting to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOp {
    pub kind: OpKind,
    pub pid: Pid,
    pub ch: char,
    pub sender: ClientId,
}

/// Local change held back while an edit is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeferredChange {
    change: SurfaceChange,
    /// Reported before the active edit's echo.
    before_echo: bool,
}

/// Per-buffer edit coordinator. Owns the document model.
pub struct Coordinator {
    site: SiteId,
    buffer: BufferId,
    document: Document,
    active: ActiveEdit,
    pending_remote: VecDeque<RemoteOp>,
    deferred_local: VecDeque<DeferredChange>,
}

impl Coordinator {
    /// `site` is this participant's client id.
    pub fn new(site: SiteId, buffer: BufferId, document: Document) -> Self {
        Self {
            site,
            buffer,
            document,
            active: ActiveEdit::Idle,
            pending_remote: VecDeque::new(),
            deferred_local: VecDeque::new(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn active(&self) -> &ActiveEdit {
        &self.active
    }

    pub fn is_idle(&self) -> bool {
        self.active == ActiveEdit::Idle
    }

    /// Remote operations not yet applied.
    pub fn pending_remote(&self) -> usize {
        self.pending_remote.len()
    }

    /// Local changes waiting for the active edit to finish.
    pub fn deferred_local(&self) -> usize {
        self.deferred_local.len()
    }

    /// INITIAL message carrying the current snapshot.
    pub fn initial_message(&self, buffer_name: &str) -> Message {
        Message::initial(buffer_name, self.buffer, self.document.snapshot())
    }

    // ───────────────────────────────────────────────────────────────────
    // Local path
    // ───────────────────────────────────────────────────────────────────

    /// Handle a change notification from the surface. Returns the TEXT
    /// messages to send, in order.
    pub fn local_change(&mut self, change: SurfaceChange) -> Result<Vec<Message>, CoordinatorError> {
        if let ActiveEdit::Applying { edit, echoed } = &mut self.active {
            if !*echoed && edit.matches(&change) {
                *echoed = true;
                log::trace!("Suppressed echo at {}", change.offset);
            } else {
                log::debug!("Deferring local change at {} behind active edit", change.offset);
                self.deferred_local.push_back(DeferredChange {
                    change,
                    before_echo: !*echoed,
                });
            }
            return Ok(Vec::new());
        }
        self.apply_local(&change)
    }

    fn apply_local(&mut self, change: &SurfaceChange) -> Result<Vec<Message>, CoordinatorError> {
        let len = self.document.len();
        if change.offset + change.removed > len {
            return Err(RangeError {
                offset: change.offset,
                removed: change.removed,
                len,
            }
            .into());
        }

        // Every fallible step happens before the model changes.
        let end = change.offset + change.removed;
        let fresh = self.document.pids_for_replace(
            self.site,
            change.offset,
            end,
            change.inserted.chars().count(),
        )?;
        let deleted: Vec<(Pid, char)> = (change.offset..end)
            .filter_map(|i| {
                let pid = self.document.pid_at(i)?.clone();
                let ch = self.document.char_at(&pid)?;
                Some((pid, ch))
            })
            .collect();

        for (pid, _) in &deleted {
            if let Err(e) = self.document.delete(pid) {
                log::error!("Local delete of {pid} failed: {e}");
            }
        }
        let mut inserted = Vec::with_capacity(fresh.len());
        for (pid, ch) in fresh.into_iter().zip(change.inserted.chars()) {
            match self.document.insert(pid.clone(), ch) {
                Ok(_) => inserted.push((pid, ch)),
                Err(e) => log::error!("Local insert of {pid} failed: {e}"),
            }
        }

        let mut out = Vec::with_capacity(2);
        if !deleted.is_empty() {
            out.push(Message::text(OpKind::Delete, deleted, self.buffer, self.site));
        }
        if !inserted.is_empty() {
            out.push(Message::text(OpKind::Insert, inserted, self.buffer, self.site));
        }
        Ok(out)
    }

    // ───────────────────────────────────────────────────────────────────
    // Remote path
    // ───────────────────────────────────────────────────────────────────

    /// Queue the character operations of a received TEXT.
    pub fn remote_text(&mut self, op: TextOp, sender: ClientId) {
        let kind = op.kind;
        self.pending_remote.extend(op.chars.into_iter().map(|(pid, ch)| RemoteOp {
            kind,
            pid,
            ch,
            sender,
        }));
    }

    /// Apply the next queued remote operation to the model and enter
    /// `Applying`. Returns the surface write to perform, or `None` when busy
    /// or nothing visible is left to apply.
    pub fn begin_next(&mut self) -> Option<SurfaceEdit> {
        if !self.is_idle() {
            return None;
        }
        while let Some(op) = self.pending_remote.pop_front() {
            let applied = match op.kind {
                OpKind::Insert => self
                    .document
                    .insert(op.pid, op.ch)
                    .map(|offset| SurfaceEdit::Insert {
                        offset,
                        text: op.ch.to_string(),
                    }),
                OpKind::Delete => {
                    let ch = self.document.char_at(&op.pid);
                    self.document.delete(&op.pid).map(|offset| SurfaceEdit::Delete {
                        offset,
                        text: ch.map(String::from).unwrap_or_default(),
                    })
                }
            };
            match applied {
                Ok(edit) => {
                    self.active = ActiveEdit::Applying {
                        edit: edit.clone(),
                        echoed: false,
                    };
                    return Some(edit);
                }
                Err(e) if e.is_already_applied() => {
                    log::debug!("Skipping remote op from {}: {e}", op.sender);
                }
                Err(e) => {
                    log::warn!("Rejected remote op from {}: {e}", op.sender);
                }
            }
        }
        None
    }

    /// Leave `Applying` and replay local changes deferred meanwhile.
    /// Returns the TEXT messages they produced.
    pub fn finish_edit(&mut self) -> Vec<Message> {
        let finished = match std::mem::take(&mut self.active) {
            ActiveEdit::Applying { edit, echoed } => {
                if !echoed {
                    log::debug!("Edit at {} finished without an echo", edit.offset());
                }
                Some(edit)
            }
            ActiveEdit::Idle => None,
        };

        let mut out = Vec::new();
        while let Some(deferred) = self.deferred_local.pop_front() {
            let change = match &finished {
                Some(edit) if deferred.before_echo => deferred.change.after(edit),
                _ => deferred.change,
            };
            match self.apply_local(&change) {
                Ok(messages) => out.extend(messages),
                Err(e) => log::error!("Dropping deferred local change at {}: {e}", change.offset),
            }
        }
        out
    }

    /// Drain every pending remote operation through `surface`, feeding each
    /// write's notification back as its echo. Returns the messages produced
    /// by any local changes replayed along the way.
    pub fn apply_pending<S: EditSurface>(&mut self, surface: &mut S) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(edit) = self.begin_next() {
            match surface.apply(&edit) {
                Ok(change) => {
                    if let Ok(messages) = self.local_change(change) {
                        out.extend(messages);
                    }
                }
                Err(e) => log::error!("Surface rejected remote edit: {e}"),
            }
            out.extend(self.finish_edit());
        }
        out
    }
}
