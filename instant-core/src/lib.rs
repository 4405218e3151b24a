//! # instant-core — Replicated ordering engine
//!
//! A Logoot-style sequence CRDT for plain text:
//!
//! - [`pid`] — ordered position identifiers and their generation
//! - [`document`] — the identifier-indexed character store
//!
//! Insert and delete are addressed by identifier, not by offset, so they
//! commute and are idempotent: replicas that receive the same set of
//! operations in any order converge to the same text.

pub mod document;
pub mod pid;

pub use document::{Document, DocumentError, Snapshot};
pub use pid::{generate, Level, Pid, PidError, SiteId, MAX_DIGIT};
