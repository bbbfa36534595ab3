//! Error types for the learning subsystem.
//!
//! Mirrors the donor backend's convention of hand-written `Display` /
//! `std::error::Error` impls on plain enums rather than a derive macro —
//! this crate never pulls in `thiserror`.

use std::fmt;

/// Typed errors surfaced by learning-agent operations.
///
/// Policy-deny outcomes (manual approval required, circuit open, protected
/// agent, impact above cap) are never represented here — those are a
/// structured `ApplyResult`, not an error (see `agent::ApplyResult`).
#[derive(Debug)]
pub enum LearningError {
    /// Bad configuration, unknown enum variant, missing required field.
    Validation(String),
    /// Improvement id, pattern, or YAML entry not found.
    NotFound(String),
    /// Caller-observed cancellation at a suspension point.
    Cancelled,
    /// Durable storage failure (query or transaction).
    Storage(rusqlite::Error),
    /// Any other I/O failure (pattern-library file access).
    Io(std::io::Error),
}

impl fmt::Display for LearningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "invalid configuration: {msg}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for LearningError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for LearningError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e)
    }
}

impl From<std::io::Error> for LearningError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, LearningError>;
