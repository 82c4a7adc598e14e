// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the conformance harness.
//!
//! Errors are categorized by where they are handled. Transport and cursor-state
//! errors are dealt with close to the [`ProtocolSession`](crate::session::ProtocolSession);
//! everything else propagates to the scenario.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Connectivity or timeout talking to the server under test |
//! | `CursorState` | No | Server rejected the cursor (stale, invalid, unprimed) |
//! | `Status` | No | Non-success protocol status where success was demanded |
//! | `StatusParse` | No | Response carried a status the command does not define |
//! | `PollExhausted` | No | Retry-poll predicate never held within budget |
//! | `Handshake` | No | Hierarchy discovery failed for an identity |
//! | `UnknownIdentity` | No | Owner label not present in configuration |
//! | `InvalidState` | No | Harness used out of order (e.g. no identity selected) |
//! | `Config` | No | Configuration invalid |
//! | `CursorStore` | No | Local SQLite errors persisting the cursor ledger |
//! | `Sut` | No | SUT control adapter operation failed |
//! | `Adapter` | No | Adapter returned a malformed response |
//! | `Cancelled` | No | Operation cancelled by the caller |
//! | `Internal` | No | Unexpected internal error |
//!
//! Expected-failure statuses are *not* errors: a scenario that provokes a
//! protocol status receives the [`Response`](crate::protocol::Response) untouched
//! and asserts on it.

use crate::protocol::{CollectionId, Command, Owner};
use crate::status::{Status, StatusParseError};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Boxed future for harness-level trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur while driving the server under test.
///
/// Use [`is_retryable()`](Self::is_retryable) to check whether the session
/// may transparently retry the exchange.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Connectivity or timeout failure reaching the server under test.
    ///
    /// The session retries these with bounded exponential backoff.
    #[error("Transport error ({command}): {message}")]
    Transport { command: Command, message: String },

    /// The server reported the supplied cursor as stale, invalid or unprimed.
    ///
    /// The cursor store entry has already been invalidated when this surfaces.
    /// The scenario decides whether to re-prime or fail.
    #[error("Cursor state error for {owner}/{collection}: {status}")]
    CursorState {
        owner: Owner,
        collection: CollectionId,
        status: Status,
    },

    /// A well-formed response carried a non-success status where the caller
    /// required success.
    #[error("{command} returned status {status}")]
    Status { command: Command, status: Status },

    /// The response carried a status code outside the command's closed set.
    #[error("Status parse error: {0}")]
    StatusParse(#[from] StatusParseError),

    /// A retry-poll never observed the expected state.
    ///
    /// Distinct from a single failed check: carries how long we waited and
    /// what we saw last.
    #[error("Poll for {what} exhausted after {attempts} attempts; last seen: {last_seen}")]
    PollExhausted {
        what: String,
        attempts: u32,
        last_seen: String,
    },

    /// Hierarchy discovery (initial FolderSync) failed for an identity.
    #[error("Handshake failed for {owner}: {message}")]
    Handshake { owner: Owner, message: String },

    /// Owner label not configured.
    #[error("Unknown identity: {0}")]
    UnknownIdentity(Owner),

    /// Harness state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQLite error persisting cursors.
    #[error("Cursor store error: {0}")]
    CursorStore(#[from] sqlx::Error),

    /// Out-of-band SUT control failure.
    #[error("SUT control error ({operation}): {message}")]
    Sut { operation: String, message: String },

    /// The adapter returned something the harness cannot interpret.
    #[error("Adapter error ({command}): {message}")]
    Adapter { command: Command, message: String },

    /// Cancelled by the caller.
    #[error("Cancelled")]
    Cancelled,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HarnessError {
    /// Create a transport error.
    pub fn transport(command: Command, message: impl Into<String>) -> Self {
        Self::Transport {
            command,
            message: message.into(),
        }
    }

    /// Create a SUT control error.
    pub fn sut(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sut {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::CursorState { .. } => false, // Scenario decides whether to re-prime
            Self::Status { .. } => false,
            Self::StatusParse(_) => false,
            Self::PollExhausted { .. } => false,
            Self::Handshake { .. } => false,
            Self::UnknownIdentity(_) => false,
            Self::InvalidState { .. } => false,
            Self::Config(_) => false,
            Self::CursorStore(_) => false,
            Self::Sut { .. } => false,
            Self::Adapter { .. } => false,
            Self::Cancelled => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this is a cursor-state error.
    pub fn is_cursor_state(&self) -> bool {
        matches!(self, Self::CursorState { .. })
    }
}
