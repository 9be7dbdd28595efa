//! # Error Handling for RevStore
//!
//! This module defines the error type used throughout the engine. A single
//! enum ([`Error`]) covers every failure mode that is *not* a normal command
//! outcome.
//!
//! ## Outcomes vs Errors
//!
//! Precondition failures, no-op commands, contention, timeouts of peers and
//! roll-forward races are all resolved inside the engine and surface as a
//! [`CommandOutcome`](crate::types::CommandOutcome). An `Error` means something
//! the engine cannot resolve on its own:
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Storage | SQLite error, I/O error | Log and retry the request |
//! | Corruption | Checksum mismatch, undecodable record | Investigate |
//! | Invalid input | Bad id, repository command inside a transaction | Fix the caller |
//! | Protocol | Illegal status transition | Bug in the engine |
//!
//! ## Rust Pattern: thiserror
//!
//! `thiserror` derives `Display` from the `#[error(...)]` attributes and the
//! `From` impls from `#[from]`, so `?` converts rusqlite, serde_json and I/O
//! errors automatically.

use thiserror::Error;

use crate::ledger::ChangeStatus;
use crate::types::Revision;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in RevStore operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Invalid Input (rejected before a revision is reserved)
    // =========================================================================

    /// An identifier does not follow the id syntax.
    #[error("invalid id '{0}'")]
    InvalidId(String),

    /// An address could not be parsed or has the wrong kind for its use.
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress {
        /// The offending address in textual form
        address: String,
        /// Why it was rejected
        reason: String,
    },

    /// A command or transaction is malformed.
    ///
    /// This is not a precondition failure: malformed commands never reach the
    /// change ledger.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================

    /// A change record was asked to move along an edge the state machine
    /// does not have.
    #[error("illegal transition for revision {revision}: {from:?} -> {to:?}")]
    IllegalTransition {
        /// The revision of the change record
        revision: Revision,
        /// Current status
        from: ChangeStatus,
        /// Requested status
        to: ChangeStatus,
    },

    /// The worker pool has shut down and can no longer accept commands.
    #[error("worker pool has shut down")]
    WorkerShutdown,

    // =========================================================================
    // Storage Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// The `#[from]` attribute lets `?` convert `rusqlite::Error` directly.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// I/O failure, e.g. while compressing a value payload.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted data failed an integrity check.
    ///
    /// # When This Happens
    ///
    /// - A checksum over saved events or an out-of-line value does not match
    /// - A change record is missing inside the reserved revision range
    /// - The database schema version is unknown
    #[error("corrupted store: {0}")]
    Corrupted(String),
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
