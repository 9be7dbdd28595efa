//! # RevStore - Distributed Change Execution
//!
//! RevStore executes commands against a hierarchical versioned store
//! (repository → model → object → field → value). Any number of independent
//! workers may execute commands on the same model at once; there is no
//! coordinator and no in-memory mutual exclusion. Workers coordinate only
//! through a persisted, per-model ledger of change records.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Async API (RevStore)                        │
//! │              worker pool, mpsc requests, oneshot replies        │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Engine (one per worker)                    │
//! │                                                                 │
//! │  ┌──────────┐  ┌───────────┐  ┌───────────┐  ┌───────────────┐  │
//! │  │  Locks   │  │   Wait /  │  │ Base view │  │ Delta + Apply │  │
//! │  │          │  │  Recover  │  │ strategy  │  │               │  │
//! │  └──────────┘  └───────────┘  └───────────┘  └───────────────┘  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            Backend (SQLite file or in-memory map)               │
//! │          change ledger  +  entity graph  +  value payloads      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Gap-free ledger**: revisions of one model are contiguous from 0 and
//!    never reused
//! 2. **Serializable conflicts**: a change is evaluated only after every
//!    conflicting predecessor is committed
//! 3. **Events before effects**: events are durable before any entity is
//!    written, and applying them is idempotent
//! 4. **Terminal is final**: a committed change record never changes again
//!
//! ## Module Organization
//!
//! - [`types`], [`command`], [`event`]: addresses, revisions, values,
//!   commands and the events they produce
//! - [`locks`]: lock sets and the conflict predicate
//! - [`ledger`]: change records, reserve and status transitions
//! - [`wait`]: waiting for, rolling forward and failing predecessors
//! - [`reader`]: base views (direct reads, snapshot replay)
//! - [`delta`]: precondition checks and event generation
//! - [`apply`]: writing events into the entity graph
//! - [`engine`]: the execution pipeline
//! - [`api`]: async worker pool

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for RevStore operations.
pub mod error;

/// Engine configuration with defaults and `REVSTORE_*` environment loading.
pub mod config;

/// Injectable time source.
pub mod clock;

/// Domain types: ids, addresses, revisions, values.
///
/// Uses the newtype pattern so a model address can't be passed where a
/// revision is expected.
pub mod types;

/// Commands and transactions.
pub mod command;

/// Events and their canonical order.
pub mod event;

/// Lock computation and conflict detection.
pub mod locks;

/// Key-value backend trait and the in-memory backend.
pub mod backend;

/// SQLite schema and the durable backend.
pub mod schema;

/// Record encoding, checksums and out-of-line value payloads.
pub mod codec;

/// Per-model change ledger.
pub mod ledger;

/// Read-only in-memory model state.
pub mod state;

/// Persisted entity graph.
pub mod storage;

/// Wait-and-recover protocol.
pub mod wait;

/// Base view strategies.
pub mod reader;

/// Precondition check and event generation.
pub mod delta;

/// Apply and commit.
pub mod apply;

/// The change execution engine.
pub mod engine;

/// Async API.
///
/// The main entry point is [`RevStore`](api::RevStore).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::RevStore;
pub use backend::{Backend, MemoryBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{AtomicCommand, Command, Precondition, Transaction};
pub use config::{EngineConfig, StrategyKind};
pub use engine::Engine;
pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use ledger::{ChangeLedger, ChangeRecord, ChangeStatus};
pub use locks::{Lock, LockMode, LockSet};
pub use schema::{Database, SqliteBackend};
pub use state::{FieldState, ModelState, ObjectState};
pub use types::{ActorId, Address, AddressKind, CommandOutcome, Id, Revision, Value};
