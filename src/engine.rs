//! # Change Execution Engine
//!
//! One [`Engine`] is one worker. Any number of engines, in one process or
//! many, may execute commands against the same backend at once; all
//! coordination happens through the change ledger.
//!
//! ## Execution Pipeline
//!
//! ```text
//!   Command
//!      │
//!      ▼
//!   validate ──► compute locks ──► reserve r ──────────────────────┐
//!                                                                  │
//!      ┌─────────────────── wait for conflicting predecessors ◄────┘
//!      │                          (roll forward / fail stalled ones)
//!      ▼
//!   base view (r - 1) ──► evaluate
//!                            │
//!          ┌─────────────────┼──────────────────────┐
//!          ▼                 ▼                      ▼
//!   FailedPreconditions  SuccessNochange     save events (Executing)
//!                                                   │
//!                                                   ▼
//!                                        apply ──► SuccessExecuted
//! ```
//!
//! ## Failure Semantics
//!
//! | Situation | Record | Outcome |
//! |-----------|--------|---------|
//! | precondition fails | `FailedPreconditions` | `Failed` |
//! | nothing to do | `SuccessNochange` | `NoChange` |
//! | budget runs out before events are saved | `FailedTimeout` | `Failed` |
//! | a peer failed our record | `FailedTimeout` | `Failed` |
//! | events saved | `Executing`, then `SuccessExecuted` | `Executed(r)` |
//!
//! Once events are saved the change will be applied, by us or by whoever
//! rolls it forward, so the outcome is `Executed` from then on.
//!
//! `Err` is reserved for invalid commands and backend or corruption errors.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::apply::{self, Lease};
use crate::backend::{Backend, MemoryBackend};
use crate::clock::{Clock, SystemClock};
use crate::codec::inline_size;
use crate::command::Command;
use crate::config::{EngineConfig, StrategyKind};
use crate::delta::{self, Evaluation};
use crate::error::{Error, Result};
use crate::event::{Event, ValueRef, ValueSlot};
use crate::ledger::{ChangeLedger, ChangeStatus};
use crate::locks::LockSet;
use crate::reader::{DirectReads, SnapshotReplay, ViewContext, ViewStrategy};
use crate::schema::SqliteBackend;
use crate::state::ModelState;
use crate::storage::EntityStore;
use crate::types::{ActorId, Address, AddressKind, CommandOutcome, Revision};
use crate::wait::{WaitOutcome, Waiter};

/// Distinguishes owner tokens minted in the same millisecond.
static OWNER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Mints a token identifying one execution attempt.
fn mint_owner_token(now_ms: u64) -> u64 {
    let sequence = OWNER_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let seed = format!(
        "{now_ms}:{}:{:?}:{sequence}",
        std::process::id(),
        std::thread::current().id()
    );
    xxh3_64(seed.as_bytes())
}

fn expect_model(model: &Address) -> Result<()> {
    if model.kind() == AddressKind::Model {
        Ok(())
    } else {
        Err(Error::InvalidAddress {
            address: model.to_string(),
            reason: "not a model address".into(),
        })
    }
}

/// A worker executing commands against a shared backend.
pub struct Engine {
    backend: Arc<dyn Backend>,
    store: EntityStore,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    strategy: Box<dyn ViewStrategy>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(backend: Arc<dyn Backend>, config: EngineConfig) -> Result<Self> {
        Self::with_clock(backend, config, Arc::new(SystemClock))
    }

    /// Creates an engine with an injected clock (tests drive time by hand).
    pub fn with_clock(
        backend: Arc<dyn Backend>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let strategy: Box<dyn ViewStrategy> = match config.strategy {
            StrategyKind::Direct => Box::new(DirectReads::new()),
            StrategyKind::Snapshot => Box::new(SnapshotReplay::new(config.snapshot_cache_size)),
        };
        Ok(Self {
            store: EntityStore::new(backend.clone()),
            backend,
            clock,
            config,
            strategy,
        })
    }

    /// Opens an engine on its own connection to a SQLite file.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        Self::new(Arc::new(SqliteBackend::open(path)?), config)
    }

    /// An engine over a fresh in-memory backend.
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryBackend::new()), config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// The change ledger of `model`.
    pub fn ledger(&self, model: &Address) -> Result<ChangeLedger> {
        expect_model(model)?;
        Ok(ChangeLedger::new(self.backend.clone(), model.clone()))
    }

    /// The materialized current state of a model.
    pub fn snapshot(&self, model: &Address) -> Result<ModelState> {
        expect_model(model)?;
        self.store.materialize(model)
    }

    /// Revision of the last executed change of `model`.
    pub fn current_revision(&self, model: &Address) -> Result<Revision> {
        self.ledger(model)?.current_revision()
    }

    /// Events of executed changes after `revision`, stopping at the first
    /// change that is still pending.
    pub fn events_since(&self, model: &Address, revision: Revision) -> Result<Vec<Event>> {
        self.ledger(model)?.events_since(revision)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Executes one command or transaction.
    pub fn execute_command(&mut self, command: &Command, actor: &ActorId) -> Result<CommandOutcome> {
        command.validate()?;
        let model = command.model_address()?;
        let ledger = ChangeLedger::new(self.backend.clone(), model.clone());
        let locks = LockSet::for_command(command);

        let started_ms = self.clock.now_ms();
        let deadline_ms = started_ms.saturating_add(self.config.execution_budget.as_millis() as u64);
        let owner = mint_owner_token(started_ms);

        let record = ledger.reserve(locks, actor, owner, started_ms)?;
        let revision = record.revision;

        let waiter = Waiter {
            ledger: &ledger,
            store: &self.store,
            clock: self.clock.as_ref(),
            config: &self.config,
        };
        let touched = match waiter.wait_for_predecessors(&record, deadline_ms)? {
            WaitOutcome::Ready { touched } => touched,
            WaitOutcome::BudgetExhausted => {
                self.give_up(&ledger, revision, owner, actor)?;
                return Ok(CommandOutcome::Failed);
            }
            WaitOutcome::Evicted => return Ok(CommandOutcome::Failed),
        };

        let base = self.strategy.base_view(&ViewContext {
            store: &self.store,
            ledger: &ledger,
            locks: &record.locks,
            revision,
            touched: &touched,
        })?;

        let mut events = match delta::evaluate(&base, command, revision, actor) {
            Evaluation::Events(events) => events,
            Evaluation::NoChange => {
                let finished = ledger.finish(revision, owner, ChangeStatus::SuccessNochange, self.clock.now_ms())?;
                return Ok(if finished {
                    CommandOutcome::NoChange
                } else {
                    CommandOutcome::Failed
                });
            }
            Evaluation::Failed(reason) => {
                debug!(model = %model, revision = %revision, actor = %actor, reason = %reason, "precondition failed");
                ledger.finish(revision, owner, ChangeStatus::FailedPreconditions, self.clock.now_ms())?;
                return Ok(CommandOutcome::Failed);
            }
        };

        if self.clock.now_ms() >= deadline_ms {
            self.give_up(&ledger, revision, owner, actor)?;
            return Ok(CommandOutcome::Failed);
        }

        let value_refs = self.externalize_values(&model, revision, &mut events)?;
        if !ledger.save_events(revision, owner, events.clone(), value_refs, self.clock.now_ms())? {
            warn!(model = %model, revision = %revision, "change was failed by a peer before its events were saved");
            return Ok(CommandOutcome::Failed);
        }

        let lease = Lease {
            clock: self.clock.as_ref(),
            owner,
            deadline_ms,
            renew_every_ms: self.config.heartbeat_interval_ms(),
        };
        let committed = apply::apply_and_commit(&self.store, &ledger, revision, &events, &lease)?;
        if committed {
            info!(model = %model, revision = %revision, actor = %actor, events = events.len(), "change executed");
        } else {
            info!(model = %model, revision = %revision, "change handed over to roll-forward");
        }
        Ok(CommandOutcome::Executed(revision))
    }

    /// Voluntary timeout: fails our own change before it reaches `Executing`.
    fn give_up(&self, ledger: &ChangeLedger, revision: Revision, owner: u64, actor: &ActorId) -> Result<()> {
        warn!(model = %ledger.model(), revision = %revision, actor = %actor, "execution budget exhausted, abandoning change");
        ledger.finish(revision, owner, ChangeStatus::FailedTimeout, self.clock.now_ms())?;
        Ok(())
    }

    /// Moves values above the inline limit out of the events.
    fn externalize_values(
        &self,
        model: &Address,
        revision: Revision,
        events: &mut [Event],
    ) -> Result<Vec<ValueRef>> {
        let mut refs = Vec::new();
        for (index, event) in events.iter_mut().enumerate() {
            let Some(slot) = event.value_slot_mut() else {
                continue;
            };
            let external = match &*slot {
                ValueSlot::Inline(value) if inline_size(value)? > self.config.inline_value_limit => {
                    Some(self.store.store_value(model, revision, index, value)?)
                }
                _ => None,
            };
            if let Some(reference) = external {
                refs.push(reference.clone());
                *slot = ValueSlot::External(reference);
            }
        }
        Ok(refs)
    }
}
