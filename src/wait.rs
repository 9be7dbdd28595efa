//! # Wait-and-Recover Protocol
//!
//! After reserving revision `r`, a change must not look at its base view
//! until every *conflicting* predecessor is committed.
//!
//! ```text
//!  last committed hint                                       own change
//!          │                                                      │
//!          ▼                                                      ▼
//!   ... ─ h ─ h+1 ─ h+2 ─ h+3 ─ ... ───────────────────────────── r
//!              │      │      │
//!              │      │      └── conflicting, pending: poll with backoff
//!              │      └── pending, no conflict: remember its writes
//!              └── committed: skip
//! ```
//!
//! ## Polling a Conflicting Predecessor
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!     reload record ── committed ──► next predecessor       │
//!            │                                              │
//!       timed out? ── no ──► budget left? ── yes ── sleep ──┘
//!            │                     │
//!           yes                    no ──► BudgetExhausted
//!            │
//!     Executing ── grab ── won ──► apply + commit ──┐
//!            │        └── lost ───────────────────┤
//!     Creating ── force fail ─────────────────────┘ (reload)
//! ```
//!
//! While polling, the worker heartbeats its own record so peers don't
//! mistake it for a stalled one.

use std::time::Duration;

use tracing::{debug, warn};

use crate::apply::{self, Lease};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::ledger::{ChangeLedger, ChangeRecord};
use crate::storage::EntityStore;
use crate::types::Address;

// =============================================================================
// Backoff
// =============================================================================

/// Doubling delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }
}

// =============================================================================
// Wait
// =============================================================================

/// How waiting for predecessors ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every conflicting predecessor is committed. `touched` lists the
    /// write-locked addresses of pending non-conflicting predecessors.
    Ready { touched: Vec<Address> },
    /// The execution budget ran out while waiting.
    BudgetExhausted,
    /// Our own record was failed by a peer.
    Evicted,
}

/// Shared inputs of the wait protocol.
pub struct Waiter<'a> {
    pub ledger: &'a ChangeLedger,
    pub store: &'a EntityStore,
    pub clock: &'a dyn Clock,
    pub config: &'a EngineConfig,
}

impl Waiter<'_> {
    /// Waits until every predecessor of `own` that conflicts with it is
    /// committed, recovering stalled ones on the way.
    pub fn wait_for_predecessors(&self, own: &ChangeRecord, deadline_ms: u64) -> Result<WaitOutcome> {
        let timeout_ms = self.config.change_timeout_ms();
        let heartbeat_every = self.config.heartbeat_interval_ms();
        let mut last_heartbeat = self.clock.now_ms();

        let mut touched = Vec::new();
        let mut all_committed = true;
        let mut predecessor = self.ledger.last_committed_hint()?.next();

        while predecessor < own.revision {
            let record = self.ledger.load_existing(predecessor)?;
            if record.status.is_committed() {
                predecessor = predecessor.next();
                continue;
            }
            if !record.locks.conflicts_with(&own.locks) {
                touched.extend(record.locks.write_addresses().cloned());
                all_committed = false;
                predecessor = predecessor.next();
                continue;
            }

            debug!(
                model = %self.ledger.model(),
                revision = %own.revision,
                predecessor = %predecessor,
                "waiting for conflicting change"
            );

            let mut backoff = Backoff::new(self.config.wait_initial, self.config.wait_max);
            loop {
                let now = self.clock.now_ms();
                let record = self.ledger.load_existing(predecessor)?;
                if record.status.is_committed() {
                    break;
                }

                if now >= deadline_ms {
                    warn!(
                        model = %self.ledger.model(),
                        revision = %own.revision,
                        predecessor = %predecessor,
                        "execution budget exhausted while waiting"
                    );
                    return Ok(WaitOutcome::BudgetExhausted);
                }

                if now.saturating_sub(last_heartbeat) >= heartbeat_every {
                    if !self.ledger.heartbeat(own.revision, own.owner, now)? {
                        warn!(model = %self.ledger.model(), revision = %own.revision, "own change was failed by a peer");
                        return Ok(WaitOutcome::Evicted);
                    }
                    last_heartbeat = now;
                }

                if record.is_timed_out(now, timeout_ms) {
                    if record.status.can_roll_forward() {
                        if let Some(grabbed) = self.ledger.grab(predecessor, own.owner, now, timeout_ms)? {
                            let lease = Lease {
                                clock: self.clock,
                                owner: own.owner,
                                deadline_ms,
                                renew_every_ms: heartbeat_every,
                            };
                            apply::roll_forward(self.store, self.ledger, &grabbed, &lease)?;
                        }
                    } else {
                        self.ledger.force_fail(predecessor, now, timeout_ms)?;
                    }
                    continue;
                }

                self.clock.sleep(backoff.next_delay());
            }

            predecessor = predecessor.next();
        }

        let last_before = own.revision.prev();
        if all_committed && last_before.is_real() {
            self.ledger.raise_committed_hint(last_before)?;
        }

        Ok(WaitOutcome::Ready { touched })
    }
}
