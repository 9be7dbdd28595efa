//! # The Change Ledger
//!
//! Every model has an append-only ledger of change records, one per reserved
//! revision. The ledger is the only coordination state between workers.
//!
//! ## Key Layout
//!
//! ```text
//! change/<repo>/<model>/<revision, 20 digits>   ChangeRecord
//! ledger/<repo>/<model>                         LedgerHints
//! ```
//!
//! Revisions are zero-padded so a prefix scan returns records in revision
//! order.
//!
//! ## Status State Machine
//!
//! ```text
//!                 ┌──────────────► SuccessNochange      (T)
//!                 ├──────────────► FailedPreconditions  (T)
//!   Creating ─────┼──────────────► FailedTimeout        (T)
//!       │         │                      ▲
//!       ▼         │                      │
//!   Executing ────┴──► SuccessExecuted   │  (T)
//!       └────────────────────────────────┘
//! ```
//!
//! A record in `Executing` has its events durably saved; anyone may finish
//! applying them (roll-forward). A record in `Creating` whose worker went
//! silent can only be failed.
//!
//! ## Atomicity
//!
//! Reserve is `insert_if_absent` on the next free revision: the single
//! linearizable step of the whole protocol. Every status change is a
//! single-key `update` that re-checks the expected state inside the atomic
//! section, so two workers racing on one record never both win.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::Backend;
use crate::codec::{decode_record, encode_record, events_checksum};
use crate::error::{Error, Result};
use crate::event::{Event, ValueRef};
use crate::locks::LockSet;
use crate::types::{ActorId, Address, Revision};

// =============================================================================
// Change Status
// =============================================================================

/// Where a change record is in its lifecycle. Persisted as its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ChangeStatus {
    Creating = 0,
    Executing = 1,
    SuccessExecuted = 2,
    SuccessNochange = 3,
    FailedPreconditions = 4,
    FailedTimeout = 5,
}

impl ChangeStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChangeStatus::Creating),
            1 => Some(ChangeStatus::Executing),
            2 => Some(ChangeStatus::SuccessExecuted),
            3 => Some(ChangeStatus::SuccessNochange),
            4 => Some(ChangeStatus::FailedPreconditions),
            5 => Some(ChangeStatus::FailedTimeout),
            _ => None,
        }
    }

    /// Terminal: nothing will ever happen to this change again.
    pub fn is_committed(self) -> bool {
        !matches!(self, ChangeStatus::Creating | ChangeStatus::Executing)
    }

    /// Events are saved but not known to be applied.
    pub fn can_roll_forward(self) -> bool {
        self == ChangeStatus::Executing
    }

    pub fn can_transition_to(self, next: ChangeStatus) -> bool {
        use ChangeStatus::*;
        matches!(
            (self, next),
            (Creating, Executing)
                | (Creating, SuccessNochange)
                | (Creating, FailedPreconditions)
                | (Creating, FailedTimeout)
                | (Executing, SuccessExecuted)
                | (Executing, FailedTimeout)
        )
    }
}

impl From<ChangeStatus> for u8 {
    fn from(status: ChangeStatus) -> Self {
        status.code()
    }
}

impl TryFrom<u8> for ChangeStatus {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown change status code {code}"))
    }
}

// =============================================================================
// Change Record
// =============================================================================

/// One entry of a model's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub model: Address,
    pub revision: Revision,
    pub status: ChangeStatus,
    pub locks: LockSet,
    pub actor: ActorId,
    /// Token of the worker currently responsible for the change. A
    /// roll-forward grab replaces it.
    pub owner: u64,
    pub last_activity_ms: u64,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub value_refs: Vec<ValueRef>,
    #[serde(default)]
    pub events_checksum: Option<u64>,
}

impl ChangeRecord {
    /// True if nobody has touched the record for longer than `timeout_ms`.
    pub fn is_timed_out(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity_ms) > timeout_ms
    }

    /// Checks the saved events against their checksum.
    pub fn verify_events(&self) -> Result<()> {
        let Some(expected) = self.events_checksum else {
            return Err(Error::Corrupted(format!(
                "change {} at revision {} has no event checksum",
                self.model, self.revision
            )));
        };
        let actual = events_checksum(&self.events)?;
        if actual != expected {
            return Err(Error::Corrupted(format!(
                "event checksum mismatch for {} at revision {}",
                self.model, self.revision
            )));
        }
        Ok(())
    }
}

/// Advisory per-model counters. Never ahead of the records they describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHints {
    /// Some revision at or below the last reserved one.
    pub last_reserved: Revision,
    /// Every revision at or below this one is committed.
    pub last_committed: Revision,
}

impl Default for LedgerHints {
    fn default() -> Self {
        Self {
            last_reserved: Revision::NOT_EXISTING,
            last_committed: Revision::NOT_EXISTING,
        }
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// The change ledger of one model.
#[derive(Clone)]
pub struct ChangeLedger {
    backend: Arc<dyn Backend>,
    model: Address,
    prefix: String,
}

impl ChangeLedger {
    pub fn new(backend: Arc<dyn Backend>, model: Address) -> Self {
        let prefix = format!(
            "change/{}/{}/",
            model.repository_id(),
            model.model_id().map_or("-", |id| id.as_str())
        );
        Self {
            backend,
            model,
            prefix,
        }
    }

    pub fn model(&self) -> &Address {
        &self.model
    }

    fn change_key(&self, revision: Revision) -> String {
        format!("{}{:020}", self.prefix, revision.as_raw())
    }

    fn hints_key(&self) -> String {
        format!(
            "ledger/{}/{}",
            self.model.repository_id(),
            self.model.model_id().map_or("-", |id| id.as_str())
        )
    }

    // =========================================================================
    // Reserve
    // =========================================================================

    /// Claims the next free revision and publishes a `Creating` record.
    ///
    /// # Algorithm
    ///
    /// 1. Read the last-reserved hint `h`
    /// 2. Try `insert_if_absent(change(r))` for `r = h+1, h+2, ...`
    /// 3. Raise the hint to the revision that stuck
    ///
    /// The hint may lag behind the real ledger head; it only saves attempts.
    pub fn reserve(
        &self,
        locks: LockSet,
        actor: &ActorId,
        owner: u64,
        now_ms: u64,
    ) -> Result<ChangeRecord> {
        let mut revision = self.hints()?.last_reserved.next();
        let mut record = ChangeRecord {
            model: self.model.clone(),
            revision,
            status: ChangeStatus::Creating,
            locks,
            actor: actor.clone(),
            owner,
            last_activity_ms: now_ms,
            events: Vec::new(),
            value_refs: Vec::new(),
            events_checksum: None,
        };

        loop {
            record.revision = revision;
            let body = encode_record(&record)?;
            if self
                .backend
                .insert_if_absent(&self.change_key(revision), &body)?
            {
                break;
            }
            revision = revision.next();
        }

        self.raise_hints(|hints| {
            if hints.last_reserved < revision {
                hints.last_reserved = revision;
                true
            } else {
                false
            }
        })?;

        debug!(model = %self.model, revision = %revision, actor = %actor, "reserved revision");
        Ok(record)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn load(&self, revision: Revision) -> Result<Option<ChangeRecord>> {
        self.backend
            .get(&self.change_key(revision))?
            .map(|body| decode_record(&body))
            .transpose()
    }

    /// Loads a record that must exist because a later one does.
    pub fn load_existing(&self, revision: Revision) -> Result<ChangeRecord> {
        self.load(revision)?.ok_or_else(|| {
            Error::Corrupted(format!(
                "gap in ledger of {} at revision {revision}",
                self.model
            ))
        })
    }

    /// All records of this ledger, in revision order.
    pub fn records(&self) -> Result<Vec<ChangeRecord>> {
        self.backend
            .scan_prefix(&self.prefix)?
            .into_iter()
            .map(|(_, body)| decode_record(&body))
            .collect()
    }

    pub fn hints(&self) -> Result<LedgerHints> {
        Ok(self
            .backend
            .get(&self.hints_key())?
            .map(|body| decode_record(&body))
            .transpose()?
            .unwrap_or_default())
    }

    pub fn last_committed_hint(&self) -> Result<Revision> {
        Ok(self.hints()?.last_committed)
    }

    /// Records that everything at or below `revision` is committed.
    pub fn raise_committed_hint(&self, revision: Revision) -> Result<()> {
        self.raise_hints(|hints| {
            if hints.last_committed < revision {
                hints.last_committed = revision;
                true
            } else {
                false
            }
        })
    }

    fn raise_hints(&self, mut raise: impl FnMut(&mut LedgerHints) -> bool) -> Result<()> {
        self.backend.update(&self.hints_key(), &mut |body| {
            let mut hints: LedgerHints = match body {
                Some(body) => decode_record(body)?,
                None => LedgerHints::default(),
            };
            if raise(&mut hints) {
                Ok(Some(encode_record(&hints)?))
            } else {
                Ok(None)
            }
        })?;
        Ok(())
    }

    /// The highest revision that has a record.
    pub fn last_reserved(&self) -> Result<Revision> {
        let mut revision = self.hints()?.last_reserved;
        while self.load(revision.next())?.is_some() {
            revision = revision.next();
        }
        Ok(revision)
    }

    /// The model revision: the last `SuccessExecuted` change of this ledger,
    /// or `NOT_EXISTING` if there is none.
    pub fn current_revision(&self) -> Result<Revision> {
        let mut revision = self.last_reserved()?;
        while revision.is_real() {
            if let Some(record) = self.load(revision)? {
                if record.status == ChangeStatus::SuccessExecuted {
                    return Ok(revision);
                }
            }
            revision = revision.prev();
        }
        Ok(Revision::NOT_EXISTING)
    }

    /// Events of executed changes after `revision`, in order.
    ///
    /// Stops at the first revision that is not yet committed, so the result
    /// is always a gap-free prefix of the history.
    pub fn events_since(&self, revision: Revision) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        let mut next = revision.next();
        while let Some(record) = self.load(next)? {
            if !record.status.is_committed() {
                break;
            }
            if record.status == ChangeStatus::SuccessExecuted {
                events.extend(record.events);
            }
            next = next.next();
        }
        Ok(events)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Atomically edits one record. `edit` returns `false` to leave it as is.
    fn modify(
        &self,
        revision: Revision,
        mut edit: impl FnMut(&mut ChangeRecord) -> Result<bool>,
    ) -> Result<Option<ChangeRecord>> {
        let mut written = None;
        self.backend.update(&self.change_key(revision), &mut |body| {
            let body = body.ok_or_else(|| {
                Error::Corrupted(format!(
                    "no change record for {} at revision {revision}",
                    self.model
                ))
            })?;
            let mut record: ChangeRecord = decode_record(body)?;
            if !edit(&mut record)? {
                return Ok(None);
            }
            let encoded = encode_record(&record)?;
            written = Some(record);
            Ok(Some(encoded))
        })?;
        Ok(written)
    }

    fn check_transition(record: &ChangeRecord, to: ChangeStatus) -> Result<()> {
        if record.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::IllegalTransition {
                revision: record.revision,
                from: record.status,
                to,
            })
        }
    }

    /// `Creating → Executing`, saving the events first.
    ///
    /// Returns `false` if the record is no longer ours (a peer failed it
    /// while we were computing).
    pub fn save_events(
        &self,
        revision: Revision,
        owner: u64,
        events: Vec<Event>,
        value_refs: Vec<ValueRef>,
        now_ms: u64,
    ) -> Result<bool> {
        let checksum = events_checksum(&events)?;
        let saved = self.modify(revision, |record| {
            if record.owner != owner || record.status == ChangeStatus::FailedTimeout {
                return Ok(false);
            }
            Self::check_transition(record, ChangeStatus::Executing)?;
            record.status = ChangeStatus::Executing;
            record.events = events.clone();
            record.value_refs = value_refs.clone();
            record.events_checksum = Some(checksum);
            record.last_activity_ms = now_ms;
            Ok(true)
        })?;
        Ok(saved.is_some())
    }

    /// Moves a `Creating` record to a terminal status.
    ///
    /// Returns `false` if a peer already failed it.
    pub fn finish(
        &self,
        revision: Revision,
        owner: u64,
        to: ChangeStatus,
        now_ms: u64,
    ) -> Result<bool> {
        let finished = self.modify(revision, |record| {
            if record.owner != owner || record.status == ChangeStatus::FailedTimeout {
                return Ok(false);
            }
            if !to.is_committed() {
                return Err(Error::IllegalTransition {
                    revision: record.revision,
                    from: record.status,
                    to,
                });
            }
            Self::check_transition(record, to)?;
            record.status = to;
            record.last_activity_ms = now_ms;
            Ok(true)
        })?;

        if finished.is_some() {
            debug!(model = %self.model, revision = %revision, status = ?to, "change finished");
        }
        Ok(finished.is_some())
    }

    /// `Executing → SuccessExecuted`.
    ///
    /// Returns `false` if the change was already committed or another worker
    /// has grabbed it.
    pub fn commit_executed(&self, revision: Revision, owner: u64, now_ms: u64) -> Result<bool> {
        let committed = self.modify(revision, |record| {
            if record.owner != owner || record.status == ChangeStatus::SuccessExecuted {
                return Ok(false);
            }
            Self::check_transition(record, ChangeStatus::SuccessExecuted)?;
            record.status = ChangeStatus::SuccessExecuted;
            record.last_activity_ms = now_ms;
            Ok(true)
        })?;

        if committed.is_some() {
            debug!(model = %self.model, revision = %revision, "change committed");
        }
        Ok(committed.is_some())
    }

    /// Refreshes the activity timestamp of a pending record we own.
    ///
    /// Returns `false` if the record is committed or owned by someone else.
    pub fn heartbeat(&self, revision: Revision, owner: u64, now_ms: u64) -> Result<bool> {
        let touched = self.modify(revision, |record| {
            if record.owner != owner || record.status.is_committed() {
                return Ok(false);
            }
            record.last_activity_ms = now_ms;
            Ok(true)
        })?;
        Ok(touched.is_some())
    }

    /// Takes over a timed-out `Executing` record for roll-forward.
    ///
    /// The status and the timeout are re-checked inside the atomic update;
    /// exactly one of several racing workers gets `Some`.
    pub fn grab(
        &self,
        revision: Revision,
        owner: u64,
        now_ms: u64,
        timeout_ms: u64,
    ) -> Result<Option<ChangeRecord>> {
        let grabbed = self.modify(revision, |record| {
            if !record.status.can_roll_forward() || !record.is_timed_out(now_ms, timeout_ms) {
                return Ok(false);
            }
            record.owner = owner;
            record.last_activity_ms = now_ms;
            Ok(true)
        })?;

        if grabbed.is_some() {
            info!(model = %self.model, revision = %revision, "grabbed timed-out change for roll-forward");
        }
        Ok(grabbed)
    }

    /// Fails a timed-out `Creating` record on behalf of its silent worker.
    pub fn force_fail(&self, revision: Revision, now_ms: u64, timeout_ms: u64) -> Result<bool> {
        let failed = self.modify(revision, |record| {
            if record.status != ChangeStatus::Creating || !record.is_timed_out(now_ms, timeout_ms) {
                return Ok(false);
            }
            record.status = ChangeStatus::FailedTimeout;
            record.last_activity_ms = now_ms;
            Ok(true)
        })?;

        if failed.is_some() {
            info!(model = %self.model, revision = %revision, "marked stalled change as timed out");
        }
        Ok(failed.is_some())
    }
}

// =============================================================================
// Tests
// =============================================================================
