//! # Apply & Commit
//!
//! Writes the saved events of an `Executing` change into the entity graph,
//! then marks the change `SuccessExecuted`.
//!
//! | Event | Entity writes |
//! |-------|---------------|
//! | add model | model `{r, removed: false}` |
//! | remove model | delete all objects, model `{r, removed: true}` |
//! | add object | object `{r}` |
//! | remove object | delete fields, delete object |
//! | add field | field `{r, no value}` |
//! | remove field | delete field, raise object to `r` |
//! | add/change value | field `{r, slot}` |
//! | remove value | field `{r, no value}` |
//!
//! Then the model revision is raised to `r`.
//!
//! Every write either overwrites with the same content or deletes, so
//! replaying a partially applied change (roll-forward) is harmless.
//!
//! ## Ownership While Writing
//!
//! A peer may grab a change whose owner went quiet for `change_timeout`. The
//! owner therefore re-asserts ownership with a heartbeat before a write
//! whenever a quarter of the timeout has passed since the last one, and
//! stops at the first failed heartbeat. It also stops once its execution
//! budget is spent; the saved events stay behind for roll-forward.

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::ledger::{ChangeLedger, ChangeRecord};
use crate::storage::{EntityStore, FieldEntity, ModelEntity, ObjectEntity};
use crate::types::{Address, Revision};

/// A worker's claim on a change while it writes the change's events.
pub struct Lease<'a> {
    pub clock: &'a dyn Clock,
    pub owner: u64,
    /// No write starts at or after this instant.
    pub deadline_ms: u64,
    /// Heartbeat before a write once this much time passed since the last.
    pub renew_every_ms: u64,
}

fn apply_event(store: &EntityStore, revision: Revision, event: &Event) -> Result<()> {
    let target = &event.target;
    match &event.kind {
        EventKind::AddModel => store.put_model(
            target,
            &ModelEntity {
                revision,
                removed: false,
            },
        ),
        EventKind::RemoveModel => {
            store.delete_model_contents(target)?;
            store.put_model(
                target,
                &ModelEntity {
                    revision,
                    removed: true,
                },
            )
        }
        EventKind::AddObject => store.put_object(target, &ObjectEntity { revision }),
        EventKind::RemoveObject => store.delete_object(target),
        EventKind::AddField => store.put_field(
            target,
            &FieldEntity {
                revision,
                value: None,
            },
        ),
        EventKind::RemoveField => {
            store.delete_field(target)?;
            match target.object_address() {
                Some(object) => store.raise_object_revision(&object, revision),
                None => Ok(()),
            }
        }
        EventKind::AddValue(slot) | EventKind::ChangeValue(slot) => store.put_field(
            target,
            &FieldEntity {
                revision,
                value: Some(slot.clone()),
            },
        ),
        EventKind::RemoveValue => store.put_field(
            target,
            &FieldEntity {
                revision,
                value: None,
            },
        ),
    }
}

/// Writes `events` of revision `revision` into the entity graph.
pub fn apply_events(store: &EntityStore, model: &Address, revision: Revision, events: &[Event]) -> Result<()> {
    for event in events {
        apply_event(store, revision, event)?;
    }
    store.raise_model_revision(model, revision)
}

/// Applies and commits a change held under `lease`.
///
/// Returns `false` as soon as ownership is lost (a peer grabbed the change
/// for roll-forward and will finish it) or the deadline passes. Events
/// already written stay; the rest is left to whoever rolls the change
/// forward.
pub fn apply_and_commit(
    store: &EntityStore,
    ledger: &ChangeLedger,
    revision: Revision,
    events: &[Event],
    lease: &Lease<'_>,
) -> Result<bool> {
    let mut renewed_ms: Option<u64> = None;
    for (index, event) in events.iter().enumerate() {
        let now = lease.clock.now_ms();
        if now >= lease.deadline_ms {
            warn!(
                model = %ledger.model(),
                revision = %revision,
                applied = index,
                "execution budget exhausted while applying, leaving change to roll-forward"
            );
            return Ok(false);
        }
        let due = renewed_ms.map_or(true, |at| now.saturating_sub(at) >= lease.renew_every_ms);
        if due {
            if !ledger.heartbeat(revision, lease.owner, now)? {
                debug!(model = %ledger.model(), revision = %revision, applied = index, "lost ownership while applying");
                return Ok(false);
            }
            renewed_ms = Some(now);
        }
        apply_event(store, revision, event)?;
    }

    store.raise_model_revision(ledger.model(), revision)?;
    ledger.commit_executed(revision, lease.owner, lease.clock.now_ms())
}

/// Finishes a grabbed `Executing` change from its saved events.
pub fn roll_forward(
    store: &EntityStore,
    ledger: &ChangeLedger,
    record: &ChangeRecord,
    lease: &Lease<'_>,
) -> Result<bool> {
    record.verify_events()?;
    debug!(
        model = %record.model,
        revision = %record.revision,
        events = record.events.len(),
        "rolling forward"
    );
    apply_and_commit(store, ledger, record.revision, &record.events, lease)
}
