//! # Events
//!
//! An event is an immutable fact about one already-applied atomic change,
//! stamped with the model revision it belongs to and the acting identity.
//!
//! ## Ordering Within a Change
//!
//! One change (one revision) may carry many events. They are always stored
//! and applied in this order:
//!
//! ```text
//!   1. removals     field → object → model   (children before parents)
//!   2. additions    model → object → field   (parents before children)
//!   3. value events add / change / remove value
//! ```
//!
//! Within each group, events are sorted by address. [`sort_events`] is the
//! only place that decides this order.

use serde::{Deserialize, Serialize};

use crate::types::{ActorId, Address, Revision, Value};

// =============================================================================
// Value Slots
// =============================================================================

/// Where an out-of-line value payload lives.
///
/// There is one payload entity per (model, revision, event index).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRef {
    pub model: Address,
    pub revision: Revision,
    pub index: usize,
    /// xxh3-64 of the stored (compressed) payload.
    pub checksum: u64,
}

/// A field value as carried by events and field entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueSlot {
    Inline(Value),
    External(ValueRef),
}

impl ValueSlot {
    /// The value if it is stored inline.
    pub fn inline(&self) -> Option<&Value> {
        match self {
            ValueSlot::Inline(value) => Some(value),
            ValueSlot::External(_) => None,
        }
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    AddModel,
    RemoveModel,
    AddObject,
    RemoveObject,
    AddField,
    RemoveField,
    AddValue(ValueSlot),
    ChangeValue(ValueSlot),
    RemoveValue,
}

/// The three groups events are ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPhase {
    Removal,
    Addition,
    Value,
}

/// One applied atomic change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// The model, object or field the event is about.
    pub target: Address,
    /// The model revision this event belongs to.
    pub revision: Revision,
    /// The entity's revision before the change, `NOT_EXISTING` for additions.
    pub old_revision: Revision,
    pub actor: ActorId,
    /// Set when the change carried more than one event.
    pub in_transaction: bool,
}

impl Event {
    pub fn phase(&self) -> EventPhase {
        match self.kind {
            EventKind::RemoveModel | EventKind::RemoveObject | EventKind::RemoveField => {
                EventPhase::Removal
            }
            EventKind::AddModel | EventKind::AddObject | EventKind::AddField => {
                EventPhase::Addition
            }
            EventKind::AddValue(_) | EventKind::ChangeValue(_) | EventKind::RemoveValue => {
                EventPhase::Value
            }
        }
    }

    /// The value slot of an add/change value event.
    pub fn value_slot(&self) -> Option<&ValueSlot> {
        match &self.kind {
            EventKind::AddValue(slot) | EventKind::ChangeValue(slot) => Some(slot),
            _ => None,
        }
    }

    pub(crate) fn value_slot_mut(&mut self) -> Option<&mut ValueSlot> {
        match &mut self.kind {
            EventKind::AddValue(slot) | EventKind::ChangeValue(slot) => Some(slot),
            _ => None,
        }
    }

    fn sort_key(&self) -> (EventPhase, usize, &Address) {
        let depth = self.target.kind().depth();
        let rank = match self.phase() {
            // Deepest first.
            EventPhase::Removal => 3 - depth,
            EventPhase::Addition => depth,
            EventPhase::Value => 0,
        };
        (self.phase(), rank, &self.target)
    }
}

/// Puts the events of one change into their canonical order.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}
