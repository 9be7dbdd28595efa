//! # In-Memory Model State
//!
//! [`ModelState`] is a read-only tree of one model's objects, fields and
//! values, with revisions. It is what [`Engine::snapshot`] hands out, what the
//! base-view strategies build for a change, and what the delta evaluator
//! works on.
//!
//! ```text
//! ModelState  /repo/phonebook   rev 12, exists
//!   ├── john      ObjectState   rev 12
//!   │     ├── phone   FieldState rev 12  "555-1234"
//!   │     └── email   FieldState rev 9   (no value)
//!   └── mary      ObjectState   rev 4
//! ```
//!
//! ## Partial Views
//!
//! A base view only contains the entities the change's locks cover, and
//! aggregate revisions (object, model) the locks don't cover are
//! [`Revision::NOT_SET`]. Snapshots handed to callers are complete.
//!
//! [`Engine::snapshot`]: crate::engine::Engine::snapshot

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind, ValueSlot};
use crate::locks::LockSet;
use crate::types::{Address, AddressKind, Id, Revision, Value};

// =============================================================================
// Field / Object State
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FieldState {
    pub(crate) revision: Revision,
    pub(crate) value: Option<Value>,
}

impl FieldState {
    pub fn new(revision: Revision, value: Option<Value>) -> Self {
        Self { revision, value }
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectState {
    pub(crate) revision: Revision,
    pub(crate) fields: BTreeMap<Id, FieldState>,
}

impl ObjectState {
    pub fn new(revision: Revision) -> Self {
        Self {
            revision,
            fields: BTreeMap::new(),
        }
    }

    /// The object's revision, or `NOT_SET` in a view without a write lock on it.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn field(&self, id: &Id) -> Option<&FieldState> {
        self.fields.get(id)
    }

    pub fn has_field(&self, id: &Id) -> bool {
        self.fields.contains_key(id)
    }

    pub fn field_ids(&self) -> impl Iterator<Item = &Id> + '_ {
        self.fields.keys()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&Id, &FieldState)> + '_ {
        self.fields.iter()
    }
}

// =============================================================================
// Model State
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ModelState {
    address: Address,
    pub(crate) revision: Revision,
    pub(crate) exists: bool,
    pub(crate) objects: BTreeMap<Id, ObjectState>,
}

impl ModelState {
    /// A model that has never existed.
    pub fn empty(address: Address) -> Self {
        Self::new(address, Revision::NOT_EXISTING, false)
    }

    pub fn new(address: Address, revision: Revision, exists: bool) -> Self {
        Self {
            address,
            revision,
            exists,
            objects: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The model revision. A removed model keeps its last revision.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn object(&self, id: &Id) -> Option<&ObjectState> {
        self.objects.get(id)
    }

    pub fn object_ids(&self) -> impl Iterator<Item = &Id> + '_ {
        self.objects.keys()
    }

    pub fn objects(&self) -> impl Iterator<Item = (&Id, &ObjectState)> + '_ {
        self.objects.iter()
    }

    /// Looks up the object an address points at or into.
    pub fn object_at(&self, address: &Address) -> Option<&ObjectState> {
        self.objects.get(address.object_id()?)
    }

    pub fn field_at(&self, address: &Address) -> Option<&FieldState> {
        self.object_at(address)?.fields.get(address.field_id()?)
    }

    pub fn value_at(&self, address: &Address) -> Option<&Value> {
        self.field_at(address)?.value.as_ref()
    }

    /// True if the entity at `address` exists in this state.
    pub fn contains(&self, address: &Address) -> bool {
        if address.model_address().as_ref() != Some(&self.address) || !self.exists {
            return false;
        }
        match address.kind() {
            AddressKind::Repository => false,
            AddressKind::Model => true,
            AddressKind::Object => self.object_at(address).is_some(),
            AddressKind::Field => self.field_at(address).is_some(),
        }
    }

    /// Revision of the entity at `address`.
    ///
    /// `NOT_EXISTING` for a missing entity, `NO_PARENT` for a field whose
    /// object is missing.
    pub fn revision_of(&self, address: &Address) -> Revision {
        match address.kind() {
            AddressKind::Repository => Revision::UNDEFINED,
            AddressKind::Model if self.exists => self.revision,
            AddressKind::Model => Revision::NOT_EXISTING,
            AddressKind::Object => self
                .object_at(address)
                .map_or(Revision::NOT_EXISTING, |o| o.revision),
            AddressKind::Field => match self.object_at(address) {
                None => Revision::NO_PARENT,
                Some(object) => address
                    .field_id()
                    .and_then(|id| object.fields.get(id))
                    .map_or(Revision::NOT_EXISTING, |f| f.revision),
            },
        }
    }

    /// Every existing entity with its value, ignoring revisions.
    ///
    /// Two states with equal entries hold the same data.
    pub fn entries(&self) -> Vec<(Address, Option<Value>)> {
        let mut entries = Vec::new();
        if !self.exists {
            return entries;
        }
        entries.push((self.address.clone(), None));
        for (object_id, object) in &self.objects {
            let Some(object_address) = self.address.child_id(object_id) else {
                continue;
            };
            entries.push((object_address.clone(), None));
            for (field_id, field) in &object.fields {
                if let Some(field_address) = object_address.child_id(field_id) {
                    entries.push((field_address, field.value.clone()));
                }
            }
        }
        entries
    }

    // =========================================================================
    // Event Application
    // =========================================================================

    /// Applies one event, resolving out-of-line values through `resolve`.
    ///
    /// Revisions follow the persisted rules: the model and the enclosing
    /// object take the event's revision, added or changed entities carry it.
    pub fn apply_event(
        &mut self,
        event: &Event,
        resolve: &mut dyn FnMut(&ValueSlot) -> Result<Value>,
    ) -> Result<()> {
        let r = event.revision;
        let target = &event.target;

        match &event.kind {
            EventKind::AddModel => {
                self.exists = true;
                self.objects.clear();
            }
            EventKind::RemoveModel => {
                self.exists = false;
                self.objects.clear();
            }
            EventKind::AddObject => {
                self.objects.insert(Self::object_id(target)?, ObjectState::new(r));
            }
            EventKind::RemoveObject => {
                self.objects.remove(&Self::object_id(target)?);
            }
            EventKind::AddField => {
                let object = self.object_mut(target)?;
                object.revision = r;
                object
                    .fields
                    .insert(Self::field_id(target)?, FieldState::new(r, None));
            }
            EventKind::RemoveField => {
                let object = self.object_mut(target)?;
                object.revision = r;
                object.fields.remove(&Self::field_id(target)?);
            }
            EventKind::AddValue(slot) | EventKind::ChangeValue(slot) => {
                let value = resolve(slot)?;
                let field = self.field_mut(target, r)?;
                field.revision = r;
                field.value = Some(value);
            }
            EventKind::RemoveValue => {
                let field = self.field_mut(target, r)?;
                field.revision = r;
                field.value = None;
            }
        }

        self.revision = r;
        Ok(())
    }

    /// Applies events whose values are all inline.
    pub fn apply_inline_events(&mut self, events: &[Event]) -> Result<()> {
        for event in events {
            self.apply_event(event, &mut |slot| {
                slot.inline().cloned().ok_or_else(|| {
                    Error::Corrupted("out-of-line value without a resolver".into())
                })
            })?;
        }
        Ok(())
    }

    fn object_id(target: &Address) -> Result<Id> {
        target
            .object_id()
            .cloned()
            .ok_or_else(|| Error::Corrupted(format!("object event on {target}")))
    }

    fn field_id(target: &Address) -> Result<Id> {
        target
            .field_id()
            .cloned()
            .ok_or_else(|| Error::Corrupted(format!("field event on {target}")))
    }

    fn object_mut(&mut self, target: &Address) -> Result<&mut ObjectState> {
        let id = Self::object_id(target)?;
        self.objects
            .get_mut(&id)
            .ok_or_else(|| Error::Corrupted(format!("event on {target} without its object")))
    }

    /// The field at `target`, with its object's revision raised to `r`.
    fn field_mut(&mut self, target: &Address, r: Revision) -> Result<&mut FieldState> {
        let field_id = Self::field_id(target)?;
        let object = self.object_mut(target)?;
        object.revision = r;
        object
            .fields
            .get_mut(&field_id)
            .ok_or_else(|| Error::Corrupted(format!("value event on missing field {target}")))
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Replaces aggregate revisions the locks don't cover with `NOT_SET`.
    pub(crate) fn mask_uncovered(&mut self, locks: &LockSet) {
        if !locks.covers_subtree(&self.address) {
            self.revision = Revision::NOT_SET;
        }
        let address = self.address.clone();
        for (id, object) in self.objects.iter_mut() {
            let covered = address
                .child_id(id)
                .is_some_and(|object_address| locks.covers_subtree(&object_address));
            if !covered {
                object.revision = Revision::NOT_SET;
            }
        }
    }

    /// Marks the aggregates above `touched` as unknown.
    pub(crate) fn invalidate_above(&mut self, touched: &Address) {
        if touched.kind() == AddressKind::Model {
            return;
        }
        self.revision = Revision::NOT_SET;
        if touched.kind() == AddressKind::Field {
            if let Some(object) = touched.object_id().and_then(|id| self.objects.get_mut(id)) {
                object.revision = Revision::NOT_SET;
            }
        }
    }
}
