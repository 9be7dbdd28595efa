//! # Persisted Entity Graph
//!
//! Executed changes end up here: one entity per model, object and field,
//! plus one entity per out-of-line value payload.
//!
//! ## Key Layout
//!
//! ```text
//! entity/<repo>/<model>                        ModelEntity  { revision, removed }
//! entity/<repo>/<model>/<object>               ObjectEntity { revision }
//! entity/<repo>/<model>/<object>/<field>       FieldEntity  { revision, value }
//! value/<repo>/<model>/<revision>/<index>      Zstd(JSON(Value))
//! ```
//!
//! Ids cannot contain `/`, so a key prefix ending in `/` selects exactly one
//! subtree.
//!
//! ## Revisions
//!
//! Only field revisions are exact. An object entity caches an upper bound
//! that is raised when the object is created or loses a field; its effective
//! revision is `max(cached, revisions of its fields)`. This lets two workers
//! change different fields of one object without touching the same entity.
//!
//! A removed model keeps its entity as a tombstone (`removed = true`) with
//! its last revision, so a later re-add continues the same ledger.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::codec::{decode_record, decode_value_payload, encode_record, encode_value_payload};
use crate::error::{Error, Result};
use crate::event::{ValueRef, ValueSlot};
use crate::locks::LockSet;
use crate::state::{FieldState, ModelState, ObjectState};
use crate::types::{Address, AddressKind, Id, Revision, Value};

// =============================================================================
// Entity Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntity {
    pub revision: Revision,
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntity {
    /// Upper-bound cache, see the module docs.
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntity {
    pub revision: Revision,
    pub value: Option<ValueSlot>,
}

// =============================================================================
// Entity Store
// =============================================================================

/// Typed access to the persisted entity graph.
#[derive(Clone)]
pub struct EntityStore {
    backend: Arc<dyn Backend>,
}

fn entity_key(address: &Address) -> String {
    let mut key = format!("entity/{}", address.repository_id());
    for id in [address.model_id(), address.object_id(), address.field_id()]
        .into_iter()
        .flatten()
    {
        key.push('/');
        key.push_str(id.as_str());
    }
    key
}

fn value_key(model: &Address, revision: Revision, index: usize) -> String {
    format!(
        "value/{}/{}/{:020}/{index}",
        model.repository_id(),
        model.model_id().map_or("-", |id| id.as_str()),
        revision.as_raw()
    )
}

/// Direct children of `parent` among scanned keys.
fn child_ids(parent: &Address, keys: impl Iterator<Item = String>) -> Result<Vec<Id>> {
    let prefix = format!("{}/", entity_key(parent));
    keys.filter_map(|key| {
        let rest = key.strip_prefix(&prefix)?;
        (!rest.contains('/')).then(|| Id::new(rest))
    })
    .collect()
}

impl EntityStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    fn get<T: serde::de::DeserializeOwned>(&self, address: &Address) -> Result<Option<T>> {
        self.backend
            .get(&entity_key(address))?
            .map(|body| decode_record(&body))
            .transpose()
    }

    fn put<T: Serialize>(&self, address: &Address, entity: &T) -> Result<()> {
        self.backend.put(&entity_key(address), &encode_record(entity)?)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn model(&self, model: &Address) -> Result<Option<ModelEntity>> {
        self.get(model)
    }

    /// The cached object entity. See [`EntityStore::object_revision`] for the
    /// effective revision.
    pub fn object(&self, object: &Address) -> Result<Option<ObjectEntity>> {
        self.get(object)
    }

    pub fn field(&self, field: &Address) -> Result<Option<FieldEntity>> {
        self.get(field)
    }

    /// Ids of the objects of a model.
    pub fn object_ids(&self, model: &Address) -> Result<Vec<Id>> {
        let prefix = format!("{}/", entity_key(model));
        let keys = self.backend.scan_prefix(&prefix)?.into_iter().map(|(k, _)| k);
        child_ids(model, keys)
    }

    /// All fields of an object.
    pub fn fields(&self, object: &Address) -> Result<Vec<(Id, FieldEntity)>> {
        let prefix = format!("{}/", entity_key(object));
        self.backend
            .scan_prefix(&prefix)?
            .into_iter()
            .filter_map(|(key, body)| {
                let id = key.strip_prefix(&prefix)?.to_string();
                Some((id, body))
            })
            .map(|(id, body)| Ok((Id::new(id)?, decode_record(&body)?)))
            .collect()
    }

    /// Effective object revision: `max(cached, field revisions)`, or
    /// `NOT_EXISTING` if the object is missing.
    pub fn object_revision(&self, object: &Address) -> Result<Revision> {
        let Some(entity) = self.object(object)? else {
            return Ok(Revision::NOT_EXISTING);
        };
        let fields = self.fields(object)?;
        Ok(fields
            .iter()
            .map(|(_, field)| field.revision)
            .fold(entity.revision, Revision::max))
    }

    /// Revision of any entity, as far as `locks` allow computing it.
    ///
    /// | Address | Result |
    /// |---------|--------|
    /// | model / object without a covering write lock | `NOT_SET` |
    /// | missing entity | `NOT_EXISTING` |
    /// | field of a missing object | `NO_PARENT` |
    pub fn revision_of(&self, address: &Address, locks: &LockSet) -> Result<Revision> {
        match address.kind() {
            AddressKind::Repository => Ok(Revision::UNDEFINED),
            AddressKind::Model | AddressKind::Object if !locks.covers_subtree(address) => {
                Ok(Revision::NOT_SET)
            }
            AddressKind::Model => Ok(match self.model(address)? {
                Some(entity) if !entity.removed => entity.revision,
                _ => Revision::NOT_EXISTING,
            }),
            AddressKind::Object => self.object_revision(address),
            AddressKind::Field => {
                let parent = address.object_address().ok_or_else(|| Error::InvalidAddress {
                    address: address.to_string(),
                    reason: "field without object".into(),
                })?;
                if self.object(&parent)?.is_none() {
                    return Ok(Revision::NO_PARENT);
                }
                Ok(self
                    .field(address)?
                    .map_or(Revision::NOT_EXISTING, |f| f.revision))
            }
        }
    }

    // =========================================================================
    // Values
    // =========================================================================

    /// Stores a value payload out of line and returns its reference.
    pub fn store_value(
        &self,
        model: &Address,
        revision: Revision,
        index: usize,
        value: &Value,
    ) -> Result<ValueRef> {
        let encoded = encode_value_payload(value)?;
        self.backend
            .put(&value_key(model, revision, index), &encoded.bytes)?;
        Ok(ValueRef {
            model: model.clone(),
            revision,
            index,
            checksum: encoded.checksum,
        })
    }

    /// Resolves a value slot, loading out-of-line payloads.
    pub fn load_value(&self, slot: &ValueSlot) -> Result<Value> {
        match slot {
            ValueSlot::Inline(value) => Ok(value.clone()),
            ValueSlot::External(reference) => {
                let key = value_key(&reference.model, reference.revision, reference.index);
                let bytes = self.backend.get(&key)?.ok_or_else(|| {
                    Error::Corrupted(format!("missing value payload {key}"))
                })?;
                decode_value_payload(&bytes, reference.checksum)
            }
        }
    }

    // =========================================================================
    // Writes (used by apply)
    // =========================================================================

    pub fn put_model(&self, model: &Address, entity: &ModelEntity) -> Result<()> {
        self.put(model, entity)
    }

    pub fn put_object(&self, object: &Address, entity: &ObjectEntity) -> Result<()> {
        self.put(object, entity)
    }

    pub fn put_field(&self, field: &Address, entity: &FieldEntity) -> Result<()> {
        self.put(field, entity)
    }

    pub fn delete_field(&self, field: &Address) -> Result<()> {
        self.backend.delete(&entity_key(field))
    }

    /// Deletes an object and its fields. Fields go first so a crash midway
    /// never leaves fields without their object.
    pub fn delete_object(&self, object: &Address) -> Result<()> {
        let prefix = format!("{}/", entity_key(object));
        for (key, _) in self.backend.scan_prefix(&prefix)? {
            self.backend.delete(&key)?;
        }
        self.backend.delete(&entity_key(object))
    }

    /// Deletes every object of a model, leaving the model entity alone.
    pub fn delete_model_contents(&self, model: &Address) -> Result<()> {
        for id in self.object_ids(model)? {
            if let Some(object) = model.child_id(&id) {
                self.delete_object(&object)?;
            }
        }
        Ok(())
    }

    /// Raises a cached object revision to at least `revision`. A missing
    /// object is left missing.
    pub fn raise_object_revision(&self, object: &Address, revision: Revision) -> Result<()> {
        self.backend.update(&entity_key(object), &mut |body| {
            let Some(body) = body else {
                return Ok(None);
            };
            let mut entity: ObjectEntity = decode_record(body)?;
            if entity.revision >= revision {
                return Ok(None);
            }
            entity.revision = revision;
            Ok(Some(encode_record(&entity)?))
        })?;
        Ok(())
    }

    /// Raises the model revision to at least `revision`, keeping the
    /// removed flag.
    pub fn raise_model_revision(&self, model: &Address, revision: Revision) -> Result<()> {
        self.backend.update(&entity_key(model), &mut |body| {
            let Some(body) = body else {
                return Ok(None);
            };
            let mut entity: ModelEntity = decode_record(body)?;
            if entity.revision >= revision {
                return Ok(None);
            }
            entity.revision = revision;
            Ok(Some(encode_record(&entity)?))
        })?;
        Ok(())
    }

    // =========================================================================
    // Materialization
    // =========================================================================

    /// Loads one object with all its fields and values.
    pub fn load_object(&self, object: &Address) -> Result<Option<ObjectState>> {
        let Some(entity) = self.object(object)? else {
            return Ok(None);
        };
        let mut state = ObjectState::new(entity.revision);
        for (id, field) in self.fields(object)? {
            let value = field
                .value
                .as_ref()
                .map(|slot| self.load_value(slot))
                .transpose()?;
            state.revision = state.revision.max(field.revision);
            state.fields.insert(id, FieldState::new(field.revision, value));
        }
        Ok(Some(state))
    }

    /// Reads the complete current state of a model.
    pub fn materialize(&self, model: &Address) -> Result<ModelState> {
        let state = match self.model(model)? {
            None => ModelState::empty(model.clone()),
            Some(entity) if entity.removed => {
                ModelState::new(model.clone(), entity.revision, false)
            }
            Some(entity) => {
                let mut state = ModelState::new(model.clone(), entity.revision, true);
                for id in self.object_ids(model)? {
                    let Some(object) = model.child_id(&id) else {
                        continue;
                    };
                    if let Some(object_state) = self.load_object(&object)? {
                        state.objects.insert(id, object_state);
                    }
                }
                state
            }
        };
        Ok(state)
    }
}
