//! # Base Views
//!
//! Before evaluating a command at revision `r`, the engine needs the model
//! as it stood at `r - 1`, restricted to what the change's locks cover.
//! Two interchangeable strategies build that view.
//!
//! ```text
//!                       ┌──────────────────┐
//!   ViewContext ───────►│  ViewStrategy    │──────► ModelState (r - 1, masked)
//!   (locks, r, ...)     └────────┬─────────┘
//!                                │
//!               ┌────────────────┴────────────────┐
//!               ▼                                 ▼
//!        DirectReads                       SnapshotReplay
//!   read locked entities from      newest cached snapshot ≤ r-1
//!   the entity graph               + committed events up to r-1
//! ```
//!
//! ## Why Direct Reads Are Enough
//!
//! Once the wait protocol returns, every conflicting predecessor is
//! committed and no later change may touch what we lock (it would conflict
//! with us and wait). So the entities under our locks are exactly as of
//! `r - 1`. Anything outside the locks may be mid-flight and is either not
//! loaded or reported as [`Revision::NOT_SET`].
//!
//! ## Snapshot Replay
//!
//! Replays the ledger instead of reading entities. A replay that had to skip
//! a pending predecessor is incomplete and never cached.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::trace;

use crate::error::Result;
use crate::ledger::{ChangeLedger, ChangeStatus};
use crate::locks::LockSet;
use crate::state::{FieldState, ModelState, ObjectState};
use crate::storage::EntityStore;
use crate::types::{Address, AddressKind, Revision};

/// Everything a strategy may look at.
pub struct ViewContext<'a> {
    pub store: &'a EntityStore,
    pub ledger: &'a ChangeLedger,
    pub locks: &'a LockSet,
    /// The pending revision. The view is as of `revision - 1`.
    pub revision: Revision,
    /// Write-locked addresses of pending non-conflicting predecessors.
    pub touched: &'a [Address],
}

/// Builds the base view for one change.
pub trait ViewStrategy: Send {
    fn base_view(&mut self, ctx: &ViewContext<'_>) -> Result<ModelState>;
}

/// Hides what a partial view cannot know.
fn finish_view(mut state: ModelState, ctx: &ViewContext<'_>) -> ModelState {
    state.mask_uncovered(ctx.locks);
    for address in ctx.touched {
        state.invalidate_above(address);
    }
    state
}

// =============================================================================
// Direct Reads
// =============================================================================

/// Reads only the locked entities from the entity graph.
#[derive(Debug, Default)]
pub struct DirectReads;

impl DirectReads {
    pub fn new() -> Self {
        Self
    }

    fn read_locked(ctx: &ViewContext<'_>) -> Result<ModelState> {
        let model = ctx.ledger.model();
        if ctx.locks.covers_subtree(model) {
            return ctx.store.materialize(model);
        }

        let mut state = match ctx.store.model(model)? {
            None => return Ok(ModelState::empty(model.clone())),
            Some(entity) if entity.removed => {
                return Ok(ModelState::new(model.clone(), entity.revision, false));
            }
            Some(entity) => ModelState::new(model.clone(), entity.revision, true),
        };

        // BTreeMap order puts every object lock before the locks of its fields.
        for lock in ctx.locks.iter() {
            let address = &lock.address;
            match address.kind() {
                AddressKind::Repository | AddressKind::Model => {}
                AddressKind::Object => {
                    let Some(id) = address.object_id() else { continue };
                    let object = if ctx.locks.covers_subtree(address) {
                        ctx.store.load_object(address)?
                    } else {
                        ctx.store.object(address)?.map(|e| ObjectState::new(e.revision))
                    };
                    if let Some(object) = object {
                        state.objects.insert(id.clone(), object);
                    }
                }
                AddressKind::Field => {
                    let (Some(object_id), Some(field_id), Some(object_address)) =
                        (address.object_id(), address.field_id(), address.object_address())
                    else {
                        continue;
                    };
                    if !state.objects.contains_key(object_id) {
                        match ctx.store.object(&object_address)? {
                            Some(entity) => {
                                state
                                    .objects
                                    .insert(object_id.clone(), ObjectState::new(entity.revision));
                            }
                            None => continue,
                        }
                    }
                    let Some(field) = ctx.store.field(address)? else { continue };
                    let value = field
                        .value
                        .as_ref()
                        .map(|slot| ctx.store.load_value(slot))
                        .transpose()?;
                    if let Some(object) = state.objects.get_mut(object_id) {
                        object
                            .fields
                            .insert(field_id.clone(), FieldState::new(field.revision, value));
                    }
                }
            }
        }

        Ok(state)
    }
}

impl ViewStrategy for DirectReads {
    fn base_view(&mut self, ctx: &ViewContext<'_>) -> Result<ModelState> {
        let state = Self::read_locked(ctx)?;
        Ok(finish_view(state, ctx))
    }
}

// =============================================================================
// Snapshot Replay
// =============================================================================

/// Replays committed events on top of cached complete snapshots.
///
/// # Rust Pattern: Cache Keyed by (Model, Revision)
///
/// Several snapshots of one model may be cached at once; the newest one at
/// or below the requested revision is the replay start. `LruCache::iter`
/// does not promote entries, only the final `get` does.
pub struct SnapshotReplay {
    cache: LruCache<(Address, Revision), ModelState>,
}

impl SnapshotReplay {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    pub fn cached_snapshots(&self) -> usize {
        self.cache.len()
    }

    /// Newest cached snapshot of `model` at or below `target`, with the
    /// revision it was cached at.
    fn start_point(&mut self, model: &Address, target: Revision) -> (Revision, ModelState) {
        let best = self
            .cache
            .iter()
            .filter(|((cached_model, revision), _)| cached_model == model && *revision <= target)
            .map(|((_, revision), _)| *revision)
            .max();

        best.and_then(|revision| {
            self.cache
                .get(&(model.clone(), revision))
                .map(|state| (revision, state.clone()))
        })
        .unwrap_or_else(|| (Revision::NOT_EXISTING, ModelState::empty(model.clone())))
    }
}

impl ViewStrategy for SnapshotReplay {
    fn base_view(&mut self, ctx: &ViewContext<'_>) -> Result<ModelState> {
        let model = ctx.ledger.model().clone();
        let target = ctx.revision.prev();
        // The snapshot's own revision lags behind the ledger position when
        // trailing changes were no-ops, so the position is tracked separately.
        let (mut replayed, mut state) = self.start_point(&model, target);

        let mut complete = true;
        let mut pending_writes: Vec<Address> = Vec::new();

        while replayed < target {
            let next = replayed.next();
            let record = ctx.ledger.load_existing(next)?;
            match record.status {
                ChangeStatus::SuccessExecuted => {
                    record.verify_events()?;
                    for event in &record.events {
                        state.apply_event(event, &mut |slot| ctx.store.load_value(slot))?;
                    }
                }
                status if status.is_committed() => {}
                _ => {
                    complete = false;
                    pending_writes.extend(record.locks.write_addresses().cloned());
                }
            }
            replayed = next;
        }

        if complete && target.is_real() {
            trace!(model = %model, revision = %target, "caching snapshot");
            self.cache.put((model, target), state.clone());
        }

        let mut state = finish_view(state, ctx);
        for address in &pending_writes {
            state.invalidate_above(address);
        }
        Ok(state)
    }
}

// =============================================================================
// Tests
// =============================================================================
