//! # Entity-Scoped Backing Store
//!
//! Workers share nothing but a [`Backend`]: a key/value store whose only
//! atomicity guarantee is per key. There are no cross-key transactions; the
//! change ledger builds serializability on top of three single-key
//! primitives:
//!
//! | Primitive | Used for |
//! |-----------|----------|
//! | [`Backend::insert_if_absent`] | reserving a revision |
//! | [`Backend::update`] | status transitions, grab, force-fail, "raise to at least r" |
//! | [`Backend::put`] / [`Backend::delete`] | applying events to entities |
//!
//! ## Implementations
//!
//! - [`MemoryBackend`]: a `BTreeMap` behind a mutex. Cloning the handle
//!   shares the map, which is how tests simulate several workers on one store.
//! - [`SqliteBackend`](crate::schema::SqliteBackend): one connection per
//!   worker to a shared database file.
//!
//! ## Rust Pattern: Trait Objects at the Seam
//!
//! The engine holds an `Arc<dyn Backend>`. Everything above this module is
//! written once and runs against either store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};

/// Closure passed to [`Backend::update`].
///
/// Receives the current body (or `None` if the key is absent) and returns the
/// new body, or `None` to leave the entity untouched.
pub type UpdateFn<'a> = dyn FnMut(Option<&[u8]>) -> Result<Option<Vec<u8>>> + 'a;

/// A store of opaque entities addressed by string keys.
pub trait Backend: Send + Sync {
    /// Reads one entity.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes one entity, replacing any previous body.
    fn put(&self, key: &str, body: &[u8]) -> Result<()>;

    /// Deletes one entity. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Writes the entity only if the key is absent.
    ///
    /// Returns `true` if this call created it.
    fn insert_if_absent(&self, key: &str, body: &[u8]) -> Result<bool>;

    /// Atomically reads, transforms and writes one entity.
    ///
    /// No other writer can change the key between the read and the write.
    /// Returns `true` if the closure produced a new body and it was written.
    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> Result<bool>;

    /// Lists every entity whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// A process-local backend.
///
/// # Example
///
/// ```rust
/// use revstore::backend::{Backend, MemoryBackend};
///
/// let store = MemoryBackend::new();
/// let worker_view = store.clone();
/// assert!(store.insert_if_absent("k", b"v").unwrap());
/// assert!(!worker_view.insert_if_absent("k", b"other").unwrap());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entities: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entities
            .lock()
            .map_err(|_| Error::Corrupted("memory backend mutex poisoned".into()))
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        self.lock()?.insert(key.to_string(), body.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn insert_if_absent(&self, key: &str, body: &[u8]) -> Result<bool> {
        let mut entities = self.lock()?;
        if entities.contains_key(key) {
            return Ok(false);
        }
        entities.insert(key.to_string(), body.to_vec());
        Ok(true)
    }

    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> Result<bool> {
        let mut entities = self.lock()?;
        let next = f(entities.get(key).map(Vec::as_slice))?;
        match next {
            Some(body) => {
                entities.insert(key.to_string(), body);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entities = self.lock()?;
        Ok(entities
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, body)| (key.clone(), body.clone()))
            .collect())
    }
}
