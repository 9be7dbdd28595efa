//! # Lock Sets and Conflict Detection
//!
//! Locks are never *held*. A change publishes its lock set in its change
//! record at reserve time, and later changes read those sets to decide whom
//! to wait for. The conflict predicate here is the sole basis for every
//! serialization decision in the engine.
//!
//! ## Lock Computation
//!
//! For each atomic command in a command or transaction:
//!
//! - **write** the target (the entity created, removed or changed)
//! - **read** every strict ancestor of the target down to the model
//!
//! The repository is never locked: the model ledger is the ordering scope.
//! Preconditions only inspect the target and its ancestors, so these reads
//! also cover everything a precondition looks at.
//!
//! ## Conflicts
//!
//! ```text
//!                 other: Read(B)           other: Write(B)
//! Read(A)         never                    A, B comparable
//! Write(A)        A, B comparable          A, B comparable
//! ```
//!
//! Comparable means equal, or one contains the other. Every lock set of a
//! model reads or writes the model itself, so two changes of one model
//! always conflict and commit in revision order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::types::{Address, AddressKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub address: Address,
    pub mode: LockMode,
}

impl Lock {
    pub fn read(address: Address) -> Self {
        Self {
            address,
            mode: LockMode::Read,
        }
    }

    pub fn write(address: Address) -> Self {
        Self {
            address,
            mode: LockMode::Write,
        }
    }

    /// The pairwise conflict predicate. Symmetric.
    pub fn conflicts_with(&self, other: &Lock) -> bool {
        match (self.mode, other.mode) {
            (LockMode::Read, LockMode::Read) => false,
            _ => self.address.is_comparable(&other.address),
        }
    }
}

/// A deduplicated set of locks.
///
/// Locking an address for write replaces an existing read lock on it; a read
/// lock never downgrades a write lock.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Lock>", into = "Vec<Lock>")]
pub struct LockSet {
    locks: BTreeMap<Address, LockMode>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the minimal lock set for a command or transaction.
    pub fn for_command(command: &Command) -> Self {
        let mut set = Self::new();
        for atomic in command.commands() {
            set.add_write_with_ancestors(atomic.target());
        }
        set
    }

    pub fn add_read(&mut self, address: Address) {
        self.locks.entry(address).or_insert(LockMode::Read);
    }

    pub fn add_write(&mut self, address: Address) {
        self.locks.insert(address, LockMode::Write);
    }

    fn add_write_with_ancestors(&mut self, target: &Address) {
        self.add_write(target.clone());
        let mut ancestor = target.parent();
        while let Some(address) = ancestor {
            if address.kind() == AddressKind::Repository {
                break;
            }
            ancestor = address.parent();
            self.add_read(address);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Lock> + '_ {
        self.locks.iter().map(|(address, mode)| Lock {
            address: address.clone(),
            mode: *mode,
        })
    }

    /// Addresses locked for write, in tree order.
    pub fn write_addresses(&self) -> impl Iterator<Item = &Address> + '_ {
        self.locks
            .iter()
            .filter(|(_, mode)| **mode == LockMode::Write)
            .map(|(address, _)| address)
    }

    pub fn mode(&self, address: &Address) -> Option<LockMode> {
        self.locks.get(address).copied()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// True if any lock of `self` conflicts with any lock of `other`.
    pub fn conflicts_with(&self, other: &LockSet) -> bool {
        self.iter()
            .any(|mine| other.iter().any(|theirs| mine.conflicts_with(&theirs)))
    }

    /// The holder may read the entity at `address` itself.
    pub fn can_read(&self, address: &Address) -> bool {
        self.locks.contains_key(address) || self.can_write(address)
    }

    /// The holder may create, remove or change the entity at `address`.
    pub fn can_write(&self, address: &Address) -> bool {
        self.write_addresses()
            .any(|locked| locked.equals_or_contains(address))
    }

    /// Nobody else can change anything at or below `address`, so aggregate
    /// revisions over that subtree may be computed.
    pub fn covers_subtree(&self, address: &Address) -> bool {
        self.can_write(address)
    }
}

impl From<Vec<Lock>> for LockSet {
    fn from(locks: Vec<Lock>) -> Self {
        let mut set = Self::new();
        for lock in locks {
            match lock.mode {
                LockMode::Read => set.add_read(lock.address),
                LockMode::Write => set.add_write(lock.address),
            }
        }
        set
    }
}

impl From<LockSet> for Vec<Lock> {
    fn from(set: LockSet) -> Self {
        set.iter().collect()
    }
}
