//! # Domain Types for RevStore
//!
//! This module defines the core types used throughout RevStore: identifiers,
//! hierarchical addresses, revisions, actors, field values and command
//! outcomes.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Every primitive that means something gets its own single-field struct:
//!
//! - **Type safety**: a [`Revision`] can't be passed where an [`ActorId`] is expected
//! - **Validation at the door**: an [`Id`] that exists is a valid id
//! - **Encapsulation**: sentinel revisions are named constants, not magic numbers
//!
//! ## The Address Hierarchy
//!
//! ```text
//!   repository                 /repo/-/-/-
//!     └── model                /repo/phonebook/-/-
//!           └── object         /repo/phonebook/john/-
//!                 └── field    /repo/phonebook/john/phone
//!                       └── value (stored in the field, not addressable)
//! ```
//!
//! Containment is total along a path: two addresses are either *comparable*
//! (equal, or one contains the other) or *disjoint*. This is what makes an
//! address usable as a lock unit.
//!
//! ## Invariants
//!
//! - [`Id`]: starts with a letter or `_`, then letters, digits, `_`, `-`, `.`;
//!   at most [`Id::MAX_LEN`] characters
//! - [`Address`]: components are filled from the top; a field address always
//!   has an object, an object address always has a model
//! - [`Revision`]: real revisions are `>= 0`, every sentinel compares below them

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Identifiers
// =============================================================================

/// A validated identifier for a repository, model, object or field.
///
/// # Rust Pattern: Parse, Don't Validate
///
/// The only way to get an `Id` is through [`Id::new`] (or serde, which goes
/// through the same check). Code holding an `Id` never re-validates it.
///
/// # Example
///
/// ```rust
/// use revstore::types::Id;
///
/// let id = Id::new("phonebook").unwrap();
/// assert_eq!(id.as_str(), "phonebook");
/// assert!(Id::new("1st").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Id(String);

impl Id {
    /// Maximum id length in characters.
    pub const MAX_LEN: usize = 100;

    /// Creates an id, rejecting anything outside the id syntax.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if Self::is_valid(&id) {
            Ok(Self(id))
        } else {
            Err(Error::InvalidId(id))
        }
    }

    /// Checks the id syntax without allocating.
    pub fn is_valid(candidate: &str) -> bool {
        let mut chars = candidate.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        if !(first.is_alphabetic() || first == '_') {
            return false;
        }
        if candidate.chars().count() > Self::MAX_LEN {
            return false;
        }
        chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Id {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Id {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Id> for String {
    fn from(id: Id) -> Self {
        id.0
    }
}

// =============================================================================
// Addresses
// =============================================================================

/// The level an [`Address`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressKind {
    Repository,
    Model,
    Object,
    Field,
}

impl AddressKind {
    /// Depth below the repository: repository 0, model 1, object 2, field 3.
    pub fn depth(self) -> usize {
        match self {
            AddressKind::Repository => 0,
            AddressKind::Model => 1,
            AddressKind::Object => 2,
            AddressKind::Field => 3,
        }
    }
}

/// A path of up to four ids: repository, model, object, field.
///
/// # Ordering
///
/// The derived `Ord` compares component by component with an absent
/// component sorting before any present one, so a parent always sorts
/// directly before its children. Ordered maps keyed by `Address` therefore
/// iterate in depth-first tree order.
///
/// # Textual Form
///
/// `/repo/model/object/field`, with `-` standing in for absent trailing
/// components:
///
/// ```rust
/// use revstore::types::{Address, AddressKind};
///
/// let addr = Address::parse("/repo/phonebook/john/-").unwrap();
/// assert_eq!(addr.kind(), AddressKind::Object);
/// assert_eq!(addr.to_string(), "/repo/phonebook/john/-");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    repository: Id,
    model: Option<Id>,
    object: Option<Id>,
    field: Option<Id>,
}

impl Address {
    /// Address of a repository.
    pub fn repository(repository: &str) -> Result<Self> {
        Ok(Self {
            repository: Id::new(repository)?,
            model: None,
            object: None,
            field: None,
        })
    }

    /// Address of a model.
    pub fn model(repository: &str, model: &str) -> Result<Self> {
        Self::repository(repository)?.child(model)
    }

    /// Address of an object.
    pub fn object(repository: &str, model: &str, object: &str) -> Result<Self> {
        Self::model(repository, model)?.child(object)
    }

    /// Address of a field.
    pub fn field(repository: &str, model: &str, object: &str, field: &str) -> Result<Self> {
        Self::object(repository, model, object)?.child(field)
    }

    /// Parses the textual form produced by `Display`.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidAddress {
            address: text.to_string(),
            reason: reason.to_string(),
        };

        let rest = text
            .strip_prefix('/')
            .ok_or_else(|| invalid("must start with '/'"))?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.is_empty() || parts.len() > 4 {
            return Err(invalid("expected one to four components"));
        }

        let mut present = Vec::with_capacity(4);
        let mut seen_absent = false;
        for part in parts {
            if part == "-" {
                seen_absent = true;
                continue;
            }
            if seen_absent {
                return Err(invalid("component after an absent component"));
            }
            present.push(Id::new(part)?);
        }

        let mut present = present.into_iter();
        let repository = present
            .next()
            .ok_or_else(|| invalid("missing repository"))?;
        Ok(Self {
            repository,
            model: present.next(),
            object: present.next(),
            field: present.next(),
        })
    }

    /// Appends one component below this address.
    ///
    /// Fails on a field address, which has no children.
    pub fn child(&self, id: &str) -> Result<Self> {
        let id = Id::new(id)?;
        let mut next = self.clone();
        match self.kind() {
            AddressKind::Repository => next.model = Some(id),
            AddressKind::Model => next.object = Some(id),
            AddressKind::Object => next.field = Some(id),
            AddressKind::Field => {
                return Err(Error::InvalidAddress {
                    address: self.to_string(),
                    reason: "fields have no children".to_string(),
                })
            }
        }
        Ok(next)
    }

    /// Same as [`Address::child`] for an already validated id.
    pub fn child_id(&self, id: &Id) -> Option<Self> {
        let mut next = self.clone();
        match self.kind() {
            AddressKind::Repository => next.model = Some(id.clone()),
            AddressKind::Model => next.object = Some(id.clone()),
            AddressKind::Object => next.field = Some(id.clone()),
            AddressKind::Field => return None,
        }
        Some(next)
    }

    /// The level this address points at.
    pub fn kind(&self) -> AddressKind {
        match (&self.model, &self.object, &self.field) {
            (None, _, _) => AddressKind::Repository,
            (Some(_), None, _) => AddressKind::Model,
            (Some(_), Some(_), None) => AddressKind::Object,
            (Some(_), Some(_), Some(_)) => AddressKind::Field,
        }
    }

    pub fn repository_id(&self) -> &Id {
        &self.repository
    }

    pub fn model_id(&self) -> Option<&Id> {
        self.model.as_ref()
    }

    pub fn object_id(&self) -> Option<&Id> {
        self.object.as_ref()
    }

    pub fn field_id(&self) -> Option<&Id> {
        self.field.as_ref()
    }

    /// The last component: the id of whatever this address points at.
    pub fn id(&self) -> &Id {
        self.field
            .as_ref()
            .or(self.object.as_ref())
            .or(self.model.as_ref())
            .unwrap_or(&self.repository)
    }

    /// The enclosing address, or `None` for a repository.
    pub fn parent(&self) -> Option<Self> {
        let mut parent = self.clone();
        match self.kind() {
            AddressKind::Repository => return None,
            AddressKind::Model => parent.model = None,
            AddressKind::Object => parent.object = None,
            AddressKind::Field => parent.field = None,
        }
        Some(parent)
    }

    /// Truncates this address to its model, if it has one.
    pub fn model_address(&self) -> Option<Self> {
        self.model.as_ref().map(|model| Self {
            repository: self.repository.clone(),
            model: Some(model.clone()),
            object: None,
            field: None,
        })
    }

    /// Truncates this address to its object, if it has one.
    pub fn object_address(&self) -> Option<Self> {
        match (&self.model, &self.object) {
            (Some(model), Some(object)) => Some(Self {
                repository: self.repository.clone(),
                model: Some(model.clone()),
                object: Some(object.clone()),
                field: None,
            }),
            _ => None,
        }
    }

    /// True if `self` is `other` or an ancestor of it.
    pub fn equals_or_contains(&self, other: &Address) -> bool {
        fn prefix(a: &Option<Id>, b: &Option<Id>) -> bool {
            match (a, b) {
                (None, _) => true,
                (Some(a), Some(b)) => a == b,
                (Some(_), None) => false,
            }
        }
        self.repository == other.repository
            && prefix(&self.model, &other.model)
            && (self.model.is_none() || prefix(&self.object, &other.object))
            && (self.object.is_none() || prefix(&self.field, &other.field))
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn contains(&self, other: &Address) -> bool {
        self != other && self.equals_or_contains(other)
    }

    /// True if one address equals or contains the other.
    pub fn is_comparable(&self, other: &Address) -> bool {
        self.equals_or_contains(other) || other.equals_or_contains(self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |id: &Option<Id>| id.as_ref().map_or("-", |id| id.as_str()).to_string();
        write!(
            f,
            "/{}/{}/{}/{}",
            self.repository,
            part(&self.model),
            part(&self.object),
            part(&self.field)
        )
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

// =============================================================================
// Revisions
// =============================================================================

/// A model-ledger revision.
///
/// # Sentinels
///
/// Negative values are sentinels, never real revisions:
///
/// | Constant | Raw | Meaning |
/// |----------|-----|---------|
/// | [`Revision::NOT_EXISTING`] | -1 | The entity does not exist |
/// | [`Revision::NOT_SET`] | -2 | Not computed: the caller lacks the locks for it |
/// | [`Revision::NO_PARENT`] | -4 | The entity's parent does not exist |
/// | [`Revision::UNDEFINED`] | -5 | Nothing could be parsed / not applicable |
///
/// All sentinels sort below [`Revision::FIRST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(i64);

impl Revision {
    /// The first revision of every model ledger.
    pub const FIRST: Revision = Revision(0);
    pub const NOT_EXISTING: Revision = Revision(-1);
    pub const NOT_SET: Revision = Revision(-2);
    pub const NO_PARENT: Revision = Revision(-4);
    pub const UNDEFINED: Revision = Revision(-5);

    /// Creates a revision from a raw value (sentinels included).
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value for storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }

    /// True for real revisions (`>= 0`).
    pub fn is_real(&self) -> bool {
        self.0 >= 0
    }

    /// The revision after this one.
    ///
    /// `NOT_EXISTING.next()` is [`Revision::FIRST`], which is how an empty
    /// ledger hands out its first revision.
    pub fn next(&self) -> Self {
        Self(self.0.max(-1) + 1)
    }

    /// The revision before this one, or `NOT_EXISTING` below `FIRST`.
    pub fn prev(&self) -> Self {
        if self.0 <= 0 {
            Self::NOT_EXISTING
        } else {
            Self(self.0 - 1)
        }
    }

    /// Parses a decimal revision, mapping garbage to [`Revision::UNDEFINED`].
    pub fn parse_lenient(text: &str) -> Self {
        text.trim().parse().map(Self).unwrap_or(Self::UNDEFINED)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Actors
// =============================================================================

/// The identity a change is executed on behalf of.
///
/// Actors are not validated: access control lives outside the engine, which
/// only stamps the actor onto change records and events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Values
// =============================================================================

/// The value stored in a field.
///
/// A closed set: every consumer matches exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Address(Address),
    List(Vec<Value>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

// =============================================================================
// Command Outcome
// =============================================================================

/// What `execute_command` reports back.
///
/// Only three outcomes exist for the caller: everything else (contention,
/// timed-out peers, roll-forward races) is resolved inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The change was executed at this revision.
    Executed(Revision),
    /// The command was already satisfied; nothing changed.
    NoChange,
    /// A precondition failed or the worker gave up before executing.
    Failed,
}

impl CommandOutcome {
    /// The revision of an executed change.
    pub fn revision(&self) -> Option<Revision> {
        match self {
            CommandOutcome::Executed(revision) => Some(*revision),
            CommandOutcome::NoChange | CommandOutcome::Failed => None,
        }
    }

    /// True for `Executed` and `NoChange`.
    pub fn is_success(&self) -> bool {
        !matches!(self, CommandOutcome::Failed)
    }
}

// =============================================================================
// Tests
// =============================================================================
