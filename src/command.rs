//! # Commands
//!
//! A command is a requested mutation. Commands are a closed set, grouped by
//! the level of the entity that *contains* the target:
//!
//! ```text
//! Repository  add/remove model      target: model address
//! Model       add/remove object     target: object address
//! Object      add/remove field      target: field address
//! Field       add/change/remove value   target: field address
//! ```
//!
//! Every command carries a [`Precondition`]. A [`Transaction`] bundles atomic
//! commands on one model under one resulting revision.
//!
//! ## Validation
//!
//! Constructors check structure (address kinds, transaction shape). A
//! structurally invalid command is an `Error::InvalidCommand` and never
//! reaches the change ledger. Whether the precondition *holds* is decided
//! later, against the base view.

use std::slice;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Address, AddressKind, Revision, Value};

// =============================================================================
// Preconditions
// =============================================================================

/// When a command may apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    /// For removals and value changes, the entity must be at exactly this
    /// revision. For additions, the entity must not exist (the revision is
    /// not consulted).
    Safe(Revision),

    /// Always applies. If the entity is already in the target state, the
    /// command is a no-op.
    Forced,

    /// Transaction only: the entity must carry the revision written by the
    /// transaction's command at this index, which must come earlier.
    Relative(usize),
}

// =============================================================================
// Atomic Commands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityOp {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueOp {
    Add(Value),
    Change(Value),
    Remove,
}

/// One mutation of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AtomicCommand {
    /// Add or remove a model.
    Repository {
        op: EntityOp,
        target: Address,
        precondition: Precondition,
    },
    /// Add or remove an object.
    Model {
        op: EntityOp,
        target: Address,
        precondition: Precondition,
    },
    /// Add or remove a field.
    Object {
        op: EntityOp,
        target: Address,
        precondition: Precondition,
    },
    /// Add, change or remove a field's value.
    Field {
        op: ValueOp,
        target: Address,
        precondition: Precondition,
    },
}

fn expect_kind(target: &Address, kind: AddressKind) -> Result<()> {
    if target.kind() == kind {
        Ok(())
    } else {
        Err(Error::InvalidCommand(format!(
            "expected a {kind:?} address, got {target}"
        )))
    }
}

impl AtomicCommand {
    pub fn add_model(target: Address, precondition: Precondition) -> Result<Self> {
        expect_kind(&target, AddressKind::Model)?;
        Ok(AtomicCommand::Repository {
            op: EntityOp::Add,
            target,
            precondition,
        })
    }

    pub fn remove_model(target: Address, precondition: Precondition) -> Result<Self> {
        expect_kind(&target, AddressKind::Model)?;
        Ok(AtomicCommand::Repository {
            op: EntityOp::Remove,
            target,
            precondition,
        })
    }

    pub fn add_object(target: Address, precondition: Precondition) -> Result<Self> {
        expect_kind(&target, AddressKind::Object)?;
        Ok(AtomicCommand::Model {
            op: EntityOp::Add,
            target,
            precondition,
        })
    }

    pub fn remove_object(target: Address, precondition: Precondition) -> Result<Self> {
        expect_kind(&target, AddressKind::Object)?;
        Ok(AtomicCommand::Model {
            op: EntityOp::Remove,
            target,
            precondition,
        })
    }

    pub fn add_field(target: Address, precondition: Precondition) -> Result<Self> {
        expect_kind(&target, AddressKind::Field)?;
        Ok(AtomicCommand::Object {
            op: EntityOp::Add,
            target,
            precondition,
        })
    }

    pub fn remove_field(target: Address, precondition: Precondition) -> Result<Self> {
        expect_kind(&target, AddressKind::Field)?;
        Ok(AtomicCommand::Object {
            op: EntityOp::Remove,
            target,
            precondition,
        })
    }

    pub fn add_value(target: Address, value: Value, precondition: Precondition) -> Result<Self> {
        expect_kind(&target, AddressKind::Field)?;
        Ok(AtomicCommand::Field {
            op: ValueOp::Add(value),
            target,
            precondition,
        })
    }

    pub fn change_value(
        target: Address,
        value: Value,
        precondition: Precondition,
    ) -> Result<Self> {
        expect_kind(&target, AddressKind::Field)?;
        Ok(AtomicCommand::Field {
            op: ValueOp::Change(value),
            target,
            precondition,
        })
    }

    pub fn remove_value(target: Address, precondition: Precondition) -> Result<Self> {
        expect_kind(&target, AddressKind::Field)?;
        Ok(AtomicCommand::Field {
            op: ValueOp::Remove,
            target,
            precondition,
        })
    }

    /// The entity this command creates, removes or changes.
    pub fn target(&self) -> &Address {
        match self {
            AtomicCommand::Repository { target, .. }
            | AtomicCommand::Model { target, .. }
            | AtomicCommand::Object { target, .. }
            | AtomicCommand::Field { target, .. } => target,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            AtomicCommand::Repository { precondition, .. }
            | AtomicCommand::Model { precondition, .. }
            | AtomicCommand::Object { precondition, .. }
            | AtomicCommand::Field { precondition, .. } => *precondition,
        }
    }

    /// The model whose ledger orders this command.
    pub fn model_address(&self) -> Result<Address> {
        self.target().model_address().ok_or_else(|| {
            Error::InvalidCommand(format!("{} is not inside a model", self.target()))
        })
    }

    fn validate_shape(&self) -> Result<()> {
        let kind = match self {
            AtomicCommand::Repository { .. } => AddressKind::Model,
            AtomicCommand::Model { .. } => AddressKind::Object,
            AtomicCommand::Object { .. } | AtomicCommand::Field { .. } => AddressKind::Field,
        };
        expect_kind(self.target(), kind)
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// An ordered, non-empty list of atomic commands on one model.
///
/// All commands share the transaction's revision: either every command
/// applies, or none does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    model: Address,
    commands: Vec<AtomicCommand>,
}

impl Transaction {
    /// Builds a transaction, rejecting:
    ///
    /// - an empty command list
    /// - repository commands (add/remove model are submitted alone)
    /// - commands outside `model`
    /// - `Relative(i)` preconditions that don't point at an earlier command
    pub fn new(model: Address, commands: Vec<AtomicCommand>) -> Result<Self> {
        expect_kind(&model, AddressKind::Model)?;
        if commands.is_empty() {
            return Err(Error::InvalidCommand("empty transaction".into()));
        }

        for (index, command) in commands.iter().enumerate() {
            command.validate_shape()?;
            if matches!(command, AtomicCommand::Repository { .. }) {
                return Err(Error::InvalidCommand(format!(
                    "repository command at index {index} inside a transaction"
                )));
            }
            if !model.contains(command.target()) {
                return Err(Error::InvalidCommand(format!(
                    "command at index {index} targets {} outside {model}",
                    command.target()
                )));
            }
            if let Precondition::Relative(earlier) = command.precondition() {
                if earlier >= index {
                    return Err(Error::InvalidCommand(format!(
                        "command at index {index} refers to command {earlier}, which is not earlier"
                    )));
                }
            }
        }

        Ok(Self { model, commands })
    }

    pub fn model(&self) -> &Address {
        &self.model
    }

    pub fn commands(&self) -> &[AtomicCommand] {
        &self.commands
    }
}

// =============================================================================
// Command
// =============================================================================

/// What a caller submits: one atomic command or a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Atomic(AtomicCommand),
    Transaction(Transaction),
}

impl Command {
    /// The model whose ledger orders this command.
    pub fn model_address(&self) -> Result<Address> {
        match self {
            Command::Atomic(command) => command.model_address(),
            Command::Transaction(tx) => Ok(tx.model().clone()),
        }
    }

    /// The contained atomic commands, in order.
    pub fn commands(&self) -> &[AtomicCommand] {
        match self {
            Command::Atomic(command) => slice::from_ref(command),
            Command::Transaction(tx) => tx.commands(),
        }
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self, Command::Transaction(_))
    }

    /// Structural checks that must pass before a revision is reserved.
    pub fn validate(&self) -> Result<()> {
        match self {
            Command::Atomic(command) => {
                command.validate_shape()?;
                if let Precondition::Relative(_) = command.precondition() {
                    return Err(Error::InvalidCommand(
                        "relative precondition outside a transaction".into(),
                    ));
                }
                Ok(())
            }
            // Checked by Transaction::new.
            Command::Transaction(_) => Ok(()),
        }
    }
}

impl From<AtomicCommand> for Command {
    fn from(command: AtomicCommand) -> Self {
        Command::Atomic(command)
    }
}

impl From<Transaction> for Command {
    fn from(tx: Transaction) -> Self {
        Command::Transaction(tx)
    }
}
