//! # Precondition Check and Event Generation
//!
//! Given the base view of a model as of `r - 1` and a command, decide whether
//! the command applies and, if so, which events revision `r` consists of.
//!
//! ## Algorithm: Apply, Then Diff
//!
//! ```text
//!   base ──clone──► work ──cmd 0──► work' ──cmd 1──► ... ──► work_n
//!     │                                                       │
//!     └──────────────────────── diff ─────────────────────────┘
//!                                 │
//!                                 ▼
//!                      minimal, ordered event list
//! ```
//!
//! 1. Each atomic command is checked against the *working copy* (so later
//!    commands of a transaction see the effects of earlier ones) and applied
//!    to it. Touched entities take the pending revision `r`.
//! 2. If any command fails its precondition, the whole command fails.
//! 3. If no command took effect, the command is a no-op.
//! 4. Otherwise the events are the difference between base and working copy,
//!    revisions included. Nothing is reported beneath a removed entity, and
//!    each address is removed at most once and added at most once.
//!
//! Structural commands that took effect are remembered by address, because a
//! plain diff can't see them once they cancel out:
//!
//! | Base | Work | Touched | Events |
//! |------|------|---------|--------|
//! | present | present | yes | removal, then addition (re-created) |
//! | absent | absent | yes | removal only (created and removed again) |
//!
//! A value changed and changed back leaves a field whose revision moved; it
//! gets a value event carrying the current value.
//!
//! ## Preconditions
//!
//! | Command | Safe(rev) | Forced |
//! |---------|-----------|--------|
//! | add model/object/field | must not exist | no-op if it exists |
//! | remove model/object/field | must exist at `rev` | no-op if missing |
//! | add value | field exists, no value yet | no-op if equal |
//! | change value | field has a value, field at `rev` | no-op if equal |
//! | remove value | field has a value, field at `rev` | no-op if none |
//!
//! Adding into a missing parent fails in every mode. `Relative(i)` behaves
//! like `Safe` with the transaction's own pending revision, and requires
//! command `i` to have taken effect.

use std::collections::BTreeSet;

use crate::command::{AtomicCommand, Command, EntityOp, Precondition, ValueOp};
use crate::event::{sort_events, Event, EventKind, ValueSlot};
use crate::state::{FieldState, ModelState, ObjectState};
use crate::types::{ActorId, Address, AddressKind, Id, Revision, Value};

/// The result of evaluating a command against a base view.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// The command applies; these are the events of the new revision.
    Events(Vec<Event>),
    /// The command is already satisfied.
    NoChange,
    /// A precondition does not hold.
    Failed(String),
}

/// Evaluates `command` against `base` for revision `revision`.
pub fn evaluate(
    base: &ModelState,
    command: &Command,
    revision: Revision,
    actor: &ActorId,
) -> Evaluation {
    evaluate_with_state(base, command, revision, actor).0
}

/// Same as [`evaluate`], also returning the working copy after applying the
/// command directly.
pub fn evaluate_with_state(
    base: &ModelState,
    command: &Command,
    revision: Revision,
    actor: &ActorId,
) -> (Evaluation, ModelState) {
    let mut evaluator = Evaluator {
        work: base.clone(),
        revision,
        applied: Vec::with_capacity(command.commands().len()),
        structural: BTreeSet::new(),
    };

    for (index, atomic) in command.commands().iter().enumerate() {
        match evaluator.step(atomic) {
            Step::Applied => evaluator.applied.push(true),
            Step::NoOp => evaluator.applied.push(false),
            Step::Failed(reason) => {
                let reason = if command.is_transaction() {
                    format!("command {index}: {reason}")
                } else {
                    reason
                };
                return (Evaluation::Failed(reason), evaluator.work);
            }
        }
    }

    if !evaluator.applied.contains(&true) {
        return (Evaluation::NoChange, evaluator.work);
    }
    let mut events = diff(base, &evaluator.work, &evaluator.structural, revision, actor);
    if events.is_empty() {
        return (Evaluation::NoChange, evaluator.work);
    }
    sort_events(&mut events);
    let in_transaction = events.len() > 1;
    for event in &mut events {
        event.in_transaction = in_transaction;
    }
    (Evaluation::Events(events), evaluator.work)
}

// =============================================================================
// Command Application
// =============================================================================

enum Step {
    Applied,
    NoOp,
    Failed(String),
}

struct Evaluator {
    work: ModelState,
    revision: Revision,
    /// Per earlier command: did it take effect?
    applied: Vec<bool>,
    /// Entities added or removed by a command that took effect.
    structural: BTreeSet<Address>,
}

impl Evaluator {
    /// Checks `current` against a revision-comparing precondition.
    fn revision_matches(&self, precondition: Precondition, current: Revision) -> bool {
        match precondition {
            Precondition::Safe(expected) => current.is_real() && current == expected,
            Precondition::Forced => true,
            Precondition::Relative(index) => {
                self.applied.get(index).copied().unwrap_or(false) && current == self.revision
            }
        }
    }

    /// Checks the precondition of an addition whose entity does not exist.
    fn addition_allowed(&self, precondition: Precondition) -> bool {
        match precondition {
            Precondition::Safe(_) | Precondition::Forced => true,
            Precondition::Relative(index) => self.applied.get(index).copied().unwrap_or(false),
        }
    }

    fn step(&mut self, command: &AtomicCommand) -> Step {
        let target = command.target();
        let precondition = command.precondition();
        let forced = precondition == Precondition::Forced;

        match command {
            AtomicCommand::Repository { op, .. } => self.model_step(*op, precondition, forced),
            AtomicCommand::Model { op, .. } => {
                let Some(id) = target.object_id().cloned() else {
                    return Step::Failed(format!("{target} is not an object address"));
                };
                self.object_step(*op, &id, target, precondition, forced)
            }
            AtomicCommand::Object { op, .. } => {
                let (Some(object_id), Some(field_id)) =
                    (target.object_id().cloned(), target.field_id().cloned())
                else {
                    return Step::Failed(format!("{target} is not a field address"));
                };
                self.field_step(*op, &object_id, &field_id, target, precondition, forced)
            }
            AtomicCommand::Field { op, .. } => {
                let (Some(object_id), Some(field_id)) =
                    (target.object_id().cloned(), target.field_id().cloned())
                else {
                    return Step::Failed(format!("{target} is not a field address"));
                };
                self.value_step(op, &object_id, &field_id, target, precondition, forced)
            }
        }
    }

    fn model_step(&mut self, op: EntityOp, precondition: Precondition, forced: bool) -> Step {
        let address = self.work.address().clone();
        match (op, self.work.exists) {
            (EntityOp::Add, true) if forced => Step::NoOp,
            (EntityOp::Add, true) => Step::Failed(format!("model {address} already exists")),
            (EntityOp::Add, false) => {
                if !self.addition_allowed(precondition) {
                    return Step::Failed(format!("relative precondition on {address} not met"));
                }
                self.work.exists = true;
                self.work.objects.clear();
                self.work.revision = self.revision;
                self.structural.insert(address);
                Step::Applied
            }
            (EntityOp::Remove, false) if forced => Step::NoOp,
            (EntityOp::Remove, false) => Step::Failed(format!("model {address} does not exist")),
            (EntityOp::Remove, true) => {
                if !self.revision_matches(precondition, self.work.revision) {
                    return Step::Failed(format!(
                        "model {address} is at revision {}",
                        self.work.revision
                    ));
                }
                self.work.exists = false;
                self.work.objects.clear();
                self.work.revision = self.revision;
                self.structural.insert(address);
                Step::Applied
            }
        }
    }

    fn object_step(
        &mut self,
        op: EntityOp,
        id: &Id,
        target: &Address,
        precondition: Precondition,
        forced: bool,
    ) -> Step {
        let r = self.revision;
        let existing = if self.work.exists {
            self.work.objects.get(id).map(|o| o.revision)
        } else {
            None
        };

        match (op, existing) {
            (EntityOp::Add, _) if !self.work.exists => {
                Step::Failed(format!("model of {target} does not exist"))
            }
            (EntityOp::Add, Some(_)) if forced => Step::NoOp,
            (EntityOp::Add, Some(_)) => Step::Failed(format!("object {target} already exists")),
            (EntityOp::Add, None) => {
                if !self.addition_allowed(precondition) {
                    return Step::Failed(format!("relative precondition on {target} not met"));
                }
                self.work.objects.insert(id.clone(), ObjectState::new(r));
                self.work.revision = r;
                self.structural.insert(target.clone());
                Step::Applied
            }
            (EntityOp::Remove, None) if forced => Step::NoOp,
            (EntityOp::Remove, None) => Step::Failed(format!("object {target} does not exist")),
            (EntityOp::Remove, Some(current)) => {
                if !self.revision_matches(precondition, current) {
                    return Step::Failed(format!("object {target} is at revision {current}"));
                }
                self.work.objects.remove(id);
                self.work.revision = r;
                self.structural.insert(target.clone());
                Step::Applied
            }
        }
    }

    fn field_step(
        &mut self,
        op: EntityOp,
        object_id: &Id,
        field_id: &Id,
        target: &Address,
        precondition: Precondition,
        forced: bool,
    ) -> Step {
        let r = self.revision;
        let object_exists = self.work.exists && self.work.objects.contains_key(object_id);
        let existing = self
            .work
            .objects
            .get(object_id)
            .filter(|_| object_exists)
            .and_then(|o| o.fields.get(field_id))
            .map(|f| f.revision);

        match (op, existing) {
            (EntityOp::Add, _) if !object_exists => {
                Step::Failed(format!("object of {target} does not exist"))
            }
            (EntityOp::Add, Some(_)) if forced => Step::NoOp,
            (EntityOp::Add, Some(_)) => Step::Failed(format!("field {target} already exists")),
            (EntityOp::Add, None) => {
                if !self.addition_allowed(precondition) {
                    return Step::Failed(format!("relative precondition on {target} not met"));
                }
                self.touch_object(object_id, |object| {
                    object.fields.insert(field_id.clone(), FieldState::new(r, None));
                });
                self.structural.insert(target.clone());
                Step::Applied
            }
            (EntityOp::Remove, None) if forced => Step::NoOp,
            (EntityOp::Remove, None) => Step::Failed(format!("field {target} does not exist")),
            (EntityOp::Remove, Some(current)) => {
                if !self.revision_matches(precondition, current) {
                    return Step::Failed(format!("field {target} is at revision {current}"));
                }
                self.touch_object(object_id, |object| {
                    object.fields.remove(field_id);
                });
                self.structural.insert(target.clone());
                Step::Applied
            }
        }
    }

    fn value_step(
        &mut self,
        op: &ValueOp,
        object_id: &Id,
        field_id: &Id,
        target: &Address,
        precondition: Precondition,
        forced: bool,
    ) -> Step {
        let field = if self.work.exists {
            self.work
                .objects
                .get(object_id)
                .and_then(|o| o.fields.get(field_id))
                .cloned()
        } else {
            None
        };

        let Some(field) = field else {
            return match op {
                ValueOp::Remove if forced => Step::NoOp,
                _ => Step::Failed(format!("field {target} does not exist")),
            };
        };

        let next: Option<Value> = match (op, &field.value) {
            (ValueOp::Add(_), Some(_)) if !forced => {
                return Step::Failed(format!("field {target} already has a value"));
            }
            (ValueOp::Add(value), _) => {
                if !forced && !self.addition_allowed(precondition) {
                    return Step::Failed(format!("relative precondition on {target} not met"));
                }
                Some(value.clone())
            }
            (ValueOp::Change(value), None) if forced => Some(value.clone()),
            (ValueOp::Change(_), None) => {
                return Step::Failed(format!("field {target} has no value"));
            }
            (ValueOp::Change(value), Some(_)) => {
                if !self.revision_matches(precondition, field.revision) {
                    return Step::Failed(format!(
                        "field {target} is at revision {}",
                        field.revision
                    ));
                }
                Some(value.clone())
            }
            (ValueOp::Remove, None) if forced => return Step::NoOp,
            (ValueOp::Remove, None) => {
                return Step::Failed(format!("field {target} has no value"));
            }
            (ValueOp::Remove, Some(_)) => {
                if !self.revision_matches(precondition, field.revision) {
                    return Step::Failed(format!(
                        "field {target} is at revision {}",
                        field.revision
                    ));
                }
                None
            }
        };

        if next == field.value {
            return Step::NoOp;
        }

        let r = self.revision;
        self.touch_object(object_id, |object| {
            if let Some(field) = object.fields.get_mut(field_id) {
                field.revision = r;
                field.value = next;
            }
        });
        Step::Applied
    }

    /// Runs `change` on an object and stamps it and the model with `r`.
    fn touch_object(&mut self, object_id: &Id, change: impl FnOnce(&mut ObjectState)) {
        let r = self.revision;
        if let Some(object) = self.work.objects.get_mut(object_id) {
            change(object);
            object.revision = r;
        }
        self.work.revision = r;
    }
}

// =============================================================================
// Diff
// =============================================================================

fn event(kind: EventKind, target: Address, old_revision: Revision, revision: Revision, actor: &ActorId) -> Event {
    Event {
        kind,
        target,
        revision,
        old_revision,
        actor: actor.clone(),
        in_transaction: false,
    }
}

fn diff(
    base: &ModelState,
    work: &ModelState,
    structural: &BTreeSet<Address>,
    revision: Revision,
    actor: &ActorId,
) -> Vec<Event> {
    let model = base.address();
    let mut events = Vec::new();

    match (base.exists, work.exists) {
        (true, false) => {
            events.push(event(EventKind::RemoveModel, model.clone(), base.revision, revision, actor));
            return events;
        }
        (false, false) => {
            if structural.contains(model) {
                events.push(event(
                    EventKind::RemoveModel,
                    model.clone(),
                    Revision::NOT_EXISTING,
                    revision,
                    actor,
                ));
            }
            return events;
        }
        (false, true) => {
            add_model_events(&mut events, work, revision, actor);
            return events;
        }
        (true, true) if structural.contains(model) => {
            events.push(event(EventKind::RemoveModel, model.clone(), base.revision, revision, actor));
            add_model_events(&mut events, work, revision, actor);
            return events;
        }
        (true, true) => {}
    }

    for (id, base_object) in &base.objects {
        if work.objects.contains_key(id) {
            continue;
        }
        if let Some(address) = model.child_id(id) {
            events.push(event(EventKind::RemoveObject, address, base_object.revision, revision, actor));
        }
    }

    for (id, work_object) in &work.objects {
        let Some(object_address) = model.child_id(id) else {
            continue;
        };
        let base_object = match base.objects.get(id) {
            Some(base_object) if !structural.contains(&object_address) => base_object,
            Some(base_object) => {
                events.push(event(
                    EventKind::RemoveObject,
                    object_address,
                    base_object.revision,
                    revision,
                    actor,
                ));
                add_object_events(&mut events, model, id, work_object, revision, actor);
                continue;
            }
            None => {
                add_object_events(&mut events, model, id, work_object, revision, actor);
                continue;
            }
        };

        for (field_id, base_field) in &base_object.fields {
            if work_object.fields.contains_key(field_id) {
                continue;
            }
            if let Some(address) = object_address.child_id(field_id) {
                events.push(event(EventKind::RemoveField, address, base_field.revision, revision, actor));
            }
        }

        for (field_id, work_field) in &work_object.fields {
            let Some(field_address) = object_address.child_id(field_id) else {
                continue;
            };
            match base_object.fields.get(field_id) {
                None => add_field_events(&mut events, field_address, work_field, revision, actor),
                Some(base_field) if structural.contains(&field_address) => {
                    events.push(event(
                        EventKind::RemoveField,
                        field_address.clone(),
                        base_field.revision,
                        revision,
                        actor,
                    ));
                    add_field_events(&mut events, field_address, work_field, revision, actor);
                }
                Some(base_field) => {
                    if let Some(kind) = value_event(base_field, work_field) {
                        events.push(event(kind, field_address, base_field.revision, revision, actor));
                    }
                }
            }
        }
    }

    // Created and removed again: only the removal is left to carry the
    // parent's new revision.
    for address in structural {
        if base.contains(address) || work.contains(address) {
            continue;
        }
        let kind = match address.kind() {
            AddressKind::Object => EventKind::RemoveObject,
            AddressKind::Field => {
                let parent_kept = address.object_address().is_some_and(|object| {
                    base.contains(&object) && work.contains(&object) && !structural.contains(&object)
                });
                if !parent_kept {
                    continue;
                }
                EventKind::RemoveField
            }
            _ => continue,
        };
        events.push(event(kind, address.clone(), Revision::NOT_EXISTING, revision, actor));
    }

    events
}

fn add_model_events(events: &mut Vec<Event>, work: &ModelState, revision: Revision, actor: &ActorId) {
    let model = work.address();
    events.push(event(
        EventKind::AddModel,
        model.clone(),
        Revision::NOT_EXISTING,
        revision,
        actor,
    ));
    for (id, object) in &work.objects {
        add_object_events(events, model, id, object, revision, actor);
    }
}

fn add_object_events(
    events: &mut Vec<Event>,
    model: &Address,
    id: &Id,
    object: &ObjectState,
    revision: Revision,
    actor: &ActorId,
) {
    let Some(object_address) = model.child_id(id) else {
        return;
    };
    events.push(event(
        EventKind::AddObject,
        object_address.clone(),
        Revision::NOT_EXISTING,
        revision,
        actor,
    ));
    for (field_id, field) in &object.fields {
        if let Some(field_address) = object_address.child_id(field_id) {
            add_field_events(events, field_address, field, revision, actor);
        }
    }
}

fn add_field_events(
    events: &mut Vec<Event>,
    address: Address,
    field: &FieldState,
    revision: Revision,
    actor: &ActorId,
) {
    events.push(event(
        EventKind::AddField,
        address.clone(),
        Revision::NOT_EXISTING,
        revision,
        actor,
    ));
    if let Some(value) = &field.value {
        events.push(event(
            EventKind::AddValue(ValueSlot::Inline(value.clone())),
            address,
            revision,
            revision,
            actor,
        ));
    }
}

/// The value event turning `before` into `after`, if the field moved at all.
fn value_event(before: &FieldState, after: &FieldState) -> Option<EventKind> {
    if before == after {
        return None;
    }
    Some(match (&before.value, &after.value) {
        (None, Some(value)) => EventKind::AddValue(ValueSlot::Inline(value.clone())),
        (Some(_), Some(value)) => EventKind::ChangeValue(ValueSlot::Inline(value.clone())),
        (_, None) => EventKind::RemoveValue,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Transaction;
    use crate::event::EventPhase;
    use proptest::prelude::*;

    fn model() -> Address {
        Address::model("r", "m").unwrap()
    }

    fn obj(id: &str) -> Address {
        Address::object("r", "m", id).unwrap()
    }

    fn fld(object: &str, field: &str) -> Address {
        Address::field("r", "m", object, field).unwrap()
    }

    fn actor() -> ActorId {
        ActorId::new("tester")
    }

    /// Applies a command through evaluate + events, panicking on failure.
    fn run(state: &mut ModelState, command: Command, revision: i64) -> Evaluation {
        let evaluation = evaluate(state, &command, Revision::new(revision), &actor());
        if let Evaluation::Events(events) = &evaluation {
            state.apply_inline_events(events).unwrap();
        }
        evaluation
    }

    /// Model with object `a` (field `f` = 1) and object `b`.
    fn seeded() -> ModelState {
        let mut state = ModelState::empty(model());
        run(&mut state, AtomicCommand::add_model(model(), Precondition::Forced).unwrap().into(), 0);
        run(&mut state, AtomicCommand::add_object(obj("a"), Precondition::Forced).unwrap().into(), 1);
        run(&mut state, AtomicCommand::add_field(fld("a", "f"), Precondition::Forced).unwrap().into(), 2);
        run(
            &mut state,
            AtomicCommand::add_value(fld("a", "f"), Value::Integer(1), Precondition::Forced)
                .unwrap()
                .into(),
            3,
        );
        run(&mut state, AtomicCommand::add_object(obj("b"), Precondition::Forced).unwrap().into(), 4);
        state
    }

    #[test]
    fn test_safe_remove_then_repeat_then_forced() {
        let mut state = seeded();
        let rev_b = state.revision_of(&obj("b"));
        assert_eq!(rev_b, Revision::new(4));

        let remove: Command = AtomicCommand::remove_object(obj("b"), Precondition::Safe(rev_b))
            .unwrap()
            .into();
        match run(&mut state, remove.clone(), 5) {
            Evaluation::Events(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].kind, EventKind::RemoveObject);
                assert_eq!(events[0].old_revision, Revision::new(4));
                assert!(!events[0].in_transaction);
            }
            other => panic!("expected events, got {other:?}"),
        }

        assert!(matches!(run(&mut state, remove, 6), Evaluation::Failed(_)));

        let forced: Command = AtomicCommand::remove_object(obj("b"), Precondition::Forced)
            .unwrap()
            .into();
        assert_eq!(run(&mut state, forced, 6), Evaluation::NoChange);
    }

    #[test]
    fn test_safe_remove_with_stale_revision_fails() {
        let state = seeded();
        let command: Command = AtomicCommand::remove_object(obj("a"), Precondition::Safe(Revision::new(1)))
            .unwrap()
            .into();
        assert!(matches!(
            evaluate(&state, &command, Revision::new(5), &actor()),
            Evaluation::Failed(_)
        ));
    }

    #[test]
    fn test_adding_into_missing_parent_fails_even_forced() {
        let state = seeded();
        let command: Command = AtomicCommand::add_field(fld("zz", "f"), Precondition::Forced)
            .unwrap()
            .into();
        assert!(matches!(
            evaluate(&state, &command, Revision::new(5), &actor()),
            Evaluation::Failed(_)
        ));
    }

    #[test]
    fn test_forced_value_to_same_value_is_nochange() {
        let state = seeded();
        let command: Command =
            AtomicCommand::change_value(fld("a", "f"), Value::Integer(1), Precondition::Forced)
                .unwrap()
                .into();
        assert_eq!(evaluate(&state, &command, Revision::new(5), &actor()), Evaluation::NoChange);
    }

    #[test]
    fn test_transaction_fails_as_a_whole() {
        let state = seeded();
        let tx = Transaction::new(
            model(),
            vec![
                AtomicCommand::add_object(obj("c"), Precondition::Safe(Revision::NOT_EXISTING)).unwrap(),
                AtomicCommand::remove_object(obj("b"), Precondition::Safe(Revision::new(99))).unwrap(),
            ],
        )
        .unwrap();
        match evaluate(&state, &tx.into(), Revision::new(5), &actor()) {
            Evaluation::Failed(reason) => assert!(reason.starts_with("command 1")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_transaction_ordering_and_suppression() {
        let state = seeded();
        let tx = Transaction::new(
            model(),
            vec![
                AtomicCommand::add_object(obj("c"), Precondition::Forced).unwrap(),
                AtomicCommand::add_field(fld("c", "x"), Precondition::Relative(0)).unwrap(),
                AtomicCommand::add_value(fld("c", "x"), Value::from("hi"), Precondition::Relative(1))
                    .unwrap(),
                AtomicCommand::remove_field(fld("a", "f"), Precondition::Forced).unwrap(),
                AtomicCommand::remove_object(obj("a"), Precondition::Relative(3)).unwrap(),
            ],
        )
        .unwrap();

        let Evaluation::Events(events) = evaluate(&state, &tx.into(), Revision::new(5), &actor())
        else {
            panic!("transaction should apply");
        };

        let summary: Vec<(EventPhase, String)> = events
            .iter()
            .map(|e| (e.phase(), e.target.to_string()))
            .collect();
        // The field removal under `a` is suppressed by the object removal.
        assert_eq!(
            summary,
            vec![
                (EventPhase::Removal, "/r/m/a/-".to_string()),
                (EventPhase::Addition, "/r/m/c/-".to_string()),
                (EventPhase::Addition, "/r/m/c/x".to_string()),
                (EventPhase::Value, "/r/m/c/x".to_string()),
            ]
        );
        assert!(events.iter().all(|e| e.in_transaction && e.revision == Revision::new(5)));
    }

    #[test]
    fn test_relative_requires_effective_command() {
        let state = seeded();
        // Command 0 is a forced no-op (object `a` exists), so Relative(0) must fail.
        let tx = Transaction::new(
            model(),
            vec![
                AtomicCommand::add_object(obj("a"), Precondition::Forced).unwrap(),
                AtomicCommand::add_field(fld("a", "g"), Precondition::Relative(0)).unwrap(),
            ],
        )
        .unwrap();
        assert!(matches!(
            evaluate(&state, &tx.into(), Revision::new(5), &actor()),
            Evaluation::Failed(_)
        ));
    }

    /// Evaluates `commands` as one transaction at revision 5 and checks the
    /// events replay to the working copy.
    fn evaluate_replayed(state: &ModelState, commands: Vec<AtomicCommand>) -> Vec<Event> {
        let tx = Transaction::new(model(), commands).unwrap();
        let (evaluation, work) = evaluate_with_state(state, &tx.into(), Revision::new(5), &actor());
        let Evaluation::Events(events) = evaluation else {
            panic!("expected events, got {evaluation:?}");
        };
        let mut replayed = state.clone();
        replayed.apply_inline_events(&events).unwrap();
        assert_eq!(replayed, work);
        events
    }

    fn kinds(events: &[Event]) -> Vec<(EventKind, String)> {
        events
            .iter()
            .map(|e| (e.kind.clone(), e.target.to_string()))
            .collect()
    }

    #[test]
    fn test_self_cancelling_transaction_still_changes_revision() {
        let state = seeded();
        let events = evaluate_replayed(
            &state,
            vec![
                AtomicCommand::add_field(fld("b", "tmp"), Precondition::Forced).unwrap(),
                AtomicCommand::remove_field(fld("b", "tmp"), Precondition::Relative(0)).unwrap(),
            ],
        );
        assert_eq!(kinds(&events), vec![(EventKind::RemoveField, "/r/m/b/tmp".to_string())]);
        assert_eq!(events[0].old_revision, Revision::NOT_EXISTING);
        assert!(!events[0].in_transaction);
    }

    #[test]
    fn test_recreated_field_is_removed_then_added() {
        let state = seeded();
        assert_eq!(state.revision_of(&fld("a", "f")), Revision::new(3));
        let events = evaluate_replayed(
            &state,
            vec![
                AtomicCommand::remove_field(fld("a", "f"), Precondition::Safe(Revision::new(3))).unwrap(),
                AtomicCommand::add_field(fld("a", "f"), Precondition::Forced).unwrap(),
                AtomicCommand::add_value(fld("a", "f"), Value::Integer(1), Precondition::Forced)
                    .unwrap(),
            ],
        );
        assert_eq!(
            kinds(&events),
            vec![
                (EventKind::RemoveField, "/r/m/a/f".to_string()),
                (EventKind::AddField, "/r/m/a/f".to_string()),
                (EventKind::AddValue(ValueSlot::Inline(Value::Integer(1))), "/r/m/a/f".to_string()),
            ]
        );
        assert_eq!(events[0].old_revision, Revision::new(3));
    }

    #[test]
    fn test_recreated_empty_object_is_removed_then_added() {
        let state = seeded();
        let events = evaluate_replayed(
            &state,
            vec![
                AtomicCommand::remove_object(obj("b"), Precondition::Forced).unwrap(),
                AtomicCommand::add_object(obj("b"), Precondition::Forced).unwrap(),
            ],
        );
        assert_eq!(
            kinds(&events),
            vec![
                (EventKind::RemoveObject, "/r/m/b/-".to_string()),
                (EventKind::AddObject, "/r/m/b/-".to_string()),
            ]
        );
    }

    #[test]
    fn test_value_changed_back_keeps_new_revision() {
        let state = seeded();
        let events = evaluate_replayed(
            &state,
            vec![
                AtomicCommand::change_value(fld("a", "f"), Value::Integer(2), Precondition::Forced)
                    .unwrap(),
                AtomicCommand::change_value(fld("a", "f"), Value::Integer(1), Precondition::Relative(0))
                    .unwrap(),
            ],
        );
        assert_eq!(
            kinds(&events),
            vec![(EventKind::ChangeValue(ValueSlot::Inline(Value::Integer(1))), "/r/m/a/f".to_string())]
        );
    }

    #[test]
    fn test_transaction_of_forced_no_ops_is_nochange() {
        let state = seeded();
        let tx = Transaction::new(
            model(),
            vec![
                AtomicCommand::add_object(obj("a"), Precondition::Forced).unwrap(),
                AtomicCommand::remove_field(fld("b", "nope"), Precondition::Forced).unwrap(),
                AtomicCommand::change_value(fld("a", "f"), Value::Integer(1), Precondition::Forced)
                    .unwrap(),
            ],
        )
        .unwrap();
        assert_eq!(evaluate(&state, &tx.into(), Revision::new(5), &actor()), Evaluation::NoChange);
    }

    #[test]
    fn test_model_add_and_remove() {
        let mut state = ModelState::empty(model());
        let add: Command = AtomicCommand::add_model(model(), Precondition::Safe(Revision::NOT_EXISTING))
            .unwrap()
            .into();
        assert!(matches!(run(&mut state, add.clone(), 0), Evaluation::Events(_)));
        assert!(matches!(run(&mut state, add, 1), Evaluation::Failed(_)));

        let remove: Command = AtomicCommand::remove_model(model(), Precondition::Safe(Revision::FIRST))
            .unwrap()
            .into();
        match run(&mut state, remove, 1) {
            Evaluation::Events(events) => assert_eq!(events[0].kind, EventKind::RemoveModel),
            other => panic!("expected events, got {other:?}"),
        }
        assert!(!state.exists());
        assert_eq!(state.revision(), Revision::new(1));
    }

    // =========================================================================
    // Property: events reproduce direct application
    // =========================================================================

    const OBJECTS: [&str; 3] = ["a", "b", "c"];
    const FIELDS: [&str; 2] = ["x", "y"];

    #[derive(Debug, Clone)]
    struct Op {
        kind: u8,
        object: usize,
        field: usize,
        value: i64,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        (0u8..7, 0..OBJECTS.len(), 0..FIELDS.len(), 0i64..3)
            .prop_map(|(kind, object, field, value)| Op { kind, object, field, value })
    }

    fn to_command(op: &Op, precondition: Precondition) -> AtomicCommand {
        let object = obj(OBJECTS[op.object]);
        let field = fld(OBJECTS[op.object], FIELDS[op.field]);
        let value = Value::Integer(op.value);
        match op.kind {
            0 => AtomicCommand::add_object(object, precondition),
            1 => AtomicCommand::remove_object(object, precondition),
            2 => AtomicCommand::add_field(field, precondition),
            3 => AtomicCommand::remove_field(field, precondition),
            4 => AtomicCommand::add_value(field, value, precondition),
            5 => AtomicCommand::change_value(field, value, precondition),
            _ => AtomicCommand::remove_value(field, precondition),
        }
        .unwrap()
    }

    fn precondition_for(choice: u8, index: usize, rev: i64) -> Precondition {
        match choice {
            0 => Precondition::Forced,
            1 if index > 0 => Precondition::Relative((rev as usize) % index),
            _ => Precondition::Safe(Revision::new(rev)),
        }
    }

    fn build_base(ops: &[Op]) -> ModelState {
        let mut state = ModelState::empty(model());
        run(&mut state, AtomicCommand::add_model(model(), Precondition::Forced).unwrap().into(), 0);
        for (i, op) in ops.iter().enumerate() {
            run(&mut state, to_command(op, Precondition::Forced).into(), i as i64 + 1);
        }
        state
    }

    proptest! {
        #[test]
        fn prop_events_reproduce_direct_application(
            history in prop::collection::vec(op_strategy(), 0..16),
            tx_ops in prop::collection::vec((op_strategy(), 0u8..3, 0i64..8), 1..6),
        ) {
            let base = build_base(&history);
            let revision = Revision::new(history.len() as i64 + 1);
            let commands: Vec<AtomicCommand> = tx_ops
                .iter()
                .enumerate()
                .map(|(i, (op, choice, rev))| to_command(op, precondition_for(*choice, i, *rev)))
                .collect();
            let tx = Transaction::new(model(), commands).unwrap();

            let (evaluation, work) = evaluate_with_state(&base, &tx.into(), revision, &actor());
            match evaluation {
                Evaluation::Events(events) => {
                    let mut replayed = base.clone();
                    replayed.apply_inline_events(&events).unwrap();
                    prop_assert_eq!(&replayed, &work);

                    // Canonical order, no address removed or added twice, and
                    // nothing under a removal unless that entity is added back.
                    let mut sorted = events.clone();
                    sort_events(&mut sorted);
                    prop_assert_eq!(&sorted, &events);
                    let structural: Vec<(EventPhase, &Address)> = events
                        .iter()
                        .filter(|e| e.phase() != EventPhase::Value)
                        .map(|e| (e.phase(), &e.target))
                        .collect();
                    for (i, a) in structural.iter().enumerate() {
                        for b in &structural[i + 1..] {
                            prop_assert_ne!(a, b);
                        }
                    }
                    for removed in events.iter().filter(|e| e.phase() == EventPhase::Removal) {
                        let added_back = events.iter().any(|e| {
                            e.phase() == EventPhase::Addition && e.target == removed.target
                        });
                        if !added_back {
                            prop_assert!(!events.iter().any(|e| removed.target.contains(&e.target)));
                        }
                    }
                }
                Evaluation::NoChange => prop_assert_eq!(&base, &work),
                Evaluation::Failed(_) => {}
            }
        }
    }
}
