//! Recovery of changes whose worker went silent.
//!
//! A "crashed" worker is simulated by driving the ledger by hand: reserve a
//! revision, optionally save its events, then never touch it again. The
//! engine under test runs on a [`ManualClock`] so timeouts pass instantly.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    actor, addr, assert_ledger_gap_free, create_temp_db_file, fast_config, forced, memory_backend,
    run, seed_model, sqlite_backend,
};
use revstore::delta::{self, Evaluation};
use revstore::storage::EntityStore;
use revstore::{
    apply, AtomicCommand, Backend, ChangeStatus, Clock, Command, CommandOutcome, Engine,
    EngineConfig, LockSet, ManualClock, Precondition, Revision, StrategyKind, Value,
};

const START_MS: u64 = 1_000_000;

fn engine_with_clock(backend: Arc<dyn Backend>, clock: &Arc<ManualClock>) -> Engine {
    Engine::with_clock(backend, fast_config(StrategyKind::Direct), clock.clone()).unwrap()
}

/// Reserves a change for `command` and saves its events, then abandons it.
fn crash_after_saving_events(engine: &Engine, command: &Command, owner: u64, now_ms: u64) -> Revision {
    let model = command.model_address().unwrap();
    let ledger = engine.ledger(&model).unwrap();
    let record = ledger
        .reserve(LockSet::for_command(command), &actor("crashed"), owner, now_ms)
        .unwrap();

    let base = engine.snapshot(&model).unwrap();
    let Evaluation::Events(events) = delta::evaluate(&base, command, record.revision, &actor("crashed")) else {
        panic!("crashed change should produce events");
    };
    assert!(ledger
        .save_events(record.revision, owner, events, Vec::new(), now_ms)
        .unwrap());
    record.revision
}

fn crashed_change_is_rolled_forward(backend: Arc<dyn Backend>) {
    let clock = Arc::new(ManualClock::new(START_MS));
    let mut engine = engine_with_clock(backend, &clock);
    seed_model(&mut engine, &["a"]);

    let crashed_cmd = forced(AtomicCommand::change_value(
        addr("/r/m/a/f"),
        Value::Integer(7),
        Precondition::Forced,
    ));
    let crashed = crash_after_saving_events(&engine, &crashed_cmd, 77, clock.now_ms());
    clock.advance(Duration::from_secs(1));

    // Safe against the crashed revision: only passes if it was applied first.
    let next = forced(AtomicCommand::change_value(
        addr("/r/m/a/f"),
        Value::Integer(9),
        Precondition::Safe(crashed),
    ));
    assert_eq!(run(&mut engine, next), CommandOutcome::Executed(crashed.next()));

    let ledger = engine.ledger(&addr("/r/m")).unwrap();
    let record = ledger.load(crashed).unwrap().unwrap();
    assert_eq!(record.status, ChangeStatus::SuccessExecuted);
    assert_ne!(record.owner, 77, "roll-forward takes over ownership");

    let events = engine.events_since(&addr("/r/m"), crashed.prev()).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(
        engine.snapshot(&addr("/r/m")).unwrap().value_at(&addr("/r/m/a/f")),
        Some(&Value::Integer(9))
    );
    assert_ledger_gap_free(&engine, &addr("/r/m"));
}

#[test]
fn crashed_executing_change_is_rolled_forward_in_memory() {
    crashed_change_is_rolled_forward(memory_backend());
}

#[test]
fn crashed_executing_change_is_rolled_forward_on_sqlite() {
    let (_dir, path) = create_temp_db_file("rollforward.db");
    crashed_change_is_rolled_forward(sqlite_backend(&path));
}

#[test]
fn stalled_creating_change_is_failed_and_skipped() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let mut engine = engine_with_clock(memory_backend(), &clock);
    seed_model(&mut engine, &["a"]);

    let stalled_cmd = forced(AtomicCommand::remove_object(addr("/r/m/a"), Precondition::Forced));
    let stalled = engine
        .ledger(&addr("/r/m"))
        .unwrap()
        .reserve(LockSet::for_command(&stalled_cmd), &actor("silent"), 5, clock.now_ms())
        .unwrap();
    clock.advance(Duration::from_secs(1));

    let change = forced(AtomicCommand::change_value(
        addr("/r/m/a/f"),
        Value::Integer(1),
        Precondition::Forced,
    ));
    assert_eq!(run(&mut engine, change), CommandOutcome::Executed(stalled.revision.next()));

    let statuses = assert_ledger_gap_free(&engine, &addr("/r/m"));
    assert_eq!(statuses[stalled.revision.as_raw() as usize], ChangeStatus::FailedTimeout);
    // The stalled removal never happened.
    assert!(engine.snapshot(&addr("/r/m")).unwrap().contains(&addr("/r/m/a")));
}

#[test]
fn partially_applied_change_is_reapplied_harmlessly() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let mut engine = engine_with_clock(memory_backend(), &clock);
    seed_model(&mut engine, &["a", "b"]);

    let remove_a = forced(AtomicCommand::remove_object(addr("/r/m/a"), Precondition::Forced));
    let crashed = crash_after_saving_events(&engine, &remove_a, 3, clock.now_ms());

    // The worker got as far as writing the entities, then died before commit.
    let record = engine.ledger(&addr("/r/m")).unwrap().load(crashed).unwrap().unwrap();
    let store = EntityStore::new(engine.backend().clone());
    apply::apply_events(&store, &addr("/r/m"), crashed, &record.events).unwrap();
    clock.advance(Duration::from_secs(1));

    let remove_model = forced(AtomicCommand::remove_model(addr("/r/m"), Precondition::Safe(crashed)));
    assert_eq!(run(&mut engine, remove_model), CommandOutcome::Executed(crashed.next()));

    let record = engine.ledger(&addr("/r/m")).unwrap().load(crashed).unwrap().unwrap();
    assert_eq!(record.status, ChangeStatus::SuccessExecuted);
    let snapshot = engine.snapshot(&addr("/r/m")).unwrap();
    assert!(!snapshot.exists());
    assert_eq!(snapshot.revision(), crashed.next());
}

#[test]
fn voluntary_timeout_then_recovery() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let config = EngineConfig {
        execution_budget: Duration::from_millis(50),
        ..fast_config(StrategyKind::Direct)
    };
    let mut engine = Engine::with_clock(memory_backend(), config, clock.clone()).unwrap();
    seed_model(&mut engine, &["a"]);

    let blocker = forced(AtomicCommand::remove_field(addr("/r/m/a/f"), Precondition::Forced));
    let stalled = engine
        .ledger(&addr("/r/m"))
        .unwrap()
        .reserve(LockSet::for_command(&blocker), &actor("silent"), 11, clock.now_ms())
        .unwrap();

    let change = forced(AtomicCommand::change_value(
        addr("/r/m/a/f"),
        Value::Integer(3),
        Precondition::Forced,
    ));
    // The predecessor is not yet timed out when our budget runs out.
    assert_eq!(run(&mut engine, change.clone()), CommandOutcome::Failed);

    clock.advance(Duration::from_secs(1));
    let outcome = run(&mut engine, change);
    let retried = stalled.revision.next().next();
    assert_eq!(outcome, CommandOutcome::Executed(retried));

    let statuses = assert_ledger_gap_free(&engine, &addr("/r/m"));
    assert_eq!(
        &statuses[stalled.revision.as_raw() as usize..],
        &[
            ChangeStatus::FailedTimeout,
            ChangeStatus::FailedTimeout,
            ChangeStatus::SuccessExecuted,
        ]
    );
    assert_eq!(
        engine.snapshot(&addr("/r/m")).unwrap().value_at(&addr("/r/m/a/f")),
        Some(&Value::Integer(3))
    );
}

#[test]
fn budget_must_end_before_peers_may_take_over() {
    let config = EngineConfig {
        execution_budget: Duration::from_secs(1),
        change_timeout: Duration::from_secs(1),
        ..fast_config(StrategyKind::Direct)
    };
    let err = Engine::new(memory_backend(), config).unwrap_err();
    assert!(matches!(err, revstore::Error::Config(_)), "{err:?}");
}

#[test]
fn owner_out_of_budget_leaves_saved_events_to_peers() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let mut engine = engine_with_clock(memory_backend(), &clock);
    seed_model(&mut engine, &["a"]);

    let command = forced(AtomicCommand::change_value(
        addr("/r/m/a/f"),
        Value::Integer(4),
        Precondition::Forced,
    ));
    let saved = crash_after_saving_events(&engine, &command, 21, clock.now_ms());
    let record = engine.ledger(&addr("/r/m")).unwrap().load(saved).unwrap().unwrap();

    // The owner resumes with its budget already spent: nothing is written.
    let store = EntityStore::new(engine.backend().clone());
    let lease = apply::Lease {
        clock: clock.as_ref(),
        owner: 21,
        deadline_ms: clock.now_ms(),
        renew_every_ms: 1,
    };
    let ledger = engine.ledger(&addr("/r/m")).unwrap();
    assert!(!apply::apply_and_commit(&store, &ledger, saved, &record.events, &lease).unwrap());
    assert_eq!(ledger.load(saved).unwrap().unwrap().status, ChangeStatus::Executing);

    clock.advance(Duration::from_secs(1));
    let next = forced(AtomicCommand::change_value(
        addr("/r/m/a/f"),
        Value::Integer(5),
        Precondition::Safe(saved),
    ));
    assert_eq!(run(&mut engine, next), CommandOutcome::Executed(saved.next()));
    assert_eq!(ledger.load(saved).unwrap().unwrap().status, ChangeStatus::SuccessExecuted);
    assert_ledger_gap_free(&engine, &addr("/r/m"));
}
