#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use revstore::{
    ActorId, Address, AtomicCommand, Backend, ChangeStatus, Command, CommandOutcome, Database,
    Engine, EngineConfig, MemoryBackend, Precondition, Revision, SqliteBackend, StrategyKind,
    Value,
};

pub fn addr(text: &str) -> Address {
    Address::parse(text).expect("valid address")
}

pub fn actor(name: &str) -> ActorId {
    ActorId::new(name)
}

/// Short timeouts so stalled-predecessor paths finish quickly.
pub fn fast_config(strategy: StrategyKind) -> EngineConfig {
    EngineConfig {
        change_timeout: Duration::from_millis(500),
        wait_initial: Duration::from_millis(1),
        wait_max: Duration::from_millis(10),
        execution_budget: Duration::from_millis(400),
        strategy,
        workers: 4,
        ..EngineConfig::default()
    }
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn memory_backend() -> Arc<dyn Backend> {
    Arc::new(MemoryBackend::new())
}

pub fn sqlite_backend(path: &PathBuf) -> Arc<dyn Backend> {
    Arc::new(SqliteBackend::open(path).expect("open sqlite backend"))
}

pub fn engine_on(backend: Arc<dyn Backend>, strategy: StrategyKind) -> Engine {
    Engine::new(backend, fast_config(strategy)).expect("engine")
}

pub fn forced(command: revstore::Result<AtomicCommand>) -> Command {
    command.expect("valid command").into()
}

pub fn run(engine: &mut Engine, command: impl Into<Command>) -> CommandOutcome {
    engine
        .execute_command(&command.into(), &actor("test"))
        .expect("execute command")
}

/// Creates `/r/m` with objects `ids`, each with a field `f` holding 0.
pub fn seed_model(engine: &mut Engine, ids: &[&str]) {
    let model = addr("/r/m");
    run(engine, forced(AtomicCommand::add_model(model, Precondition::Forced)));
    for id in ids {
        let object = addr(&format!("/r/m/{id}"));
        let field = addr(&format!("/r/m/{id}/f"));
        run(engine, forced(AtomicCommand::add_object(object, Precondition::Forced)));
        run(engine, forced(AtomicCommand::add_field(field.clone(), Precondition::Forced)));
        run(
            engine,
            forced(AtomicCommand::add_value(field, Value::Integer(0), Precondition::Forced)),
        );
    }
}

/// Asserts revisions `0..n` are present, contiguous and committed.
pub fn assert_ledger_gap_free(engine: &Engine, model: &Address) -> Vec<ChangeStatus> {
    let records = engine.ledger(model).unwrap().records().unwrap();
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.revision, Revision::new(i as i64), "gap in ledger");
        assert!(
            record.status.is_committed(),
            "revision {} left in {:?}",
            record.revision,
            record.status
        );
    }
    records.into_iter().map(|r| r.status).collect()
}
