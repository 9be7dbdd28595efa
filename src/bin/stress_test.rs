//! RevStore Stress Test Binary
//!
//! Drives many concurrent workers against one SQLite file and verifies the
//! ledger invariants afterwards.
//! Run with: `cargo run --bin stress_test -- [OPTIONS]`
//!
//! Every task increments counters with safe (revision-checked) value
//! changes and retries when a peer got there first, so the final counter
//! sum must equal the number of successful increments exactly.
//!
//! # Examples
//!
//! ```bash
//! # Default: 8 counters, 400 increments, 8 workers
//! cargo run --release --bin stress_test
//!
//! # Everyone on one counter
//! cargo run --release --bin stress_test -- --counters 1 --increments 200
//!
//! # Snapshot replay strategy
//! RUST_LOG=revstore=debug cargo run --bin stress_test -- --strategy snapshot
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use revstore::{
    ActorId, Address, AtomicCommand, ChangeLedger, ChangeStatus, CommandOutcome, EngineConfig,
    Precondition, Revision, RevStore, SqliteBackend, StrategyKind, Transaction, Value,
};
use tracing_subscriber::EnvFilter;

/// Stress test configuration
struct Config {
    /// Number of counter objects
    counters: usize,
    /// Total successful increments to perform
    increments: usize,
    /// Number of concurrent tasks and workers
    concurrency: usize,
    strategy: StrategyKind,
    /// Path to database file (or temp if None)
    db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            counters: 8,
            increments: 400,
            concurrency: 8,
            strategy: StrategyKind::Direct,
            db_path: None,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--counters" | "-n" => {
                i += 1;
                config.counters = args[i].parse().expect("Invalid --counters value");
            }
            "--increments" | "-i" => {
                i += 1;
                config.increments = args[i].parse().expect("Invalid --increments value");
            }
            "--concurrency" | "-c" => {
                i += 1;
                config.concurrency = args[i].parse().expect("Invalid --concurrency value");
            }
            "--strategy" => {
                i += 1;
                config.strategy = StrategyKind::parse(&args[i]).expect("Invalid --strategy value");
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = Some(args[i].clone());
            }
            "--help" | "-h" => {
                println!(
                    r#"RevStore Stress Test

Usage: stress_test [OPTIONS]

Options:
  -n, --counters <N>     Number of counter objects (default: 8)
  -i, --increments <N>   Total increments (default: 400)
  -c, --concurrency <N>  Concurrent tasks and workers (default: 8)
  --strategy <S>         direct | snapshot (default: direct)
  -d, --db <PATH>        Database path (default: temp file)
  -h, --help             Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn counter_field(model: &Address, counter: usize) -> Address {
    model
        .child(&format!("counter{counter}"))
        .and_then(|object| object.child("value"))
        .expect("valid counter address")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = parse_args();

    println!("RevStore Stress Test");
    println!("====================");
    println!("Counters:    {}", config.counters);
    println!("Increments:  {}", config.increments);
    println!("Concurrency: {}", config.concurrency);
    println!("Strategy:    {:?}", config.strategy);
    println!();

    let temp_dir = std::env::temp_dir().join(format!("revstore-stress-{}", std::process::id()));
    std::fs::create_dir_all(&temp_dir).expect("create temp dir");
    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| temp_dir.join("stress.db").to_string_lossy().to_string());

    println!("Database:    {}", db_path);
    println!();

    let engine_config = EngineConfig {
        workers: config.concurrency,
        strategy: config.strategy,
        ..EngineConfig::from_env().expect("valid REVSTORE_* environment")
    };
    let store = RevStore::open(&db_path, engine_config).await.unwrap();
    let model = Address::model("stress", "counters").unwrap();

    // Setup: the model and zeroed counters in one transaction.
    store
        .execute(
            AtomicCommand::add_model(model.clone(), Precondition::Forced).unwrap(),
            ActorId::new("setup"),
        )
        .await
        .unwrap();
    let mut setup = Vec::new();
    for counter in 0..config.counters {
        let field = counter_field(&model, counter);
        let object = field.object_address().expect("field has an object");
        setup.push(AtomicCommand::add_object(object, Precondition::Forced).unwrap());
        setup.push(AtomicCommand::add_field(field.clone(), Precondition::Forced).unwrap());
        setup.push(AtomicCommand::add_value(field, Value::Integer(0), Precondition::Forced).unwrap());
    }
    store
        .execute(Transaction::new(model.clone(), setup).unwrap(), ActorId::new("setup"))
        .await
        .unwrap();

    // Metrics
    let succeeded = Arc::new(AtomicU64::new(0));
    let retries = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    println!("Starting stress test...");
    let start = Instant::now();

    let mut handles = Vec::new();
    let per_task = config.increments / config.concurrency;

    for task_id in 0..config.concurrency {
        let store = store.clone();
        let model = model.clone();
        let succeeded = succeeded.clone();
        let retries = retries.clone();
        let errors = errors.clone();
        let counters = config.counters;

        let handle = tokio::spawn(async move {
            let actor = ActorId::new(format!("task-{task_id}"));
            for i in 0..per_task {
                let field = counter_field(&model, (task_id + i) % counters);
                loop {
                    let snapshot = match store.snapshot(model.clone()).await {
                        Ok(snapshot) => snapshot,
                        Err(_) => {
                            errors.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                    };
                    let current = match snapshot.value_at(&field) {
                        Some(Value::Integer(n)) => *n,
                        _ => 0,
                    };
                    let command = AtomicCommand::change_value(
                        field.clone(),
                        Value::Integer(current + 1),
                        Precondition::Safe(snapshot.revision_of(&field)),
                    )
                    .unwrap();

                    match store.execute(command, actor.clone()).await {
                        Ok(CommandOutcome::Executed(_)) => {
                            succeeded.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        Ok(_) => {
                            retries.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            errors.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let elapsed = start.elapsed();
    let final_state = store.snapshot(model.clone()).await.unwrap();
    store.shutdown().await;

    let succeeded = succeeded.load(Ordering::Relaxed);
    let retry_count = retries.load(Ordering::Relaxed);
    let error_count = errors.load(Ordering::Relaxed);

    println!();
    println!("Results");
    println!("-------");
    println!("Increments:      {}", succeeded);
    println!("Retries:         {}", retry_count);
    println!("Errors:          {}", error_count);
    println!("Duration:        {:?}", elapsed);
    println!(
        "Throughput:      {:.2} changes/sec",
        succeeded as f64 / elapsed.as_secs_f64()
    );
    println!();

    // Verify invariants
    println!("Verifying invariants...");
    assert_eq!(error_count, 0, "{} commands returned errors", error_count);

    let backend = Arc::new(SqliteBackend::open(&db_path).unwrap());
    let ledger = ChangeLedger::new(backend, model.clone());
    let records = ledger.records().unwrap();

    for (i, record) in records.iter().enumerate() {
        assert_eq!(
            record.revision,
            Revision::new(i as i64),
            "Gap in ledger: expected revision {}, got {}",
            i,
            record.revision
        );
        assert!(
            record.status.is_committed(),
            "Revision {} left in {:?}",
            record.revision,
            record.status
        );
    }
    println!("  Ledger:            {} revisions, gapless, all terminal ✓", records.len());

    let executed = records
        .iter()
        .filter(|r| r.status == ChangeStatus::SuccessExecuted)
        .count() as u64;
    // Two setup changes plus one per increment.
    assert_eq!(executed, succeeded + 2, "Executed changes don't match increments");
    println!("  Executed changes:  {} ✓", executed);

    let total: i64 = (0..config.counters)
        .map(|counter| match final_state.value_at(&counter_field(&model, counter)) {
            Some(Value::Integer(n)) => *n,
            _ => 0,
        })
        .sum();
    assert_eq!(total as u64, succeeded, "Lost update: counters sum to {}", total);
    println!("  Counters:          sum {} matches increments ✓", total);

    println!();
    println!("Stress test PASSED ✓");
}
