//! # Async API for RevStore
//!
//! [`Engine`] is synchronous: waiting for a predecessor sleeps the calling
//! thread. This module runs a pool of engines on dedicated OS threads and
//! lets async code talk to them over channels.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Tokio Runtime                             │
//! │  task1 ─┐                                                    │
//! │  task2 ─┼── tokio::sync::mpsc ──┐        oneshot replies     │
//! │  task3 ─┘     (async send)      │            ▲               │
//! └─────────────────────────────────┼────────────┼───────────────┘
//!                                   ▼            │
//!        ┌──────────────┬──────────────┬──────────────┐
//!        │  Worker 0    │  Worker 1    │  Worker N    │  ← std::thread
//!        │  Engine      │  Engine      │  Engine      │
//!        │  (own conn)  │  (own conn)  │  (own conn)  │
//!        └──────┬───────┴──────┬───────┴──────┬───────┘
//!               └──────────────┼──────────────┘
//!                              ▼
//!                     ┌─────────────────┐
//!                     │  SQLite (WAL)   │
//!                     └─────────────────┘
//! ```
//!
//! Workers share nothing but the backend: each owns its engine, and with
//! SQLite its own connection. They coordinate exactly like independent
//! processes would, through the change ledger.
//!
//! ## Rust Concepts
//!
//! - **tokio::sync::mpsc**: one request queue, workers compete for requests
//! - **tokio::sync::oneshot**: single-use reply channel per request
//! - **blocking_recv**: lets a plain thread receive from an async channel

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use crate::backend::{Backend, MemoryBackend};
use crate::command::Command;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::schema::SqliteBackend;
use crate::state::ModelState;
use crate::types::{ActorId, Address, CommandOutcome, Revision};

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 4096;

// =============================================================================
// Requests
// =============================================================================

enum Request {
    Execute {
        command: Command,
        actor: ActorId,
        response: oneshot::Sender<Result<CommandOutcome>>,
    },
    Snapshot {
        model: Address,
        response: oneshot::Sender<Result<ModelState>>,
    },
    CurrentRevision {
        model: Address,
        response: oneshot::Sender<Result<Revision>>,
    },
    EventsSince {
        model: Address,
        revision: Revision,
        response: oneshot::Sender<Result<Vec<Event>>>,
    },
    Shutdown,
}

fn run_worker(mut engine: Engine, rx: Arc<std::sync::Mutex<mpsc::Receiver<Request>>>) {
    loop {
        let request = {
            let Ok(mut guard) = rx.lock() else {
                break;
            };
            guard.blocking_recv()
        };

        match request {
            Some(Request::Execute {
                command,
                actor,
                response,
            }) => {
                let _ = response.send(engine.execute_command(&command, &actor));
            }
            Some(Request::Snapshot { model, response }) => {
                let _ = response.send(engine.snapshot(&model));
            }
            Some(Request::CurrentRevision { model, response }) => {
                let _ = response.send(engine.current_revision(&model));
            }
            Some(Request::EventsSince {
                model,
                revision,
                response,
            }) => {
                let _ = response.send(engine.events_since(&model, revision));
            }
            Some(Request::Shutdown) | None => break,
        }
    }
    debug!("worker stopped");
}

// =============================================================================
// RevStore
// =============================================================================

/// Where workers get their backend from.
enum BackendSource {
    /// Each worker opens its own connection to this file.
    Sqlite(PathBuf),
    /// All workers share one in-memory backend.
    Memory(Arc<MemoryBackend>),
}

impl BackendSource {
    fn backend(&self) -> Result<Arc<dyn Backend>> {
        Ok(match self {
            BackendSource::Sqlite(path) => Arc::new(SqliteBackend::open(path)?),
            BackendSource::Memory(backend) => backend.clone(),
        })
    }
}

/// The async handle to a pool of engine workers.
///
/// # Thread Safety
///
/// `RevStore` is `Clone`, `Send` and `Sync`; all clones talk to the same
/// workers.
#[derive(Clone)]
pub struct RevStore {
    request_tx: mpsc::Sender<Request>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    worker_count: usize,
}

impl RevStore {
    /// Opens or creates a store at `path` with `config.workers` workers.
    ///
    /// ```rust,ignore
    /// let store = RevStore::open("models.db", EngineConfig::from_env()?).await?;
    /// ```
    pub async fn open<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        Self::start(BackendSource::Sqlite(path.as_ref().to_path_buf()), config)
    }

    /// A store on a fresh in-memory backend, for tests.
    pub async fn in_memory(config: EngineConfig) -> Result<Self> {
        Self::start(BackendSource::Memory(Arc::new(MemoryBackend::new())), config)
    }

    fn start(source: BackendSource, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let worker_count = config.workers;

        // Engines are built up front so an open error reaches the caller.
        let engines = (0..worker_count)
            .map(|_| Engine::new(source.backend()?, config.clone()))
            .collect::<Result<Vec<_>>>()?;

        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        // Workers compete for the receiver (simple load balancing).
        let request_rx = Arc::new(std::sync::Mutex::new(request_rx));

        let mut handles = Vec::with_capacity(worker_count);
        for (i, engine) in engines.into_iter().enumerate() {
            let rx = Arc::clone(&request_rx);
            let handle = thread::Builder::new()
                .name(format!("revstore-worker-{i}"))
                .spawn(move || run_worker(engine, rx))?;
            handles.push(handle);
        }

        info!(workers = worker_count, strategy = ?config.strategy, "revstore started");
        Ok(Self {
            request_tx,
            workers: Arc::new(Mutex::new(handles)),
            worker_count,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> Request) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::WorkerShutdown)?;
        response_rx.await.map_err(|_| Error::WorkerShutdown)?
    }

    /// Executes a command on the next free worker.
    pub async fn execute(&self, command: impl Into<Command>, actor: ActorId) -> Result<CommandOutcome> {
        let command = command.into();
        self.request(|response| Request::Execute {
            command,
            actor,
            response,
        })
        .await
    }

    /// The materialized current state of a model.
    pub async fn snapshot(&self, model: Address) -> Result<ModelState> {
        self.request(|response| Request::Snapshot { model, response })
            .await
    }

    pub async fn current_revision(&self, model: Address) -> Result<Revision> {
        self.request(|response| Request::CurrentRevision { model, response })
            .await
    }

    pub async fn events_since(&self, model: Address, revision: Revision) -> Result<Vec<Event>> {
        self.request(|response| Request::EventsSince {
            model,
            revision,
            response,
        })
        .await
    }

    /// Stops all workers after the requests queued before this call.
    ///
    /// Other clones fail with [`Error::WorkerShutdown`] afterwards.
    pub async fn shutdown(self) {
        for _ in 0..self.worker_count {
            let _ = self.request_tx.send(Request::Shutdown).await;
        }

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AtomicCommand, Precondition};

    fn config(workers: usize) -> EngineConfig {
        EngineConfig {
            workers,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_execute_and_snapshot() {
        let store = RevStore::in_memory(config(2)).await.unwrap();
        let model = Address::model("r", "m").unwrap();

        let outcome = store
            .execute(
                AtomicCommand::add_model(model.clone(), Precondition::Forced).unwrap(),
                ActorId::new("alice"),
            )
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Executed(Revision::FIRST));
        assert!(store.snapshot(model.clone()).await.unwrap().exists());
        assert_eq!(store.current_revision(model).await.unwrap(), Revision::FIRST);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let store = RevStore::in_memory(config(1)).await.unwrap();
        let clone = store.clone();
        store.shutdown().await;

        let err = clone
            .snapshot(Address::model("r", "m").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerShutdown));
    }

    #[tokio::test]
    async fn test_sqlite_workers_open_own_connections() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RevStore::open(dir.path().join("rev.db"), config(3)).await.unwrap();
        assert_eq!(store.worker_count(), 3);
        store.shutdown().await;
    }
}
