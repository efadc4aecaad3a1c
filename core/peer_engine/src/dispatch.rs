//! Command resolution and ordered execution
//!
//! ```text
//! Data ──► unpack ──► CommandRegistry::resolve(id) ──► ExecutionQueue::enqueue
//!                                                         │
//!                          ┌──────────────────────────────┼───────────────┐
//!                          ▼                              ▼               ▼
//!                    worker "alice"                 worker "bob"        ...
//!                   (FIFO, one at a time)
//! ```
//!
//! Commands from one peer run strictly in arrival order; different peers run
//! concurrently on their own workers.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::package::Package;

// ============================================================================
// Commands
// ============================================================================

/// Arguments handed to a command handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandArgs {
    /// Identity of the sending peer
    pub peer_id: String,
    pub package: Package,
    pub raw_data: Option<Vec<u8>>,
}

/// Handler for one command id
pub trait Command: Send + Sync {
    fn run(&self, args: CommandArgs);
}

/// Maps command ids to handlers
pub trait CommandRegistry: Send + Sync {
    fn resolve(&self, id: u64) -> Option<Arc<dyn Command>>;
}

/// Runs resolved commands
pub trait ExecutionQueue: Send + Sync {
    /// Queue a command; commands for the same `peer_id` run in call order
    fn enqueue(&self, peer_id: &str, command: Arc<dyn Command>, args: CommandArgs);

    /// Stop accepting work (engine disposal)
    fn close(&self) {}
}

// ============================================================================
// Command Map
// ============================================================================

/// [`CommandRegistry`] backed by a hash map
#[derive(Default)]
pub struct CommandMap {
    commands: HashMap<u64, Arc<dyn Command>>,
}

impl CommandMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `id`
    pub fn register(&mut self, id: impl Into<u64>, command: Arc<dyn Command>) {
        self.commands.insert(id.into(), command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl CommandRegistry for CommandMap {
    fn resolve(&self, id: u64) -> Option<Arc<dyn Command>> {
        self.commands.get(&id).cloned()
    }
}

// ============================================================================
// Request Queue
// ============================================================================

type Job = (Arc<dyn Command>, CommandArgs);

struct Worker {
    sender: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

/// [`ExecutionQueue`] with one worker thread per peer identity
///
/// A panicking command is caught and logged; the worker keeps serving the
/// rest of that peer's queue.
pub struct RequestQueue {
    workers: Mutex<HashMap<String, Worker>>,
    closed: AtomicBool,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of peers with a live worker
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn spawn_worker(peer_id: &str) -> std::io::Result<Worker> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let name = peer_id.to_string();

        let handle = thread::Builder::new()
            .name(format!("peer-queue-{}", peer_id))
            .spawn(move || {
                for (command, args) in receiver {
                    let id = args.package.id;
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| command.run(args)))
                    {
                        log::error!(
                            "Command 0x{:X} from '{}' panicked: {}",
                            id,
                            name,
                            panic_message(payload.as_ref())
                        );
                    }
                }
                log::trace!("Request worker for '{}' stopped", name);
            })?;

        Ok(Worker { sender, handle })
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionQueue for RequestQueue {
    fn enqueue(&self, peer_id: &str, command: Arc<dyn Command>, args: CommandArgs) {
        if self.closed.load(Ordering::Acquire) {
            log::debug!("Request queue closed, dropping command from '{}'", peer_id);
            return;
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        let job = match workers.get(peer_id) {
            Some(worker) => match worker.sender.send((command, args)) {
                Ok(()) => return,
                // Worker is gone, respawn below with the same job
                Err(mpsc::SendError(job)) => job,
            },
            None => (command, args),
        };

        match Self::spawn_worker(peer_id) {
            Ok(worker) => {
                // The receiver was just created, so this cannot fail
                let _ = worker.sender.send(job);
                workers.insert(peer_id.to_string(), worker);
            }
            Err(e) => {
                log::error!("Failed to spawn request worker for '{}': {}", peer_id, e);
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let workers: Vec<Worker> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, worker)| worker)
            .collect();

        let current = thread::current().id();
        for Worker { sender, handle } in workers {
            drop(sender);
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        log::debug!("Request queue closed");
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.close();
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
