//! Worker pool: thread lifecycle, actor placement, load balancing.
//!
//! The pool owns the shared half of every worker (inbox, triage queue,
//! parker, stealer) plus the thread handles. Newly spawned actors are
//! bound to a worker round-robin, or to the spawner's worker when an
//! affinity hint is given.
//!
//! Balancing is soft: every load period the balancer compares per-worker
//! dispatch deltas and, when the spread is wide, republishes one busy
//! actor's preferred worker. The single-runner claim makes the handoff
//! safe without draining anything; in-flight wakeups simply finish
//! where they are.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_deque::{Stealer, Worker as WorkDeque};

use crate::actor::{Actor, TriageQueue};
use crate::memory::{MemoryPool, DEFAULT_BLOCK_SIZE};
use crate::node::NodeCore;
use crate::worker::{Worker, WorkerShared};

/// Minimum dispatch-delta spread before the balancer moves an actor.
const BALANCE_THRESHOLD: u64 = 128;

/// Parts handed to a worker thread at startup.
struct WorkerParts {
    deque: WorkDeque<Arc<Actor>>,
    outbound: MemoryPool,
    ephemeral: MemoryPool,
}

/// Shared scheduler state for all workers of one node.
pub(crate) struct WorkerPool {
    shared: Vec<Arc<WorkerShared>>,
    stealers: Arc<Vec<Stealer<Arc<Actor>>>>,
    parts: Mutex<Vec<Option<WorkerParts>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    round_robin: AtomicUsize,
    auto_scaling: bool,
    /// Previous per-worker dispatch counts; the balancer's own lock.
    balance: Mutex<Vec<u64>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.shared.len())
            .field("auto_scaling", &self.auto_scaling)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub(crate) fn new(worker_count: usize, auto_scaling: bool) -> Self {
        let mut shared = Vec::with_capacity(worker_count);
        let mut stealers = Vec::with_capacity(worker_count);
        let mut parts = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let deque = WorkDeque::new_lifo();
            stealers.push(deque.stealer());
            shared.push(Arc::new(WorkerShared::new(index)));

            let mut outbound = MemoryPool::new("worker-outbound", DEFAULT_BLOCK_SIZE);
            outbound.enable_normalization();
            let mut ephemeral = MemoryPool::new("worker-ephemeral", DEFAULT_BLOCK_SIZE);
            ephemeral.disable_tracking();

            parts.push(Some(WorkerParts {
                deque,
                outbound,
                ephemeral,
            }));
        }

        Self {
            shared,
            stealers: Arc::new(stealers),
            parts: Mutex::new(parts),
            handles: Mutex::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
            auto_scaling,
            balance: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker threads. Called once, from `Node::run`.
    pub(crate) fn start(&self, node: &Arc<NodeCore>) {
        let mut parts = self.parts.lock().expect("worker parts lock poisoned");
        let mut handles = self.handles.lock().expect("worker handles lock poisoned");
        for (index, slot) in parts.iter_mut().enumerate() {
            let Some(WorkerParts {
                deque,
                outbound,
                ephemeral,
            }) = slot.take()
            else {
                continue;
            };
            let worker = Worker::new(
                Arc::clone(&self.shared[index]),
                deque,
                Arc::clone(&self.stealers),
                Arc::clone(node),
                outbound,
                ephemeral,
            );
            let handle = std::thread::Builder::new()
                .name(format!("argon-worker-{index}"))
                .spawn(move || worker.run())
                .expect("spawn worker thread");
            handles.push(handle);
        }
    }

    /// Wakes everyone and joins the threads. The node sets its shutdown
    /// flag first; workers exit when idle.
    pub(crate) fn stop(&self) {
        self.wake_all();
        let mut handles = self.handles.lock().expect("worker handles lock poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    pub(crate) fn wake_all(&self) {
        for shared in &self.shared {
            shared.parker.wake();
        }
    }

    /// Binds a fresh actor to a worker: affinity hint first, otherwise
    /// round-robin.
    pub(crate) fn assign(&self, actor: &Actor, hint: Option<usize>) {
        let index = match hint {
            Some(worker) => worker % self.shared.len(),
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % self.shared.len(),
        };
        actor.set_preferred_worker(index);
    }

    /// Puts a ready actor on its preferred worker and wakes it.
    pub(crate) fn schedule(&self, actor: Arc<Actor>) {
        let index = actor.preferred_worker() % self.shared.len();
        let shared = &self.shared[index];
        shared.inbox.push(actor);
        shared.parker.wake();
    }

    #[must_use]
    pub(crate) fn worker_count(&self) -> usize {
        self.shared.len()
    }

    #[must_use]
    pub(crate) fn triage(&self, index: usize) -> &TriageQueue {
        &self.shared[index].triage
    }

    /// Per-worker dispatch totals, for the load report.
    #[must_use]
    pub(crate) fn processed(&self) -> Vec<u64> {
        self.shared
            .iter()
            .map(|s| s.processed.load(Ordering::Relaxed))
            .collect()
    }

    /// One balancing round. No-op unless `-auto-scaling` was given.
    pub(crate) fn balance(&self, node: &NodeCore) {
        if !self.auto_scaling || self.shared.len() < 2 {
            return;
        }
        let current = self.processed();
        let mut previous = self.balance.lock().expect("balance lock poisoned");
        if previous.len() != current.len() {
            *previous = current;
            return;
        }

        let deltas: Vec<u64> = current
            .iter()
            .zip(previous.iter())
            .map(|(now, before)| now.saturating_sub(*before))
            .collect();
        *previous = current;

        let busiest = deltas
            .iter()
            .enumerate()
            .max_by_key(|(_, d)| **d)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let idlest = deltas
            .iter()
            .enumerate()
            .min_by_key(|(_, d)| **d)
            .map(|(i, _)| i)
            .unwrap_or(0);
        if busiest == idlest
            || deltas[busiest] < deltas[idlest].saturating_mul(2) + BALANCE_THRESHOLD
        {
            return;
        }

        if let Some(actor) = node.migration_candidate(busiest) {
            tracing::debug!(
                actor = actor.name(),
                from = busiest,
                to = idlest,
                "rebalancing actor"
            );
            actor.set_preferred_worker(idlest);
        }
    }
}
