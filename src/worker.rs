//! Worker threads: the dispatch loop.
//!
//! Each worker owns a Chase-Lev deque of ready actors, an inbox for
//! actors scheduled from other threads, an outbound message pool, an
//! ephemeral scratch pool, and a triage queue through which foreign
//! threads return this worker's buffers.
//!
//! One dispatch drains exactly one mailbox message:
//!
//! 1. claim the actor (CAS on its running flag; lose the race, skip it),
//! 2. pop one message, run the handler (or the engine's system-tag
//!    interception),
//! 3. release the payload buffer toward its origin pool,
//! 4. route everything the handler staged,
//! 5. re-enqueue the actor if its mailbox still has messages, else
//!    clear its ready bit (re-checking for the producer race),
//! 6. release the claim.
//!
//! Idle workers steal from random victims before parking.

use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_deque::{Steal, Stealer, Worker as WorkDeque};

use crate::actor::{self, Actor, ActorState, ReclaimBuffer, TriageQueue, FLAG_DEAD, FLAG_DYING, FLAG_STARTED};
use crate::actor::ActorScope;
use crate::memory::MemoryPool;
use crate::message::{
    BufferOrigin, Message, ACTION_BINOMIAL_TREE_SEND, ACTION_GET_NODE_WORKER_COUNT,
    ACTION_GET_NODE_WORKER_COUNT_REPLY, ACTION_SPAWN, ACTION_SPAWN_REPLY, ACTION_START,
    ACTION_STOP,
};
use crate::mpsc::MpscQueue;
use crate::node::NodeCore;

/// Park timeout — workers recheck the shutdown flag at this interval.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Sentinel name in an `ACTION_SPAWN_REPLY` whose spawn failed.
pub const SPAWN_FAILED: u32 = u32::MAX;

// ── Parker ──────────────────────────────────────────────────────────────

/// Per-worker parking primitive. Each worker parks on its own mutex and
/// condvar so wakeups do not contend on a single global lock.
#[derive(Debug, Default)]
pub(crate) struct Parker {
    lock: Mutex<bool>,
    cond: Condvar,
}

impl Parker {
    /// Blocks until woken or until `timeout`, consuming the wake flag.
    fn park(&self, timeout: Duration) {
        let mut woken = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !*woken {
            let (guard, _) = self
                .cond
                .wait_timeout(woken, timeout)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            woken = guard;
        }
        *woken = false;
    }

    /// Wakes the parked worker (or pre-arms the flag if it is running).
    pub(crate) fn wake(&self) {
        let mut woken = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *woken = true;
        self.cond.notify_one();
    }
}

// ── Shared worker state ─────────────────────────────────────────────────

/// The parts of a worker every thread can see.
#[derive(Debug)]
pub(crate) struct WorkerShared {
    pub(crate) index: usize,
    /// Actors scheduled onto this worker from other threads.
    pub(crate) inbox: MpscQueue<Arc<Actor>>,
    /// Buffers coming home to this worker's outbound pool.
    pub(crate) triage: TriageQueue,
    pub(crate) parker: Parker,
    /// Messages dispatched, for the load balancer and `-print-load`.
    pub(crate) processed: AtomicU64,
}

impl WorkerShared {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            inbox: MpscQueue::new(),
            triage: TriageQueue::new(),
            parker: Parker::default(),
            processed: AtomicU64::new(0),
        }
    }
}

// ── Xorshift64 PRNG for victim selection ────────────────────────────────

/// Minimal xorshift64 PRNG — one per worker thread.
struct Xorshift64(u64);

impl Xorshift64 {
    fn new(seed: u64) -> Self {
        Self(if seed == 0 { 1 } else { seed })
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

// ── Worker ──────────────────────────────────────────────────────────────

/// Thread-owned half of a worker.
pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    deque: WorkDeque<Arc<Actor>>,
    stealers: Arc<Vec<Stealer<Arc<Actor>>>>,
    node: Arc<NodeCore>,
    outbound: MemoryPool,
    ephemeral: MemoryPool,
    outbox: Vec<Message>,
    rng: Xorshift64,
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<WorkerShared>,
        deque: WorkDeque<Arc<Actor>>,
        stealers: Arc<Vec<Stealer<Arc<Actor>>>>,
        node: Arc<NodeCore>,
        outbound: MemoryPool,
        ephemeral: MemoryPool,
    ) -> Self {
        let seed = 0x9e37_79b9_7f4a_7c15_u64.wrapping_mul(shared.index as u64 + 1);
        Self {
            shared,
            deque,
            stealers,
            node,
            outbound,
            ephemeral,
            outbox: Vec::new(),
            rng: Xorshift64::new(seed),
        }
    }

    /// The worker thread body.
    pub(crate) fn run(mut self) {
        tracing::debug!(worker = self.shared.index, "worker up");
        loop {
            self.reclaim();
            self.ephemeral.free_all();
            self.drain_inbox();

            match self.next_actor() {
                Some(actor) => self.dispatch(&actor),
                None => {
                    if self.node.is_shutdown() {
                        break;
                    }
                    self.shared.parker.park(PARK_TIMEOUT);
                }
            }
        }
        self.reclaim();
        tracing::debug!(worker = self.shared.index, "worker down");
    }

    /// Returns buffers other threads sent home to this worker's pool.
    fn reclaim(&mut self) {
        // SAFETY: this worker thread is the triage queue's consumer.
        while let Some(buffer) = unsafe { self.shared.triage.pop() } {
            debug_assert_eq!(buffer.origin, BufferOrigin::Worker(self.shared.index));
            self.outbound.free(buffer.pointer);
        }
    }

    fn drain_inbox(&mut self) {
        // SAFETY: this worker thread is the inbox's consumer.
        while let Some(actor) = unsafe { self.shared.inbox.pop() } {
            self.deque.push(actor);
        }
    }

    fn next_actor(&mut self) -> Option<Arc<Actor>> {
        if let Some(actor) = self.deque.pop() {
            return Some(actor);
        }
        self.steal()
    }

    /// Steals one ready actor from a random victim.
    fn steal(&mut self) -> Option<Arc<Actor>> {
        let count = self.stealers.len();
        if count <= 1 {
            return None;
        }
        for _ in 0..count {
            let victim = (self.rng.next_u64() as usize) % count;
            if victim == self.shared.index {
                continue;
            }
            loop {
                match self.stealers[victim].steal() {
                    Steal::Success(actor) => return Some(actor),
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }
        }
        None
    }

    /// One dispatch: one actor, at most one message.
    fn dispatch(&mut self, actor: &Arc<Actor>) {
        if actor.has_flag(FLAG_DEAD | FLAG_DYING) {
            return;
        }
        if !actor.try_claim() {
            // Another worker is inside this actor; it re-enqueues if
            // more work remains.
            return;
        }

        // SAFETY: the claim was just taken; this worker is the mailbox
        // consumer for the duration.
        if let Some(mut message) = unsafe { actor.mailbox().pop() } {
            self.invoke(actor, &message);
            self.release(message.take_buffer());
            self.route_outbox();
            self.shared
                .processed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        if actor.has_flag(FLAG_DEAD) {
            actor.clear_ready();
            actor.release_claim();
            return;
        }

        if !actor.mailbox().is_empty() {
            // Keep the ready bit; this worker still owns the requeue.
            actor.release_claim();
            self.deque.push(Arc::clone(actor));
        } else {
            actor.clear_ready();
            actor.release_claim();
            // A producer may have pushed between the emptiness check
            // and clearing the bit; it saw READY set and skipped the
            // enqueue, so it is on us.
            if !actor.mailbox().is_empty() && actor.mark_ready() {
                self.deque.push(Arc::clone(actor));
            }
        }
    }

    /// Runs the handler or the engine's system-tag interception.
    fn invoke(&mut self, actor: &Arc<Actor>, message: &Message) {
        // SAFETY: this worker holds the actor's running claim.
        let state: &mut ActorState = unsafe { actor.state_mut() };
        let ActorState {
            behavior,
            acquaintances,
            children,
        } = state;

        let mut scope = ActorScope {
            node: &*self.node,
            actor: &**actor,
            acquaintances,
            children,
            outbound: &mut self.outbound,
            ephemeral: &mut self.ephemeral,
            outbox: &mut self.outbox,
            worker_index: self.shared.index,
            current_source: message.source(),
        };

        match message.tag() {
            ACTION_START => {
                actor.set_flag(FLAG_STARTED);
                behavior.on_start(&mut scope, message);
            }
            ACTION_STOP => {
                if !actor.has_flag(FLAG_DYING) {
                    actor.set_flag(FLAG_DYING);
                    behavior.on_stop(&mut scope);
                    actor.set_flag(FLAG_DEAD);
                    self.node.report_death(actor.name());
                }
            }
            ACTION_SPAWN => {
                let script = message
                    .data()
                    .get(0..4)
                    .map(|b| u32::from_ne_bytes(b.try_into().expect("4 bytes")));
                let name = match script {
                    Some(script) => scope.spawn(script).unwrap_or_else(|error| {
                        tracing::warn!(%error, "message-driven spawn failed");
                        SPAWN_FAILED
                    }),
                    None => SPAWN_FAILED,
                };
                scope.reply(ACTION_SPAWN_REPLY, &name.to_ne_bytes());
            }
            ACTION_GET_NODE_WORKER_COUNT => {
                let count = u32::try_from(scope.worker_count()).unwrap_or(u32::MAX);
                scope.reply(ACTION_GET_NODE_WORKER_COUNT_REPLY, &count.to_ne_bytes());
            }
            ACTION_BINOMIAL_TREE_SEND => {
                actor::receive_binomial_tree(&mut scope, message);
            }
            _ => behavior.receive(&mut scope, message),
        }
    }

    /// Sends the payload buffer home: direct free when this worker owns
    /// the pool, triage queue otherwise.
    fn release(&mut self, taken: Option<(NonNull<u8>, BufferOrigin)>) {
        let Some((pointer, origin)) = taken else {
            return;
        };
        match origin {
            BufferOrigin::Worker(index) if index == self.shared.index => {
                self.outbound.free(pointer);
            }
            _ => self.node.reclaim(ReclaimBuffer { pointer, origin }),
        }
    }

    /// Routes everything the handler staged, in staging order.
    fn route_outbox(&mut self) {
        let outbox = std::mem::take(&mut self.outbox);
        for message in outbox {
            self.node.route(message);
        }
    }
}
