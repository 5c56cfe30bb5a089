//! Actor cells and the handler-facing scope API.
//!
//! An [`Actor`] is the engine-side cell: name, lifecycle flags,
//! mailbox, and the behavior state. The state sits in an `UnsafeCell`
//! guarded by the running claim — a CAS-set flag bit that guarantees at
//! most one worker is inside the actor's handler at any instant.
//!
//! [`ActorScope`] is what a behavior sees while handling a message: the
//! only way to send, spawn, or touch the acquaintance table. Sends are
//! staged in the dispatching worker's outbox and routed after the
//! handler returns.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::EngineError;
use crate::mailbox::Mailbox;
use crate::memory::MemoryPool;
use crate::message::{BufferOrigin, Message, ACTION_ASK_TO_STOP, ACTION_BINOMIAL_TREE_SEND, ACTION_STOP};
use crate::mpsc;
use crate::node::NodeCore;
use crate::script::{Behavior, Script};
use crate::wire;

// ── Lifecycle flags ─────────────────────────────────────────────────────

/// Slot allocated, behavior constructed.
pub(crate) const FLAG_SPAWNED: u32 = 1 << 0;
/// `ACTION_START` delivered.
pub(crate) const FLAG_STARTED: u32 = 1 << 1;
/// `ACTION_STOP` observed; no further handler runs.
pub(crate) const FLAG_DYING: u32 = 1 << 2;
/// Death reported to the node; slot awaiting reclamation.
pub(crate) const FLAG_DEAD: u32 = 1 << 3;
/// Actor sits in some worker's ready queue.
const FLAG_READY: u32 = 1 << 4;
/// A worker is inside the actor's handler.
const FLAG_RUNNING: u32 = 1 << 5;

/// Behavior-side state, accessed only under the running claim.
pub(crate) struct ActorState {
    pub(crate) behavior: Box<dyn Behavior>,
    /// Compact index -> peer name table.
    pub(crate) acquaintances: Vec<u32>,
    /// Names this actor spawned.
    pub(crate) children: Vec<u32>,
}

/// Engine-side actor cell.
pub struct Actor {
    name: u32,
    script: Script,
    supervisor: AtomicU32,
    /// Preferred worker index; republished by the balancer.
    worker: AtomicUsize,
    flags: AtomicU32,
    mailbox: Mailbox,
    state: UnsafeCell<ActorState>,
}

// SAFETY: all shared fields are atomics or the internally synchronized
// mailbox. `state` is only touched by the worker holding the running
// claim (or by the death path after the actor left every table).
unsafe impl Send for Actor {}
// SAFETY: see above; the running-claim CAS serializes state access.
unsafe impl Sync for Actor {}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("name", &self.name)
            .field("script", &self.script.name())
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .field("mailbox", &self.mailbox.len())
            .finish_non_exhaustive()
    }
}

impl Actor {
    pub(crate) fn new(name: u32, script: Script, supervisor: u32, worker: usize) -> Self {
        Self {
            name,
            script,
            supervisor: AtomicU32::new(supervisor),
            worker: AtomicUsize::new(worker),
            flags: AtomicU32::new(FLAG_SPAWNED),
            mailbox: Mailbox::new(),
            state: UnsafeCell::new(ActorState {
                behavior: script.instantiate(),
                acquaintances: Vec::new(),
                children: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> u32 {
        self.name
    }

    #[must_use]
    pub fn script_id(&self) -> u32 {
        self.script.id()
    }

    #[must_use]
    pub fn supervisor(&self) -> u32 {
        self.supervisor.load(Ordering::Relaxed)
    }

    pub(crate) fn set_supervisor(&self, name: u32) {
        self.supervisor.store(name, Ordering::Relaxed);
    }

    #[must_use]
    pub(crate) fn preferred_worker(&self) -> usize {
        self.worker.load(Ordering::Acquire)
    }

    pub(crate) fn set_preferred_worker(&self, index: usize) {
        self.worker.store(index, Ordering::Release);
    }

    pub(crate) fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    // ── Flag protocol ──────────────────────────────────────────────────

    /// Claims the actor for dispatch. Returns `false` when another
    /// worker already runs it (the holder re-enqueues as needed).
    pub(crate) fn try_claim(&self) -> bool {
        self.flags.fetch_or(FLAG_RUNNING, Ordering::Acquire) & FLAG_RUNNING == 0
    }

    pub(crate) fn release_claim(&self) {
        self.flags.fetch_and(!FLAG_RUNNING, Ordering::Release);
    }

    /// Marks the actor ready. Returns `true` when this call made the
    /// transition, i.e. the caller must enqueue the actor.
    pub(crate) fn mark_ready(&self) -> bool {
        self.flags.fetch_or(FLAG_READY, Ordering::AcqRel) & FLAG_READY == 0
    }

    pub(crate) fn clear_ready(&self) {
        self.flags.fetch_and(!FLAG_READY, Ordering::Release);
    }

    pub(crate) fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub(crate) fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    /// Behavior-side state.
    ///
    /// # Safety
    ///
    /// Caller must hold the running claim, or be the death path after
    /// the actor was removed from every routing table.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn state_mut(&self) -> &mut ActorState {
        // SAFETY: exclusivity per this function's contract.
        unsafe { &mut *self.state.get() }
    }
}

// ── Triage handles ──────────────────────────────────────────────────────

/// A payload buffer travelling back to its origin pool through a triage
/// queue.
pub(crate) struct ReclaimBuffer {
    pub(crate) pointer: std::ptr::NonNull<u8>,
    pub(crate) origin: BufferOrigin,
}

// SAFETY: the buffer is exclusively owned by whoever holds the handle;
// it is only freed by its origin pool's owning thread.
unsafe impl Send for ReclaimBuffer {}

pub(crate) type TriageQueue = mpsc::MpscQueue<ReclaimBuffer>;

// ── Actor scope ─────────────────────────────────────────────────────────

/// Handler context: everything a behavior may do while it runs.
pub struct ActorScope<'a> {
    pub(crate) node: &'a NodeCore,
    pub(crate) actor: &'a Actor,
    pub(crate) acquaintances: &'a mut Vec<u32>,
    pub(crate) children: &'a mut Vec<u32>,
    pub(crate) outbound: &'a mut MemoryPool,
    pub(crate) ephemeral: &'a mut MemoryPool,
    pub(crate) outbox: &'a mut Vec<Message>,
    pub(crate) worker_index: usize,
    pub(crate) current_source: u32,
}

impl<'a> ActorScope<'a> {
    /// This actor's globally unique name.
    #[must_use]
    pub fn name(&self) -> u32 {
        self.actor.name()
    }

    /// Source of the message currently being handled.
    #[must_use]
    pub fn source(&self) -> u32 {
        self.current_source
    }

    #[must_use]
    pub fn supervisor(&self) -> u32 {
        self.actor.supervisor()
    }

    pub fn set_supervisor(&mut self, name: u32) {
        self.actor.set_supervisor(name);
    }

    /// Name of the node this actor runs on.
    #[must_use]
    pub fn node_name(&self) -> u32 {
        self.node.name()
    }

    /// Total node count in the cluster.
    #[must_use]
    pub fn nodes(&self) -> u32 {
        self.node.nodes()
    }

    /// Worker threads on this node.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.node.worker_count()
    }

    /// Index of the worker currently dispatching this actor.
    #[must_use]
    pub fn worker(&self) -> usize {
        self.worker_index
    }

    /// Arguments the engine did not consume at startup.
    #[must_use]
    pub fn app_args(&self) -> &[String] {
        self.node.app_args()
    }

    // ── Sending ────────────────────────────────────────────────────────

    /// Sends `data` to `destination` under `tag`. The payload is copied
    /// into this worker's outbound pool; delivery order per destination
    /// is the staging order.
    pub fn send(&mut self, destination: u32, tag: u32, data: &[u8]) {
        let message = self.make_message(destination, tag, data);
        self.outbox.push(message);
    }

    /// Sends a payload-less message.
    pub fn send_empty(&mut self, destination: u32, tag: u32) {
        self.send(destination, tag, &[]);
    }

    /// Replies to the sender of the current message.
    pub fn reply(&mut self, tag: u32, data: &[u8]) {
        let destination = self.current_source;
        self.send(destination, tag, data);
    }

    /// Replies with an empty payload.
    pub fn reply_empty(&mut self, tag: u32) {
        self.reply(tag, &[]);
    }

    /// Sends to self (delivered through the mailbox like any message).
    pub fn send_to_self(&mut self, tag: u32, data: &[u8]) {
        let name = self.name();
        self.send(name, tag, data);
    }

    /// Asks this actor to die: stages `ACTION_STOP` to self. The engine
    /// intercepts it on delivery, runs `on_stop`, and reclaims the
    /// slot.
    pub fn stop(&mut self) {
        self.send_to_self(ACTION_STOP, &[]);
    }

    /// Politely asks another actor to stop; it decides whether to
    /// comply.
    pub fn ask_to_stop(&mut self, name: u32) {
        self.send_empty(name, ACTION_ASK_TO_STOP);
    }

    // ── Spawning ───────────────────────────────────────────────────────

    /// Spawns a child actor running `script` on this node. The child is
    /// supervised by this actor and receives `ACTION_START` before
    /// anything else.
    pub fn spawn(&mut self, script: u32) -> Result<u32, EngineError> {
        let child = self
            .node
            .spawn_actor(script, self.name(), Some(self.worker_index))?;
        self.children.push(child);
        Ok(child)
    }

    /// Names of the actors this one spawned.
    #[must_use]
    pub fn children(&self) -> &[u32] {
        &*self.children
    }

    // ── Acquaintances ──────────────────────────────────────────────────

    /// Peer name at `index` in the acquaintance table.
    #[must_use]
    pub fn acquaintance(&self, index: usize) -> Option<u32> {
        self.acquaintances.get(index).copied()
    }

    /// Records `name` (once) and returns its compact index.
    pub fn add_acquaintance(&mut self, name: u32) -> usize {
        if let Some(index) = self.acquaintance_index(name) {
            return index;
        }
        self.acquaintances.push(name);
        self.acquaintances.len() - 1
    }

    /// Compact index of `name`, if recorded.
    #[must_use]
    pub fn acquaintance_index(&self, name: u32) -> Option<usize> {
        self.acquaintances.iter().position(|&n| n == name)
    }

    // ── Scratch memory ─────────────────────────────────────────────────

    /// Zeroed scratch bytes valid for the rest of this dispatch. The
    /// backing pool is rewound wholesale between dispatches, so nothing
    /// here may escape the handler.
    pub fn scratch(&mut self, len: usize) -> &mut [u8] {
        if len == 0 {
            return &mut [];
        }
        let pointer = self.ephemeral.allocate(len);
        // SAFETY: `len` bytes were just allocated; the returned borrow
        // ties the slice to `&mut self`, and the pool is only rewound
        // after the handler (and the borrow) are gone.
        unsafe {
            std::ptr::write_bytes(pointer.as_ptr(), 0, len);
            std::slice::from_raw_parts_mut(pointer.as_ptr(), len)
        }
    }

    // ── Binomial-tree broadcast ────────────────────────────────────────

    /// Sends one message to every actor in `names`, forwarding along a
    /// binomial tree so no single actor sends more than O(log n)
    /// copies. Receivers observe the nearest forwarder as the source.
    pub fn send_range_binomial_tree(&mut self, names: &[u32], tag: u32, data: &[u8]) {
        match names {
            [] => {}
            [one] => self.send(*one, tag, data),
            [one, two] => {
                self.send(*one, tag, data);
                self.send(*two, tag, data);
            }
            _ => {
                let frame = pack_tree_message(tag, names, data);
                self.send(names[0], ACTION_BINOMIAL_TREE_SEND, &frame);
            }
        }
    }

    fn make_message(&mut self, destination: u32, tag: u32, data: &[u8]) -> Message {
        let source = self.name();
        if data.is_empty() {
            return Message::empty(tag, source, destination);
        }
        let buffer = self.outbound.allocate(data.len());
        // SAFETY: data.len() bytes were just allocated at `buffer`.
        unsafe {
            buffer
                .as_ptr()
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
        Message::with_buffer(
            tag,
            source,
            destination,
            buffer,
            u32::try_from(data.len()).unwrap_or(u32::MAX),
            BufferOrigin::Worker(self.worker_index),
        )
    }
}

// ── Binomial tree plumbing ──────────────────────────────────────────────

/// Tree frame layout: `[inner_tag | packed names | inner payload]`.
fn pack_tree_message(inner_tag: u32, names: &[u32], payload: &[u8]) -> Vec<u8> {
    let packed = wire::pack_u32_vector(names);
    let mut frame = Vec::with_capacity(4 + packed.len() + payload.len());
    frame.extend_from_slice(&inner_tag.to_ne_bytes());
    frame.extend_from_slice(&packed);
    frame.extend_from_slice(payload);
    frame
}

/// Handles an `ACTION_BINOMIAL_TREE_SEND` frame addressed to this
/// actor: delivers the inner message to self and forwards the remaining
/// range as two subtrees. Malformed frames are dropped.
pub(crate) fn receive_binomial_tree(scope: &mut ActorScope<'_>, message: &Message) {
    let data = message.data();
    if data.len() < 4 {
        return;
    }
    let inner_tag = u32::from_ne_bytes(data[0..4].try_into().expect("4 bytes"));
    let Some(names) = wire::unpack_u32_vector(&data[4..]) else {
        return;
    };
    let payload_offset = 4 + 4 + names.len() * 4;
    let payload = &data[payload_offset.min(data.len())..];

    if names.first() != Some(&scope.name()) {
        // The range was built for someone else; deliver to self anyway
        // so no member of the range is lost.
        tracing::trace!(
            actor = scope.name(),
            "binomial tree frame arrived at an unexpected range head"
        );
    }
    scope.send_to_self(inner_tag, payload);

    let rest = &names[1..];
    if rest.is_empty() {
        return;
    }
    let middle = rest.len().div_ceil(2);
    for half in [&rest[..middle], &rest[middle..]] {
        match half {
            [] => {}
            [one] => scope.send(*one, inner_tag, payload),
            _ => {
                let frame = pack_tree_message(inner_tag, half, payload);
                scope.send(half[0], ACTION_BINOMIAL_TREE_SEND, &frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Behavior, Script};

    struct Nop;

    impl Behavior for Nop {
        fn receive(&mut self, _scope: &mut ActorScope<'_>, _message: &Message) {}
    }

    fn nop_factory() -> Box<dyn Behavior> {
        Box::new(Nop)
    }

    fn test_actor(name: u32) -> Actor {
        Actor::new(name, Script::new(1, "nop", nop_factory), name, 0)
    }

    #[test]
    fn running_claim_is_exclusive() {
        let actor = test_actor(7);
        assert!(actor.try_claim());
        assert!(!actor.try_claim());
        actor.release_claim();
        assert!(actor.try_claim());
    }

    #[test]
    fn ready_transition_reports_only_once() {
        let actor = test_actor(7);
        assert!(actor.mark_ready());
        assert!(!actor.mark_ready());
        actor.clear_ready();
        assert!(actor.mark_ready());
    }

    #[test]
    fn lifecycle_flags_accumulate() {
        let actor = test_actor(9);
        assert!(actor.has_flag(FLAG_SPAWNED));
        assert!(!actor.has_flag(FLAG_STARTED));
        actor.set_flag(FLAG_STARTED);
        actor.set_flag(FLAG_DYING);
        assert!(actor.has_flag(FLAG_STARTED));
        assert!(actor.has_flag(FLAG_DYING));
    }

    #[test]
    fn tree_frame_round_trip() {
        let frame = pack_tree_message(77, &[5, 6, 7], b"xy");
        assert_eq!(u32::from_ne_bytes(frame[0..4].try_into().unwrap()), 77);
        let names = wire::unpack_u32_vector(&frame[4..]).unwrap();
        assert_eq!(names, vec![5, 6, 7]);
        assert_eq!(&frame[4 + 4 + 12..], b"xy");
    }
}
