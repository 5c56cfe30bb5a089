//! The per-node engine.
//!
//! A [`Node`] owns everything on one cluster member: the actor tables,
//! the script registry, the worker pool, the transport endpoint, the
//! multiplexer, and the node-side memory pools. Its main loop runs on
//! the calling thread, distinct from the workers:
//!
//! 1. pump the transport (inbound frames -> local mailboxes),
//! 2. drain the workers' outbound queue into the multiplexer,
//! 3. flush age-expired batches,
//! 4. return triaged buffers to the node pools,
//! 5. reclaim actors that died since the last turn,
//! 6. snapshot counters every load period.
//!
//! Actor names are location: `name mod nodes` is the owning node, so a
//! send resolves its destination without any directory traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::actor::{Actor, ReclaimBuffer, FLAG_DEAD, FLAG_DYING};
use crate::config::{NodeConfig, LOAD_PERIOD};
use crate::counter::{CounterSnapshot, EngineCounters};
use crate::error::EngineError;
use crate::memory::{MemoryPool, DEFAULT_BLOCK_SIZE};
use crate::message::{BufferOrigin, Message, ACTION_START, MULTIPLEX_MESSAGE};
use crate::mpsc::MpscQueue;
use crate::multiplexer::Multiplexer;
use crate::script::{Script, ScriptRegistry};
use crate::signal;
use crate::transport::{InboundFrame, LoopbackTransport, Transport};
use crate::wire::{self, MessageHeader, ENVELOPE_HEADER_SIZE, MESSAGE_HEADER_SIZE};
use crate::worker_pool::WorkerPool;

/// Idle main-loop backoff.
const IDLE_SLEEP: Duration = Duration::from_micros(50);

/// Largest assignable actor name (31-bit space, `u32::MAX` reserved as
/// the spawn-failure sentinel).
const MAX_ACTOR_NAME: u32 = 0x7fff_ffff;

// ── Actor directory ─────────────────────────────────────────────────────

const DIRECTORY_SHARDS: usize = 64;

/// FNV-1a over the name bytes, for shard selection.
fn fnv1a(name: u32) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 14_695_981_039_346_656_037;
    const FNV_PRIME: u64 = 1_099_511_628_211;
    let mut hash = FNV_OFFSET_BASIS;
    for byte in name.to_ne_bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Sharded name -> actor map. The send fast path takes one shard read
/// lock, which is uncontended outside spawn/death bursts.
struct ActorDirectory {
    shards: Vec<RwLock<HashMap<u32, Arc<Actor>>>>,
}

impl ActorDirectory {
    fn new() -> Self {
        Self {
            shards: (0..DIRECTORY_SHARDS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, name: u32) -> &RwLock<HashMap<u32, Arc<Actor>>> {
        &self.shards[(fnv1a(name) as usize) % DIRECTORY_SHARDS]
    }

    fn insert(&self, name: u32, actor: Arc<Actor>) {
        self.shard(name)
            .write()
            .expect("directory lock poisoned")
            .insert(name, actor);
    }

    fn get(&self, name: u32) -> Option<Arc<Actor>> {
        self.shard(name)
            .read()
            .expect("directory lock poisoned")
            .get(&name)
            .cloned()
    }

    fn remove(&self, name: u32) {
        self.shard(name)
            .write()
            .expect("directory lock poisoned")
            .remove(&name);
    }
}

// ── Actor table ─────────────────────────────────────────────────────────

/// Slot table guarded by the spawn-and-death lock. Slots are recycled;
/// names never are.
#[derive(Debug, Default)]
struct ActorTable {
    slots: Vec<Option<Arc<Actor>>>,
    names: HashMap<u32, usize>,
    dead_indices: VecDeque<usize>,
    next_name: u32,
}

// ── Node core ───────────────────────────────────────────────────────────

/// State shared between the main loop and the workers.
pub(crate) struct NodeCore {
    config: NodeConfig,
    scripts: ScriptRegistry,
    directory: ActorDirectory,
    /// The spawn-and-death lock.
    table: Mutex<ActorTable>,
    pub(crate) pool: WorkerPool,
    /// Workers push remote-destined messages here; the main loop
    /// multiplexes them.
    pub(crate) outbound_queue: MpscQueue<Message>,
    /// Buffers owned by the node pools, coming home.
    pub(crate) node_triage: MpscQueue<ReclaimBuffer>,
    /// Names of actors that died since the last main-loop turn.
    pub(crate) death_queue: MpscQueue<u32>,
    alive_actors: AtomicUsize,
    counters: Arc<EngineCounters>,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCore")
            .field("node", &self.config.node)
            .field("nodes", &self.config.nodes)
            .field("alive", &self.alive_actors.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl NodeCore {
    #[must_use]
    pub(crate) fn name(&self) -> u32 {
        self.config.node
    }

    #[must_use]
    pub(crate) fn nodes(&self) -> u32 {
        self.config.nodes
    }

    #[must_use]
    pub(crate) fn worker_count(&self) -> usize {
        self.config.workers
    }

    #[must_use]
    pub(crate) fn app_args(&self) -> &[String] {
        &self.config.app_args
    }

    #[must_use]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Owning node of `name`.
    #[must_use]
    pub(crate) fn node_of(&self, name: u32) -> u32 {
        name % self.config.nodes
    }

    /// Spawns an actor supervised by `supervisor`, delivering
    /// `ACTION_START` before anything else.
    pub(crate) fn spawn_actor(
        &self,
        script: u32,
        supervisor: u32,
        hint: Option<usize>,
    ) -> Result<u32, EngineError> {
        self.spawn_inner(script, Some(supervisor), hint, true)
    }

    /// Spawns a self-supervised initial actor; the caller delivers its
    /// `ACTION_START` (with the initial-actor vector) later.
    fn spawn_initial(&self, script: u32) -> Result<u32, EngineError> {
        self.spawn_inner(script, None, None, false)
    }

    fn spawn_inner(
        &self,
        script: u32,
        supervisor: Option<u32>,
        hint: Option<usize>,
        send_start: bool,
    ) -> Result<u32, EngineError> {
        if self.is_shutdown() {
            return Err(EngineError::ShuttingDown);
        }
        let script = self
            .scripts
            .get(script)
            .ok_or(EngineError::UnknownScript(script))?;

        let actor = {
            let mut table = self.table.lock().expect("spawn-and-death lock poisoned");
            if table.names.len() >= self.config.max_actors {
                return Err(EngineError::ActorTableFull(self.config.max_actors));
            }
            let name = self.assign_name(&mut table)?;
            let supervisor = supervisor.unwrap_or(name);
            let actor = Arc::new(Actor::new(name, script, supervisor, 0));

            let slot = match table.dead_indices.pop_front() {
                Some(slot) => slot,
                None => {
                    table.slots.push(None);
                    table.slots.len() - 1
                }
            };
            table.slots[slot] = Some(Arc::clone(&actor));
            table.names.insert(name, slot);
            actor
        };

        let name = actor.name();
        self.pool.assign(&actor, hint);
        self.directory.insert(name, Arc::clone(&actor));
        self.alive_actors.fetch_add(1, Ordering::AcqRel);
        EngineCounters::bump(&self.counters.actors_spawned);
        tracing::debug!(actor = name, script = actor.script_id(), "spawned");

        if send_start {
            self.route(Message::empty(ACTION_START, actor.supervisor(), name));
        }
        Ok(name)
    }

    /// Picks a fresh name under the table lock. Deterministic mode
    /// walks the node-congruent arithmetic progression; random mode
    /// draws 31-bit names congruent to the node, so `node_of` works
    /// either way.
    fn assign_name(&self, table: &mut ActorTable) -> Result<u32, EngineError> {
        if self.config.deterministic_names {
            if table.next_name == 0 {
                table.next_name = self.config.node;
            }
            let name = table.next_name;
            if name > MAX_ACTOR_NAME {
                return Err(EngineError::ActorTableFull(self.config.max_actors));
            }
            // First assignment for node 0 yields name 0; bump by the
            // stride so every name is unique modulo the node count.
            table.next_name = name + self.config.nodes;
            return Ok(name);
        }

        let mut rng = rand::rng();
        let nodes = self.config.nodes;
        loop {
            let raw: u32 = rng.random_range(0..=MAX_ACTOR_NAME);
            let name = raw - (raw % nodes) + self.config.node;
            if name <= MAX_ACTOR_NAME && !table.names.contains_key(&name) {
                return Ok(name);
            }
        }
    }

    /// Routes one message: local mailbox or the outbound queue.
    pub(crate) fn route(&self, mut message: Message) {
        let destination = message.destination();
        if self.node_of(destination) != self.name() {
            EngineCounters::bump(&self.counters.remote_outbound);
            self.outbound_queue.push(message);
            return;
        }

        match self.directory.get(destination) {
            Some(actor) if !actor.has_flag(FLAG_DEAD | FLAG_DYING) => {
                actor.mailbox().push(message);
                EngineCounters::bump(&self.counters.local_deliveries);
                if actor.mark_ready() {
                    self.pool.schedule(actor);
                }
            }
            _ => {
                EngineCounters::bump(&self.counters.dropped_messages);
                tracing::trace!(destination, "dropping message for unknown or dead actor");
                self.release(message.take_buffer());
            }
        }
    }

    /// Sends a payload buffer home through the right triage queue.
    pub(crate) fn reclaim(&self, buffer: ReclaimBuffer) {
        match buffer.origin {
            BufferOrigin::Worker(index) => self.pool.triage(index).push(buffer),
            BufferOrigin::NodeInbound | BufferOrigin::NodeOutbound => {
                self.node_triage.push(buffer);
            }
            BufferOrigin::None => {}
        }
    }

    pub(crate) fn release(&self, taken: Option<(std::ptr::NonNull<u8>, BufferOrigin)>) {
        if let Some((pointer, origin)) = taken {
            self.reclaim(ReclaimBuffer { pointer, origin });
        }
    }

    /// Workers report a dead actor here; the main loop reclaims it.
    pub(crate) fn report_death(&self, name: u32) {
        self.death_queue.push(name);
    }

    /// Reclaims a dead actor's slot and name entry; remaining mailbox
    /// messages are dropped and their buffers recycled.
    fn notify_death(&self, name: u32) {
        let actor = {
            let mut table = self.table.lock().expect("spawn-and-death lock poisoned");
            let Some(slot) = table.names.remove(&name) else {
                return;
            };
            let actor = table.slots[slot].take();
            table.dead_indices.push_back(slot);
            actor
        };
        self.directory.remove(name);

        if let Some(actor) = actor {
            // The dispatching worker still holds the claim for the
            // final instants of the ACTION_STOP dispatch; wait it out.
            while !actor.try_claim() {
                std::thread::yield_now();
            }
            // SAFETY: claim held and the actor is out of every table,
            // so this thread is the unique mailbox consumer.
            while let Some(mut message) = unsafe { actor.mailbox().pop() } {
                EngineCounters::bump(&self.counters.dropped_messages);
                self.release(message.take_buffer());
            }
        }

        self.alive_actors.fetch_sub(1, Ordering::AcqRel);
        EngineCounters::bump(&self.counters.actors_dead);
        tracing::debug!(actor = name, "slot reclaimed");
    }

    /// First live actor bound to `worker`, for the balancer.
    pub(crate) fn migration_candidate(&self, worker: usize) -> Option<Arc<Actor>> {
        let table = self.table.lock().expect("spawn-and-death lock poisoned");
        table
            .slots
            .iter()
            .flatten()
            .find(|actor| {
                actor.preferred_worker() == worker && !actor.has_flag(FLAG_DEAD | FLAG_DYING)
            })
            .cloned()
    }
}

// ── Node ────────────────────────────────────────────────────────────────

/// One cluster member. See the module docs.
pub struct Node {
    core: Arc<NodeCore>,
    transport: Box<dyn Transport>,
    multiplexer: Multiplexer,
    inbound_pool: MemoryPool,
    outbound_pool: MemoryPool,
    initial_scripts: Vec<u32>,
    initial_actors: Vec<u32>,
    last_report: Instant,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Brings up a single-node engine (loopback transport).
    pub fn init(config: NodeConfig) -> Result<Self, EngineError> {
        let node = config.node;
        Self::with_transport(config, Box::new(LoopbackTransport::new(node)))
    }

    /// Brings up the engine on an established transport endpoint.
    pub fn with_transport(
        config: NodeConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if transport.nodes() != config.nodes || transport.node() != config.node {
            return Err(EngineError::UnreachableNode(config.node));
        }

        crate::config::init_tracing();
        signal::install_crash_handler(config.node);

        let mut inbound_pool = MemoryPool::new("node-inbound", DEFAULT_BLOCK_SIZE);
        inbound_pool.enable_normalization();
        let mut outbound_pool = MemoryPool::new("node-outbound", DEFAULT_BLOCK_SIZE);
        outbound_pool.enable_normalization();

        let counters = Arc::new(EngineCounters::default());
        let multiplexer = Multiplexer::new(
            config.nodes,
            config.flush_threshold,
            config.max_batch_latency,
            Arc::clone(&counters),
        );

        let core = Arc::new(NodeCore {
            pool: WorkerPool::new(config.workers, config.auto_scaling),
            scripts: ScriptRegistry::new(),
            directory: ActorDirectory::new(),
            table: Mutex::new(ActorTable::default()),
            outbound_queue: MpscQueue::new(),
            node_triage: MpscQueue::new(),
            death_queue: MpscQueue::new(),
            alive_actors: AtomicUsize::new(0),
            counters,
            shutdown: AtomicBool::new(false),
            config,
        });

        tracing::info!(
            node = core.name(),
            nodes = core.nodes(),
            workers = core.worker_count(),
            "engine initialized"
        );

        Ok(Self {
            core,
            transport,
            multiplexer,
            inbound_pool,
            outbound_pool,
            initial_scripts: Vec::new(),
            initial_actors: Vec::new(),
            last_report: Instant::now(),
        })
    }

    /// Registers an actor class. Late registration is fine as long as
    /// it happens before the first spawn of that script.
    pub fn add_script(&self, script: Script) -> Result<(), EngineError> {
        self.core.scripts.add(script)
    }

    /// Queues `script` as an initial actor, spawned when `run` starts.
    /// Initial actors receive the packed vector of this node's initial
    /// actor names in their `ACTION_START` payload.
    pub fn add_initial_actor(&mut self, script: u32) {
        self.initial_scripts.push(script);
    }

    /// Spawns a self-supervised actor immediately.
    pub fn spawn(&self, script: u32) -> Result<u32, EngineError> {
        self.core.spawn_inner(script, None, None, true)
    }

    /// Sends a message from outside any actor (bootstrap, tests).
    pub fn send(&mut self, source: u32, destination: u32, tag: u32, data: &[u8]) {
        let message = self.node_message(tag, source, destination, data);
        self.core.route(message);
    }

    /// Names of the initial actors, available once `run` started them.
    #[must_use]
    pub fn initial_actors(&self) -> &[u32] {
        &self.initial_actors
    }

    #[must_use]
    pub fn name(&self) -> u32 {
        self.core.name()
    }

    #[must_use]
    pub fn nodes(&self) -> u32 {
        self.core.nodes()
    }

    #[must_use]
    pub fn alive_actors(&self) -> usize {
        self.core.alive_actors.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.core.counters.snapshot()
    }

    /// Drives the engine until every local actor has died, then tears
    /// the node down. Transport failures are fatal and propagate.
    pub fn run(&mut self) -> Result<(), EngineError> {
        let core = Arc::clone(&self.core);
        core.pool.start(&core);
        self.bootstrap()?;

        let single = core.nodes() == 1;
        let result = loop {
            let mut progress = false;

            if !single {
                match self.pump_transport() {
                    Ok(moved) => progress |= moved,
                    Err(error) => break Err(error),
                }
            }

            // SAFETY: the main loop is the node triage consumer.
            while let Some(buffer) = unsafe { core.node_triage.pop() } {
                self.free_node_buffer(buffer);
                progress = true;
            }

            // SAFETY: the main loop is the death queue consumer.
            while let Some(name) = unsafe { core.death_queue.pop() } {
                core.notify_death(name);
                progress = true;
            }

            self.periodic();

            if !progress {
                if core.alive_actors.load(Ordering::Acquire) == 0 {
                    break Ok(());
                }
                std::thread::sleep(IDLE_SLEEP);
            }
        };

        self.shutdown();
        result
    }

    // ── Bootstrap ──────────────────────────────────────────────────────

    fn bootstrap(&mut self) -> Result<(), EngineError> {
        let scripts = std::mem::take(&mut self.initial_scripts);
        let mut initial = Vec::with_capacity(scripts.len());
        for script in scripts {
            initial.push(self.core.spawn_initial(script)?);
        }
        if !initial.is_empty() {
            let packed = wire::pack_u32_vector(&initial);
            for &name in &initial {
                let start = self.node_message(ACTION_START, name, name, &packed);
                self.core.route(start);
            }
            tracing::info!(actors = ?initial, "initial actors started");
        }
        self.initial_actors = initial;
        Ok(())
    }

    /// Builds a message whose payload lives in the node outbound pool.
    fn node_message(&mut self, tag: u32, source: u32, destination: u32, data: &[u8]) -> Message {
        if data.is_empty() {
            return Message::empty(tag, source, destination);
        }
        let buffer = self.outbound_pool.allocate(data.len());
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
            BufferOrigin::NodeOutbound,
        )
    }

    // ── Transport pump ─────────────────────────────────────────────────

    /// Moves frames both ways; returns whether anything moved.
    fn pump_transport(&mut self) -> Result<bool, EngineError> {
        let core = Arc::clone(&self.core);
        let mut progress = false;

        while let Some(frame) = self.transport.poll()? {
            self.demultiplex(frame);
            progress = true;
        }

        // SAFETY: the main loop is the outbound queue consumer.
        while let Some(mut message) = unsafe { core.outbound_queue.pop() } {
            self.multiplexer
                .multiplex(&message, self.transport.as_mut())?;
            core.release(message.take_buffer());
            progress = true;
        }

        self.multiplexer.poll(self.transport.as_mut())?;
        Ok(progress)
    }

    /// Rematerializes the messages inside one inbound frame.
    fn demultiplex(&mut self, frame: InboundFrame) {
        EngineCounters::bump(&self.core.counters.transport_receives);
        let data = frame.data;

        match wire::read_envelope(&data) {
            Some((MULTIPLEX_MESSAGE, count)) => {
                for (header, payload) in
                    wire::frames(&data[ENVELOPE_HEADER_SIZE..]).take(count as usize)
                {
                    self.deliver_inbound(&header, payload);
                }
            }
            _ => match wire::read_header(&data) {
                Some(header) => {
                    let payload = &data[MESSAGE_HEADER_SIZE..header.frame_size()];
                    self.deliver_inbound(&header, payload);
                }
                None => {
                    EngineCounters::bump(&self.core.counters.dropped_messages);
                    tracing::warn!(source = frame.source, "malformed transport frame");
                }
            },
        }
    }

    fn deliver_inbound(&mut self, header: &MessageHeader, payload: &[u8]) {
        if self.core.node_of(header.destination) != self.core.name() {
            // Misrouted frame; nothing sensible to do but count it.
            EngineCounters::bump(&self.core.counters.dropped_messages);
            return;
        }
        let message = if payload.is_empty() {
            Message::empty(header.tag, header.source, header.destination)
        } else {
            let buffer = self.inbound_pool.allocate(payload.len());
            // SAFETY: payload.len() bytes were just allocated.
            unsafe {
                buffer
                    .as_ptr()
                    .copy_from_nonoverlapping(payload.as_ptr(), payload.len());
            }
            Message::with_buffer(
                header.tag,
                header.source,
                header.destination,
                buffer,
                header.payload_length,
                BufferOrigin::NodeInbound,
            )
        };
        self.core.route(message);
    }

    fn free_node_buffer(&mut self, buffer: ReclaimBuffer) {
        match buffer.origin {
            BufferOrigin::NodeInbound => self.inbound_pool.free(buffer.pointer),
            BufferOrigin::NodeOutbound => self.outbound_pool.free(buffer.pointer),
            // Worker buffers go through the worker triage queues, never
            // through here.
            BufferOrigin::Worker(_) | BufferOrigin::None => {
                debug_assert!(false, "worker buffer in node triage");
            }
        }
    }

    // ── Instrumentation ────────────────────────────────────────────────

    fn periodic(&mut self) {
        if self.last_report.elapsed() < LOAD_PERIOD {
            return;
        }
        self.last_report = Instant::now();
        self.core.pool.balance(&self.core);
        self.report();
    }

    fn report(&self) {
        let config = &self.core.config;
        if config.print_load {
            let processed = self.core.pool.processed();
            tracing::info!(node = self.core.name(), ?processed, "load");
        }
        if config.print_counters {
            let snapshot = self.core.counters.snapshot();
            tracing::info!(node = self.core.name(), %snapshot, "counters");
        }
        if config.print_memory_usage {
            let inbound = self.inbound_pool.footprint();
            let outbound = self.outbound_pool.footprint();
            tracing::info!(node = self.core.name(), ?inbound, ?outbound, "memory");
        }
    }

    // ── Teardown ───────────────────────────────────────────────────────

    fn shutdown(&mut self) {
        let core = Arc::clone(&self.core);
        core.shutdown.store(true, Ordering::Release);
        core.pool.stop();

        // Workers are gone; route their final remote messages and push
        // the last batches out.
        if core.nodes() > 1 {
            // SAFETY: workers joined; the main loop is the consumer.
            while let Some(mut message) = unsafe { core.outbound_queue.pop() } {
                if let Err(error) = self
                    .multiplexer
                    .multiplex(&message, self.transport.as_mut())
                {
                    tracing::warn!(%error, "dropping outbound message at shutdown");
                }
                core.release(message.take_buffer());
            }
            if let Err(error) = self.multiplexer.flush_all(self.transport.as_mut()) {
                tracing::warn!(%error, "flush at shutdown failed");
            }
        }

        // SAFETY: workers joined; single-threaded from here on.
        while let Some(name) = unsafe { core.death_queue.pop() } {
            core.notify_death(name);
        }
        // SAFETY: same.
        while let Some(buffer) = unsafe { core.node_triage.pop() } {
            self.free_node_buffer(buffer);
        }

        self.report();
        tracing::info!(
            node = core.name(),
            counters = %core.counters.snapshot(),
            "engine stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorScope;
    use crate::script::Behavior;

    struct Idle;

    impl Behavior for Idle {
        fn receive(&mut self, _scope: &mut ActorScope<'_>, _message: &Message) {}
    }

    fn idle_factory() -> Box<dyn Behavior> {
        Box::new(Idle)
    }

    fn test_node() -> Node {
        let config = NodeConfig {
            node: 0,
            nodes: 1,
            workers: 2,
            ..NodeConfig::default()
        };
        Node::init(config).unwrap()
    }

    #[test]
    fn spawn_requires_registered_script() {
        let node = test_node();
        let err = node.spawn(0x1234).unwrap_err();
        assert!(matches!(err, EngineError::UnknownScript(0x1234)));
        assert_eq!(node.alive_actors(), 0);
    }

    #[test]
    fn spawn_assigns_deterministic_names() {
        let node = test_node();
        node.add_script(Script::new(1, "idle", idle_factory)).unwrap();
        let a = node.spawn(1).unwrap();
        let b = node.spawn(1).unwrap();
        let c = node.spawn(1).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(node.alive_actors(), 3);
    }

    #[test]
    fn names_are_node_congruent() {
        let config = NodeConfig {
            node: 1,
            nodes: 4,
            workers: 1,
            ..NodeConfig::default()
        };
        let fabric = crate::transport::MemoryFabric::new(4);
        let node = Node::with_transport(config, Box::new(fabric.endpoint(1))).unwrap();
        node.add_script(Script::new(1, "idle", idle_factory)).unwrap();
        let a = node.spawn(1).unwrap();
        let b = node.spawn(1).unwrap();
        assert_eq!(a % 4, 1);
        assert_eq!(b % 4, 1);
        assert_eq!(b, a + 4);
    }

    #[test]
    fn transport_shape_must_match_config() {
        let config = NodeConfig {
            node: 0,
            nodes: 2,
            workers: 1,
            ..NodeConfig::default()
        };
        let err = Node::with_transport(config, Box::new(LoopbackTransport::new(0))).unwrap_err();
        assert!(matches!(err, EngineError::UnreachableNode(0)));
    }

    #[test]
    fn send_to_unknown_actor_drops_and_counts() {
        let mut node = test_node();
        node.send(99, 77, 42, b"lost");
        assert_eq!(node.counters().dropped_messages, 1);
        assert_eq!(node.counters().local_deliveries, 0);
    }

    #[test]
    fn actor_table_slot_limit_is_enforced() {
        let config = NodeConfig {
            node: 0,
            nodes: 1,
            workers: 1,
            max_actors: 2,
            ..NodeConfig::default()
        };
        let node = Node::init(config).unwrap();
        node.add_script(Script::new(1, "idle", idle_factory)).unwrap();
        node.spawn(1).unwrap();
        node.spawn(1).unwrap();
        let err = node.spawn(1).unwrap_err();
        assert!(matches!(err, EngineError::ActorTableFull(2)));
    }
}
