//! Single-node lifecycle integration tests: local ping, spawn chains,
//! stop cascades, and the engine-handled query/spawn tags.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use argon::{
    ActorScope, Behavior, Message, Node, NodeConfig, Script, ACTION_ASK_TO_STOP,
    ACTION_GET_NODE_WORKER_COUNT, ACTION_GET_NODE_WORKER_COUNT_REPLY, ACTION_SPAWN,
    ACTION_SPAWN_REPLY, SPAWN_FAILED,
};

fn single_node(workers: usize) -> Node {
    let config = NodeConfig {
        node: 0,
        nodes: 1,
        workers,
        ..NodeConfig::default()
    };
    Node::init(config).expect("node init")
}

fn peer_of(scope: &ActorScope<'_>, message: &Message) -> u32 {
    let names = argon::wire::unpack_u32_vector(message.data()).expect("initial actor vector");
    names
        .into_iter()
        .find(|&name| name != scope.name())
        .expect("a peer exists")
}

// ── Ping local ──────────────────────────────────────────────────────────

const PINGER: u32 = 0x1001;
const PONGER: u32 = 0x1002;
const TAG_PING: u32 = 42;
const TAG_PONG: u32 = 43;

static PONG_SOURCE: AtomicU32 = AtomicU32::new(u32::MAX);
static PONG_LEN: AtomicU32 = AtomicU32::new(u32::MAX);
static PING_SEEN_FROM: AtomicU32 = AtomicU32::new(u32::MAX);
static PING_PAYLOAD_OK: AtomicBool = AtomicBool::new(false);

struct Pinger;

impl Behavior for Pinger {
    fn on_start(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        let peer = peer_of(scope, message);
        scope.send(peer, TAG_PING, b"hi");
    }

    fn receive(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        if message.tag() == TAG_PONG {
            PONG_SOURCE.store(message.source(), Ordering::SeqCst);
            PONG_LEN.store(message.len() as u32, Ordering::SeqCst);
            let responder = message.source();
            scope.ask_to_stop(responder);
            scope.stop();
        }
    }
}

struct Ponger;

impl Behavior for Ponger {
    fn receive(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        match message.tag() {
            TAG_PING => {
                PING_SEEN_FROM.store(message.source(), Ordering::SeqCst);
                PING_PAYLOAD_OK.store(message.data() == b"hi", Ordering::SeqCst);
                scope.reply(TAG_PONG, &[]);
            }
            ACTION_ASK_TO_STOP => scope.stop(),
            _ => {}
        }
    }
}

#[test]
fn ping_local() {
    let mut node = single_node(2);
    node.add_script(Script::new(PINGER, "pinger", || Box::new(Pinger)))
        .unwrap();
    node.add_script(Script::new(PONGER, "ponger", || Box::new(Ponger)))
        .unwrap();
    node.add_initial_actor(PINGER);
    node.add_initial_actor(PONGER);
    node.run().unwrap();

    let pinger = node.initial_actors()[0];
    let ponger = node.initial_actors()[1];
    assert_eq!(PING_SEEN_FROM.load(Ordering::SeqCst), pinger);
    assert!(PING_PAYLOAD_OK.load(Ordering::SeqCst));
    assert_eq!(PONG_SOURCE.load(Ordering::SeqCst), ponger);
    assert_eq!(PONG_LEN.load(Ordering::SeqCst), 0);

    assert_eq!(node.alive_actors(), 0);
    let counters = node.counters();
    assert_eq!(counters.actors_spawned, 2);
    assert_eq!(counters.actors_dead, 2);
    assert_eq!(counters.remote_outbound, 0);
}

// ── Spawn chain ─────────────────────────────────────────────────────────

const ROOT: u32 = 0x2001;
const MIDDLE: u32 = 0x2002;
const LEAF: u32 = 0x2003;
const TAG_SET_TARGET: u32 = 0x21;
const TAG_DONE: u32 = 0x22;

static CHAIN_ROOT: AtomicU32 = AtomicU32::new(u32::MAX);
static CHAIN_MIDDLE: AtomicU32 = AtomicU32::new(u32::MAX);
static CHAIN_LEAF: AtomicU32 = AtomicU32::new(u32::MAX);

struct Root;

impl Behavior for Root {
    fn on_start(&mut self, scope: &mut ActorScope<'_>, _message: &Message) {
        CHAIN_ROOT.store(scope.name(), Ordering::SeqCst);
        let middle = scope.spawn(MIDDLE).expect("spawn middle");
        CHAIN_MIDDLE.store(middle, Ordering::SeqCst);
        scope.add_acquaintance(middle);
    }

    fn receive(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        if message.tag() == TAG_DONE {
            CHAIN_LEAF.store(message.source(), Ordering::SeqCst);
            let middle = scope.acquaintance(0).expect("middle recorded");
            scope.ask_to_stop(middle);
            scope.stop();
        }
    }
}

struct Middle;

impl Behavior for Middle {
    fn on_start(&mut self, scope: &mut ActorScope<'_>, _message: &Message) {
        let leaf = scope.spawn(LEAF).expect("spawn leaf");
        let root = scope.supervisor();
        scope.send(leaf, TAG_SET_TARGET, &root.to_ne_bytes());
    }

    fn receive(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        if message.tag() == ACTION_ASK_TO_STOP {
            scope.stop();
        }
    }
}

struct Leaf;

impl Behavior for Leaf {
    fn receive(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        if message.tag() == TAG_SET_TARGET {
            let target = u32::from_ne_bytes(message.data().try_into().expect("4 bytes"));
            scope.send(target, TAG_DONE, &[]);
            scope.stop();
        }
    }
}

#[test]
fn spawn_chain_completes_and_reclaims() {
    let mut node = single_node(2);
    node.add_script(Script::new(ROOT, "root", || Box::new(Root)))
        .unwrap();
    node.add_script(Script::new(MIDDLE, "middle", || Box::new(Middle)))
        .unwrap();
    node.add_script(Script::new(LEAF, "leaf", || Box::new(Leaf)))
        .unwrap();
    node.add_initial_actor(ROOT);
    node.run().unwrap();

    let root = CHAIN_ROOT.load(Ordering::SeqCst);
    let middle = CHAIN_MIDDLE.load(Ordering::SeqCst);
    let leaf = CHAIN_LEAF.load(Ordering::SeqCst);
    assert_ne!(root, u32::MAX);
    assert_ne!(middle, u32::MAX);
    assert_ne!(leaf, u32::MAX);
    assert!(root != middle && middle != leaf && root != leaf);

    assert_eq!(node.alive_actors(), 0);
    let counters = node.counters();
    assert_eq!(counters.actors_spawned, 3);
    assert_eq!(counters.actors_dead, 3);
}

// ── Stop cascade ────────────────────────────────────────────────────────

const SUPERVISOR: u32 = 0x3001;
const CHILD: u32 = 0x3002;
const TAG_STOPPING: u32 = 0x31;
const CHILD_COUNT: usize = 4;

struct Supervisor {
    stopped_children: usize,
}

impl Behavior for Supervisor {
    fn on_start(&mut self, scope: &mut ActorScope<'_>, _message: &Message) {
        for _ in 0..CHILD_COUNT {
            scope.spawn(CHILD).expect("spawn child");
        }
        let children = scope.children().to_vec();
        scope.send_range_binomial_tree(&children, ACTION_ASK_TO_STOP, &[]);
    }

    fn receive(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        if message.tag() == TAG_STOPPING {
            self.stopped_children += 1;
            if self.stopped_children == CHILD_COUNT {
                scope.stop();
            }
        }
    }
}

struct Child;

impl Behavior for Child {
    fn receive(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        if message.tag() == ACTION_ASK_TO_STOP {
            let supervisor = scope.supervisor();
            scope.send_empty(supervisor, TAG_STOPPING);
            scope.stop();
        }
    }
}

#[test]
fn stop_cascade_reaches_zero_and_shuts_down() {
    let mut node = single_node(3);
    node.add_script(Script::new(SUPERVISOR, "supervisor", || {
        Box::new(Supervisor {
            stopped_children: 0,
        })
    }))
    .unwrap();
    node.add_script(Script::new(CHILD, "child", || Box::new(Child)))
        .unwrap();
    node.add_initial_actor(SUPERVISOR);
    node.run().unwrap();

    assert_eq!(node.alive_actors(), 0);
    let counters = node.counters();
    assert_eq!(counters.actors_spawned, 1 + CHILD_COUNT as u64);
    assert_eq!(counters.actors_dead, 1 + CHILD_COUNT as u64);
    assert_eq!(counters.dropped_messages, 0);
}

// ── Engine-handled tags ─────────────────────────────────────────────────

const ASKER: u32 = 0x4001;
const TARGET: u32 = 0x4002;
const GHOST: u32 = 0x4003;

static SEEN_WORKER_COUNT: AtomicU32 = AtomicU32::new(u32::MAX);
static GHOST_NAME: AtomicU32 = AtomicU32::new(u32::MAX);

struct Asker {
    peer: u32,
}

impl Behavior for Asker {
    fn on_start(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        self.peer = peer_of(scope, message);
        scope.send_empty(self.peer, ACTION_GET_NODE_WORKER_COUNT);
    }

    fn receive(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        match message.tag() {
            ACTION_GET_NODE_WORKER_COUNT_REPLY => {
                let count = u32::from_ne_bytes(message.data().try_into().expect("4 bytes"));
                SEEN_WORKER_COUNT.store(count, Ordering::SeqCst);
                scope.send(self.peer, ACTION_SPAWN, &GHOST.to_ne_bytes());
            }
            ACTION_SPAWN_REPLY => {
                let name = u32::from_ne_bytes(message.data().try_into().expect("4 bytes"));
                GHOST_NAME.store(name, Ordering::SeqCst);
                scope.ask_to_stop(self.peer);
                scope.stop();
            }
            _ => {}
        }
    }
}

struct Target;

impl Behavior for Target {
    fn receive(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        if message.tag() == ACTION_ASK_TO_STOP {
            scope.stop();
        }
    }
}

struct Ghost;

impl Behavior for Ghost {
    fn on_start(&mut self, scope: &mut ActorScope<'_>, _message: &Message) {
        scope.stop();
    }

    fn receive(&mut self, _scope: &mut ActorScope<'_>, _message: &Message) {}
}

#[test]
fn engine_answers_worker_count_and_message_spawn() {
    let mut node = single_node(2);
    node.add_script(Script::new(ASKER, "asker", || Box::new(Asker { peer: 0 })))
        .unwrap();
    node.add_script(Script::new(TARGET, "target", || Box::new(Target)))
        .unwrap();
    node.add_script(Script::new(GHOST, "ghost", || Box::new(Ghost)))
        .unwrap();
    node.add_initial_actor(ASKER);
    node.add_initial_actor(TARGET);
    node.run().unwrap();

    assert_eq!(SEEN_WORKER_COUNT.load(Ordering::SeqCst), 2);
    let ghost = GHOST_NAME.load(Ordering::SeqCst);
    assert_ne!(ghost, SPAWN_FAILED);
    assert!(!node.initial_actors().contains(&ghost));
    assert_eq!(node.counters().actors_spawned, 3);
    assert_eq!(node.counters().actors_dead, 3);
}
