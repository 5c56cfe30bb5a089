//! Block partitioner handshake: a configuration-driven actor that
//! splits a stream of entries into block-sized store assignments, the
//! way a sequence store manager would drive it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use argon::{wire, ActorScope, Behavior, Message, Node, NodeConfig, Script, ACTION_ASK_TO_STOP};

const DRIVER: u32 = 0x7001;
const PARTITIONER: u32 = 0x7002;

const TAG_SET_BLOCK_SIZE: u32 = 0x71;
const TAG_SET_BLOCK_SIZE_REPLY: u32 = 0x72;
const TAG_SET_ENTRY_VECTOR: u32 = 0x73;
const TAG_SET_ENTRY_VECTOR_REPLY: u32 = 0x74;
const TAG_SET_ACTOR_COUNT: u32 = 0x75;
const TAG_SET_ACTOR_COUNT_REPLY: u32 = 0x76;
const TAG_PROVIDE_STORE_ENTRY_COUNTS: u32 = 0x77;

static STORE_COUNTS: Mutex<Vec<u64>> = Mutex::new(Vec::new());
static REPLIES_SEEN: AtomicU32 = AtomicU32::new(0);

// ── Partitioner ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Partitioner {
    block_size: Option<u64>,
    entries: Option<Vec<u64>>,
    store_count: Option<u32>,
    controller: Option<u32>,
    provided: bool,
}

impl Partitioner {
    /// Once fully configured, assigns whole blocks to stores in
    /// round-robin order and reports the per-store entry counts.
    fn verify(&mut self, scope: &mut ActorScope<'_>) {
        if self.provided {
            return;
        }
        let (Some(block_size), Some(entries), Some(stores)) =
            (self.block_size, self.entries.as_ref(), self.store_count)
        else {
            return;
        };

        let stores = stores as usize;
        let total: u64 = entries.iter().sum();

        // Accumulate per-store totals in dispatch-scratch memory, then
        // copy them out before touching the scope again.
        let counts: Vec<u64> = {
            let table = scope.scratch(stores * 8);
            let mut remaining = total;
            let mut store = 0usize;
            while remaining > 0 {
                let block = remaining.min(block_size);
                let slot = &mut table[store * 8..store * 8 + 8];
                let current = u64::from_ne_bytes(slot.try_into().expect("8 bytes"));
                slot.copy_from_slice(&(current + block).to_ne_bytes());
                remaining -= block;
                store = (store + 1) % stores;
            }
            table
                .chunks_exact(8)
                .map(|chunk| u64::from_ne_bytes(chunk.try_into().expect("8 bytes")))
                .collect()
        };

        let controller = self.controller.expect("configured by someone");
        scope.send(
            controller,
            TAG_PROVIDE_STORE_ENTRY_COUNTS,
            &wire::pack_u64_vector(&counts),
        );
        self.provided = true;
    }
}

impl Behavior for Partitioner {
    fn receive(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        match message.tag() {
            TAG_SET_BLOCK_SIZE => {
                self.controller = Some(message.source());
                self.block_size = Some(u64::from_ne_bytes(
                    message.data().try_into().expect("8 bytes"),
                ));
                scope.reply_empty(TAG_SET_BLOCK_SIZE_REPLY);
                self.verify(scope);
            }
            TAG_SET_ENTRY_VECTOR => {
                self.controller = Some(message.source());
                self.entries =
                    Some(wire::unpack_u64_vector(message.data()).expect("entry vector"));
                scope.reply_empty(TAG_SET_ENTRY_VECTOR_REPLY);
                self.verify(scope);
            }
            TAG_SET_ACTOR_COUNT => {
                self.controller = Some(message.source());
                self.store_count = Some(u32::from_ne_bytes(
                    message.data().try_into().expect("4 bytes"),
                ));
                scope.reply_empty(TAG_SET_ACTOR_COUNT_REPLY);
                self.verify(scope);
            }
            ACTION_ASK_TO_STOP => scope.stop(),
            _ => {}
        }
    }
}

// ── Driver ──────────────────────────────────────────────────────────────

struct Driver;

impl Behavior for Driver {
    fn on_start(&mut self, scope: &mut ActorScope<'_>, _message: &Message) {
        let partitioner = scope.spawn(PARTITIONER).expect("spawn partitioner");
        scope.send(partitioner, TAG_SET_BLOCK_SIZE, &4096u64.to_ne_bytes());
        scope.send(
            partitioner,
            TAG_SET_ENTRY_VECTOR,
            &wire::pack_u64_vector(&[10_000]),
        );
        scope.send(partitioner, TAG_SET_ACTOR_COUNT, &3u32.to_ne_bytes());
    }

    fn receive(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        match message.tag() {
            TAG_SET_BLOCK_SIZE_REPLY | TAG_SET_ENTRY_VECTOR_REPLY | TAG_SET_ACTOR_COUNT_REPLY => {
                REPLIES_SEEN.fetch_add(1, Ordering::SeqCst);
            }
            TAG_PROVIDE_STORE_ENTRY_COUNTS => {
                let counts = wire::unpack_u64_vector(message.data()).expect("store counts");
                *STORE_COUNTS.lock().unwrap() = counts;
                let partitioner = scope.children()[0];
                scope.ask_to_stop(partitioner);
                scope.stop();
            }
            _ => {}
        }
    }
}

#[test]
fn partitioner_handshake() {
    let config = NodeConfig {
        node: 0,
        nodes: 1,
        workers: 2,
        ..NodeConfig::default()
    };
    let mut node = Node::init(config).unwrap();
    node.add_script(Script::new(DRIVER, "driver", || Box::new(Driver)))
        .unwrap();
    node.add_script(Script::new(PARTITIONER, "partitioner", || {
        Box::new(Partitioner::default())
    }))
    .unwrap();
    node.add_initial_actor(DRIVER);
    node.run().unwrap();

    let counts = STORE_COUNTS.lock().unwrap().clone();
    assert_eq!(counts, vec![4096, 4096, 1808]);
    assert_eq!(counts.iter().sum::<u64>(), 10_000);
    assert_eq!(REPLIES_SEEN.load(Ordering::SeqCst), 3);
    assert_eq!(node.alive_actors(), 0);
}
