//! Distributed actor engine.
//!
//! Lightweight actors addressed by globally unique integer names,
//! scheduled across a fixed pool of worker threads per node, with
//! location-transparent message delivery and transport-level batching
//! of small cross-node messages. Handlers are synchronous and
//! run-to-completion; messages are the only IPC.
//!
//! # Architecture
//!
//! ```text
//! Layer 0: error, counter, config, wire, memory   (no internal deps)
//! Layer 1: mpsc, message                          (atomic primitives, pools)
//! Layer 2: mailbox, script                        (L0+L1)
//! Layer 3: actor                                  (L2)
//! Layer 4: worker, worker_pool, multiplexer       (L3)
//! Layer 5: transport, node, signal                (everything below)
//! ```
//!
//! # Quick shape
//!
//! ```no_run
//! use argon::{Behavior, ActorScope, Message, Node, NodeConfig, Script};
//!
//! struct Greeter;
//!
//! impl Behavior for Greeter {
//!     fn on_start(&mut self, scope: &mut ActorScope<'_>, _message: &Message) {
//!         scope.stop();
//!     }
//!     fn receive(&mut self, _scope: &mut ActorScope<'_>, _message: &Message) {}
//! }
//!
//! let mut node = Node::init(NodeConfig::default()).unwrap();
//! node.add_script(Script::new(0x1, "greeter", || Box::new(Greeter))).unwrap();
//! node.add_initial_actor(0x1);
//! node.run().unwrap();
//! ```

pub mod actor;
pub mod config;
pub mod counter;
pub mod error;
pub mod mailbox;
pub mod memory;
pub mod message;
pub mod mpsc;
pub mod multiplexer;
pub mod node;
pub mod script;
pub mod signal;
pub mod transport;
pub mod wire;
pub mod worker;
pub mod worker_pool;

pub use actor::{Actor, ActorScope};
pub use config::NodeConfig;
pub use counter::CounterSnapshot;
pub use error::EngineError;
pub use memory::MemoryPool;
pub use message::{
    Message, ACTION_ASK_TO_STOP, ACTION_BINOMIAL_TREE_SEND, ACTION_GET_NODE_WORKER_COUNT,
    ACTION_GET_NODE_WORKER_COUNT_REPLY, ACTION_SPAWN, ACTION_SPAWN_REPLY, ACTION_START,
    ACTION_START_REPLY, ACTION_STOP,
};
pub use node::Node;
pub use script::{Behavior, Script};
pub use transport::{
    InboundFrame, LoopbackTransport, MemoryFabric, MemoryTransport, TcpTransport, Transport,
};
pub use worker::SPAWN_FAILED;
