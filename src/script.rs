//! Scripts: the behavior descriptors shared by all actors of a class.
//!
//! A [`Script`] ties an integer id to a factory producing the boxed
//! [`Behavior`] for each spawned actor. Registration is late (any time
//! before the first spawn of that script) and immutable afterwards:
//! `add` takes the registry write lock, lookups share a read lock and
//! copy the descriptor out.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::actor::ActorScope;
use crate::error::EngineError;
use crate::message::Message;

/// User-defined actor behavior. One instance exists per actor; the
/// engine guarantees at most one thread is inside any of these methods
/// for a given actor at a time.
///
/// Handlers must return promptly: messages are the only IPC, and a
/// blocked handler stalls every actor queued behind it on that worker.
pub trait Behavior: Send {
    /// Runs when the engine delivers `ACTION_START`, before any other
    /// message. For initial actors the message payload is the packed
    /// vector of the node's initial actor names.
    fn on_start(&mut self, scope: &mut ActorScope<'_>, message: &Message) {
        let _ = (scope, message);
    }

    /// Handles one message. Borrow the message; never retain it.
    fn receive(&mut self, scope: &mut ActorScope<'_>, message: &Message);

    /// Runs once when the actor dies (after it sent `ACTION_STOP` to
    /// itself), before the slot is reclaimed.
    fn on_stop(&mut self, scope: &mut ActorScope<'_>) {
        let _ = scope;
    }
}

/// Factory invoked at spawn to produce the actor's behavior instance.
pub type BehaviorFactory = fn() -> Box<dyn Behavior>;

/// Static description of an actor class.
#[derive(Clone, Copy)]
pub struct Script {
    id: u32,
    name: &'static str,
    factory: BehaviorFactory,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("id", &format_args!("{:#010x}", self.id))
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Script {
    #[must_use]
    pub fn new(id: u32, name: &'static str, factory: BehaviorFactory) -> Self {
        Self { id, name, factory }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn instantiate(&self) -> Box<dyn Behavior> {
        (self.factory)()
    }
}

/// Node-wide script table.
#[derive(Debug, Default)]
pub struct ScriptRegistry {
    scripts: RwLock<HashMap<u32, Script>>,
}

impl ScriptRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a script. Ids are immutable once taken.
    pub fn add(&self, script: Script) -> Result<(), EngineError> {
        let mut scripts = self.scripts.write().expect("script lock poisoned");
        if scripts.contains_key(&script.id()) {
            return Err(EngineError::DuplicateScript(script.id()));
        }
        scripts.insert(script.id(), script);
        Ok(())
    }

    /// Copies the descriptor for `id` out of the table.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<Script> {
        self.scripts
            .read()
            .expect("script lock poisoned")
            .get(&id)
            .copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scripts.read().expect("script lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
