//! Engine error taxonomy.
//!
//! Errors cross the public API only at configuration and transport
//! boundaries. Routing problems (unknown destination, dead actor) are
//! never errors: they are drop-and-count events. Resource exhaustion
//! inside the memory pools aborts the process.

use std::io;

use thiserror::Error;

/// Errors surfaced by the engine's fallible entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A command-line option was not recognized by the engine.
    #[error("unknown engine option: {0}")]
    UnknownOption(String),

    /// A command-line option carried an unusable value.
    #[error("invalid value for {option}: {value}")]
    InvalidOptionValue {
        /// The offending option name.
        option: &'static str,
        /// The raw value as given.
        value: String,
    },

    /// The configured worker count is zero or absurd.
    #[error("invalid worker count: {0}")]
    InvalidWorkerCount(usize),

    /// Spawn was requested for a script id that was never registered.
    #[error("script {0:#010x} is not registered")]
    UnknownScript(u32),

    /// A script id was registered twice.
    #[error("script {0:#010x} is already registered")]
    DuplicateScript(u32),

    /// The actor slot table is exhausted.
    #[error("actor table is full ({0} slots)")]
    ActorTableFull(usize),

    /// Spawn was requested while the node is tearing down.
    #[error("node is shutting down")]
    ShuttingDown,

    /// The destination node is not part of the transport fabric.
    #[error("node {0} is not reachable")]
    UnreachableNode(u32),

    /// The underlying transport failed. Transport failures are fatal to
    /// the engine; the main loop propagates them out of `run`.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_script_id_in_hex() {
        let e = EngineError::UnknownScript(0xbf0a_d0f3);
        assert!(e.to_string().contains("0xbf0ad0f3"));
    }

    #[test]
    fn io_error_converts() {
        let io = io::Error::new(io::ErrorKind::BrokenPipe, "peer gone");
        let e: EngineError = io.into();
        assert!(matches!(e, EngineError::Transport(_)));
    }
}
