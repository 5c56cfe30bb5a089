//! Node configuration from command-line arguments and environment.
//!
//! The engine understands a small set of single-dash options in the
//! style of cluster launchers (`-threads 8 -print-load`); everything it
//! does not recognize as an engine option is passed through to the
//! initial actors untouched. Cluster placement (`node`, `nodes`) comes
//! from the environment, set by the launcher:
//!
//! - `ARGON_NODE` — this node's name (integer, default 0)
//! - `ARGON_NODES` — total node count (default 1)
//! - `ARGON_DETERMINISTIC_NAMES` — `0` switches actor names to random
//!   31-bit integers (congruent to the node name, so location lookup
//!   stays O(1))

use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Counter snapshot cadence for `-print-load` and friends, in seconds.
pub const LOAD_PERIOD: Duration = Duration::from_secs(10);

/// Default multiplexer flush threshold in bytes.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 4096;

/// Default maximum added latency before a non-empty batch is flushed.
pub const DEFAULT_MAX_BATCH_LATENCY: Duration = Duration::from_millis(1);

/// Default upper bound on live actors per node.
pub const DEFAULT_MAX_ACTORS: usize = 1 << 20;

/// Everything the engine needs to come up on one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's name (integer assigned by the cluster launcher).
    pub node: u32,
    /// Total number of nodes in the cluster.
    pub nodes: u32,
    /// Worker threads on this node.
    pub workers: usize,
    /// Print the periodic load report.
    pub print_load: bool,
    /// Print the periodic counter snapshot.
    pub print_counters: bool,
    /// Print the periodic memory-pool footprint.
    pub print_memory_usage: bool,
    /// Monotonic, node-congruent actor names (see module docs).
    pub deterministic_names: bool,
    /// Enable the periodic actor load balancer.
    pub auto_scaling: bool,
    /// Multiplexer batch flush threshold in bytes.
    pub flush_threshold: usize,
    /// Maximum time a non-empty batch may wait before flushing.
    pub max_batch_latency: Duration,
    /// Maximum live actors on this node.
    pub max_actors: usize,
    /// Arguments the engine did not consume; handed to initial actors.
    pub app_args: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: env_u32("ARGON_NODE", 0),
            nodes: env_u32("ARGON_NODES", 1).max(1),
            workers: default_workers(),
            print_load: false,
            print_counters: false,
            print_memory_usage: false,
            deterministic_names: !matches!(
                std::env::var("ARGON_DETERMINISTIC_NAMES").as_deref(),
                Ok("0")
            ),
            auto_scaling: false,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            max_batch_latency: DEFAULT_MAX_BATCH_LATENCY,
            max_actors: DEFAULT_MAX_ACTORS,
            app_args: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Builds a configuration from process arguments (without the
    /// program name). Engine options are consumed; the rest land in
    /// [`NodeConfig::app_args`].
    pub fn from_args<I>(args: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();
        let mut iter = args.into_iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-threads" => {
                    let value = iter.next().ok_or(EngineError::InvalidOptionValue {
                        option: "-threads",
                        value: String::from("<missing>"),
                    })?;
                    let workers: usize =
                        value
                            .parse()
                            .map_err(|_| EngineError::InvalidOptionValue {
                                option: "-threads",
                                value: value.clone(),
                            })?;
                    if workers == 0 {
                        return Err(EngineError::InvalidWorkerCount(workers));
                    }
                    config.workers = workers;
                }
                "-print-load" => config.print_load = true,
                "-print-counters" => config.print_counters = true,
                "-print-memory-usage" => config.print_memory_usage = true,
                "-auto-scaling" => config.auto_scaling = true,
                _ => config.app_args.push(arg),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks invariants that the builders above cannot express.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::InvalidWorkerCount(self.workers));
        }
        if self.node >= self.nodes {
            return Err(EngineError::InvalidOptionValue {
                option: "ARGON_NODE",
                value: self.node.to_string(),
            });
        }
        Ok(())
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(2)
        .max(1)
}

static TRACING_INIT: Once = Once::new();

/// Installs the global `tracing` subscriber, once per process.
///
/// Filtering follows `RUST_LOG`; the default keeps the engine quiet
/// except for warnings.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
