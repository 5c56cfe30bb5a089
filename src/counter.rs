//! Engine-wide instrumentation counters.
//!
//! One [`EngineCounters`] instance lives in the shared node core. Hot
//! paths bump individual counters with relaxed atomics; the main loop
//! snapshots them every load period when `-print-counters` is set.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic event counters for one node.
#[derive(Debug, Default)]
pub struct EngineCounters {
    /// Actors created on this node.
    pub(crate) actors_spawned: AtomicU64,
    /// Actors whose slots were reclaimed.
    pub(crate) actors_dead: AtomicU64,
    /// Messages placed on a local mailbox.
    pub(crate) local_deliveries: AtomicU64,
    /// Messages handed to the multiplexer for another node.
    pub(crate) remote_outbound: AtomicU64,
    /// Frames written to the transport.
    pub(crate) transport_sends: AtomicU64,
    /// Frames received from the transport.
    pub(crate) transport_receives: AtomicU64,
    /// Messages dropped because the destination was unknown or dead.
    pub(crate) dropped_messages: AtomicU64,
    /// Multiplexer batches flushed.
    pub(crate) batches_flushed: AtomicU64,
    /// Small messages coalesced into batches.
    pub(crate) frames_batched: AtomicU64,
    /// Messages that bypassed batching (large or bypass-tagged).
    pub(crate) bypass_sends: AtomicU64,
}

impl EngineCounters {
    pub(crate) fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            actors_spawned: self.actors_spawned.load(Ordering::Relaxed),
            actors_dead: self.actors_dead.load(Ordering::Relaxed),
            local_deliveries: self.local_deliveries.load(Ordering::Relaxed),
            remote_outbound: self.remote_outbound.load(Ordering::Relaxed),
            transport_sends: self.transport_sends.load(Ordering::Relaxed),
            transport_receives: self.transport_receives.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            frames_batched: self.frames_batched.load(Ordering::Relaxed),
            bypass_sends: self.bypass_sends.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value view of [`EngineCounters`], suitable for assertions and
/// for the periodic load report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub actors_spawned: u64,
    pub actors_dead: u64,
    pub local_deliveries: u64,
    pub remote_outbound: u64,
    pub transport_sends: u64,
    pub transport_receives: u64,
    pub dropped_messages: u64,
    pub batches_flushed: u64,
    pub frames_batched: u64,
    pub bypass_sends: u64,
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spawned={} dead={} local={} remote={} sends={} receives={} \
             dropped={} batches={} batched-frames={} bypass={}",
            self.actors_spawned,
            self.actors_dead,
            self.local_deliveries,
            self.remote_outbound,
            self.transport_sends,
            self.transport_receives,
            self.dropped_messages,
            self.batches_flushed,
            self.frames_batched,
            self.bypass_sends,
        )
    }
}
