//! Outbound message multiplexer.
//!
//! Small cross-node messages are coalesced into per-destination batches
//! so the transport sees a few large frames instead of many tiny ones.
//! A batch flushes when its body reaches the size threshold, when it
//! has been open longer than the latency bound, or when the main loop
//! forces it. Large messages and system tags bypass batching entirely.
//!
//! Batch buffers come from the multiplexer's own pool; with tracking
//! and normalization on, a flushed buffer is recycled for the next
//! batch to the same or another destination.
//!
//! Ordering: frames are appended in the order messages arrive from the
//! send queue, and flushes toward one destination are sequenced on the
//! transport, so two messages from the same source actor to the same
//! destination actor never reorder.

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::counter::EngineCounters;
use crate::error::EngineError;
use crate::memory::MemoryPool;
use crate::message::{is_system_tag, Message, MULTIPLEX_MESSAGE};
use crate::transport::Transport;
use crate::wire::{self, MessageHeader, ENVELOPE_HEADER_SIZE, MESSAGE_HEADER_SIZE};

/// One open batch toward one destination node.
struct Batch {
    buffer: NonNull<u8>,
    capacity: usize,
    /// Bytes written, including the envelope header slot.
    len: usize,
    frames: u32,
    /// When the first frame landed; drives the age flush.
    opened_at: Instant,
}

/// Per-node batching stage between the engine and the transport.
pub(crate) struct Multiplexer {
    nodes: u32,
    flush_threshold: usize,
    max_latency: Duration,
    pool: MemoryPool,
    batches: Vec<Option<Batch>>,
    counters: Arc<EngineCounters>,
}

// SAFETY: the multiplexer (and the raw batch buffers inside) is owned
// by the node main loop alone; it moves with the node, it is never
// shared.
unsafe impl Send for Multiplexer {}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("nodes", &self.nodes)
            .field("flush_threshold", &self.flush_threshold)
            .field(
                "open_batches",
                &self.batches.iter().filter(|b| b.is_some()).count(),
            )
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    pub(crate) fn new(
        nodes: u32,
        flush_threshold: usize,
        max_latency: Duration,
        counters: Arc<EngineCounters>,
    ) -> Self {
        let mut pool = MemoryPool::new("multiplexer", crate::memory::DEFAULT_BLOCK_SIZE);
        pool.enable_normalization();
        Self {
            nodes,
            flush_threshold,
            max_latency,
            pool,
            batches: (0..nodes).map(|_| None).collect(),
            counters,
        }
    }

    /// Routes one outbound message: append to the destination's batch,
    /// or hand it straight to the transport when batching would not
    /// help. The caller still owns the message payload afterwards.
    pub(crate) fn multiplex(
        &mut self,
        message: &Message,
        transport: &mut dyn Transport,
    ) -> Result<(), EngineError> {
        let destination = message.destination() % self.nodes;
        let header = MessageHeader::of(message);
        let frame_size = header.frame_size();

        if is_system_tag(message.tag()) || frame_size >= self.flush_threshold {
            // Bypass class: synchronization tags must not wait out a
            // batch deadline, and large payloads amortize nothing.
            self.send_single(destination, &header, message.data(), transport)?;
            EngineCounters::bump(&self.counters.bypass_sends);
            return Ok(());
        }

        let capacity = ENVELOPE_HEADER_SIZE + 2 * self.flush_threshold;
        if self.batches[destination as usize].is_none() {
            let buffer = self.pool.allocate(capacity);
            self.batches[destination as usize] = Some(Batch {
                buffer,
                capacity,
                len: ENVELOPE_HEADER_SIZE,
                frames: 0,
                opened_at: Instant::now(),
            });
        }
        let batch = self.batches[destination as usize]
            .as_mut()
            .expect("batch was just ensured");

        debug_assert!(batch.len + frame_size <= batch.capacity);
        // SAFETY: the batch buffer has `capacity` bytes and the append
        // stays inside it (a qualifying frame is < flush_threshold and
        // the batch body was < flush_threshold before the append).
        unsafe {
            let body = std::slice::from_raw_parts_mut(batch.buffer.as_ptr(), batch.capacity);
            wire::write_header(&mut body[batch.len..], &header);
            body[batch.len + MESSAGE_HEADER_SIZE..batch.len + frame_size]
                .copy_from_slice(message.data());
        }
        batch.len += frame_size;
        batch.frames += 1;
        EngineCounters::bump(&self.counters.frames_batched);

        if batch.len - ENVELOPE_HEADER_SIZE >= self.flush_threshold {
            self.flush(destination, transport)?;
        }
        Ok(())
    }

    /// Flushes batches that have waited past the latency bound. Called
    /// once per main-loop iteration.
    pub(crate) fn poll(&mut self, transport: &mut dyn Transport) -> Result<(), EngineError> {
        let now = Instant::now();
        for destination in 0..self.nodes {
            let expired = self.batches[destination as usize]
                .as_ref()
                .is_some_and(|b| now.duration_since(b.opened_at) >= self.max_latency);
            if expired {
                self.flush(destination, transport)?;
            }
        }
        Ok(())
    }

    /// Unconditionally flushes every open batch (shutdown path).
    pub(crate) fn flush_all(&mut self, transport: &mut dyn Transport) -> Result<(), EngineError> {
        for destination in 0..self.nodes {
            if self.batches[destination as usize].is_some() {
                self.flush(destination, transport)?;
            }
        }
        Ok(())
    }

    fn flush(
        &mut self,
        destination: u32,
        transport: &mut dyn Transport,
    ) -> Result<(), EngineError> {
        let Some(batch) = self.batches[destination as usize].take() else {
            return Ok(());
        };
        // SAFETY: buffer holds `capacity` bytes, len <= capacity.
        let body =
            unsafe { std::slice::from_raw_parts_mut(batch.buffer.as_ptr(), batch.capacity) };
        wire::write_envelope(body, MULTIPLEX_MESSAGE, batch.frames);
        let result = transport.send(destination, &body[..batch.len]);
        self.pool.free(batch.buffer);
        result?;
        EngineCounters::bump(&self.counters.batches_flushed);
        EngineCounters::bump(&self.counters.transport_sends);
        Ok(())
    }

    fn send_single(
        &mut self,
        destination: u32,
        header: &MessageHeader,
        payload: &[u8],
        transport: &mut dyn Transport,
    ) -> Result<(), EngineError> {
        let frame_size = header.frame_size();
        let buffer = self.pool.allocate(frame_size);
        // SAFETY: frame_size bytes were just allocated at `buffer`.
        let body = unsafe { std::slice::from_raw_parts_mut(buffer.as_ptr(), frame_size) };
        wire::write_header(body, header);
        body[MESSAGE_HEADER_SIZE..].copy_from_slice(payload);
        let result = transport.send(destination, body);
        self.pool.free(buffer);
        result?;
        EngineCounters::bump(&self.counters.transport_sends);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPool;
    use crate::message::{BufferOrigin, ACTION_STOP};
    use crate::transport::{MemoryFabric, Transport};

    fn counters() -> Arc<EngineCounters> {
        Arc::new(EngineCounters::default())
    }

    fn pooled_message(pool: &mut MemoryPool, tag: u32, dest: u32, data: &[u8]) -> Message {
        let buffer = pool.allocate(data.len());
        // SAFETY: data.len() bytes were just allocated.
        unsafe {
            buffer
                .as_ptr()
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
        Message::with_buffer(
            tag,
            0,
            dest,
            buffer,
            u32::try_from(data.len()).unwrap(),
            BufferOrigin::Worker(0),
        )
    }

    #[test]
    fn small_messages_coalesce_into_few_sends() {
        let fabric = MemoryFabric::new(2);
        let mut transport = fabric.endpoint(0);
        let mut mux = Multiplexer::new(2, 1024, Duration::from_secs(10), counters());
        let mut pool = MemoryPool::new("test", 1 << 16);

        for i in 0..100u64 {
            let mut m = pooled_message(&mut pool, 42, 1, &i.to_ne_bytes());
            mux.multiplex(&m, &mut transport).unwrap();
            let (buffer, _) = m.take_buffer().unwrap();
            pool.free(buffer);
        }
        mux.flush_all(&mut transport).unwrap();

        // 24-byte frames against a 1024-byte threshold: two full
        // batches plus the forced remainder.
        let sends = fabric.total_sends();
        assert!((2..=3).contains(&sends), "sends = {sends}");

        // Every frame arrives exactly once, in order.
        let mut b = fabric.endpoint(1);
        let mut seen = Vec::new();
        while let Some(frame) = b.poll().unwrap() {
            let (tag, count) = wire::read_envelope(&frame.data).unwrap();
            assert_eq!(tag, MULTIPLEX_MESSAGE);
            let frames: Vec<_> = wire::frames(&frame.data[ENVELOPE_HEADER_SIZE..]).collect();
            assert_eq!(frames.len(), count as usize);
            for (header, payload) in frames {
                assert_eq!(header.tag, 42);
                seen.push(u64::from_ne_bytes(payload.try_into().unwrap()));
            }
        }
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn system_tags_bypass_batching() {
        let fabric = MemoryFabric::new(2);
        let mut transport = fabric.endpoint(0);
        let stats = counters();
        let mut mux = Multiplexer::new(2, 1024, Duration::from_secs(10), Arc::clone(&stats));

        let m = Message::empty(ACTION_STOP, 0, 1);
        mux.multiplex(&m, &mut transport).unwrap();

        assert_eq!(fabric.total_sends(), 1);
        assert_eq!(stats.snapshot().bypass_sends, 1);
        assert_eq!(stats.snapshot().frames_batched, 0);
    }

    #[test]
    fn large_messages_bypass_batching() {
        let fabric = MemoryFabric::new(2);
        let mut transport = fabric.endpoint(0);
        let mut mux = Multiplexer::new(2, 64, Duration::from_secs(10), counters());
        let mut pool = MemoryPool::new("test", 1 << 16);

        let big = vec![7u8; 128];
        let mut m = pooled_message(&mut pool, 5, 1, &big);
        mux.multiplex(&m, &mut transport).unwrap();
        let (buffer, _) = m.take_buffer().unwrap();
        pool.free(buffer);

        assert_eq!(fabric.total_sends(), 1);
        let mut b = fabric.endpoint(1);
        let frame = b.poll().unwrap().unwrap();
        let header = wire::read_header(&frame.data).unwrap();
        assert_eq!(header.payload_length, 128);
    }

    #[test]
    fn age_flush_is_driven_by_poll() {
        let fabric = MemoryFabric::new(2);
        let mut transport = fabric.endpoint(0);
        let mut mux = Multiplexer::new(2, 1024, Duration::from_millis(0), counters());
        let mut pool = MemoryPool::new("test", 1 << 16);

        let mut m = pooled_message(&mut pool, 9, 1, b"tick");
        mux.multiplex(&m, &mut transport).unwrap();
        let (buffer, _) = m.take_buffer().unwrap();
        pool.free(buffer);
        assert_eq!(fabric.total_sends(), 0);

        mux.poll(&mut transport).unwrap();
        assert_eq!(fabric.total_sends(), 1);
    }
}
