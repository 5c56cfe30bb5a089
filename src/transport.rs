//! Transport abstraction and concrete fabrics.
//!
//! The engine only needs two operations from a transport: push a frame
//! toward another node, and probe for a completed inbound frame. Frames
//! are opaque here; the node layer decides whether a frame is a single
//! message or a multiplexed batch.
//!
//! Three implementations:
//!
//! - [`LoopbackTransport`] — the single-node stand-in; never carries a
//!   frame.
//! - [`MemoryFabric`] / [`MemoryTransport`] — an in-process fabric for
//!   multi-node runs inside one OS process (and for tests).
//! - [`TcpTransport`] — length-prefixed framing over TCP, full mesh
//!   established at initialization.
//!
//! All three preserve frame order per (source node, destination node)
//! pair, which is what the multiplexer's ordering guarantee stands on.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::EngineError;

/// One frame handed up from the transport.
#[derive(Debug)]
pub struct InboundFrame {
    /// Node that sent the frame.
    pub source: u32,
    /// Frame bytes (message or batch envelope).
    pub data: Vec<u8>,
}

/// Abstract node-to-node frame mover.
pub trait Transport: Send {
    /// This node's name.
    fn node(&self) -> u32;

    /// Total nodes on the fabric.
    fn nodes(&self) -> u32;

    /// Queues `frame` toward `destination`. Completion is synchronous:
    /// when this returns, the caller may reuse the frame buffer.
    fn send(&mut self, destination: u32, frame: &[u8]) -> Result<(), EngineError>;

    /// Probes for one inbound frame without blocking.
    fn poll(&mut self) -> Result<Option<InboundFrame>, EngineError>;
}

// ── Loopback ────────────────────────────────────────────────────────────

/// Transport for a single-node cluster. The engine never routes
/// remotely when there is one node, so both operations are trivial.
#[derive(Debug)]
pub struct LoopbackTransport {
    node: u32,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new(node: u32) -> Self {
        Self { node }
    }
}

impl Transport for LoopbackTransport {
    fn node(&self) -> u32 {
        self.node
    }

    fn nodes(&self) -> u32 {
        1
    }

    fn send(&mut self, destination: u32, _frame: &[u8]) -> Result<(), EngineError> {
        Err(EngineError::UnreachableNode(destination))
    }

    fn poll(&mut self) -> Result<Option<InboundFrame>, EngineError> {
        Ok(None)
    }
}

// ── In-process fabric ───────────────────────────────────────────────────

/// Shared mailboxes connecting every [`MemoryTransport`] endpoint in
/// one process. Frame order per (source, destination) pair follows send
/// order because each inbox is a single FIFO.
#[derive(Debug)]
pub struct MemoryFabric {
    inboxes: Vec<Mutex<VecDeque<InboundFrame>>>,
    sends: AtomicU64,
}

impl MemoryFabric {
    /// Creates a fabric for `nodes` endpoints.
    #[must_use]
    pub fn new(nodes: u32) -> Arc<Self> {
        Arc::new(Self {
            inboxes: (0..nodes).map(|_| Mutex::new(VecDeque::new())).collect(),
            sends: AtomicU64::new(0),
        })
    }

    /// The endpoint for `node`.
    #[must_use]
    pub fn endpoint(self: &Arc<Self>, node: u32) -> MemoryTransport {
        assert!((node as usize) < self.inboxes.len(), "node off the fabric");
        MemoryTransport {
            fabric: Arc::clone(self),
            node,
        }
    }

    /// Total frames carried, across all node pairs. Batching tests key
    /// off this.
    #[must_use]
    pub fn total_sends(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }
}

/// One node's endpoint on a [`MemoryFabric`].
#[derive(Debug)]
pub struct MemoryTransport {
    fabric: Arc<MemoryFabric>,
    node: u32,
}

impl Transport for MemoryTransport {
    fn node(&self) -> u32 {
        self.node
    }

    fn nodes(&self) -> u32 {
        u32::try_from(self.fabric.inboxes.len()).expect("node count fits u32")
    }

    fn send(&mut self, destination: u32, frame: &[u8]) -> Result<(), EngineError> {
        let inbox = self
            .fabric
            .inboxes
            .get(destination as usize)
            .ok_or(EngineError::UnreachableNode(destination))?;
        inbox
            .lock()
            .expect("fabric inbox lock poisoned")
            .push_back(InboundFrame {
                source: self.node,
                data: frame.to_vec(),
            });
        self.fabric.sends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<InboundFrame>, EngineError> {
        Ok(self.fabric.inboxes[self.node as usize]
            .lock()
            .expect("fabric inbox lock poisoned")
            .pop_front())
    }
}

// ── TCP ─────────────────────────────────────────────────────────────────

/// Wire framing: `[length(u32) | frame bytes]`, with a one-shot
/// `[node(u32)]` hello after connect so the acceptor can map the stream
/// to a node name.
const TCP_LENGTH_PREFIX: usize = 4;

/// Largest accepted frame (16 MiB), matching the sanity bound a
/// homogeneous cluster actually needs.
const TCP_MAX_FRAME: usize = 16 * 1024 * 1024;

/// How long to keep retrying the initial mesh dial.
const TCP_CONNECT_DEADLINE: Duration = Duration::from_secs(30);

struct TcpPeer {
    stream: TcpStream,
    /// Partial inbound frame: accumulated bytes until the announced
    /// length is complete.
    pending: Vec<u8>,
    expected: Option<usize>,
}

/// Full-mesh TCP transport with length-prefixed frames.
pub struct TcpTransport {
    node: u32,
    peers: Vec<Option<TcpPeer>>,
    /// Round-robin cursor so one chatty peer cannot starve the rest.
    poll_cursor: usize,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("node", &self.node)
            .field("peers", &self.peers.iter().filter(|p| p.is_some()).count())
            .finish_non_exhaustive()
    }
}

impl TcpTransport {
    /// Establishes the mesh: listens on `addresses[node]`, dials every
    /// lower-numbered node, accepts every higher-numbered one. Returns
    /// once all `addresses.len() - 1` peers are connected.
    pub fn mesh(node: u32, addresses: &[SocketAddr]) -> Result<Self, EngineError> {
        let nodes = addresses.len();
        let listener = TcpListener::bind(addresses[node as usize])?;
        let mut peers: Vec<Option<TcpPeer>> = (0..nodes).map(|_| None).collect();

        // Dial down, accept up; both sides agree on who initiates, so
        // the mesh converges without a coordinator.
        for peer in 0..node {
            let stream = dial(addresses[peer as usize])?;
            let mut stream = stream;
            stream.write_all(&node.to_ne_bytes())?;
            stream.set_nodelay(true)?;
            stream.set_nonblocking(true)?;
            peers[peer as usize] = Some(TcpPeer {
                stream,
                pending: Vec::new(),
                expected: None,
            });
        }

        let expected_accepts = nodes - 1 - node as usize;
        for _ in 0..expected_accepts {
            let (mut stream, _) = listener.accept()?;
            let mut hello = [0u8; 4];
            stream.read_exact(&mut hello)?;
            let peer = u32::from_ne_bytes(hello);
            if peer as usize >= nodes {
                return Err(EngineError::UnreachableNode(peer));
            }
            stream.set_nodelay(true)?;
            stream.set_nonblocking(true)?;
            peers[peer as usize] = Some(TcpPeer {
                stream,
                pending: Vec::new(),
                expected: None,
            });
        }

        Ok(Self {
            node,
            peers,
            poll_cursor: 0,
        })
    }
}

fn dial(address: SocketAddr) -> Result<TcpStream, EngineError> {
    let deadline = Instant::now() + TCP_CONNECT_DEADLINE;
    loop {
        match TcpStream::connect(address) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                tracing::trace!(%address, error = %e, "mesh dial retry");
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

impl Transport for TcpTransport {
    fn node(&self) -> u32 {
        self.node
    }

    fn nodes(&self) -> u32 {
        u32::try_from(self.peers.len()).expect("node count fits u32")
    }

    fn send(&mut self, destination: u32, frame: &[u8]) -> Result<(), EngineError> {
        let peer = self
            .peers
            .get_mut(destination as usize)
            .and_then(Option::as_mut)
            .ok_or(EngineError::UnreachableNode(destination))?;
        let length = u32::try_from(frame.len()).map_err(|_| {
            EngineError::Transport(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))
        })?;
        // The stream is nonblocking for reads; sends block until the
        // kernel buffer takes the frame, preserving per-pair order.
        write_fully(&mut peer.stream, &length.to_ne_bytes())?;
        write_fully(&mut peer.stream, frame)?;
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<InboundFrame>, EngineError> {
        let count = self.peers.len();
        for step in 0..count {
            let index = (self.poll_cursor + step) % count;
            let Some(peer) = self.peers[index].as_mut() else {
                continue;
            };
            if let Some(frame) = poll_peer(peer)? {
                self.poll_cursor = (index + 1) % count;
                return Ok(Some(InboundFrame {
                    source: u32::try_from(index).expect("peer index fits u32"),
                    data: frame,
                }));
            }
        }
        Ok(None)
    }
}

/// Writes the whole buffer, spinning through `WouldBlock`.
fn write_fully(stream: &mut TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::hint::spin_loop(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Advances one peer's inbound state machine by whatever bytes are
/// available; returns a frame when one completes.
fn poll_peer(peer: &mut TcpPeer) -> Result<Option<Vec<u8>>, EngineError> {
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let wanted = match peer.expected {
            None => TCP_LENGTH_PREFIX - peer.pending.len(),
            Some(length) => length - peer.pending.len(),
        };
        if wanted == 0 {
            break;
        }
        let take = wanted.min(chunk.len());
        match peer.stream.read(&mut chunk[..take]) {
            Ok(0) => {
                return Err(EngineError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed",
                )))
            }
            Ok(n) => peer.pending.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        if peer.expected.is_none() && peer.pending.len() == TCP_LENGTH_PREFIX {
            let length =
                u32::from_ne_bytes(peer.pending[..4].try_into().expect("4 bytes")) as usize;
            if length > TCP_MAX_FRAME {
                return Err(EngineError::Transport(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "frame exceeds maximum size",
                )));
            }
            peer.pending.clear();
            peer.expected = Some(length);
        }
    }

    match peer.expected {
        Some(length) if peer.pending.len() == length => {
            peer.expected = None;
            Ok(Some(std::mem::take(&mut peer.pending)))
        }
        _ => Ok(None),
    }
}
