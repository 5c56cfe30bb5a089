//! Per-actor mailbox: the FIFO of pending messages.
//!
//! Wait-free multi-producer enqueue over the [`MpscQueue`]; the single
//! consumer is whichever worker currently holds the actor's running
//! claim. A separate pending counter lets producers and the scheduler
//! check for work without touching the queue's consumer side.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::message::Message;
use crate::mpsc::MpscQueue;

/// FIFO of messages destined for one actor.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: MpscQueue<Message>,
    pending: AtomicUsize,
}

impl Mailbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message. Callable from any thread; messages from one
    /// producer are delivered in push order.
    pub fn push(&self, message: Message) {
        self.queue.push(message);
        self.pending.fetch_add(1, Ordering::Release);
    }

    /// Dequeues the oldest message.
    ///
    /// # Safety
    ///
    /// Caller must hold the actor's running claim (or otherwise be the
    /// unique consumer, as the death path is after unregistration).
    pub(crate) unsafe fn pop(&self) -> Option<Message> {
        // SAFETY: forwarded single-consumer contract.
        let message = unsafe { self.queue.pop() };
        if message.is_some() {
            self.pending.fetch_sub(1, Ordering::Release);
        }
        message
    }

    /// Number of undelivered messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
