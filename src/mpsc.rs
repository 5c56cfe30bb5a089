//! Lock-free MPSC (Multiple Producer, Single Consumer) queue.
//!
//! A Vyukov-style queue over heap nodes. Any thread may push; exactly
//! one consumer may pop. Every mailbox, triage queue, and engine feed
//! queue in the crate is one of these.
//!
//! The queue keeps a stub sentinel so the consumer always has a dummy
//! node to stand on: `tail` points at an already-consumed node, and the
//! next value to pop lives in `tail.next`.
//!
//! # Memory ordering
//!
//! - **push**: `AcqRel` on the head exchange (publishes node data to
//!   the consumer), `Release` on linking `prev.next`.
//! - **pop**: `Acquire` on loading `next` (sees the producer's writes).

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

/// Vyukov MPSC queue. Push from any thread; pop from one.
pub struct MpscQueue<T> {
    /// Producers exchange themselves in here.
    head: AtomicPtr<Node<T>>,
    /// Consumer-only cursor: the current dummy node.
    tail: UnsafeCell<*mut Node<T>>,
    /// Heap-allocated sentinel; freed on drop.
    stub: *mut Node<T>,
}

// SAFETY: the queue hands values across threads; producers only touch
// `head` (atomic) and their own fresh nodes, the single consumer owns
// `tail`. T must be Send because values cross thread boundaries.
unsafe impl<T: Send> Send for MpscQueue<T> {}
// SAFETY: concurrent pushes are lock-free; pop is restricted to one
// consumer by the `unsafe` contract on [`MpscQueue::pop`].
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> std::fmt::Debug for MpscQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpscQueue")
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MpscQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let stub = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: None,
        }));
        Self {
            head: AtomicPtr::new(stub),
            tail: UnsafeCell::new(stub),
            stub,
        }
    }

    /// Pushes a value. Lock-free; callable from any thread.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: Some(value),
        }));
        // AcqRel: release the node data to the consumer, acquire the
        // previous head for linking.
        let prev = self.head.swap(node, Ordering::AcqRel);
        // SAFETY: prev is the stub or a previously pushed node, both
        // owned by the queue until the consumer frees them.
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
    }

    /// Pops the oldest value, or `None` when the queue is empty.
    ///
    /// Spins briefly when a producer has exchanged the head but not yet
    /// linked its node (that window is a few instructions wide).
    ///
    /// # Safety
    ///
    /// Must only be called from the single consumer thread, which is
    /// whoever currently owns this queue's consuming side (a worker for
    /// its own queues, the main loop for the node's).
    pub unsafe fn pop(&self) -> Option<T> {
        loop {
            // SAFETY: consumer-only access per this function's contract.
            let tail_slot = unsafe { &mut *self.tail.get() };
            let tail = *tail_slot;
            // SAFETY: tail is the stub or a node not yet freed.
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };

            if next.is_null() {
                if tail == self.head.load(Ordering::Acquire) {
                    return None;
                }
                // A push is mid-flight: head moved but prev.next is not
                // linked yet. Retry shortly.
                std::hint::spin_loop();
                continue;
            }

            *tail_slot = next;
            // SAFETY: next was fully published by the Release link.
            let value = unsafe { (*next).value.take() };
            if tail != self.stub {
                // SAFETY: the old dummy came from Box::into_raw in push
                // and no other reference to it remains.
                drop(unsafe { Box::from_raw(tail) });
            }
            return Some(value.expect("non-stub queue node holds a value"));
        }
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: drain remaining values, then the dummy.
        // SAFETY: &mut self means no other producer or consumer exists.
        unsafe { while self.pop().is_some() {} }
        let tail = *self.tail.get_mut();
        if tail != self.stub {
            // SAFETY: leftover dummy from the last pop, heap-allocated.
            drop(unsafe { Box::from_raw(tail) });
        }
        // SAFETY: the stub was allocated in new() and never freed.
        drop(unsafe { Box::from_raw(self.stub) });
    }
}
