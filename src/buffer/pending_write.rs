//! A secondary write queue for handlers that want to coalesce several
//! logical writes before they become real [`OutboundBuffer`] entries —
//! mirrors Netty's `PendingWriteQueue` utility, typically sat in front of an
//! encoder that prefers to batch small writes into fewer flushes.
//!
//! Every queued entry charges its estimated size against the owning
//! [`OutboundBuffer`]'s watermark accounting immediately via
//! [`OutboundBuffer::mirror_add`] — backpressure must reflect bytes the
//! caller believes are already in flight, not just the ones that have
//! reached the real buffer. Handing an entry off to the real buffer first
//! un-mirrors its charge via [`OutboundBuffer::mirror_remove`] (no
//! writability event) and then calls [`OutboundBuffer::add_message`] (which
//! fires its own, correct event for the same bytes) — the pair nets to zero
//! spurious transitions.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::buffer::message::{Message, MessageSizeEstimator};
use crate::buffer::outbound::OutboundBuffer;
use crate::promise::Promise;

struct QueueEntry {
    message: Message,
    size: usize,
    promise: Promise<()>,
}

/// Governs how [`PendingWriteQueue::drain_batch`] decides what to release.
#[derive(Clone, Copy, Debug)]
pub enum PendingWriteQueueKind {
    /// Each call releases exactly one entry; the returned promise is the
    /// entry's own, not an aggregate.
    Simple,
    /// Each call greedily gathers entries (always at least one) until their
    /// combined size would exceed `max_size`, forwards them all, and returns
    /// one [`Promise::aggregate`] handle spanning the whole batch.
    Batching { max_size: usize },
}

/// FIFO queue of not-yet-forwarded writes, sitting in front of an
/// [`OutboundBuffer`].
pub struct PendingWriteQueue {
    kind: PendingWriteQueueKind,
    entries: VecDeque<QueueEntry>,
    estimator: Arc<dyn MessageSizeEstimator>,
    total_size: usize,
}

impl PendingWriteQueue {
    /// Builds an empty queue of the given batching discipline.
    pub fn new(kind: PendingWriteQueueKind, estimator: Arc<dyn MessageSizeEstimator>) -> Self {
        Self {
            kind,
            entries: VecDeque::new(),
            estimator,
            total_size: 0,
        }
    }

    /// True iff no entry is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries currently queued.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Sum of the estimated sizes of every queued entry.
    pub fn queued_size(&self) -> usize {
        self.total_size
    }

    /// Queues `message`, mirroring its estimated size into `outbound`'s
    /// watermark accounting.
    pub fn add(&mut self, message: Message, promise: Promise<()>, outbound: &OutboundBuffer) {
        let size = self.estimator.estimate(&message);
        outbound.mirror_add(size);
        self.total_size += size;
        self.entries.push_back(QueueEntry {
            message,
            size,
            promise,
        });
    }

    /// Forwards the head entry into `outbound`'s real buffer. Returns
    /// `false` if the queue was empty.
    fn forward_one(&mut self, outbound: &mut OutboundBuffer) -> Option<Promise<()>> {
        let entry = self.entries.pop_front()?;
        self.total_size -= entry.size;
        outbound.mirror_remove(entry.size);
        outbound.add_message(entry.message, entry.promise.clone());
        Some(entry.promise)
    }

    /// Forwards every queued entry into `outbound`, in order, regardless of
    /// [`PendingWriteQueueKind`].
    pub fn drain_all(&mut self, outbound: &mut OutboundBuffer) {
        while self.forward_one(outbound).is_some() {}
    }

    /// Releases one batch per [`PendingWriteQueueKind`]: a single entry in
    /// [`PendingWriteQueueKind::Simple`] mode, or a greedily-gathered run of
    /// entries under the configured `max_size` in
    /// [`PendingWriteQueueKind::Batching`] mode. Returns `None` if the queue
    /// was already empty.
    pub fn drain_batch(&mut self, outbound: &mut OutboundBuffer) -> Option<Promise<()>> {
        match self.kind {
            PendingWriteQueueKind::Simple => self.forward_one(outbound),
            PendingWriteQueueKind::Batching { max_size } => {
                let mut gathered = Vec::new();
                let mut running = 0usize;
                loop {
                    let Some(front_size) = self.entries.front().map(|e| e.size) else {
                        break;
                    };
                    if !gathered.is_empty() && running + front_size > max_size {
                        break;
                    }
                    let promise = self.forward_one(outbound).expect("front was just observed");
                    running += front_size;
                    gathered.push(promise);
                }
                if gathered.is_empty() {
                    None
                } else {
                    Some(Promise::aggregate(gathered))
                }
            }
        }
    }

    /// Releases every queued entry as a single terminal failure, used when
    /// the owning channel closes while writes are still batched here.
    pub fn fail_all(&mut self, cause: crate::error::CoreError) {
        while let Some(entry) = self.entries.pop_front() {
            self.total_size -= entry.size;
            entry.promise.fail(cause.clone());
        }
    }
}
