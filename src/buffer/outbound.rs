//! The pending-write accounting structure: a watermark-gated queue between
//! the pipeline's outbound writes and the transport's actual I/O.
//!
//! Structurally this is the triply-partitioned singly-linked list the design
//! describes (`flushed_head..unflushed_head..tail`), implemented as a
//! [`VecDeque`] split by a `flushed_count` boundary index — the same shape,
//! since both give O(1) push-to-tail and O(1) pop-from-head, just expressed
//! with a standard collection instead of hand-rolled links.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::buffer::message::{Message, MessageSizeEstimator};
use crate::error::{CoreError, codes};
use crate::promise::Promise;

/// Bit 0 of `unwritable_flags`: the core's own high-watermark signal.
pub const HIGH_WATERMARK_BIT: u32 = 0;

/// Notified whenever `unwritable_flags` edge-triggers between zero and
/// nonzero. Implemented by whatever owns the pipeline (typically the
/// channel's head context), which decides whether to fire the inbound event
/// inline or defer it via `invoke_later`.
pub trait WritabilityListener: Send + Sync {
    /// `is_writable` reflects the buffer's state *after* the transition that
    /// triggered this call.
    fn channel_writability_changed(&self, is_writable: bool);
}

/// A [`WritabilityListener`] that does nothing; used by buffers created
/// before they are attached to a channel and in tests that don't care about
/// the event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWritabilityListener;

impl WritabilityListener for NoopWritabilityListener {
    fn channel_writability_changed(&self, _is_writable: bool) {}
}

struct OutboundEntry {
    message: Option<Message>,
    pending_size: usize,
    promise: Promise<()>,
}

/// Outcome of [`OutboundBuffer::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The buffer was drained and is now closed.
    Closed,
    /// A `fail_flushed` call is reentrantly in progress; the caller must
    /// retry `close` from the executor once that call returns.
    Deferred,
}

/// Ordered pending-write queue with watermark-based writability signalling.
/// Owned exclusively by a channel; every structural method requires `&mut
/// self`, mirroring the "mutated only on the channel executor" rule — the
/// atomic fields exist purely so the writability snapshot can be read from
/// other threads without bouncing through the executor.
pub struct OutboundBuffer {
    entries: VecDeque<OutboundEntry>,
    flushed_count: usize,
    total_pending_size: AtomicUsize,
    unwritable_flags: AtomicU32,
    high_water_mark: usize,
    low_water_mark: usize,
    in_fail: AtomicBool,
    estimator: Arc<dyn MessageSizeEstimator>,
    listener: Arc<dyn WritabilityListener>,
}

impl OutboundBuffer {
    /// Creates an empty, writable buffer with the given watermarks.
    pub fn new(
        high_water_mark: usize,
        low_water_mark: usize,
        estimator: Arc<dyn MessageSizeEstimator>,
        listener: Arc<dyn WritabilityListener>,
    ) -> Self {
        Self {
            entries: VecDeque::new(),
            flushed_count: 0,
            total_pending_size: AtomicUsize::new(0),
            unwritable_flags: AtomicU32::new(0),
            high_water_mark,
            low_water_mark,
            in_fail: AtomicBool::new(false),
            estimator,
            listener,
        }
    }

    /// Total bytes currently pending across both segments. May be read from
    /// any thread.
    pub fn total_pending_size(&self) -> usize {
        self.total_pending_size.load(Ordering::Acquire)
    }

    /// The raw bitset backing writability. May be read from any thread.
    pub fn unwritable_flags(&self) -> u32 {
        self.unwritable_flags.load(Ordering::Acquire)
    }

    /// `true` iff no unwritable bit (core or user-defined) is set.
    pub fn is_writable(&self) -> bool {
        self.unwritable_flags() == 0
    }

    /// Number of entries already flushed and eligible for transport write.
    pub fn flushed_count(&self) -> usize {
        self.flushed_count
    }

    /// Number of entries still in the unflushed segment.
    pub fn unflushed_count(&self) -> usize {
        self.entries.len() - self.flushed_count
    }

    /// Appends a message to the tail of the unflushed segment. Never fails
    /// observably: a channel closing concurrently only affects the promise
    /// once a later `add_flush`/`close` walks this entry.
    pub fn add_message(&mut self, message: Message, promise: Promise<()>) {
        let size = self.estimator.estimate(&message);
        self.entries.push_back(OutboundEntry {
            message: Some(message),
            pending_size: size,
            promise,
        });
        self.increment(size);
    }

    /// Marks every currently-unflushed entry as flushed. A promise already
    /// cancelled at this point is neutralized (message released, bytes
    /// refunded silently) instead of being carried into the flushed
    /// segment; surviving entries are made uncancellable.
    pub fn add_flush(&mut self) {
        let mut idx = self.flushed_count;
        while idx < self.entries.len() {
            if self.entries[idx].promise.is_cancelled() {
                let entry = self.entries.remove(idx).expect("idx in bounds");
                self.decrement(entry.pending_size, false);
                continue;
            }
            self.entries[idx].promise.set_uncancellable();
            idx += 1;
        }
        self.flushed_count = self.entries.len();
    }

    /// The message at `flushed_head`, if any entry has been flushed.
    pub fn current(&self) -> Option<&Message> {
        if self.flushed_count == 0 {
            return None;
        }
        self.entries.front().and_then(|e| e.message.as_ref())
    }

    /// Completes `flushed_head` with success, releases the message, and
    /// advances the boundary. Returns whether an entry was actually removed.
    pub fn remove(&mut self) -> bool {
        self.remove_inner(None, true)
    }

    /// Same as [`OutboundBuffer::remove`] but completes the head entry's
    /// promise with `cause` instead of success.
    pub fn remove_failed(&mut self, cause: CoreError) -> bool {
        self.remove_inner(Some(cause), true)
    }

    fn remove_inner(&mut self, cause: Option<CoreError>, notify: bool) -> bool {
        if self.flushed_count == 0 {
            return false;
        }
        let entry = match self.entries.pop_front() {
            Some(entry) => entry,
            None => return false,
        };
        self.flushed_count -= 1;
        self.decrement(entry.pending_size, notify);
        match cause {
            Some(cause) => {
                entry.promise.fail(cause);
            }
            None => {
                entry.promise.complete(());
            }
        }
        true
    }

    /// Advances the reader index of `flushed_head` by `n` bytes. Entries
    /// fully consumed are removed via [`OutboundBuffer::remove`]. Only valid
    /// for byte-string ([`Message::Bytes`]) payloads.
    pub fn remove_bytes(&mut self, mut n: usize) -> Result<(), CoreError> {
        while n > 0 {
            if self.flushed_count == 0 {
                return Err(CoreError::new(
                    codes::CLOSED_CHANNEL,
                    "remove_bytes called past the flushed segment",
                ));
            }
            let remaining = {
                let front = self.entries.front_mut().expect("flushed_count > 0");
                let buf = match front.message.as_mut() {
                    Some(Message::Bytes(buf)) => buf,
                    _ => {
                        return Err(CoreError::new(
                            codes::PIPELINE_EXCEPTION,
                            "remove_bytes requires a byte-string message",
                        ));
                    }
                };
                let buf = Arc::get_mut(buf).ok_or_else(|| {
                    CoreError::new(
                        codes::PIPELINE_EXCEPTION,
                        "remove_bytes requires an uncontended byte-string buffer",
                    )
                })?;
                let take = n.min(buf.remaining());
                buf.advance(take)?;
                n -= take;
                buf.remaining()
            };
            if remaining == 0 {
                self.remove();
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Repeatedly removes flushed entries with `cause` until the flushed
    /// segment is empty. Reentrancy-guarded: a recursive call observed while
    /// already running returns immediately without doing anything.
    pub fn fail_flushed(&mut self, cause: CoreError, notify: bool) {
        if self.in_fail.swap(true, Ordering::AcqRel) {
            return;
        }
        while self.remove_inner(Some(cause.clone()), notify) {}
        self.in_fail.store(false, Ordering::Release);
    }

    /// Releases every unflushed entry (decrementing `total_pending_size`
    /// without firing watermark events) and fails their promises with
    /// `cause`. Requires the flushed segment to already be empty unless
    /// `allow_open` is set, matching the precondition that `close` is the
    /// terminal step after `fail_flushed` has drained flushed writes.
    pub fn close(&mut self, cause: CoreError, allow_open: bool) -> Result<CloseOutcome, CoreError> {
        if self.in_fail.load(Ordering::Acquire) {
            return Ok(CloseOutcome::Deferred);
        }
        if !allow_open && self.flushed_count != 0 {
            return Err(CoreError::new(
                codes::PIPELINE_EXCEPTION,
                "close() precondition violated: flushed segment must be empty",
            ));
        }
        while let Some(entry) = self.entries.pop_front() {
            self.decrement(entry.pending_size, false);
            entry.promise.fail(cause.clone());
        }
        self.flushed_count = 0;
        Ok(CloseOutcome::Closed)
    }

    /// Returns gather-write slices covering the first `max_count` flushed
    /// byte-string messages, or until `max_bytes` bytes have been gathered —
    /// whichever comes first. Always returns at least one slice when any
    /// readable byte exists, even if it alone exceeds `max_bytes`, so a
    /// transport always makes forward progress.
    pub fn get_shared_buffer_list(&self, max_count: usize, max_bytes: usize) -> Vec<&[u8]> {
        let mut slices = Vec::new();
        let mut gathered = 0usize;
        for entry in self.entries.iter().take(self.flushed_count) {
            if slices.len() >= max_count {
                break;
            }
            let Some(Message::Bytes(buf)) = entry.message.as_ref() else {
                break;
            };
            let chunk = buf.chunk();
            if chunk.is_empty() {
                continue;
            }
            if gathered >= max_bytes && !slices.is_empty() {
                break;
            }
            gathered += chunk.len();
            slices.push(chunk);
        }
        slices
    }

    /// Toggles a user-defined writability bit (index `1..=31`) with the same
    /// CAS-and-edge-trigger discipline as the core high-watermark bit.
    pub fn set_user_defined_writability(&self, index: u32, writable: bool) {
        debug_assert!((1..32).contains(&index), "user-defined bits occupy 1..31");
        let mask = 1u32 << index;
        let transitioned = if writable {
            self.clear_bit(mask)
        } else {
            self.set_bit(mask)
        };
        if let Some(now_writable) = transitioned {
            self.listener.channel_writability_changed(now_writable);
        }
    }

    /// Charges `n` bytes against the writability accounting without storing
    /// an entry. Used by [`crate::buffer::PendingWriteQueue`] to reflect
    /// backpressure from messages it is still batching before they become
    /// real [`OutboundBuffer`] entries.
    pub(crate) fn mirror_add(&self, n: usize) {
        self.increment(n);
    }

    /// Reverses a prior [`OutboundBuffer::mirror_add`] without firing a
    /// writability event; the queue calls this immediately before handing
    /// the same bytes to [`OutboundBuffer::add_message`], which performs its
    /// own (correctly event-firing) accounting for the same bytes.
    pub(crate) fn mirror_remove(&self, n: usize) {
        self.decrement(n, false);
    }

    fn increment(&self, n: usize) {
        if n == 0 {
            return;
        }
        let prev = self.total_pending_size.fetch_add(n, Ordering::AcqRel);
        let new_total = prev + n;
        if new_total > self.high_water_mark && self.set_bit(1 << HIGH_WATERMARK_BIT).is_some() {
            self.listener.channel_writability_changed(false);
        }
    }

    fn decrement(&self, n: usize, notify: bool) {
        if n == 0 {
            return;
        }
        let prev = self.total_pending_size.fetch_sub(n, Ordering::AcqRel);
        let new_total = prev - n;
        // The bit must always track reality, even when the caller asked not
        // to be notified (a neutralized cancellation, a close draining the
        // unflushed segment): `notify` only gates whether the listener is
        // told, never whether `unwritable_flags` itself gets updated.
        if (new_total == 0 || new_total <= self.low_water_mark)
            && self.clear_bit(1 << HIGH_WATERMARK_BIT) == Some(true)
            && notify
        {
            self.listener.channel_writability_changed(true);
        }
    }

    /// Sets `mask`'s bits via CAS loop. Returns `Some(now_writable)` only on
    /// the 0-to-nonzero edge, `None` if the bits were already set or the
    /// transition didn't flip writability.
    fn set_bit(&self, mask: u32) -> Option<bool> {
        loop {
            let current = self.unwritable_flags.load(Ordering::Acquire);
            if current & mask != 0 {
                return None;
            }
            let new = current | mask;
            if self
                .unwritable_flags
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return if current == 0 { Some(false) } else { None };
            }
        }
    }

    /// Clears `mask`'s bits via CAS loop. Returns `Some(true)` only on the
    /// nonzero-to-0 edge.
    fn clear_bit(&self, mask: u32) -> Option<bool> {
        loop {
            let current = self.unwritable_flags.load(Ordering::Acquire);
            if current & mask == 0 {
                return None;
            }
            let new = current & !mask;
            if self
                .unwritable_flags
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return if new == 0 { Some(true) } else { None };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::message::DefaultMessageSizeEstimator;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};

    #[derive(Default)]
    struct RecordingListener {
        events: spin::Mutex<Vec<bool>>,
    }

    impl WritabilityListener for RecordingListener {
        fn channel_writability_changed(&self, is_writable: bool) {
            self.events.lock().push(is_writable);
        }
    }

    fn buffer_with(high: usize, low: usize) -> (OutboundBuffer, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let buffer = OutboundBuffer::new(
            high,
            low,
            Arc::new(DefaultMessageSizeEstimator::default()),
            listener.clone(),
        );
        (buffer, listener)
    }

    fn opaque_message() -> Message {
        static COUNTER: StdAtomicUsize = StdAtomicUsize::new(0);
        Message::opaque(COUNTER.fetch_add(1, StdOrdering::Relaxed))
    }

    #[test]
    fn basic_write_flush_close_crosses_watermarks_exactly_once_each() {
        let (mut buffer, listener) = buffer_with(8, 2);
        let promise = Promise::new();
        buffer.add_message(opaque_message(), promise.clone());
        // DefaultMessageSizeEstimator charges opaque messages a fixed 16
        // bytes, comfortably above high=8.
        assert!(!buffer.is_writable());
        assert_eq!(buffer.unwritable_flags(), 1);

        buffer.add_flush();
        assert!(buffer.remove());
        assert!(promise.is_done());
        assert_eq!(buffer.total_pending_size(), 0);
        assert!(buffer.is_writable());
        assert_eq!(&*listener.events.lock(), &[false, true]);
    }

    #[test]
    fn cancellation_between_add_and_flush_refunds_silently() {
        let (mut buffer, listener) = buffer_with(1000, 10);
        let promise: Promise<()> = Promise::new();
        buffer.add_message(opaque_message(), promise.clone());
        assert!(promise.cancel());
        buffer.add_flush();

        assert!(promise.is_cancelled());
        assert_eq!(buffer.total_pending_size(), 0);
        assert!(listener.events.lock().is_empty());
        assert_eq!(buffer.flushed_count(), 0);
    }

    #[test]
    fn cancel_after_flush_is_ignored() {
        let (mut buffer, _listener) = buffer_with(1000, 10);
        let promise: Promise<()> = Promise::new();
        buffer.add_message(opaque_message(), promise.clone());
        buffer.add_flush();
        assert!(!promise.cancel(), "flush boundary must commit the write");
        assert!(buffer.remove());
    }

    #[test]
    fn fail_flushed_fans_one_cause_to_every_flushed_entry() {
        let (mut buffer, _listener) = buffer_with(1000, 10);
        let p1 = Promise::new();
        let p2 = Promise::new();
        buffer.add_message(opaque_message(), p1.clone());
        buffer.add_message(opaque_message(), p2.clone());
        buffer.add_flush();

        let cause = CoreError::new(codes::CLOSED_CHANNEL, "transport closed");
        buffer.fail_flushed(cause, true);

        assert!(p1.is_done() && !p1.is_cancelled());
        assert!(p2.is_done() && !p2.is_cancelled());
        assert_eq!(buffer.flushed_count(), 0);
    }

    #[test]
    fn user_defined_writability_round_trips() {
        let (buffer, listener) = buffer_with(1000, 10);
        buffer.set_user_defined_writability(1, false);
        buffer.set_user_defined_writability(1, true);
        buffer.set_user_defined_writability(1, false);
        assert!(!buffer.is_writable());
        assert_eq!(listener.events.lock().len(), 3);
    }

    #[test]
    fn close_requires_flushed_segment_to_be_drained_first() {
        let (mut buffer, _listener) = buffer_with(1000, 10);
        let promise: Promise<()> = Promise::new();
        buffer.add_message(opaque_message(), promise);
        buffer.add_flush();
        let err = buffer.close(CoreError::new(codes::CLOSED_CHANNEL, "closed"), false);
        assert!(err.is_err());
    }

    #[test]
    fn close_drains_unflushed_without_firing_writability_events() {
        let (mut buffer, listener) = buffer_with(8, 2);
        let promise: Promise<()> = Promise::new();
        buffer.add_message(opaque_message(), promise.clone());
        assert!(!listener.events.lock().is_empty());
        listener.events.lock().clear();

        let outcome = buffer
            .close(CoreError::new(codes::CLOSED_CHANNEL, "closed"), true)
            .unwrap();
        assert_eq!(outcome, CloseOutcome::Closed);
        assert!(promise.is_done());
        assert_eq!(buffer.total_pending_size(), 0);
        assert!(listener.events.lock().is_empty());
    }
}
