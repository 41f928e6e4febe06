//! The payload type carried by outbound buffer entries and pending-write
//! queue nodes.
//!
//! Netty's pipeline lets a write be either a `ByteBuf` (wire-ready bytes) or
//! an arbitrary POJO a downstream encoder will transform before it reaches
//! the transport. [`Message`] models the same split: most of the core only
//! ever needs to know a message's accounted size and how to release it, but
//! [`crate::buffer::OutboundBuffer::remove_bytes`] and
//! [`crate::buffer::OutboundBuffer::get_shared_buffer_list`] require the
//! byte-string shape and fail loudly for opaque messages.

use alloc::sync::Arc;
use core::any::Any;

use crate::buffer::ReadableBuffer;

/// A reference-counted outbound payload: either wire-ready bytes or an
/// opaque application object still awaiting encoding further down the
/// pipeline.
#[derive(Clone)]
pub enum Message {
    /// Bytes ready for a gather-write to the transport.
    Bytes(Arc<dyn ReadableBuffer>),
    /// An application-level object. Only inspectable via [`Message::downcast_ref`];
    /// the core never assumes anything about its shape.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Message {
    /// Wraps a byte-string payload.
    pub fn bytes(buf: Arc<dyn ReadableBuffer>) -> Self {
        Message::Bytes(buf)
    }

    /// Wraps an opaque application object.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Message::Opaque(Arc::new(value))
    }

    /// Returns the byte-string view if this message is [`Message::Bytes`].
    pub fn as_bytes(&self) -> Option<&Arc<dyn ReadableBuffer>> {
        match self {
            Message::Bytes(buf) => Some(buf),
            Message::Opaque(_) => None,
        }
    }

    /// Attempts to view an opaque payload as a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Message::Opaque(value) => value.downcast_ref::<T>(),
            Message::Bytes(_) => None,
        }
    }

    /// Remaining readable bytes, or `0` for opaque messages (size estimation
    /// for those goes through [`MessageSizeEstimator`] instead).
    pub fn remaining_bytes(&self) -> usize {
        match self {
            Message::Bytes(buf) => buf.remaining(),
            Message::Opaque(_) => 0,
        }
    }
}

/// Produces the accounted byte size for a [`Message`], consumed by
/// [`crate::buffer::OutboundBuffer::add_message`] to feed the watermark
/// accounting. Byte-string messages are weighed exactly; opaque messages
/// fall back to a host-supplied heuristic (size of the boxed value is not
/// observable generically, so this is deliberately a trait rather than a
/// blanket `size_of_val` guess).
pub trait MessageSizeEstimator: Send + Sync {
    /// Returns the number of bytes this message should count against
    /// watermark accounting.
    fn estimate(&self, message: &Message) -> usize;
}

/// The default estimator: exact byte count for byte-string messages, and a
/// fixed per-message overhead for opaque ones (mirrors the common default in
/// frameworks of this lineage of charging a constant "object header" cost
/// rather than zero, so a flood of opaque messages still exerts backpressure).
#[derive(Debug, Clone, Copy)]
pub struct DefaultMessageSizeEstimator {
    opaque_overhead: usize,
}

impl Default for DefaultMessageSizeEstimator {
    fn default() -> Self {
        Self {
            opaque_overhead: 16,
        }
    }
}

impl DefaultMessageSizeEstimator {
    /// Builds an estimator charging `opaque_overhead` bytes for every opaque
    /// message.
    pub fn with_opaque_overhead(opaque_overhead: usize) -> Self {
        Self { opaque_overhead }
    }
}

impl MessageSizeEstimator for DefaultMessageSizeEstimator {
    fn estimate(&self, message: &Message) -> usize {
        match message {
            Message::Bytes(buf) => buf.remaining(),
            Message::Opaque(_) => self.opaque_overhead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_message_is_not_a_byte_view() {
        let message = Message::opaque(42u32);
        assert!(message.as_bytes().is_none());
        assert_eq!(message.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn default_estimator_charges_fixed_overhead_for_opaque() {
        let estimator = DefaultMessageSizeEstimator::default();
        let message = Message::opaque(());
        assert_eq!(estimator.estimate(&message), 16);
    }
}
