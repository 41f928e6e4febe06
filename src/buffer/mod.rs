//! Buffer layer: payload representation, watermark-gated outbound
//! accounting, and the secondary pending-write queue handlers can use to
//! batch writes before they reach the channel's real outbound buffer.

pub(crate) mod message;
mod outbound;
mod pending_write;
mod readable;
mod writable;

pub use message::{DefaultMessageSizeEstimator, Message, MessageSizeEstimator};
pub use outbound::{
    CloseOutcome, HIGH_WATERMARK_BIT, NoopWritabilityListener, OutboundBuffer,
    WritabilityListener,
};
pub use pending_write::{PendingWriteQueue, PendingWriteQueueKind};
pub use readable::ReadableBuffer;
pub use writable::WritableBuffer;
