#![cfg_attr(not(feature = "std"), no_std)]
#![doc = "ember-core: the channel lifecycle, handler pipeline, and outbound"]
#![doc = "backpressure contracts shared by every protocol runtime built on top"]
#![doc = "of this crate."]
#![doc = ""]
#![doc = "== Scope (P1) =="]
#![doc = "This crate is the CORE of an event-driven networking transport runtime:"]
#![doc = "channel lifecycle, pipeline dispatch, outbound buffering, and the"]
#![doc = "registration/executor-binding protocol. Concrete socket transports,"]
#![doc = "executor pools, byte-buffer allocators, and protocol codecs are deliberately"]
#![doc = "out of scope; this crate only specifies (and consumes) the seams they"]
#![doc = "plug into — see [`transport`] and [`executor`]."]
#![doc = ""]
#![doc = "== Allocation (P2) =="]
#![doc = "`ember-core` targets `no_std + alloc`: the pipeline arena, promise"]
#![doc = "completion graph, and outbound buffer all lean on `alloc`'s `Arc`, `Box`,"]
#![doc = "and `Vec`. A pure allocator-free build is not supported."]

extern crate alloc;

mod sealed;

pub mod address;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod future;
pub mod ids;
pub mod observability;
pub mod pipeline;
pub mod promise;
pub mod size_predictor;
pub mod time;
pub mod transport;

pub use address::Address;
pub use buffer::{
    DefaultMessageSizeEstimator, Message, MessageSizeEstimator, OutboundBuffer,
    PendingWriteQueue, PendingWriteQueueKind, ReadableBuffer, WritableBuffer,
};
pub use channel::{Channel, ChannelState};
pub use config::{
    BufferAllocator, ChannelConfiguration, SizePredictorFactory, StaticChannelConfiguration,
};
pub use error::{CoreError, ErrorCategory};
pub use executor::{Executor, ShutdownHook, Task};
pub use future::{BoxFuture, LocalBoxFuture};
pub use ids::{ChannelId, DefaultIdentitySource, IdentitySource};
pub use observability::{Logger, MetricsProvider, NoopObservability, Severity, TraceContext, UserEvent};
pub use pipeline::{Context, EventMask, Handler, Pipeline};
pub use promise::{Outcome, Promise};
pub use size_predictor::{AdaptivePredictor, FixedPredictor, SizePredictor};
pub use time::{DefaultMonotonicClock, MonotonicClock, MonotonicTimePoint};
pub use transport::{BoxedTransport, TransportMetadata, TransportPlug};

use alloc::boxed::Box;
use core::fmt;

/// The `no_std`-friendly error trait every error type in this crate
/// implements, standing in for `std::error::Error` (which is unavailable
/// without `std`).
///
/// # Why
/// `std::error::Error` cannot be named without the `std` feature, but
/// [`CoreError`] still needs a way to carry and chain an arbitrary boxed
/// cause. This trait is that minimal common interface.
///
/// # What
/// Implementors must be `Debug + Display` and may expose an upstream
/// [`Error::source`], mirroring `std::error::Error::source`'s semantics.
///
/// # Trade-off
/// Deliberately does not require `Send + Sync` — callers that need to move
/// an error across threads reach for [`error::ErrorCause`] instead, which
/// does.
pub trait Error: fmt::Debug + fmt::Display + crate::sealed::Sealed {
    fn source(&self) -> Option<&(dyn Error + 'static)>;
}

impl<E> Error for Box<E>
where
    E: Error + ?Sized,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        (**self).source()
    }
}

/// Crate-wide result alias: every fallible core operation returns
/// `Result<T, CoreError>` unless it has a more specific reason not to.
pub type Result<T, E = CoreError> = core::result::Result<T, E>;
