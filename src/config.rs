//! Channel configuration: the six recognized options from §6, exposed
//! through a trait (not a struct) so a host can back it with a `HashMap`, a
//! `dashmap`, or a generated config layer without the core depending on any
//! particular source.

use alloc::sync::Arc;

use crate::buffer::MessageSizeEstimator;
use crate::buffer::message::DefaultMessageSizeEstimator;
use crate::error::{CoreError, codes};
use crate::size_predictor::SizePredictor;

/// Builds a fresh [`SizePredictor`] per channel (each channel tracks its own
/// read history, so the factory — not a shared predictor instance — is what
/// a [`ChannelConfiguration`] hands out).
pub trait SizePredictorFactory: Send + Sync {
    fn new_predictor(&self) -> alloc::boxed::Box<dyn SizePredictor>;
}

/// Allocates the writable buffers a transport reads into. Concrete
/// allocators (pooled, arena, mmap-backed) are out of scope for this crate
/// (§1); only the factory seam a [`ChannelConfiguration`] exposes is
/// specified.
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, capacity: usize) -> alloc::boxed::Box<dyn crate::buffer::WritableBuffer>;
}

/// The six recognized configuration options (§6), exposed as a trait so a
/// host can back it with whatever storage it already has rather than being
/// forced through this crate's own builder.
pub trait ChannelConfiguration: Send + Sync {
    /// Bytes pending above which [`crate::buffer::OutboundBuffer`] sets the
    /// core high-watermark bit.
    fn write_buffer_high_water_mark(&self) -> usize;

    /// Bytes pending at or below which the core high-watermark bit clears.
    fn write_buffer_low_water_mark(&self) -> usize;

    /// Whether the head context issues `begin_read` after activation and
    /// after every `channel_read_complete`.
    fn auto_read(&self) -> bool;

    /// The buffer allocator new read buffers are drawn from.
    fn allocator(&self) -> Arc<dyn BufferAllocator>;

    /// Factory for the per-channel receive-size predictor.
    fn recv_byte_buf_allocator(&self) -> Arc<dyn SizePredictorFactory>;

    /// The estimator charged against outbound watermark accounting.
    fn message_size_estimator(&self) -> Arc<dyn MessageSizeEstimator>;
}

struct DefaultEstimatorFactory;
impl SizePredictorFactory for DefaultEstimatorFactory {
    fn new_predictor(&self) -> alloc::boxed::Box<dyn SizePredictor> {
        alloc::boxed::Box::new(crate::size_predictor::AdaptivePredictor::default())
    }
}

struct PanicOnAllocateAllocator;
impl BufferAllocator for PanicOnAllocateAllocator {
    fn allocate(&self, _capacity: usize) -> alloc::boxed::Box<dyn crate::buffer::WritableBuffer> {
        panic!(
            "StaticChannelConfiguration ships no default BufferAllocator; \
             concrete buffer implementations are out of scope for this crate (see §1) \
             and must be supplied by the host"
        )
    }
}

/// Builder-style [`ChannelConfiguration`] implementation covering exactly
/// the six recognized options, with validated setters (rejecting a
/// low-water-mark above the high-water-mark, matching the invariant
/// [`crate::buffer::OutboundBuffer`] relies on to ever clear its high bit).
pub struct StaticChannelConfiguration {
    high_water_mark: usize,
    low_water_mark: usize,
    auto_read: bool,
    allocator: Arc<dyn BufferAllocator>,
    recv_byte_buf_allocator: Arc<dyn SizePredictorFactory>,
    message_size_estimator: Arc<dyn MessageSizeEstimator>,
}

impl Default for StaticChannelConfiguration {
    fn default() -> Self {
        Self {
            high_water_mark: 64 * 1024,
            low_water_mark: 32 * 1024,
            auto_read: true,
            allocator: Arc::new(PanicOnAllocateAllocator),
            recv_byte_buf_allocator: Arc::new(DefaultEstimatorFactory),
            message_size_estimator: Arc::new(DefaultMessageSizeEstimator::default()),
        }
    }
}

impl StaticChannelConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets both watermarks at once, rejecting `low > high`.
    pub fn with_watermarks(mut self, high: usize, low: usize) -> Result<Self, CoreError> {
        if low > high {
            return Err(CoreError::new(
                codes::PIPELINE_EXCEPTION,
                "write_buffer_low_water_mark must not exceed write_buffer_high_water_mark",
            ));
        }
        self.high_water_mark = high;
        self.low_water_mark = low;
        Ok(self)
    }

    pub fn with_auto_read(mut self, auto_read: bool) -> Self {
        self.auto_read = auto_read;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_recv_byte_buf_allocator(mut self, factory: Arc<dyn SizePredictorFactory>) -> Self {
        self.recv_byte_buf_allocator = factory;
        self
    }

    pub fn with_message_size_estimator(
        mut self,
        estimator: Arc<dyn MessageSizeEstimator>,
    ) -> Self {
        self.message_size_estimator = estimator;
        self
    }
}

impl ChannelConfiguration for StaticChannelConfiguration {
    fn write_buffer_high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    fn write_buffer_low_water_mark(&self) -> usize {
        self.low_water_mark
    }

    fn auto_read(&self) -> bool {
        self.auto_read
    }

    fn allocator(&self) -> Arc<dyn BufferAllocator> {
        self.allocator.clone()
    }

    fn recv_byte_buf_allocator(&self) -> Arc<dyn SizePredictorFactory> {
        self.recv_byte_buf_allocator.clone()
    }

    fn message_size_estimator(&self) -> Arc<dyn MessageSizeEstimator> {
        self.message_size_estimator.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = StaticChannelConfiguration::default();
        assert!(config.write_buffer_low_water_mark() <= config.write_buffer_high_water_mark());
        assert!(config.auto_read());
    }

    #[test]
    fn watermarks_reject_low_above_high() {
        let err = StaticChannelConfiguration::new().with_watermarks(10, 20);
        assert!(err.is_err());
    }

    #[test]
    fn watermarks_accept_equal_bounds() {
        let config = StaticChannelConfiguration::new()
            .with_watermarks(10, 10)
            .expect("equal bounds are valid");
        assert_eq!(config.write_buffer_high_water_mark(), 10);
        assert_eq!(config.write_buffer_low_water_mark(), 10);
    }
}
