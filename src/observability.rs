//! Logging, metrics, and trace-context facades consumed by the pipeline and
//! channel layers. Concrete sinks (stdout, OpenTelemetry, a test collector)
//! are a host concern; this module only specifies the interface and ships a
//! zero-cost [`NoopObservability`] default so the core is usable without
//! wiring any external telemetry stack.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

use crate::Error;

/// W3C-Trace-Context-shaped correlation identifier, threaded through
/// handler callbacks so a log line or span can be tied back to the channel
/// and event that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraceContext {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub sampled: bool,
}

impl TraceContext {
    /// A context with no real trace/span identity, used where no tracer is
    /// installed.
    pub const fn absent() -> Self {
        Self {
            trace_id: [0; 16],
            span_id: [0; 8],
            sampled: false,
        }
    }

    /// Derives a child context inheriting `trace_id` and sampling, with a
    /// caller-supplied `span_id` (the core has no entropy source of its own
    /// to mint one).
    pub fn child(&self, span_id: [u8; 8]) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id,
            sampled: self.sampled,
        }
    }
}

/// Severity of a log record, ordered low to high.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Object-safe logging sink. Every call site supplies a severity, a message,
/// and optionally the error and trace context that produced it — the same
/// shape [`crate::pipeline`]'s default tail handler uses to report
/// unhandled exceptions.
pub trait Logger: Send + Sync + 'static {
    /// Emits one log record. Implementations must not block the caller for
    /// long; route slow sinks through a bounded channel internally.
    fn log(
        &self,
        severity: Severity,
        message: &str,
        error: Option<&(dyn Error + 'static)>,
        trace: Option<TraceContext>,
    );

    /// Convenience for the common no-error, no-trace case.
    fn info(&self, message: &str) {
        self.log(Severity::Info, message, None, None);
    }

    /// Convenience for a warning carrying no error object.
    fn warn(&self, message: &str) {
        self.log(Severity::Warn, message, None, None);
    }
}

/// Monotonically-increasing counter metric.
pub trait Counter: Send + Sync {
    fn add(&self, value: u64);
}

/// Point-in-time gauge metric.
pub trait Gauge: Send + Sync {
    fn set(&self, value: f64);
    fn increment(&self, value: f64);
    fn decrement(&self, value: f64);
}

/// Distribution metric (byte sizes, latencies).
pub trait Histogram: Send + Sync {
    fn record(&self, value: f64);
}

/// Produces the named metric handles the pipeline and outbound buffer use:
/// pipeline mutation count, outbound byte totals, writability-flip count.
/// Handle names follow the same `<domain>.<reason>` convention as
/// [`crate::error::codes`].
pub trait MetricsProvider: Send + Sync + 'static {
    fn counter(&self, name: &'static str) -> Box<dyn Counter>;
    fn gauge(&self, name: &'static str) -> Box<dyn Gauge>;
    fn histogram(&self, name: &'static str) -> Box<dyn Histogram>;
}

/// An application-defined event broadcast through the pipeline's
/// `on_user_event_triggered` entry point. The core never interprets the
/// payload; it only carries it, the same way [`crate::buffer::Message`]
/// carries an opaque outbound payload.
#[derive(Clone)]
pub struct UserEvent(Arc<dyn Any + Send + Sync>);

impl UserEvent {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserEvent(..)")
    }
}

struct NoopCounter;
impl Counter for NoopCounter {
    fn add(&self, _value: u64) {}
}

struct NoopGauge;
impl Gauge for NoopGauge {
    fn set(&self, _value: f64) {}
    fn increment(&self, _value: f64) {}
    fn decrement(&self, _value: f64) {}
}

struct NoopHistogram;
impl Histogram for NoopHistogram {
    fn record(&self, _value: f64) {}
}

/// Zero-cost implementation of [`Logger`] and [`MetricsProvider`]; the
/// built-in default so the pipeline and channel are usable without wiring
/// any external telemetry stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObservability;

impl Logger for NoopObservability {
    fn log(
        &self,
        _severity: Severity,
        _message: &str,
        _error: Option<&(dyn Error + 'static)>,
        _trace: Option<TraceContext>,
    ) {
    }
}

impl MetricsProvider for NoopObservability {
    fn counter(&self, _name: &'static str) -> Box<dyn Counter> {
        Box::new(NoopCounter)
    }

    fn gauge(&self, _name: &'static str) -> Box<dyn Gauge> {
        Box::new(NoopGauge)
    }

    fn histogram(&self, _name: &'static str) -> Box<dyn Histogram> {
        Box::new(NoopHistogram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_observability_accepts_every_call_without_panicking() {
        let obs = NoopObservability;
        obs.info("hello");
        obs.warn("careful");
        let _ = obs.counter("pipeline.mutations");
        let _ = obs.gauge("pipeline.outbound_bytes");
        let _ = obs.histogram("pipeline.flush_latency");
    }

    #[test]
    fn user_event_round_trips_through_downcast() {
        let event = UserEvent::new(42u32);
        assert_eq!(event.downcast_ref::<u32>(), Some(&42));
        assert_eq!(event.downcast_ref::<i64>(), None);
    }

    #[test]
    fn trace_context_child_inherits_trace_id_and_sampling() {
        let root = TraceContext {
            trace_id: [7; 16],
            span_id: [0; 8],
            sampled: true,
        };
        let child = root.child([9; 8]);
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.sampled, root.sampled);
        assert_eq!(child.span_id, [9; 8]);
    }
}
