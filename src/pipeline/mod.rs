//! The handler chain threaded between a channel's registration and its
//! transport: inbound events travel head-to-tail, outbound operations travel
//! tail-to-head, and a context in the middle only ever continues the
//! traversal from where it stands — see [`context`] and [`pipeline`].

mod context;
mod handler;
mod pipeline;

pub use context::Context;
pub use handler::{EventMask, Handler, event};
pub use pipeline::{Pipeline, PipelineSink};
