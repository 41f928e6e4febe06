//! The per-invocation handle a [`Handler`](super::handler::Handler) uses to
//! keep propagating an event, or to initiate an outbound operation, from its
//! current position in the pipeline.
//!
//! A context is never stored: [`ContextHandle`] is built on the stack for the
//! duration of a single dispatch and borrows the pipeline it belongs to. This
//! sidesteps the classic cyclic-ownership problem (context owns a reference
//! to the pipeline, the pipeline owns the context) without reaching for
//! `unsafe` — the arena in [`super::pipeline::Pipeline`] is the only thing
//! that actually owns handler state; a context is just `(pipeline, index)`.

use alloc::sync::Arc;

use crate::CoreError;
use crate::address::Address;
use crate::buffer::Message;
use crate::executor::Executor;
use crate::observability::UserEvent;
use crate::promise::Promise;

use super::pipeline::Pipeline;

/// The capability set a [`Handler`](super::handler::Handler) implementation
/// is given: nine `fire_*` methods to keep propagating an inbound event past
/// this context, and ten plain methods to keep propagating an outbound
/// operation past it. Every method continues the traversal from *this*
/// context's position — it never restarts from the head or tail.
pub trait Context: Send + Sync {
    /// The name this context was installed under.
    fn name(&self) -> Arc<str>;

    /// The executor this context's handler is bound to (the pipeline's
    /// default, i.e. the channel's own executor, unless an override was
    /// given when the handler was added).
    fn executor(&self) -> Arc<dyn Executor>;

    fn fire_channel_registered(&self);
    fn fire_channel_unregistered(&self);
    fn fire_channel_active(&self);
    fn fire_channel_inactive(&self);
    fn fire_channel_read(&self, msg: Message);
    fn fire_channel_read_complete(&self);
    fn fire_writability_changed(&self, is_writable: bool);
    fn fire_user_event_triggered(&self, event: UserEvent);
    fn fire_exception_caught(&self, error: CoreError);

    fn register(&self, promise: Promise<()>);
    fn bind(&self, local: Address, promise: Promise<()>);
    fn connect(&self, remote: Address, local: Option<Address>, promise: Promise<()>);
    fn disconnect(&self, promise: Promise<()>);
    fn close(&self, promise: Promise<()>);
    fn deregister(&self, promise: Promise<()>);
    fn read_requested(&self);
    fn write(&self, msg: Message, promise: Promise<()>);
    fn flush(&self);
    fn close_forcibly(&self);
}

/// The concrete, transient [`Context`] every dispatch in this crate hands to
/// a handler: a borrowed pipeline plus the arena index the handler was
/// installed at.
pub(crate) struct ContextHandle<'p> {
    pub(crate) pipeline: &'p Arc<Pipeline>,
    pub(crate) idx: usize,
}

impl<'p> Context for ContextHandle<'p> {
    fn name(&self) -> Arc<str> {
        self.pipeline.node_name(self.idx)
    }

    fn executor(&self) -> Arc<dyn Executor> {
        self.pipeline.node_executor(self.idx)
    }

    fn fire_channel_registered(&self) {
        Pipeline::deliver_inbound(
            self.pipeline,
            self.idx,
            super::handler::event::CHANNEL_REGISTERED,
            super::pipeline::InboundEvent::Registered,
        );
    }

    fn fire_channel_unregistered(&self) {
        Pipeline::deliver_inbound(
            self.pipeline,
            self.idx,
            super::handler::event::CHANNEL_UNREGISTERED,
            super::pipeline::InboundEvent::Unregistered,
        );
    }

    fn fire_channel_active(&self) {
        Pipeline::deliver_inbound(
            self.pipeline,
            self.idx,
            super::handler::event::CHANNEL_ACTIVE,
            super::pipeline::InboundEvent::Active,
        );
    }

    fn fire_channel_inactive(&self) {
        Pipeline::deliver_inbound(
            self.pipeline,
            self.idx,
            super::handler::event::CHANNEL_INACTIVE,
            super::pipeline::InboundEvent::Inactive,
        );
    }

    fn fire_channel_read(&self, msg: Message) {
        Pipeline::deliver_inbound(
            self.pipeline,
            self.idx,
            super::handler::event::CHANNEL_READ,
            super::pipeline::InboundEvent::Read(msg),
        );
    }

    fn fire_channel_read_complete(&self) {
        Pipeline::deliver_inbound(
            self.pipeline,
            self.idx,
            super::handler::event::CHANNEL_READ_COMPLETE,
            super::pipeline::InboundEvent::ReadComplete,
        );
    }

    fn fire_writability_changed(&self, is_writable: bool) {
        Pipeline::deliver_inbound(
            self.pipeline,
            self.idx,
            super::handler::event::WRITABILITY_CHANGED,
            super::pipeline::InboundEvent::Writability(is_writable),
        );
    }

    fn fire_user_event_triggered(&self, event: UserEvent) {
        Pipeline::deliver_inbound(
            self.pipeline,
            self.idx,
            super::handler::event::USER_EVENT_TRIGGERED,
            super::pipeline::InboundEvent::UserEvent(event),
        );
    }

    fn fire_exception_caught(&self, error: CoreError) {
        Pipeline::deliver_inbound(
            self.pipeline,
            self.idx,
            super::handler::event::EXCEPTION_CAUGHT,
            super::pipeline::InboundEvent::Exception(error),
        );
    }

    fn register(&self, promise: Promise<()>) {
        Pipeline::deliver_outbound(
            self.pipeline,
            self.idx,
            super::handler::event::REGISTER,
            super::pipeline::OutboundOp::Register(promise),
        );
    }

    fn bind(&self, local: Address, promise: Promise<()>) {
        Pipeline::deliver_outbound(
            self.pipeline,
            self.idx,
            super::handler::event::BIND,
            super::pipeline::OutboundOp::Bind(local, promise),
        );
    }

    fn connect(&self, remote: Address, local: Option<Address>, promise: Promise<()>) {
        Pipeline::deliver_outbound(
            self.pipeline,
            self.idx,
            super::handler::event::CONNECT,
            super::pipeline::OutboundOp::Connect(remote, local, promise),
        );
    }

    fn disconnect(&self, promise: Promise<()>) {
        Pipeline::deliver_outbound(
            self.pipeline,
            self.idx,
            super::handler::event::DISCONNECT,
            super::pipeline::OutboundOp::Disconnect(promise),
        );
    }

    fn close(&self, promise: Promise<()>) {
        Pipeline::deliver_outbound(
            self.pipeline,
            self.idx,
            super::handler::event::CLOSE,
            super::pipeline::OutboundOp::Close(promise),
        );
    }

    fn deregister(&self, promise: Promise<()>) {
        Pipeline::deliver_outbound(
            self.pipeline,
            self.idx,
            super::handler::event::DEREGISTER,
            super::pipeline::OutboundOp::Deregister(promise),
        );
    }

    fn read_requested(&self) {
        Pipeline::deliver_outbound(
            self.pipeline,
            self.idx,
            super::handler::event::READ_REQUESTED,
            super::pipeline::OutboundOp::ReadRequested,
        );
    }

    fn write(&self, msg: Message, promise: Promise<()>) {
        Pipeline::deliver_outbound(
            self.pipeline,
            self.idx,
            super::handler::event::WRITE,
            super::pipeline::OutboundOp::Write(msg, promise),
        );
    }

    fn flush(&self) {
        Pipeline::deliver_outbound(
            self.pipeline,
            self.idx,
            super::handler::event::FLUSH,
            super::pipeline::OutboundOp::Flush,
        );
    }

    fn close_forcibly(&self) {
        Pipeline::deliver_outbound(
            self.pipeline,
            self.idx,
            super::handler::event::CLOSE_FORCIBLY,
            super::pipeline::OutboundOp::CloseForcibly,
        );
    }
}
