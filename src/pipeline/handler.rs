//! The single capability-set handler trait every pipeline participant
//! implements, plus the event-mask bitset a handler uses to opt out of
//! invocation for events it never customizes.
//!
//! A class hierarchy of inbound/outbound/duplex handlers (the shape this
//! crate's own earlier pipeline generations used) relies on a runtime or
//! bytecode layer to ask "did this concrete type override this method" and
//! compute a skip-flag bitset from the answer. Rust has no such reflection,
//! so [`Handler::event_mask`] makes the declaration explicit: a handler
//! overrides it only when it wants the pipeline to skip invoking it for
//! events it never customizes, and the result is cached per concrete type by
//! whatever installs the handler (the pipeline itself does no caching here —
//! `event_mask()` is assumed cheap, typically a `const`-like return).

use crate::CoreError;
use crate::address::Address;
use crate::buffer::Message;
use crate::observability::UserEvent;
use crate::pipeline::context::Context;
use crate::promise::Promise;

/// Bit positions for the 19 traversable pipeline events (9 inbound, 10
/// outbound). `handler_added`/`handler_removed` are structural lifecycle
/// callbacks, always invoked regardless of mask, and are therefore not
/// assigned bits here.
pub mod event {
    pub const CHANNEL_REGISTERED: u32 = 1 << 0;
    pub const CHANNEL_UNREGISTERED: u32 = 1 << 1;
    pub const CHANNEL_ACTIVE: u32 = 1 << 2;
    pub const CHANNEL_INACTIVE: u32 = 1 << 3;
    pub const CHANNEL_READ: u32 = 1 << 4;
    pub const CHANNEL_READ_COMPLETE: u32 = 1 << 5;
    pub const WRITABILITY_CHANGED: u32 = 1 << 6;
    pub const USER_EVENT_TRIGGERED: u32 = 1 << 7;
    pub const EXCEPTION_CAUGHT: u32 = 1 << 8;

    pub const REGISTER: u32 = 1 << 9;
    pub const BIND: u32 = 1 << 10;
    pub const CONNECT: u32 = 1 << 11;
    pub const DISCONNECT: u32 = 1 << 12;
    pub const CLOSE: u32 = 1 << 13;
    pub const DEREGISTER: u32 = 1 << 14;
    pub const READ_REQUESTED: u32 = 1 << 15;
    pub const WRITE: u32 = 1 << 16;
    pub const FLUSH: u32 = 1 << 17;
    pub const CLOSE_FORCIBLY: u32 = 1 << 18;

    pub const ALL_INBOUND: u32 = CHANNEL_REGISTERED
        | CHANNEL_UNREGISTERED
        | CHANNEL_ACTIVE
        | CHANNEL_INACTIVE
        | CHANNEL_READ
        | CHANNEL_READ_COMPLETE
        | WRITABILITY_CHANGED
        | USER_EVENT_TRIGGERED
        | EXCEPTION_CAUGHT;

    pub const ALL_OUTBOUND: u32 = REGISTER
        | BIND
        | CONNECT
        | DISCONNECT
        | CLOSE
        | DEREGISTER
        | READ_REQUESTED
        | WRITE
        | FLUSH
        | CLOSE_FORCIBLY;
}

/// Declares which of the 19 event positions a handler wants the pipeline to
/// skip it for. A bit set here means "pass through without invoking me";
/// the default, [`EventMask::NONE`], means every event is delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventMask(u32);

impl EventMask {
    /// Every event is delivered to the handler.
    pub const NONE: EventMask = EventMask(0);
    /// No event is delivered; the handler is a pure pass-through.
    pub const ALL: EventMask = EventMask(event::ALL_INBOUND | event::ALL_OUTBOUND);

    /// Builds a mask that skips exactly the given bits (OR the `event::*`
    /// constants together at the call site).
    pub const fn skip(bits: u32) -> Self {
        EventMask(bits)
    }

    pub(crate) fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// The one trait every pipeline participant implements: nine inbound entry
/// points (data flowing from the transport toward the application) and ten
/// outbound entry points (operations flowing from the application toward
/// the transport). Every method has a forwarding default that simply calls
/// the matching `ctx.fire_*`/`ctx.*` method, so implementing only the
/// handful of events a handler actually cares about is enough.
pub trait Handler: Send + Sync + 'static {
    /// Declares which events this handler wants the pipeline to skip
    /// invoking it for. See the module docs for why this replaces runtime
    /// reflection over method overrides.
    fn event_mask(&self) -> EventMask {
        EventMask::NONE
    }

    /// Whether this handler instance may be added to more than one pipeline
    /// (or more than once to the same pipeline). Most handlers carry
    /// per-connection state and must answer `false` (the default).
    fn is_sharable(&self) -> bool {
        false
    }

    /// Invoked once the context has been linked into the pipeline and is
    /// ready to receive events. A failure here causes the pipeline to unlink
    /// the context again (calling [`Handler::handler_removed`]) and to fire
    /// a pipeline exception instead of leaving `added` true without a
    /// matching `removed`.
    fn handler_added(&self, ctx: &dyn Context) -> crate::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Invoked after the context has been unlinked. A failure here only
    /// fires a pipeline exception; the context is already gone.
    fn handler_removed(&self, ctx: &dyn Context) -> crate::Result<()> {
        let _ = ctx;
        Ok(())
    }

    // ---- inbound (head toward tail) ----

    fn on_channel_registered(&self, ctx: &dyn Context) {
        ctx.fire_channel_registered();
    }

    fn on_channel_unregistered(&self, ctx: &dyn Context) {
        ctx.fire_channel_unregistered();
    }

    fn on_channel_active(&self, ctx: &dyn Context) {
        ctx.fire_channel_active();
    }

    fn on_channel_inactive(&self, ctx: &dyn Context) {
        ctx.fire_channel_inactive();
    }

    fn on_channel_read(&self, ctx: &dyn Context, msg: Message) {
        ctx.fire_channel_read(msg);
    }

    fn on_channel_read_complete(&self, ctx: &dyn Context) {
        ctx.fire_channel_read_complete();
    }

    fn on_writability_changed(&self, ctx: &dyn Context, is_writable: bool) {
        ctx.fire_writability_changed(is_writable);
    }

    fn on_user_event_triggered(&self, ctx: &dyn Context, event: UserEvent) {
        ctx.fire_user_event_triggered(event);
    }

    fn on_exception_caught(&self, ctx: &dyn Context, error: CoreError) {
        ctx.fire_exception_caught(error);
    }

    // ---- outbound (tail toward head) ----

    fn on_register(&self, ctx: &dyn Context, promise: Promise<()>) {
        ctx.register(promise);
    }

    fn on_bind(&self, ctx: &dyn Context, local: Address, promise: Promise<()>) {
        ctx.bind(local, promise);
    }

    fn on_connect(
        &self,
        ctx: &dyn Context,
        remote: Address,
        local: Option<Address>,
        promise: Promise<()>,
    ) {
        ctx.connect(remote, local, promise);
    }

    fn on_disconnect(&self, ctx: &dyn Context, promise: Promise<()>) {
        ctx.disconnect(promise);
    }

    fn on_close(&self, ctx: &dyn Context, promise: Promise<()>) {
        ctx.close(promise);
    }

    fn on_deregister(&self, ctx: &dyn Context, promise: Promise<()>) {
        ctx.deregister(promise);
    }

    fn on_read_requested(&self, ctx: &dyn Context) {
        ctx.read_requested();
    }

    fn on_write(&self, ctx: &dyn Context, msg: Message, promise: Promise<()>) {
        ctx.write(msg, promise);
    }

    fn on_flush(&self, ctx: &dyn Context) {
        ctx.flush();
    }

    fn on_close_forcibly(&self, ctx: &dyn Context) {
        ctx.close_forcibly();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mask_delivers_every_event() {
        let mask = EventMask::NONE;
        assert!(!mask.contains(event::CHANNEL_READ));
        assert!(!mask.contains(event::WRITE));
    }

    #[test]
    fn skip_mask_only_hides_declared_bits() {
        let mask = EventMask::skip(event::CHANNEL_READ | event::FLUSH);
        assert!(mask.contains(event::CHANNEL_READ));
        assert!(mask.contains(event::FLUSH));
        assert!(!mask.contains(event::WRITE));
    }
}
