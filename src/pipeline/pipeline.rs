//! The handler chain itself: an arena of contexts addressed by stable index,
//! threaded between two sentinel positions (`HEAD`, `TAIL`) that never carry
//! a [`Handler`] of their own. A traversal that walks off either end falls
//! through to [`PipelineSink`] — the channel that owns this pipeline — the
//! same split a classic two-sentinel linked handler chain encodes, done here
//! with a plain index comparison instead of two extra handler impls wearing
//! a disguise.
//!
//! Structural changes (`add_*`/`remove*`/`replace`) take the arena's write
//! lock; every dispatch only ever takes a read lock and releases it before
//! calling into a handler, so concurrent fires and writes never serialize
//! against each other, only against a structural change in flight.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, RwLock};

use crate::CoreError;
use crate::address::Address;
use crate::buffer::Message;
use crate::error::codes;
use crate::executor::{Executor, Task};
use crate::ids::ChannelId;
use crate::observability::{Logger, MetricsProvider, Severity, UserEvent};
use crate::promise::Promise;

use super::context::{Context, ContextHandle};
use super::handler::{EventMask, Handler, event};

pub(crate) const HEAD: usize = 0;
pub(crate) const TAIL: usize = 1;

/// The nine inbound events a traversal may be carrying, paired one-to-one
/// with the bit positions in [`super::handler::event`].
pub(crate) enum InboundEvent {
    Registered,
    Unregistered,
    Active,
    Inactive,
    Read(Message),
    ReadComplete,
    Writability(bool),
    UserEvent(UserEvent),
    Exception(CoreError),
}

/// The ten outbound operations a traversal may be carrying.
pub(crate) enum OutboundOp {
    Register(Promise<()>),
    Bind(Address, Promise<()>),
    Connect(Address, Option<Address>, Promise<()>),
    Disconnect(Promise<()>),
    Close(Promise<()>),
    Deregister(Promise<()>),
    ReadRequested,
    Write(Message, Promise<()>),
    Flush,
    CloseForcibly,
}

/// The unsafe surface a pipeline's sentinels fall back to: the real
/// transport-facing operations at the outbound terminus (`HEAD`), plus the
/// facilities (`logger`/`metrics`) the tail's own fallback behavior and
/// `add`/`remove` error reporting use. Implemented by whatever owns this
/// pipeline — in this crate, [`crate::channel::Channel`].
pub trait PipelineSink: Send + Sync + 'static {
    fn channel_id(&self) -> ChannelId;
    fn logger(&self) -> Arc<dyn Logger>;
    fn metrics(&self) -> Arc<dyn MetricsProvider>;

    fn sink_register(&self, promise: Promise<()>);
    fn sink_bind(&self, local: Address, promise: Promise<()>);
    fn sink_connect(&self, remote: Address, local: Option<Address>, promise: Promise<()>);
    fn sink_disconnect(&self, promise: Promise<()>);
    fn sink_close(&self, promise: Promise<()>);
    fn sink_deregister(&self, promise: Promise<()>);
    fn sink_read_requested(&self);
    fn sink_write(&self, msg: Message, promise: Promise<()>);
    fn sink_flush(&self);
    fn sink_close_forcibly(&self);
}

struct Node {
    name: Arc<str>,
    handler: Option<Arc<dyn Handler>>,
    executor: Arc<dyn Executor>,
    mask: EventMask,
    prev: usize,
    next: usize,
    linked: bool,
}

/// The handler pipeline: every context between `HEAD` and `TAIL`, indexed by
/// a stable `usize` that is never reused even after `remove` — a removed
/// node's slot is tombstoned (`linked = false`), not reclaimed, so a
/// [`ContextHandle`] captured mid-dispatch never dangles onto a different
/// handler.
pub struct Pipeline {
    nodes: RwLock<Vec<Node>>,
    sink: Arc<dyn PipelineSink>,
    default_executor: Arc<dyn Executor>,
    /// `true` once the owning channel's first `channel_registered` has fired.
    /// Gates whether `insert_after` invokes `handler_added` immediately or
    /// defers it into `pending_added` (§4.D "late registration protocol").
    registered: AtomicBool,
    /// Indices of contexts added before registration, in insertion order;
    /// drained by `fire_channel_registered` before the event itself
    /// propagates past the head.
    pending_added: Mutex<Vec<usize>>,
}

impl Pipeline {
    /// Builds an empty pipeline: just the `HEAD`/`TAIL` sentinels, both
    /// pinned to `default_executor` — the same executor a newly-added
    /// context inherits unless an override is given.
    pub fn new(sink: Arc<dyn PipelineSink>, default_executor: Arc<dyn Executor>) -> Arc<Self> {
        let sentinel = |name: &'static str| Node {
            name: Arc::from(name),
            handler: None,
            executor: default_executor.clone(),
            mask: EventMask::NONE,
            prev: HEAD,
            next: TAIL,
            linked: true,
        };
        let nodes = {
            let mut v = Vec::with_capacity(2);
            v.push(sentinel("head"));
            v.push(sentinel("tail"));
            v
        };
        Arc::new(Self {
            nodes: RwLock::new(nodes),
            sink,
            default_executor,
            registered: AtomicBool::new(false),
            pending_added: Mutex::new(Vec::new()),
        })
    }

    /// Whether the owning channel has completed its first registration.
    /// While `false`, newly-inserted contexts have their `handler_added`
    /// deferred rather than invoked inline.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn node_name(&self, idx: usize) -> Arc<str> {
        self.nodes.read()[idx].name.clone()
    }

    pub(crate) fn node_executor(&self, idx: usize) -> Arc<dyn Executor> {
        self.nodes.read()[idx].executor.clone()
    }

    // ---- structural mutation ----

    /// Installs `handler` immediately after `HEAD`, first in line for every
    /// inbound event.
    pub fn add_first(self: &Arc<Self>, name: impl Into<String>, handler: Arc<dyn Handler>) -> crate::Result<()> {
        self.insert_after(HEAD, name.into(), handler, None)
    }

    /// Installs `handler` immediately before `TAIL`, last in line for every
    /// inbound event, first in line for every outbound operation.
    pub fn add_last(self: &Arc<Self>, name: impl Into<String>, handler: Arc<dyn Handler>) -> crate::Result<()> {
        let before_tail = self.nodes.read()[TAIL].prev;
        self.insert_after(before_tail, name.into(), handler, None)
    }

    /// As [`Pipeline::add_last`] but pins the context to `executor` instead
    /// of the pipeline's default, e.g. to offload a CPU-heavy codec onto a
    /// worker pool rather than run it on the channel's own executor.
    pub fn add_last_with_executor(
        self: &Arc<Self>,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        executor: Arc<dyn Executor>,
    ) -> crate::Result<()> {
        let before_tail = self.nodes.read()[TAIL].prev;
        self.insert_after(before_tail, name.into(), handler, Some(executor))
    }

    pub fn add_before(
        self: &Arc<Self>,
        base_name: &str,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> crate::Result<()> {
        let base = self.find_index(base_name)?;
        let prev = self.nodes.read()[base].prev;
        self.insert_after(prev, name.into(), handler, None)
    }

    pub fn add_after(
        self: &Arc<Self>,
        base_name: &str,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> crate::Result<()> {
        let base = self.find_index(base_name)?;
        self.insert_after(base, name.into(), handler, None)
    }

    fn find_index(&self, name: &str) -> crate::Result<usize> {
        let nodes = self.nodes.read();
        nodes
            .iter()
            .enumerate()
            .find(|(idx, node)| node.linked && *idx != HEAD && *idx != TAIL && &*node.name == name)
            .map(|(idx, _)| idx)
            .ok_or_else(|| {
                CoreError::new(codes::PIPELINE_EXCEPTION, "no context registered under that name")
            })
    }

    fn insert_after(
        self: &Arc<Self>,
        after: usize,
        name: String,
        handler: Arc<dyn Handler>,
        executor: Option<Arc<dyn Executor>>,
    ) -> crate::Result<()> {
        if !handler.is_sharable() {
            let nodes = self.nodes.read();
            let duplicate = nodes
                .iter()
                .any(|n| n.linked && n.handler.as_ref().is_some_and(|h| Arc::ptr_eq(h, &handler)));
            if duplicate {
                return Err(CoreError::new(
                    codes::PIPELINE_EXCEPTION,
                    "non-sharable handler instance already installed in this pipeline",
                ));
            }
        }

        let idx = {
            let mut nodes = self.nodes.write();
            if nodes.iter().any(|n| n.linked && &*n.name == name.as_str()) {
                return Err(CoreError::new(
                    codes::PIPELINE_EXCEPTION,
                    "a context with that name is already installed",
                ));
            }
            let mask = handler.event_mask();
            let node_executor = executor.unwrap_or_else(|| self.default_executor.clone());
            let new_idx = nodes.len();
            let next = nodes[after].next;
            nodes.push(Node {
                name: Arc::from(name.as_str()),
                handler: Some(handler.clone()),
                executor: node_executor,
                mask,
                prev: after,
                next,
                linked: true,
            });
            nodes[after].next = new_idx;
            nodes[next].prev = new_idx;
            new_idx
        };

        // Late registration protocol (§4.D): a handler added before the
        // channel's first registration has its `added` callback queued
        // rather than invoked now; `fire_channel_registered` drains the
        // queue, in insertion order, before the event itself propagates.
        if !self.registered.load(Ordering::Acquire) {
            self.pending_added.lock().push(idx);
            return Ok(());
        }

        self.invoke_handler_added(idx, handler)
    }

    /// Runs (or schedules) a single context's `handler_added`, on that
    /// context's own executor. A rejected submission unlinks the context
    /// without invoking anything — neither `handler_added` nor
    /// `handler_removed` — since the callback never actually ran.
    fn invoke_handler_added(self: &Arc<Self>, idx: usize, handler: Arc<dyn Handler>) -> crate::Result<()> {
        let executor = self.node_executor(idx);
        if executor.in_event_loop() {
            return self.run_handler_added(idx, handler);
        }
        let pipeline = self.clone();
        let handler2 = handler.clone();
        let task: Task = Box::new(move || {
            let _ = pipeline.run_handler_added(idx, handler2);
        });
        if let Err(err) = executor.execute(task) {
            self.unlink(idx);
            self.sink.logger().log(
                Severity::Warn,
                "executor rejected handler_added; context removed without invoking it",
                Some(&err),
                None,
            );
            return Err(err);
        }
        Ok(())
    }

    fn run_handler_added(self: &Arc<Self>, idx: usize, handler: Arc<dyn Handler>) -> crate::Result<()> {
        let ctx = ContextHandle { pipeline: self, idx };
        if let Err(err) = handler.handler_added(&ctx) {
            // "added implies removed" bookkeeping: unlink and run
            // `handler_removed` before surfacing the failure, rather than
            // leaving a half-installed context with `added` true and no
            // matching `removed`.
            self.unlink(idx);
            let ctx2 = ContextHandle { pipeline: self, idx };
            if let Err(remove_err) = handler.handler_removed(&ctx2) {
                self.sink.logger().log(
                    Severity::Warn,
                    "handler_removed also failed while unwinding a handler_added failure",
                    Some(&remove_err),
                    None,
                );
            }
            self.sink
                .logger()
                .log(Severity::Warn, "handler_added failed; context removed", Some(&err), None);
            let wrapped = CoreError::new(codes::PIPELINE_EXCEPTION, "handler_added failed").with_cause(err.clone());
            self.fire_exception_caught(wrapped);
            return Err(err);
        }
        Ok(())
    }

    /// Drains every queued `handler_added` callback, in the order contexts
    /// were inserted, before the caller propagates `channel_registered`
    /// itself further. Invoked once, from the head context, on the first
    /// successful registration.
    fn drain_pending_added(self: &Arc<Self>) {
        loop {
            let idx = {
                let mut pending = self.pending_added.lock();
                if pending.is_empty() {
                    return;
                }
                pending.remove(0)
            };
            let handler = {
                let nodes = self.nodes.read();
                if !nodes[idx].linked {
                    continue;
                }
                nodes[idx].handler.clone()
            };
            if let Some(handler) = handler {
                let _ = self.invoke_handler_added(idx, handler);
            }
        }
    }

    fn unlink(&self, idx: usize) {
        let mut nodes = self.nodes.write();
        let prev = nodes[idx].prev;
        let next = nodes[idx].next;
        nodes[prev].next = next;
        nodes[next].prev = prev;
        nodes[idx].linked = false;
    }

    /// Removes the context installed under `name`, invoking
    /// [`Handler::handler_removed`] once it has been unlinked.
    pub fn remove(self: &Arc<Self>, name: &str) -> crate::Result<()> {
        let idx = self.find_index(name)?;
        self.remove_at(idx)
    }

    pub fn remove_first(self: &Arc<Self>) -> crate::Result<()> {
        let idx = self.nodes.read()[HEAD].next;
        if idx == TAIL {
            return Err(CoreError::new(codes::PIPELINE_EXCEPTION, "pipeline has no handlers"));
        }
        self.remove_at(idx)
    }

    pub fn remove_last(self: &Arc<Self>) -> crate::Result<()> {
        let idx = self.nodes.read()[TAIL].prev;
        if idx == HEAD {
            return Err(CoreError::new(codes::PIPELINE_EXCEPTION, "pipeline has no handlers"));
        }
        self.remove_at(idx)
    }

    fn remove_at(self: &Arc<Self>, idx: usize) -> crate::Result<()> {
        self.unlink(idx);
        self.invoke_handler_removed(idx);
        Ok(())
    }

    /// Runs (or schedules) a single context's `handler_removed`, on that
    /// context's own executor — "schedules `handler_removed` on the relevant
    /// executor" per the removal contract. The context must already be
    /// unlinked; a rejected submission is logged and otherwise ignored (the
    /// context is gone from the chain either way, only the callback itself
    /// didn't run).
    fn invoke_handler_removed(self: &Arc<Self>, idx: usize) {
        let executor = self.node_executor(idx);
        if executor.in_event_loop() {
            self.run_handler_removed(idx);
            return;
        }
        let pipeline = self.clone();
        let task: Task = Box::new(move || {
            pipeline.run_handler_removed(idx);
        });
        if let Err(err) = executor.execute(task) {
            self.sink.logger().log(
                Severity::Warn,
                "executor rejected handler_removed; callback did not run",
                Some(&err),
                None,
            );
        }
    }

    fn run_handler_removed(self: &Arc<Self>, idx: usize) {
        let handler = {
            let nodes = self.nodes.read();
            nodes[idx].handler.clone()
        };
        let Some(handler) = handler else {
            return;
        };
        let ctx = ContextHandle { pipeline: self, idx };
        if let Err(err) = handler.handler_removed(&ctx) {
            // The context is already removed by this point; unlike a
            // `handler_added` failure there is nothing left to unwind, only
            // a pipeline-exception to raise (§ errors in structural
            // callbacks).
            self.sink
                .logger()
                .log(Severity::Warn, "handler_removed reported failure", Some(&err), None);
            let wrapped = CoreError::new(codes::PIPELINE_EXCEPTION, "handler_removed failed").with_cause(err);
            self.fire_exception_caught(wrapped);
        }
    }

    /// Atomically swaps the context named `name` for `handler` under
    /// `new_name`: the replacement is linked in — and its `handler_added`
    /// invoked — before the old context is unlinked, so an in-flight
    /// traversal never observes a gap where neither is present.
    pub fn replace(
        self: &Arc<Self>,
        name: &str,
        new_name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> crate::Result<()> {
        let old_idx = self.find_index(name)?;
        let after = self.nodes.read()[old_idx].prev;
        self.insert_after(after, new_name.into(), handler, None)?;
        self.remove_at(old_idx)
    }

    /// Tears the whole chain down in the two-pass order the destruction
    /// contract requires: a forward pass from `head.next` to `tail.prev`
    /// snapshots the linked contexts and their executors (a plain read-lock
    /// walk, no mutation), then a reverse pass from `tail.prev` back to
    /// `head.next` unlinks and invokes `handler_removed` on each, last-added
    /// first. Taking the order up front rather than re-reading `prev` as we
    /// go means a concurrent structural change racing the destruction can
    /// never make this traversal skip or double-visit a context. Failures
    /// from individual handlers are logged/exception-fired, never
    /// propagated: by the time this runs the owning channel is already past
    /// the point of caring.
    pub fn destroy(self: &Arc<Self>) {
        let order = {
            let nodes = self.nodes.read();
            let mut order = Vec::new();
            let mut idx = nodes[HEAD].next;
            while idx != TAIL {
                if nodes[idx].linked {
                    order.push(idx);
                }
                idx = nodes[idx].next;
            }
            order
        };
        for idx in order.into_iter().rev() {
            if self.nodes.read()[idx].linked {
                let _ = self.remove_at(idx);
            }
        }
    }

    // ---- inbound entry points, invoked by the owning channel ----

    /// Fires `channel_registered`. On the *first* call this also flips the
    /// pipeline into the registered state and drains every handler added
    /// beforehand — each queued `handler_added` runs, in insertion order,
    /// before this event propagates past the head (§4.D).
    pub fn fire_channel_registered(self: &Arc<Self>) {
        if !self.registered.swap(true, Ordering::AcqRel) {
            self.drain_pending_added();
        }
        Self::deliver_inbound(self, HEAD, event::CHANNEL_REGISTERED, InboundEvent::Registered);
    }

    pub fn fire_channel_unregistered(self: &Arc<Self>) {
        Self::deliver_inbound(self, HEAD, event::CHANNEL_UNREGISTERED, InboundEvent::Unregistered);
    }

    pub fn fire_channel_active(self: &Arc<Self>) {
        Self::deliver_inbound(self, HEAD, event::CHANNEL_ACTIVE, InboundEvent::Active);
    }

    pub fn fire_channel_inactive(self: &Arc<Self>) {
        Self::deliver_inbound(self, HEAD, event::CHANNEL_INACTIVE, InboundEvent::Inactive);
    }

    pub fn fire_channel_read(self: &Arc<Self>, msg: Message) {
        Self::deliver_inbound(self, HEAD, event::CHANNEL_READ, InboundEvent::Read(msg));
    }

    pub fn fire_channel_read_complete(self: &Arc<Self>) {
        Self::deliver_inbound(self, HEAD, event::CHANNEL_READ_COMPLETE, InboundEvent::ReadComplete);
    }

    pub fn fire_writability_changed(self: &Arc<Self>, is_writable: bool) {
        Self::deliver_inbound(
            self,
            HEAD,
            event::WRITABILITY_CHANGED,
            InboundEvent::Writability(is_writable),
        );
    }

    pub fn fire_user_event_triggered(self: &Arc<Self>, user_event: UserEvent) {
        Self::deliver_inbound(
            self,
            HEAD,
            event::USER_EVENT_TRIGGERED,
            InboundEvent::UserEvent(user_event),
        );
    }

    pub fn fire_exception_caught(self: &Arc<Self>, error: CoreError) {
        Self::deliver_inbound(self, HEAD, event::EXCEPTION_CAUGHT, InboundEvent::Exception(error));
    }

    // ---- outbound entry points, invoked on behalf of the public channel API ----

    pub fn register(self: &Arc<Self>, promise: Promise<()>) {
        Self::deliver_outbound(self, TAIL, event::REGISTER, OutboundOp::Register(promise));
    }

    pub fn bind(self: &Arc<Self>, local: Address, promise: Promise<()>) {
        Self::deliver_outbound(self, TAIL, event::BIND, OutboundOp::Bind(local, promise));
    }

    pub fn connect(self: &Arc<Self>, remote: Address, local: Option<Address>, promise: Promise<()>) {
        Self::deliver_outbound(self, TAIL, event::CONNECT, OutboundOp::Connect(remote, local, promise));
    }

    pub fn disconnect(self: &Arc<Self>, promise: Promise<()>) {
        Self::deliver_outbound(self, TAIL, event::DISCONNECT, OutboundOp::Disconnect(promise));
    }

    pub fn close(self: &Arc<Self>, promise: Promise<()>) {
        Self::deliver_outbound(self, TAIL, event::CLOSE, OutboundOp::Close(promise));
    }

    pub fn deregister(self: &Arc<Self>, promise: Promise<()>) {
        Self::deliver_outbound(self, TAIL, event::DEREGISTER, OutboundOp::Deregister(promise));
    }

    pub fn read_requested(self: &Arc<Self>) {
        Self::deliver_outbound(self, TAIL, event::READ_REQUESTED, OutboundOp::ReadRequested);
    }

    pub fn write(self: &Arc<Self>, msg: Message, promise: Promise<()>) {
        Self::deliver_outbound(self, TAIL, event::WRITE, OutboundOp::Write(msg, promise));
    }

    pub fn flush(self: &Arc<Self>) {
        Self::deliver_outbound(self, TAIL, event::FLUSH, OutboundOp::Flush);
    }

    pub fn close_forcibly(self: &Arc<Self>) {
        Self::deliver_outbound(self, TAIL, event::CLOSE_FORCIBLY, OutboundOp::CloseForcibly);
    }

    // ---- dispatch core ----

    /// Walks toward `TAIL` starting just past `from`, skipping contexts
    /// whose [`EventMask`] declares `bit`, and hands the event to the first
    /// one that doesn't. Falls through to the tail's built-in behavior if
    /// nothing claims it first.
    pub(crate) fn deliver_inbound(pipeline: &Arc<Self>, from: usize, bit: u32, event: InboundEvent) {
        let mut idx = from;
        loop {
            let next = pipeline.nodes.read()[idx].next;
            if next == TAIL {
                Self::run_tail_fallback(pipeline, event);
                return;
            }
            let (handler, mask, executor) = {
                let nodes = pipeline.nodes.read();
                let node = &nodes[next];
                (node.handler.clone(), node.mask, node.executor.clone())
            };
            let Some(handler) = handler else {
                idx = next;
                continue;
            };
            if mask.contains(bit) {
                idx = next;
                continue;
            }
            Self::invoke_inbound_at(pipeline, next, handler, executor, event);
            return;
        }
    }

    fn invoke_inbound_at(
        pipeline: &Arc<Self>,
        idx: usize,
        handler: Arc<dyn Handler>,
        executor: Arc<dyn Executor>,
        event: InboundEvent,
    ) {
        if executor.in_event_loop() {
            let ctx = ContextHandle { pipeline, idx };
            Self::dispatch_inbound(&*handler, &ctx, event);
            return;
        }
        let pipeline = pipeline.clone();
        let task: Task = Box::new(move || {
            let ctx = ContextHandle { pipeline: &pipeline, idx };
            Self::dispatch_inbound(&*handler, &ctx, event);
        });
        if let Err(err) = executor.execute(task) {
            pipeline
                .sink
                .logger()
                .log(Severity::Warn, "failed to hand an inbound event to a handler's executor", Some(&err), None);
        }
    }

    fn dispatch_inbound(handler: &dyn Handler, ctx: &dyn Context, event: InboundEvent) {
        match event {
            InboundEvent::Registered => handler.on_channel_registered(ctx),
            InboundEvent::Unregistered => handler.on_channel_unregistered(ctx),
            InboundEvent::Active => handler.on_channel_active(ctx),
            InboundEvent::Inactive => handler.on_channel_inactive(ctx),
            InboundEvent::Read(msg) => handler.on_channel_read(ctx, msg),
            InboundEvent::ReadComplete => handler.on_channel_read_complete(ctx),
            InboundEvent::Writability(writable) => handler.on_writability_changed(ctx, writable),
            InboundEvent::UserEvent(user_event) => handler.on_user_event_triggered(ctx, user_event),
            InboundEvent::Exception(error) => handler.on_exception_caught(ctx, error),
        }
    }

    fn run_tail_fallback(pipeline: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::Exception(err) => {
                pipeline.sink.logger().log(
                    Severity::Warn,
                    "exception reached the tail of the pipeline unhandled",
                    Some(&err),
                    None,
                );
            }
            InboundEvent::Read(_) => {
                pipeline
                    .sink
                    .logger()
                    .warn("a channel_read message reached the tail unhandled and was released");
            }
            // Lifecycle and writability notifications with no listener
            // installed are expected, not a bug; stay quiet for those.
            _ => {}
        }
    }

    /// Walks toward `HEAD` starting just before `from`, skipping contexts
    /// whose [`EventMask`] declares `bit`, and hands the operation to the
    /// first one that doesn't. Falls through to [`PipelineSink`] once it
    /// reaches `HEAD`.
    pub(crate) fn deliver_outbound(pipeline: &Arc<Self>, from: usize, bit: u32, op: OutboundOp) {
        let mut idx = from;
        loop {
            let prev = pipeline.nodes.read()[idx].prev;
            if prev == HEAD {
                Self::run_head_sink(pipeline, op);
                return;
            }
            let (handler, mask, executor) = {
                let nodes = pipeline.nodes.read();
                let node = &nodes[prev];
                (node.handler.clone(), node.mask, node.executor.clone())
            };
            let Some(handler) = handler else {
                idx = prev;
                continue;
            };
            if mask.contains(bit) {
                idx = prev;
                continue;
            }
            Self::invoke_outbound_at(pipeline, prev, handler, executor, op);
            return;
        }
    }

    fn invoke_outbound_at(
        pipeline: &Arc<Self>,
        idx: usize,
        handler: Arc<dyn Handler>,
        executor: Arc<dyn Executor>,
        op: OutboundOp,
    ) {
        if executor.in_event_loop() {
            let ctx = ContextHandle { pipeline, idx };
            Self::dispatch_outbound(&*handler, &ctx, op);
            return;
        }
        let pipeline = pipeline.clone();
        let task: Task = Box::new(move || {
            let ctx = ContextHandle { pipeline: &pipeline, idx };
            Self::dispatch_outbound(&*handler, &ctx, op);
        });
        if let Err(err) = executor.execute(task) {
            pipeline
                .sink
                .logger()
                .log(Severity::Warn, "failed to hand an outbound operation to a handler's executor", Some(&err), None);
        }
    }

    fn dispatch_outbound(handler: &dyn Handler, ctx: &dyn Context, op: OutboundOp) {
        match op {
            OutboundOp::Register(promise) => handler.on_register(ctx, promise),
            OutboundOp::Bind(local, promise) => handler.on_bind(ctx, local, promise),
            OutboundOp::Connect(remote, local, promise) => handler.on_connect(ctx, remote, local, promise),
            OutboundOp::Disconnect(promise) => handler.on_disconnect(ctx, promise),
            OutboundOp::Close(promise) => handler.on_close(ctx, promise),
            OutboundOp::Deregister(promise) => handler.on_deregister(ctx, promise),
            OutboundOp::ReadRequested => handler.on_read_requested(ctx),
            OutboundOp::Write(msg, promise) => handler.on_write(ctx, msg, promise),
            OutboundOp::Flush => handler.on_flush(ctx),
            OutboundOp::CloseForcibly => handler.on_close_forcibly(ctx),
        }
    }

    fn run_head_sink(pipeline: &Arc<Self>, op: OutboundOp) {
        let executor = pipeline.nodes.read()[HEAD].executor.clone();
        if executor.in_event_loop() {
            Self::invoke_sink(pipeline, op);
            return;
        }
        let pipeline2 = pipeline.clone();
        let task: Task = Box::new(move || Self::invoke_sink(&pipeline2, op));
        if let Err(err) = executor.execute(task) {
            pipeline
                .sink
                .logger()
                .log(Severity::Warn, "failed to hand an outbound operation to the channel's executor", Some(&err), None);
        }
    }

    fn invoke_sink(pipeline: &Arc<Self>, op: OutboundOp) {
        match op {
            OutboundOp::Register(promise) => pipeline.sink.sink_register(promise),
            OutboundOp::Bind(local, promise) => pipeline.sink.sink_bind(local, promise),
            OutboundOp::Connect(remote, local, promise) => pipeline.sink.sink_connect(remote, local, promise),
            OutboundOp::Disconnect(promise) => pipeline.sink.sink_disconnect(promise),
            OutboundOp::Close(promise) => pipeline.sink.sink_close(promise),
            OutboundOp::Deregister(promise) => pipeline.sink.sink_deregister(promise),
            OutboundOp::ReadRequested => pipeline.sink.sink_read_requested(),
            OutboundOp::Write(msg, promise) => pipeline.sink.sink_write(msg, promise),
            OutboundOp::Flush => pipeline.sink.sink_flush(),
            OutboundOp::CloseForcibly => pipeline.sink.sink_close_forcibly(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::executor::testing::InlineExecutor;
    use crate::observability::NoopObservability;
    use alloc::sync::Arc as StdArc;
    use alloc::vec::Vec as StdVec;
    use spin::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        written: Mutex<StdVec<&'static str>>,
    }

    impl PipelineSink for RecordingSink {
        fn channel_id(&self) -> ChannelId {
            ChannelId::from_fields(0, 0, 0, 0, 0)
        }

        fn logger(&self) -> Arc<dyn Logger> {
            Arc::new(NoopObservability)
        }

        fn metrics(&self) -> Arc<dyn MetricsProvider> {
            Arc::new(NoopObservability)
        }

        fn sink_register(&self, promise: Promise<()>) {
            self.written.lock().push("register");
            promise.complete(());
        }
        fn sink_bind(&self, _local: Address, promise: Promise<()>) {
            self.written.lock().push("bind");
            promise.complete(());
        }
        fn sink_connect(&self, _remote: Address, _local: Option<Address>, promise: Promise<()>) {
            self.written.lock().push("connect");
            promise.complete(());
        }
        fn sink_disconnect(&self, promise: Promise<()>) {
            promise.complete(());
        }
        fn sink_close(&self, promise: Promise<()>) {
            self.written.lock().push("close");
            promise.complete(());
        }
        fn sink_deregister(&self, promise: Promise<()>) {
            promise.complete(());
        }
        fn sink_read_requested(&self) {
            self.written.lock().push("read_requested");
        }
        fn sink_write(&self, _msg: Message, promise: Promise<()>) {
            self.written.lock().push("write");
            promise.complete(());
        }
        fn sink_flush(&self) {
            self.written.lock().push("flush");
        }
        fn sink_close_forcibly(&self) {
            self.written.lock().push("close_forcibly");
        }
    }

    struct RecordingHandler {
        reads: Mutex<StdVec<&'static str>>,
    }

    impl Handler for RecordingHandler {
        fn on_channel_active(&self, ctx: &dyn Context) {
            self.reads.lock().push("active");
            ctx.fire_channel_active();
        }

        fn on_channel_read(&self, ctx: &dyn Context, msg: Message) {
            self.reads.lock().push("read");
            ctx.fire_channel_read(msg);
        }
    }

    fn pipeline_with_sink() -> (StdArc<Pipeline>, StdArc<RecordingSink>) {
        let sink = StdArc::new(RecordingSink::default());
        let executor: StdArc<dyn Executor> = StdArc::new(InlineExecutor::new());
        (Pipeline::new(sink.clone(), executor), sink)
    }

    #[test]
    fn empty_pipeline_write_reaches_the_sink() {
        let (pipeline, sink) = pipeline_with_sink();
        let promise = Promise::new();
        pipeline.write(Message::opaque(1u32), promise.clone());
        assert!(promise.is_done());
        assert_eq!(&*sink.written.lock(), &["write"]);
    }

    #[test]
    fn handler_forwards_active_and_read_to_tail() {
        let (pipeline, _sink) = pipeline_with_sink();
        let handler = StdArc::new(RecordingHandler {
            reads: Mutex::new(StdVec::new()),
        });
        pipeline.add_last("recorder", handler.clone()).unwrap();

        pipeline.fire_channel_active();
        pipeline.fire_channel_read(Message::opaque(7u32));

        assert_eq!(&*handler.reads.lock(), &["active", "read"]);
    }

    #[test]
    fn add_before_orders_handlers_correctly() {
        let (pipeline, _sink) = pipeline_with_sink();
        let first = StdArc::new(RecordingHandler {
            reads: Mutex::new(StdVec::new()),
        });
        let second = StdArc::new(RecordingHandler {
            reads: Mutex::new(StdVec::new()),
        });
        pipeline.add_last("b", second).unwrap();
        pipeline.add_before("b", "a", first.clone()).unwrap();

        pipeline.fire_channel_active();
        assert_eq!(&*first.reads.lock(), &["active"]);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let (pipeline, _sink) = pipeline_with_sink();
        let handler = StdArc::new(RecordingHandler {
            reads: Mutex::new(StdVec::new()),
        });
        pipeline.add_last("dup", handler.clone()).unwrap();
        let err = pipeline.add_last("dup", handler);
        assert!(err.is_err());
    }

    #[test]
    fn remove_unlinks_without_disturbing_neighbors() {
        let (pipeline, _sink) = pipeline_with_sink();
        let first = StdArc::new(RecordingHandler {
            reads: Mutex::new(StdVec::new()),
        });
        let second = StdArc::new(RecordingHandler {
            reads: Mutex::new(StdVec::new()),
        });
        pipeline.add_last("first", first.clone()).unwrap();
        pipeline.add_last("second", second.clone()).unwrap();
        pipeline.remove("first").unwrap();

        pipeline.fire_channel_active();
        assert!(first.reads.lock().is_empty());
        assert_eq!(&*second.reads.lock(), &["active"]);
    }

    #[test]
    fn replace_links_the_new_handler_before_unlinking_the_old_one() {
        let (pipeline, _sink) = pipeline_with_sink();
        let old = StdArc::new(RecordingHandler {
            reads: Mutex::new(StdVec::new()),
        });
        let new = StdArc::new(RecordingHandler {
            reads: Mutex::new(StdVec::new()),
        });
        pipeline.add_last("swap", old.clone()).unwrap();
        pipeline.replace("swap", "swap2", new.clone()).unwrap();

        pipeline.fire_channel_active();
        assert!(old.reads.lock().is_empty());
        assert_eq!(&*new.reads.lock(), &["active"]);
    }

    struct OrderTrackingHandler {
        label: &'static str,
        order: StdArc<Mutex<StdVec<&'static str>>>,
    }

    impl Handler for OrderTrackingHandler {
        fn handler_added(&self, _ctx: &dyn Context) -> crate::Result<()> {
            self.order.lock().push(self.label);
            Ok(())
        }
    }

    /// Scenario 3: handlers added to an unregistered pipeline have
    /// `handler_added` queued, then drained in insertion order on the first
    /// `channel_registered` — strictly before that event propagates past the
    /// head.
    #[test]
    fn late_handler_additions_run_handler_added_in_insertion_order_before_registration_propagates() {
        let (pipeline, _sink) = pipeline_with_sink();
        let order = StdArc::new(Mutex::new(StdVec::new()));

        assert!(!pipeline.is_registered());
        pipeline
            .add_last("a", StdArc::new(OrderTrackingHandler { label: "A", order: order.clone() }))
            .unwrap();
        pipeline
            .add_last("b", StdArc::new(OrderTrackingHandler { label: "B", order: order.clone() }))
            .unwrap();
        pipeline
            .add_last("c", StdArc::new(OrderTrackingHandler { label: "C", order: order.clone() }))
            .unwrap();
        // Nothing runs until registration.
        assert!(order.lock().is_empty());

        pipeline.fire_channel_registered();

        assert_eq!(&*order.lock(), &["A", "B", "C"]);
        assert!(pipeline.is_registered());
    }

    struct OrderTrackingRemovalHandler {
        label: &'static str,
        order: StdArc<Mutex<StdVec<&'static str>>>,
    }

    impl Handler for OrderTrackingRemovalHandler {
        fn handler_removed(&self, _ctx: &dyn Context) -> crate::Result<()> {
            self.order.lock().push(self.label);
            Ok(())
        }
    }

    #[test]
    fn destroy_invokes_handler_removed_tail_to_head() {
        let (pipeline, _sink) = pipeline_with_sink();
        let order = StdArc::new(Mutex::new(StdVec::new()));

        pipeline
            .add_last("a", StdArc::new(OrderTrackingRemovalHandler { label: "A", order: order.clone() }))
            .unwrap();
        pipeline
            .add_last("b", StdArc::new(OrderTrackingRemovalHandler { label: "B", order: order.clone() }))
            .unwrap();
        pipeline
            .add_last("c", StdArc::new(OrderTrackingRemovalHandler { label: "C", order: order.clone() }))
            .unwrap();
        pipeline.fire_channel_registered();

        pipeline.destroy();

        assert_eq!(&*order.lock(), &["C", "B", "A"]);
        assert!(pipeline.find_index("a").is_err(), "contexts must be unlinked after destroy");
    }
}
