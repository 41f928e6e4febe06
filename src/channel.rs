//! The abstract channel: the owner of exactly one [`Pipeline`], one
//! [`OutboundBuffer`], and one [`TransportPlug`], and the thing that actually
//! implements [`PipelineSink`] — the unsafe operations the pipeline's head
//! falls through to once every handler has had its say.
//!
//! A channel is built with [`Arc::new_cyclic`] because its own sink and its
//! outbound buffer's writability listener both need to call back into it
//! (`pipeline.fire_writability_changed`, `transport.do_write`, …): rather than
//! reach for `unsafe` self-referential storage, both hold a [`Weak`] and
//! upgrade it on the (single, pinned) executor thread that is ever actually
//! running this channel's logic.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::CoreError;
use crate::address::Address;
use crate::buffer::{CloseOutcome, Message, OutboundBuffer, WritabilityListener};
use crate::config::ChannelConfiguration;
use crate::error::codes;
use crate::executor::Executor;
use crate::future::BoxFuture;
use crate::ids::ChannelId;
use crate::observability::{Logger, MetricsProvider, Severity};
use crate::pipeline::{Pipeline, PipelineSink};
use crate::promise::{Outcome, Promise};
use crate::transport::BoxedTransport;

/// A channel's lifecycle position, in the order it is always traversed:
/// `Open` at construction, `Registered` once bound to an executor and
/// transport, `Active` once bound/connected, `Closed` terminally. A channel
/// never regresses out of `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChannelState {
    Open,
    Registered,
    Active,
    Closed,
}

/// Forwards a [`Promise`]'s already-resolved [`Outcome`] into another promise
/// of the same type — used every time a second `close`/`disconnect` call
/// needs to ride along on the first one's result instead of redoing the work.
fn forward(promise: Promise<()>, outcome: Outcome<()>) {
    match outcome {
        Outcome::Success(()) => {
            promise.complete(());
        }
        Outcome::Failure(err) => {
            promise.fail(err);
        }
        Outcome::Cancelled => {
            promise.cancel();
        }
    }
}

struct ChannelWritabilityListener {
    channel: Weak<Channel>,
}

impl WritabilityListener for ChannelWritabilityListener {
    fn channel_writability_changed(&self, is_writable: bool) {
        if let Some(channel) = self.channel.upgrade() {
            channel.pipeline.fire_writability_changed(is_writable);
        }
    }
}

/// The [`PipelineSink`] half of a channel: a thin [`Weak`]-holding shim so the
/// pipeline can be built (and the sink installed into it) before the
/// [`Channel`] itself finishes constructing.
struct ChannelSink {
    channel: Weak<Channel>,
    id: ChannelId,
    logger: Arc<dyn Logger>,
    metrics: Arc<dyn MetricsProvider>,
}

impl PipelineSink for ChannelSink {
    fn channel_id(&self) -> ChannelId {
        self.id
    }

    fn logger(&self) -> Arc<dyn Logger> {
        self.logger.clone()
    }

    fn metrics(&self) -> Arc<dyn MetricsProvider> {
        self.metrics.clone()
    }

    fn sink_register(&self, promise: Promise<()>) {
        match self.channel.upgrade() {
            Some(channel) => channel.do_register(promise),
            None => {
                promise.fail(CoreError::new(codes::CLOSED_CHANNEL, "channel no longer exists"));
            }
        }
    }

    fn sink_bind(&self, local: Address, promise: Promise<()>) {
        match self.channel.upgrade() {
            Some(channel) => channel.do_sink_bind(local, promise),
            None => {
                promise.fail(CoreError::new(codes::CLOSED_CHANNEL, "channel no longer exists"));
            }
        }
    }

    fn sink_connect(&self, remote: Address, local: Option<Address>, promise: Promise<()>) {
        match self.channel.upgrade() {
            Some(channel) => channel.do_sink_connect(remote, local, promise),
            None => {
                promise.fail(CoreError::new(codes::CLOSED_CHANNEL, "channel no longer exists"));
            }
        }
    }

    fn sink_disconnect(&self, promise: Promise<()>) {
        match self.channel.upgrade() {
            Some(channel) => channel.do_sink_disconnect(promise),
            None => {
                promise.fail(CoreError::new(codes::CLOSED_CHANNEL, "channel no longer exists"));
            }
        }
    }

    fn sink_close(&self, promise: Promise<()>) {
        match self.channel.upgrade() {
            Some(channel) => channel.do_sink_close(promise),
            None => {
                promise.complete(());
            }
        }
    }

    fn sink_deregister(&self, promise: Promise<()>) {
        match self.channel.upgrade() {
            Some(channel) => channel.do_sink_deregister(promise),
            None => {
                promise.fail(CoreError::new(codes::CLOSED_CHANNEL, "channel no longer exists"));
            }
        }
    }

    fn sink_read_requested(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.do_sink_read_requested();
        }
    }

    fn sink_write(&self, msg: Message, promise: Promise<()>) {
        match self.channel.upgrade() {
            Some(channel) => channel.do_sink_write(msg, promise),
            None => {
                promise.fail(CoreError::new(codes::CLOSED_CHANNEL, "channel no longer exists"));
            }
        }
    }

    fn sink_flush(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.do_sink_flush();
        }
    }

    fn sink_close_forcibly(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.do_close_forcibly();
        }
    }
}

/// The abstract channel: owns the pipeline, the outbound buffer, and the
/// transport plug, and drives the registration/bind/connect/close state
/// machine (§3–§5) on top of them.
pub struct Channel {
    id: ChannelId,
    pipeline: Arc<Pipeline>,
    transport: Mutex<BoxedTransport>,
    executor: Mutex<Option<Arc<dyn Executor>>>,
    /// The executor this channel first registered to, retained across a
    /// deregister so a later re-registration can be checked against it (see
    /// the open question in §9: re-registration must target the *same*
    /// executor; any other is `IncompatibleExecutor`).
    pinned_executor: Mutex<Option<Arc<dyn Executor>>>,
    state: Mutex<ChannelState>,
    outbound: Mutex<Option<OutboundBuffer>>,
    local_address: Mutex<Option<Address>>,
    remote_address: Mutex<Option<Address>>,
    close_completion: Promise<()>,
    close_started: AtomicBool,
    flushing: AtomicBool,
    config: Arc<dyn ChannelConfiguration>,
    logger: Arc<dyn Logger>,
    metrics: Arc<dyn MetricsProvider>,
}

impl Channel {
    /// Builds a new, `Open` channel: empty pipeline (just the sentinels),
    /// full outbound buffer wired to `config`'s watermarks and estimator, and
    /// not yet bound to any executor.
    pub fn new(
        id: ChannelId,
        transport: BoxedTransport,
        config: Arc<dyn ChannelConfiguration>,
        default_executor: Arc<dyn Executor>,
        logger: Arc<dyn Logger>,
        metrics: Arc<dyn MetricsProvider>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Channel>| {
            let sink: Arc<dyn PipelineSink> = Arc::new(ChannelSink {
                channel: weak.clone(),
                id,
                logger: logger.clone(),
                metrics: metrics.clone(),
            });
            let pipeline = Pipeline::new(sink, default_executor.clone());
            let listener: Arc<dyn WritabilityListener> = Arc::new(ChannelWritabilityListener {
                channel: weak.clone(),
            });
            let outbound = OutboundBuffer::new(
                config.write_buffer_high_water_mark(),
                config.write_buffer_low_water_mark(),
                config.message_size_estimator(),
                listener,
            );
            Self {
                id,
                pipeline,
                transport: Mutex::new(transport),
                executor: Mutex::new(None),
                pinned_executor: Mutex::new(None),
                state: Mutex::new(ChannelState::Open),
                outbound: Mutex::new(Some(outbound)),
                local_address: Mutex::new(None),
                remote_address: Mutex::new(None),
                close_completion: Promise::new(),
                close_started: AtomicBool::new(false),
                flushing: AtomicBool::new(false),
                config,
                logger,
                metrics,
            }
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn config(&self) -> &Arc<dyn ChannelConfiguration> {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active
    }

    pub fn is_writable(&self) -> bool {
        self.outbound.lock().as_ref().is_some_and(OutboundBuffer::is_writable)
    }

    pub fn local_address(&self) -> Option<Address> {
        if let Some(addr) = self.local_address.lock().clone() {
            return Some(addr);
        }
        let addr = self.transport.lock().local_address();
        if let Some(addr) = addr.clone() {
            *self.local_address.lock() = Some(addr);
        }
        addr
    }

    pub fn remote_address(&self) -> Option<Address> {
        if let Some(addr) = self.remote_address.lock().clone() {
            return Some(addr);
        }
        let addr = self.transport.lock().remote_address();
        if let Some(addr) = addr.clone() {
            *self.remote_address.lock() = Some(addr);
        }
        addr
    }

    /// Resolves once this channel has fully closed. Safe to call any number
    /// of times, before or after `close` — every caller observes the same
    /// completion.
    pub fn closed(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let completion = self.close_completion.clone();
        Box::pin(async move {
            let _ = completion.await;
        })
    }

    // ---- registration: binds the channel to an executor and transport,
    // outside the ordinary outbound pipeline traversal since no handler can
    // meaningfully run before the channel has an executor to run on ----

    /// Binds this channel to `executor` and performs transport registration.
    /// Fails with [`codes::ALREADY_REGISTERED`] if the channel is currently
    /// registered, or [`codes::INCOMPATIBLE_EXECUTOR`] if the transport
    /// rejects `executor` or (on a re-registration after `deregister`) if
    /// `executor` is not the same instance the channel originally pinned to.
    /// A task submission rejected by `executor` force-closes the channel —
    /// there is no handler chain yet to report the failure through.
    pub fn register(self: &Arc<Self>, executor: Arc<dyn Executor>, promise: Promise<()>) {
        if self.state() == ChannelState::Closed {
            promise.fail(CoreError::new(codes::CLOSED_CHANNEL, "channel is closed"));
            return;
        }
        if self.executor.lock().is_some() {
            promise.fail(CoreError::new(codes::ALREADY_REGISTERED, "channel already registered"));
            return;
        }
        if let Some(pinned) = self.pinned_executor.lock().as_ref() {
            if !crate::executor::same_executor(pinned, &executor) {
                promise.fail(CoreError::new(
                    codes::INCOMPATIBLE_EXECUTOR,
                    "re-registration must target the same executor the channel first pinned to",
                ));
                return;
            }
        }
        if !self.transport.lock().is_compatible(&executor) {
            promise.fail(CoreError::new(
                codes::INCOMPATIBLE_EXECUTOR,
                "transport rejected the given executor",
            ));
            return;
        }
        *self.executor.lock() = Some(executor.clone());
        self.pinned_executor.lock().get_or_insert_with(|| executor.clone());

        let channel = self.clone();
        if executor.in_event_loop() {
            channel.do_register(promise);
            return;
        }
        let channel2 = self.clone();
        let promise2 = promise.clone();
        let task = alloc::boxed::Box::new(move || channel.do_register(promise2));
        if let Err(err) = executor.execute(task) {
            channel2.logger.log(
                Severity::Error,
                "executor rejected the registration task; force-closing",
                Some(&err),
                None,
            );
            promise.fail(err);
            channel2.do_close_forcibly();
        }
    }

    fn do_register(self: &Arc<Self>, promise: Promise<()>) {
        match self.transport.lock().do_register() {
            Ok(()) => {
                // A re-registration (after a prior deregister) finds the
                // channel already past `Open` — possibly still `Active`, per
                // the orthogonal open/active/registered flags in §3 — so
                // only the very first registration advances the state.
                let mut state = self.state.lock();
                if *state == ChannelState::Open {
                    *state = ChannelState::Registered;
                }
                let was_active = *state == ChannelState::Active;
                drop(state);

                self.pipeline.fire_channel_registered();
                // Only the first successful registration fires
                // `channel_active`; a re-registration that finds the channel
                // already active instead just re-asserts read pressure.
                if was_active && self.config.auto_read() {
                    self.pipeline.read_requested();
                }
                promise.complete(());
            }
            Err(err) => {
                promise.fail(err);
            }
        }
    }

    // ---- public API: every operation below is fed through the pipeline's
    // outbound traversal so installed handlers see it before the transport
    // does ----

    pub fn bind(self: &Arc<Self>, local: Address, promise: Promise<()>) {
        self.pipeline.bind(local, promise);
    }

    pub fn connect(self: &Arc<Self>, remote: Address, local: Option<Address>, promise: Promise<()>) {
        self.pipeline.connect(remote, local, promise);
    }

    pub fn disconnect(self: &Arc<Self>, promise: Promise<()>) {
        self.pipeline.disconnect(promise);
    }

    pub fn close(self: &Arc<Self>, promise: Promise<()>) {
        self.pipeline.close(promise);
    }

    pub fn deregister(self: &Arc<Self>, promise: Promise<()>) {
        self.pipeline.deregister(promise);
    }

    pub fn write(self: &Arc<Self>, msg: Message, promise: Promise<()>) {
        self.pipeline.write(msg, promise);
    }

    pub fn flush(self: &Arc<Self>) {
        self.pipeline.flush();
    }

    pub fn write_and_flush(self: &Arc<Self>, msg: Message, promise: Promise<()>) {
        self.pipeline.write(msg, promise);
        self.pipeline.flush();
    }

    // ---- the actual sink operations, invoked once a traversal reaches the
    // pipeline's head ----

    fn do_sink_bind(self: &Arc<Self>, local: Address, promise: Promise<()>) {
        if matches!(*self.state.lock(), ChannelState::Open) {
            promise.fail(CoreError::new(
                codes::NOT_YET_CONNECTED,
                "channel must be registered before it can bind",
            ));
            return;
        }
        match self.transport.lock().do_bind(&local) {
            Ok(()) => {
                *self.local_address.lock() = Some(local);
                promise.complete(());
                self.activate();
            }
            Err(err) => promise.fail(err),
        }
    }

    fn do_sink_connect(self: &Arc<Self>, remote: Address, local: Option<Address>, promise: Promise<()>) {
        if matches!(*self.state.lock(), ChannelState::Open) {
            promise.fail(CoreError::new(
                codes::NOT_YET_CONNECTED,
                "channel must be registered before it can connect",
            ));
            return;
        }
        if self.remote_address.lock().is_some() {
            promise.fail(CoreError::new(codes::ALREADY_CONNECTED, "channel is already connected"));
            return;
        }
        match self.transport.lock().do_connect(&remote, local.as_ref()) {
            Ok(()) => {
                *self.remote_address.lock() = Some(remote);
                if let Some(local) = local {
                    *self.local_address.lock() = Some(local);
                }
                promise.complete(());
                self.activate();
            }
            Err(err) => promise.fail(err),
        }
    }

    fn do_sink_disconnect(self: &Arc<Self>, promise: Promise<()>) {
        if !self.transport.lock().metadata().has_disconnect {
            self.do_sink_close(promise);
            return;
        }
        match self.transport.lock().do_disconnect() {
            Ok(()) => {
                *self.remote_address.lock() = None;
                promise.complete(());
                self.deactivate();
            }
            Err(err) => promise.fail(err),
        }
    }

    fn do_sink_close(self: &Arc<Self>, promise: Promise<()>) {
        if self.close_started.swap(true, Ordering::AcqRel) {
            let completion = self.close_completion.clone();
            completion.on_complete(move |outcome| forward(promise, outcome));
            return;
        }

        let cause = CoreError::new(codes::CLOSED_CHANNEL, "channel closed");
        if let Some(mut outbound) = self.outbound.lock().take() {
            outbound.fail_flushed(cause.clone(), true);
            match outbound.close(cause.clone(), true) {
                Ok(CloseOutcome::Closed) => {}
                Ok(CloseOutcome::Deferred) => {
                    // A reentrant fail_flushed is in progress on this same
                    // thread (we are single-threaded per channel); put the
                    // buffer back so flush0's own unwind finishes closing it.
                    *self.outbound.lock() = Some(outbound);
                }
                Err(_) => {}
            }
        }

        let transport_result = self.transport.lock().do_close();
        let was_active = matches!(*self.state.lock(), ChannelState::Active);
        *self.state.lock() = ChannelState::Closed;
        if was_active {
            // Deferred rather than fired inline: a close triggered mid-flush
            // is still unwinding the outbound call stack that got us here,
            // and `channel_inactive` must not be observed nested under it.
            let channel = self.clone();
            self.invoke_later(move || channel.pipeline.fire_channel_inactive());
        }

        match transport_result {
            Ok(()) => {
                self.close_completion.complete(());
            }
            Err(err) => {
                self.close_completion.fail(err);
            }
        }
        let completion = self.close_completion.clone();
        completion.on_complete(move |outcome| forward(promise, outcome));
    }

    fn do_sink_deregister(self: &Arc<Self>, promise: Promise<()>) {
        match self.transport.lock().do_deregister() {
            Ok(()) => {
                *self.executor.lock() = None;
                self.pipeline.fire_channel_unregistered();
                // Destruction only runs for a channel that is never coming
                // back: a closed channel's pipeline is torn down here; a
                // merely-deregistered-for-reregistration channel keeps its
                // contexts intact (see `pinned_executor`/re-registration).
                if self.state() == ChannelState::Closed {
                    self.pipeline.destroy();
                }
                promise.complete(());
            }
            Err(err) => promise.fail(err),
        }
    }

    fn do_sink_read_requested(self: &Arc<Self>) {
        if let Err(err) = self.transport.lock().do_begin_read() {
            self.pipeline.fire_exception_caught(err);
        }
    }

    fn do_sink_write(self: &Arc<Self>, msg: Message, promise: Promise<()>) {
        let filtered = match self.transport.lock().filter_outbound_message(msg) {
            Ok(msg) => msg,
            Err(err) => {
                promise.fail(err);
                return;
            }
        };
        match self.outbound.lock().as_mut() {
            Some(buffer) => buffer.add_message(filtered, promise),
            None => {
                promise.fail(CoreError::new(codes::CLOSED_CHANNEL, "channel is closed"));
            }
        }
    }

    fn do_sink_flush(self: &Arc<Self>) {
        {
            match self.outbound.lock().as_mut() {
                Some(buffer) => buffer.add_flush(),
                None => return,
            }
        }
        self.flush0();
    }

    fn do_close_forcibly(self: &Arc<Self>) {
        if self.close_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let cause = CoreError::new(codes::CLOSED_CHANNEL, "channel force-closed");
        if let Some(mut outbound) = self.outbound.lock().take() {
            outbound.fail_flushed(cause.clone(), true);
            let _ = outbound.close(cause, true);
        }
        let _ = self.transport.lock().do_close();
        let was_active = matches!(*self.state.lock(), ChannelState::Active);
        *self.state.lock() = ChannelState::Closed;
        if was_active {
            self.pipeline.fire_channel_inactive();
        }
        self.close_completion.complete(());
    }

    fn activate(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Active {
                return;
            }
            *state = ChannelState::Active;
        }
        let channel = self.clone();
        self.invoke_later(move || {
            channel.pipeline.fire_channel_active();
            if channel.config.auto_read() {
                channel.pipeline.read_requested();
            }
        });
    }

    fn deactivate(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if *state != ChannelState::Active {
            return;
        }
        *state = ChannelState::Registered;
        drop(state);
        let channel = self.clone();
        self.invoke_later(move || channel.pipeline.fire_channel_inactive());
    }

    /// Runs `task` through the channel's bound executor instead of inline, so
    /// an inbound side effect a pipeline sink operation triggers (e.g.
    /// `channel_active` firing because `bind` just succeeded) is observed
    /// only after the triggering call's own stack has unwound, not nested
    /// underneath it. If the executor rejects the task there is no safe way
    /// to retry the deferred work, so the channel force-closes instead.
    fn invoke_later<F>(self: &Arc<Self>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.executor.lock().clone() {
            Some(executor) => {
                if let Err(err) = executor.execute(alloc::boxed::Box::new(task)) {
                    self.logger.log(
                        Severity::Error,
                        "executor rejected a deferred pipeline task; force-closing",
                        Some(&err),
                        None,
                    );
                    self.do_close_forcibly();
                }
            }
            None => task(),
        }
    }

    /// The flush engine: hands the flushed segment to the transport, and on
    /// failure fails every flushed entry with the transport's error.
    /// Reentrance-guarded — a flush triggered while one is already unwinding
    /// on this same call stack (e.g. a handler's `on_flush` calling
    /// `ctx.flush()` again) is a silent no-op rather than a double write.
    fn flush0(self: &Arc<Self>) {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return;
        }

        let result = {
            let mut guard = self.outbound.lock();
            match guard.as_mut() {
                None => Err(CoreError::new(codes::CLOSED_CHANNEL, "channel is closed")),
                Some(buffer) => {
                    if !self.is_active() {
                        Err(CoreError::new(
                            codes::NOT_YET_CONNECTED,
                            "flush requested before the channel became active",
                        ))
                    } else {
                        self.transport.lock().do_write(buffer)
                    }
                }
            }
        };

        self.flushing.store(false, Ordering::Release);

        if let Err(err) = result {
            if let Some(buffer) = self.outbound.lock().as_mut() {
                buffer.fail_flushed(err, true);
            }
        }
    }
}
