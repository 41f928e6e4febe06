//! End-to-end scenario coverage driven entirely through the public
//! `Channel`/`Pipeline` surface, instead of any single module's internals —
//! the shape spec.md's own "Concrete scenarios" section describes. Unit
//! tests alongside each module already cover scenarios 1-3; this file covers
//! the scenarios that only make sense wired through a whole channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ember_core::buffer::OutboundBuffer;
use ember_core::channel::Channel;
use ember_core::config::StaticChannelConfiguration;
use ember_core::error::codes;
use ember_core::executor::testing::InlineExecutor;
use ember_core::ids::ChannelId;
use ember_core::observability::NoopObservability;
use ember_core::pipeline::{Context, Handler};
use ember_core::promise::Promise;
use ember_core::transport::testing::RecordingTransport;
use ember_core::transport::{BoxedTransport, TransportMetadata, TransportPlug};
use ember_core::{Address, ChannelConfiguration, ChannelState, CoreError, Executor, Message, Outcome, Task};

/// `RecordingTransport` is not `Clone`; every scenario below wants to both
/// hand the transport to the channel (which takes ownership via
/// `BoxedTransport`) and keep an `Arc` handle of its own to assert against,
/// so this shim just forwards every call through to a shared instance.
struct SharedTransport(Arc<RecordingTransport>);

impl TransportPlug for SharedTransport {
    fn is_compatible(&self, executor: &Arc<dyn Executor>) -> bool {
        self.0.is_compatible(executor)
    }
    fn do_register(&self) -> ember_core::Result<()> {
        self.0.do_register()
    }
    fn do_bind(&self, local: &Address) -> ember_core::Result<()> {
        self.0.do_bind(local)
    }
    fn do_connect(&self, remote: &Address, local: Option<&Address>) -> ember_core::Result<()> {
        self.0.do_connect(remote, local)
    }
    fn do_disconnect(&self) -> ember_core::Result<()> {
        self.0.do_disconnect()
    }
    fn do_close(&self) -> ember_core::Result<()> {
        self.0.do_close()
    }
    fn do_deregister(&self) -> ember_core::Result<()> {
        self.0.do_deregister()
    }
    fn do_begin_read(&self) -> ember_core::Result<()> {
        self.0.do_begin_read()
    }
    fn do_write(&self, buffer: &mut OutboundBuffer) -> ember_core::Result<()> {
        self.0.do_write(buffer)
    }
    fn local_address(&self) -> Option<Address> {
        self.0.local_address()
    }
    fn remote_address(&self) -> Option<Address> {
        self.0.remote_address()
    }
    fn metadata(&self) -> TransportMetadata {
        self.0.metadata()
    }
}

fn new_channel() -> (Arc<Channel>, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let boxed: BoxedTransport = Box::new(SharedTransport(transport.clone()));
    let config: Arc<dyn ChannelConfiguration> = Arc::new(StaticChannelConfiguration::default());
    let executor: Arc<dyn Executor> = Arc::new(InlineExecutor::new());
    let channel = Channel::new(
        ChannelId::from_fields(1, 2, 3, 4, 5),
        boxed,
        config,
        executor,
        Arc::new(NoopObservability),
        Arc::new(NoopObservability),
    );
    (channel, transport)
}

/// Records handler callback order across threads for assertions below.
#[derive(Default)]
struct Trace(Mutex<Vec<&'static str>>);

impl Trace {
    fn push(&self, tag: &'static str) {
        self.0.lock().unwrap().push(tag);
    }

    fn snapshot(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

/// Scenario 4 — pipeline replacement atomicity. From inside `h1`'s
/// `channel_read`, `h2` is replaced by a new handler on the first read only.
/// Propagation of that very read must still reach the replacement, and so
/// must every subsequent read — the old context never sees either.
#[test]
fn replacing_a_handler_mid_dispatch_redirects_the_current_and_future_reads() {
    let (channel, _transport) = new_channel();
    let trace = Arc::new(Trace::default());

    struct OldTail(Arc<Trace>);
    impl Handler for OldTail {
        fn on_channel_read(&self, ctx: &dyn Context, msg: Message) {
            self.0.push("h2_old");
            ctx.fire_channel_read(msg);
        }
    }

    struct NewTail(Arc<Trace>);
    impl Handler for NewTail {
        fn on_channel_read(&self, ctx: &dyn Context, msg: Message) {
            self.0.push("h2_new");
            ctx.fire_channel_read(msg);
        }
        fn handler_added(&self, _ctx: &dyn Context) -> ember_core::Result<()> {
            self.0.push("h2_new_added");
            Ok(())
        }
        fn handler_removed(&self, _ctx: &dyn Context) -> ember_core::Result<()> {
            self.0.push("h2_old_removed");
            Ok(())
        }
    }

    struct SwapOnFirstRead {
        trace: Arc<Trace>,
        channel: Arc<Channel>,
        new_handler: Arc<NewTail>,
        swapped: AtomicBool,
    }
    impl Handler for SwapOnFirstRead {
        fn on_channel_read(&self, ctx: &dyn Context, msg: Message) {
            self.trace.push("h1");
            if !self.swapped.swap(true, Ordering::AcqRel) {
                self.channel
                    .pipeline()
                    .replace("h2", "h2b", self.new_handler.clone())
                    .expect("h2 must still be linked when h1 dispatches its first read");
            }
            ctx.fire_channel_read(msg);
        }
    }

    let new_tail = Arc::new(NewTail(trace.clone()));
    let h1 = Arc::new(SwapOnFirstRead {
        trace: trace.clone(),
        channel: channel.clone(),
        new_handler: new_tail.clone(),
        swapped: AtomicBool::new(false),
    });
    channel.pipeline().add_last("h1", h1).unwrap();
    channel.pipeline().add_last("h2", Arc::new(OldTail(trace.clone()))).unwrap();

    let executor: Arc<dyn Executor> = Arc::new(InlineExecutor::new());
    channel.register(executor, Promise::new());
    channel.connect(Address::new(1u32), None, Promise::new());
    trace.0.lock().unwrap().clear();

    channel.pipeline().fire_channel_read(Message::opaque(1u32));
    channel.pipeline().fire_channel_read(Message::opaque(2u32));

    assert_eq!(
        trace.snapshot(),
        vec!["h1", "h2_new_added", "h2_old_removed", "h2_new", "h1", "h2_new"],
        "the first read must still reach the replacement handler, not the old one",
    );
}

/// Scenario 5 — close during in-flight flush. Three writes are queued and
/// flushed; the transport accepts the first, then fails. Entry 1 succeeds,
/// entries 2 and 3 fail with the transport's cause, and the channel stays
/// active — a flush failure alone never implies close.
#[test]
fn transport_failure_mid_flush_fails_only_the_unwritten_entries() {
    let (channel, transport) = new_channel();
    *transport.fail_after_n_writes.lock() = Some(1);

    let executor: Arc<dyn Executor> = Arc::new(InlineExecutor::new());
    channel.register(executor, Promise::new());
    channel.connect(Address::new(1u32), None, Promise::new());

    let p1 = Promise::new();
    let p2 = Promise::new();
    let p3 = Promise::new();
    channel.write(Message::opaque(1u32), p1.clone());
    channel.write(Message::opaque(2u32), p2.clone());
    channel.write(Message::opaque(3u32), p3.clone());
    channel.flush();

    assert!(p1.peek().expect("first write must resolve").is_success());
    assert!(matches!(p2.peek(), Some(Outcome::Failure(_))));
    assert!(matches!(p3.peek(), Some(Outcome::Failure(_))));
    assert_eq!(
        channel.state(),
        ChannelState::Active,
        "a flush failure alone must not close the channel",
    );
}

/// Scenario 6 — force-close on executor rejection. Registering against an
/// executor whose `execute` always rejects must force-close the channel,
/// fail the registration promise with the rejection cause, and never fire
/// `channel_registered`.
#[test]
fn registering_against_a_rejecting_executor_force_closes_the_channel() {
    struct RejectingExecutor;
    impl Executor for RejectingExecutor {
        fn execute(&self, _task: Task) -> ember_core::Result<()> {
            Err(CoreError::new(codes::REJECTED_EXECUTION, "always rejects"))
        }
        fn in_event_loop(&self) -> bool {
            false
        }
    }

    let (channel, _transport) = new_channel();

    struct RegisteredProbe(Arc<AtomicBool>);
    impl Handler for RegisteredProbe {
        fn on_channel_registered(&self, ctx: &dyn Context) {
            self.0.store(true, Ordering::Release);
            ctx.fire_channel_registered();
        }
    }
    let registered_fired = Arc::new(AtomicBool::new(false));
    channel
        .pipeline()
        .add_last("probe", Arc::new(RegisteredProbe(registered_fired.clone())))
        .unwrap();

    let executor: Arc<dyn Executor> = Arc::new(RejectingExecutor);
    let promise = Promise::new();
    channel.register(executor, promise.clone());

    match promise.peek() {
        Some(Outcome::Failure(err)) => assert_eq!(err.code(), codes::REJECTED_EXECUTION),
        other => panic!("expected registration to fail with the rejection cause, got {other:?}"),
    }
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(!registered_fired.load(Ordering::Acquire));
}
