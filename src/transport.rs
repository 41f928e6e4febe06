//! The transport plug: the interface concrete socket transports (TCP, UDP,
//! local/in-process) implement and the channel's unsafe surface consumes.
//! Concrete transports themselves are out of scope for this crate (§1) —
//! only this contract, and the [`crate::channel::Channel`] logic that drives
//! it, live here.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::address::Address;
use crate::buffer::OutboundBuffer;
use crate::buffer::message::Message;
use crate::executor::Executor;

/// Static facts about a transport that the channel's state machine consults
/// without calling into the transport itself — e.g. whether `disconnect` is
/// meaningful for this transport at all (UDP has no notion of it) and how
/// many messages a single `begin_read` burst should deliver by default
/// before yielding back to the executor.
#[derive(Clone, Copy, Debug)]
pub struct TransportMetadata {
    /// Whether this transport distinguishes `disconnect` from `close`. A
    /// connectionless transport (UDP, in-process datagram) typically answers
    /// `false`, collapsing disconnect into close.
    pub has_disconnect: bool,
    /// The default cap on messages delivered per `channel_read` burst before
    /// the transport stops to let the executor service other channels.
    pub default_max_messages_per_read: usize,
}

/// The transport-facing operation set a concrete socket transport
/// implements and [`crate::channel::Channel`]'s unsafe surface calls into.
/// Every method here executes on the channel's pinned executor — the
/// channel guarantees this, a transport implementation need not re-check it.
pub trait TransportPlug: Send + Sync + 'static {
    /// Whether this transport can be driven by `executor`. Each transport
    /// declares its own compatible executor family (e.g. an epoll-backed
    /// transport rejecting a pure in-process test executor that never polls
    /// file descriptors).
    fn is_compatible(&self, executor: &Arc<dyn Executor>) -> bool;

    /// Performs whatever OS-level registration the transport needs (e.g.
    /// adding a file descriptor to the executor's readiness poller).
    fn do_register(&self) -> crate::Result<()>;

    /// Binds the local endpoint.
    fn do_bind(&self, local: &Address) -> crate::Result<()>;

    /// Initiates a connection to `remote`, optionally from `local`.
    fn do_connect(&self, remote: &Address, local: Option<&Address>) -> crate::Result<()>;

    /// Half-closes the write side, or the full connection for a transport
    /// whose [`TransportMetadata::has_disconnect`] is `false`.
    fn do_disconnect(&self) -> crate::Result<()>;

    /// Tears down the transport resource. Called exactly once per channel,
    /// from [`crate::channel::Channel::close`].
    fn do_close(&self) -> crate::Result<()>;

    /// Undoes `do_register`. Called during destruction, after `do_close`.
    fn do_deregister(&self) -> crate::Result<()>;

    /// Arms (or re-arms) read-readiness interest for this transport.
    fn do_begin_read(&self) -> crate::Result<()>;

    /// Writes as much of `buffer`'s flushed segment as the transport can
    /// accept right now, calling [`OutboundBuffer::remove`] /
    /// [`OutboundBuffer::remove_bytes`] for whatever was actually
    /// transmitted. A transport that cannot write everything in one call is
    /// expected to re-arm write-readiness and retry later rather than block.
    fn do_write(&self, buffer: &mut OutboundBuffer) -> crate::Result<()>;

    /// Gives the transport a chance to transform an outbound message before
    /// it is queued (e.g. wrapping bytes in a UDP datagram envelope). The
    /// default passes the message through unchanged.
    fn filter_outbound_message(&self, msg: Message) -> crate::Result<Message> {
        Ok(msg)
    }

    /// The bound local address, if known. Cache invalidation on close/error
    /// is the transport's responsibility per §3.
    fn local_address(&self) -> Option<Address>;

    /// The connected peer address, if known.
    fn remote_address(&self) -> Option<Address>;

    /// Static metadata about this transport, consulted by the channel's
    /// state machine.
    fn metadata(&self) -> TransportMetadata;
}

/// A boxed handle to a [`TransportPlug`] implementation, the shape
/// [`crate::channel::Channel`] is built with.
pub type BoxedTransport = Box<dyn TransportPlug>;

#[cfg(any(test, feature = "test-support"))]
pub mod testing {
    //! Minimal in-process transport used by this crate's own unit and
    //! scenario tests — not a real socket, just enough bookkeeping to drive
    //! the channel state machine and outbound buffer through their paces.
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex;

    #[derive(Default)]
    pub struct RecordingTransport {
        pub registered: Mutex<bool>,
        pub bound: Mutex<Option<Address>>,
        pub connected: Mutex<Option<Address>>,
        pub closed: Mutex<bool>,
        pub begin_read_count: Mutex<usize>,
        pub writes: Mutex<Vec<usize>>,
        pub fail_after_n_writes: Mutex<Option<usize>>,
    }

    impl TransportPlug for RecordingTransport {
        fn is_compatible(&self, _executor: &Arc<dyn Executor>) -> bool {
            true
        }

        fn do_register(&self) -> crate::Result<()> {
            *self.registered.lock() = true;
            Ok(())
        }

        fn do_bind(&self, local: &Address) -> crate::Result<()> {
            *self.bound.lock() = Some(local.clone());
            Ok(())
        }

        fn do_connect(&self, remote: &Address, _local: Option<&Address>) -> crate::Result<()> {
            *self.connected.lock() = Some(remote.clone());
            Ok(())
        }

        fn do_disconnect(&self) -> crate::Result<()> {
            *self.connected.lock() = None;
            Ok(())
        }

        fn do_close(&self) -> crate::Result<()> {
            *self.closed.lock() = true;
            Ok(())
        }

        fn do_deregister(&self) -> crate::Result<()> {
            *self.registered.lock() = false;
            Ok(())
        }

        fn do_begin_read(&self) -> crate::Result<()> {
            *self.begin_read_count.lock() += 1;
            Ok(())
        }

        fn do_write(&self, buffer: &mut OutboundBuffer) -> crate::Result<()> {
            let mut writes = self.writes.lock();
            let limit = *self.fail_after_n_writes.lock();
            loop {
                if buffer.current().is_none() {
                    return Ok(());
                }
                if let Some(limit) = limit {
                    if writes.len() >= limit {
                        return Err(crate::CoreError::new(
                            crate::error::codes::CONNECT_EXCEPTION,
                            "simulated transport write failure",
                        ));
                    }
                }
                writes.push(writes.len());
                buffer.remove();
            }
        }

        fn local_address(&self) -> Option<Address> {
            self.bound.lock().clone()
        }

        fn remote_address(&self) -> Option<Address> {
            self.connected.lock().clone()
        }

        fn metadata(&self) -> TransportMetadata {
            TransportMetadata {
                has_disconnect: true,
                default_max_messages_per_read: 16,
            }
        }
    }
}
