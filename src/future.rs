use alloc::boxed::Box;
use core::{future::Future, pin::Pin};

/// Object-safe future wrapper used wherever a trait method must return a future
/// without becoming generic over its concrete type (the `_async` operations on
/// the channel's unsafe surface, promise continuations, executor submissions).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Same as [`BoxFuture`] but without the `Send` bound, for single-threaded
/// executors (e.g. a `!Send` in-loop task wrapper) that never move work
/// across threads.
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;
