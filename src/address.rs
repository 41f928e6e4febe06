//! Opaque transport endpoint addresses.
//!
//! Concrete socket transports are out of scope for this crate (§1); the
//! core only ever stores and compares addresses, never interprets their
//! shape. [`Address`] is therefore the same kind of type-erased wrapper as
//! [`crate::buffer::Message::Opaque`] — a transport downcasts it back to its
//! own concrete address type (e.g. a `SocketAddr`), the core never does.

use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

/// A reference-counted, type-erased endpoint address.
#[derive(Clone)]
pub struct Address(Arc<dyn Any + Send + Sync>);

impl Address {
    /// Wraps a concrete address value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Attempts to view the address as a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Address(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_downcast() {
        let addr = Address::new(alloc::string::String::from("127.0.0.1:9000"));
        assert_eq!(
            addr.downcast_ref::<alloc::string::String>().map(String::as_str),
            Some("127.0.0.1:9000")
        );
        assert_eq!(addr.downcast_ref::<u32>(), None);
    }
}
