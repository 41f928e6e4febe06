//! Channel identity: a 28-byte opaque id with stable short/long text
//! projections and a total order.
//!
//! Layout (big-endian, see the external-interfaces section this crate's
//! design notes derive from):
//!
//! ```text
//! offset size field
//!   0     8   machine_id
//!   8     4   process_id
//!  12     4   sequence    (process-wide monotonic counter)
//!  16     8   timestamp   (nanos, from a monotonic clock, xored with millis)
//!  24     4   random
//! ```

use alloc::format;
use alloc::string::String;
use core::cmp::Ordering;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use crate::time::{DefaultMonotonicClock, MonotonicClock};

const ID_LEN: usize = 28;

/// Opaque, totally-ordered channel identifier. Two ids are equal iff their
/// 28-byte buffers are equal; hashing is the 4-byte random field only (the
/// other fields are highly structured and would otherwise skew hash
/// distribution under bulk channel creation).
#[derive(Clone, Copy, Eq)]
pub struct ChannelId {
    bytes: [u8; ID_LEN],
}

impl ChannelId {
    /// Builds an id from already-assembled field values. Exposed so a host
    /// providing its own [`IdentitySource`] never needs to hand-encode the
    /// byte layout itself.
    pub fn from_fields(
        machine_id: u64,
        process_id: u32,
        sequence: u32,
        timestamp_nanos: u64,
        random: u32,
    ) -> Self {
        let mut bytes = [0u8; ID_LEN];
        bytes[0..8].copy_from_slice(&machine_id.to_be_bytes());
        bytes[8..12].copy_from_slice(&process_id.to_be_bytes());
        bytes[12..16].copy_from_slice(&sequence.to_be_bytes());
        bytes[16..24].copy_from_slice(&timestamp_nanos.to_be_bytes());
        bytes[24..28].copy_from_slice(&random.to_be_bytes());
        Self { bytes }
    }

    /// Generates a fresh id using the given [`IdentitySource`] and the
    /// process-wide monotonic sequence counter. Safe to call concurrently:
    /// the sequence field is drawn from an atomic fetch-add.
    pub fn new(source: &dyn IdentitySource) -> Self {
        let sequence = next_sequence();
        let millis = source.clock().now().as_nanos() / 1_000_000;
        let nanos = source.clock().now().as_nanos();
        let timestamp = nanos ^ millis;
        Self::from_fields(
            source.machine_id(),
            source.process_id(),
            sequence,
            timestamp,
            source.random(),
        )
    }

    /// Raw 28-byte big-endian representation.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.bytes
    }

    /// Lowercase hex of the trailing 4 random bytes; stable and short enough
    /// for log lines.
    pub fn short_text(&self) -> String {
        hex_lower(&self.bytes[24..28])
    }

    /// Hex of each field joined by `-`, without a trailing separator.
    pub fn long_text(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            hex_lower(&self.bytes[0..8]),
            hex_lower(&self.bytes[8..12]),
            hex_lower(&self.bytes[12..16]),
            hex_lower(&self.bytes[16..24]),
            hex_lower(&self.bytes[24..28]),
        )
    }

    /// Total order over the binary value; no two distinct ids generated by
    /// [`ChannelId::new`] are expected to tie, but ties (e.g. hand-built ids
    /// in tests) break lexicographically over the byte buffer, which is what
    /// the derived `Ord` below already does.
    pub fn compare_to(&self, other: &ChannelId) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl PartialEq for ChannelId {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl PartialOrd for ChannelId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare_to(other))
    }
}

impl Ord for ChannelId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_to(other)
    }
}

impl core::hash::Hash for ChannelId {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.bytes[24..28].hash(state);
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelId").field(&self.short_text()).finish()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_text())
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn next_sequence() -> u32 {
    static SEQUENCE: AtomicU32 = AtomicU32::new(0);
    SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Supplies the host-specific entropy a [`ChannelId`] is derived from:
/// a stable machine id, the current process id, a random field, and the
/// monotonic clock to timestamp against. The core ships [`DefaultIdentitySource`]
/// as a default good enough for single-process tests and non-adversarial
/// deployments; a distributed deployment should inject a source seeded from
/// real hardware entropy instead.
pub trait IdentitySource: Send + Sync {
    /// A value stable for the lifetime of the host process (and, ideally,
    /// unique across the fleet this process runs in).
    fn machine_id(&self) -> u64;

    /// The OS process id, or any other value that disambiguates processes
    /// sharing a `machine_id`.
    fn process_id(&self) -> u32;

    /// A fresh random value for each call; does not need to be
    /// cryptographically secure, only uniform enough to avoid collisions
    /// within the same nanosecond/sequence pair.
    fn random(&self) -> u32;

    /// The monotonic clock new ids are timestamped against.
    fn clock(&self) -> &dyn MonotonicClock;
}

/// Default [`IdentitySource`]: machine id derived from a fixed seed mixed
/// with the process start time, process id from a monotonic counter (since
/// `no_std` has no portable `getpid`), and a simple xorshift PRNG for the
/// random field.
pub struct DefaultIdentitySource {
    machine_id: u64,
    process_id: u32,
    rng: spin::Mutex<XorShiftRng>,
    clock: DefaultMonotonicClock,
}

impl DefaultIdentitySource {
    /// Builds a source seeded from the given machine id and process id. Hosts
    /// that can read real identifiers (e.g. a MAC address hash, the OS pid)
    /// should prefer this constructor over relying on process-local defaults.
    pub fn new(machine_id: u64, process_id: u32) -> Self {
        Self {
            machine_id,
            process_id,
            rng: spin::Mutex::new(XorShiftRng::seeded(machine_id ^ (process_id as u64))),
            clock: DefaultMonotonicClock,
        }
    }
}

impl Default for DefaultIdentitySource {
    fn default() -> Self {
        static NEXT_PROCESS_LOCAL_ID: AtomicU32 = AtomicU32::new(1);
        let process_id = NEXT_PROCESS_LOCAL_ID.fetch_add(1, AtomicOrdering::Relaxed);
        Self::new(0xC0FF_EE00_D00D_0000, process_id)
    }
}

impl IdentitySource for DefaultIdentitySource {
    fn machine_id(&self) -> u64 {
        self.machine_id
    }

    fn process_id(&self) -> u32 {
        self.process_id
    }

    fn random(&self) -> u32 {
        self.rng.lock().next_u32()
    }

    fn clock(&self) -> &dyn MonotonicClock {
        &self.clock
    }
}

/// Minimal xorshift PRNG. Not cryptographically secure; adequate for
/// disambiguating ids within the same nanosecond/sequence pair, which is all
/// this field is used for.
struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    fn seeded(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_last_four_bytes_hex() {
        let id = ChannelId::from_fields(1, 2, 3, 4, 0xDEAD_BEEF);
        assert_eq!(id.short_text(), "deadbeef");
    }

    #[test]
    fn long_text_joins_fields_without_trailing_dash() {
        let id = ChannelId::from_fields(1, 2, 3, 4, 5);
        let text = id.long_text();
        assert_eq!(text.matches('-').count(), 4);
        assert!(!text.ends_with('-'));
    }

    #[test]
    fn equality_and_order_are_over_the_byte_buffer() {
        let a = ChannelId::from_fields(1, 0, 0, 0, 0);
        let b = ChannelId::from_fields(1, 0, 0, 0, 0);
        let c = ChannelId::from_fields(2, 0, 0, 0, 0);
        assert_eq!(a, b);
        assert_eq!(a.compare_to(&c), Ordering::Less);
    }

    #[test]
    fn concurrent_new_id_never_repeats_sequence() {
        let source = DefaultIdentitySource::default();
        let first = ChannelId::new(&source);
        let second = ChannelId::new(&source);
        assert_ne!(first, second);
    }
}
