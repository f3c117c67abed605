//! Trace and span identifiers.
//!
//! Trace ids are 128-bit and span ids 64-bit, rendered as lowercase hex
//! (32 and 16 characters respectively). Generation draws from a per-thread
//! cryptographically secure RNG seeded from the OS.

use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::StdRng> = RefCell::new(rngs::StdRng::from_entropy());
}

/// Uniform draw in `[0, 1)` from the thread-local generator.
pub(crate) fn random_unit() -> f64 {
    CURRENT_RNG.with(|rng| rng.borrow_mut().gen::<f64>())
}

/// A 128-bit trace identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// The invalid (all-zero) trace id.
    pub const INVALID: TraceId = TraceId(0);

    /// Generate a new random trace id.
    pub fn random() -> Self {
        CURRENT_RNG.with(|rng| TraceId(rng.borrow_mut().gen::<u128>()))
    }

    /// Parse a 32-character lowercase hex string.
    ///
    /// Anything else, including uppercase hex or the all-zero id, is
    /// rejected.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 32 || !is_lower_hex(hex) {
            return None;
        }
        match u128::from_str_radix(hex, 16) {
            Ok(0) | Err(_) => None,
            Ok(value) => Some(TraceId(value)),
        }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({:032x})", self.0)
    }
}

/// A 64-bit span identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// The invalid (all-zero) span id.
    pub const INVALID: SpanId = SpanId(0);

    /// Generate a new random span id.
    pub fn random() -> Self {
        CURRENT_RNG.with(|rng| SpanId(rng.borrow_mut().gen::<u64>()))
    }

    /// Parse a 16-character lowercase hex string.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 16 || !is_lower_hex(hex) {
            return None;
        }
        match u64::from_str_radix(hex, 16) {
            Ok(0) | Err(_) => None,
            Ok(value) => Some(SpanId(value)),
        }
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({:016x})", self.0)
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
