//! Error types reported through return values
//!
//! Recoverable outcomes (timeouts, full queues) are values, never panics;
//! fatal invariant violations go through [`crate::kernel::panic`] instead.
use core::fmt;

/// A timed blocking operation gave up before its condition was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    /// The calling thread's timeout fired first.
    Timeout,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
        }
    }
}
