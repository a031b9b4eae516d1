//! Provides `PriorityMap`, a fixed-width bit set supporting a
//! constant-time highest-set-bit scan.
use core::fmt;

use super::{clz::highest_set_bit, Init};

/// One bit per priority level. Bit `i` is set exactly when the ready list
/// at priority `i` is nonempty.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PriorityMap {
    bits: u16,
}

impl Init for PriorityMap {
    const INIT: Self = Self { bits: 0 };
}

impl PriorityMap {
    /// Get the bit at the specified position.
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < u16::BITS as usize);
        (self.bits >> i) & 1 != 0
    }

    /// Set the bit at the specified position.
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < u16::BITS as usize);
        self.bits |= 1 << i;
    }

    /// Clear the bit at the specified position.
    pub fn clear(&mut self, i: usize) {
        debug_assert!(i < u16::BITS as usize);
        self.bits &= !(1 << i);
    }

    /// Get the position of the highest set bit, i.e. the highest priority
    /// with a ready thread. Constant-time.
    pub fn highest(&self) -> Option<usize> {
        highest_set_bit(self.bits).map(|i| i as usize)
    }

    /// `true` if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

impl fmt::Debug for PriorityMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..u16::BITS as usize).filter(|&i| self.get(i)))
            .finish()
    }
}
