//! Find the highest set bit in a priority word
#![allow(clippy::needless_bool)]

/// Indicates whether the target has a usable count-leading-zeros
/// instruction (or something the compiler lowers to one).
const HAS_CLZ: bool = if cfg!(target_arch = "msp430") {
    false
} else if cfg!(target_arch = "avr") {
    false
} else if cfg!(target_arch = "arm") {
    // Armv5 and later in Arm state, Thumb-2 otherwise
    cfg!(target_feature = "v5te") || cfg!(target_feature = "v6t2")
} else {
    // AArch64: all
    // x86: 80386 and later (BSR)
    // RISC-V: the fallback is cheap enough either way
    true
};

/// Bit position of the highest set bit in a 4-bit value, one-indexed.
/// Index 0 encodes "no bits set".
const NIBBLE_MSB: [u8; 16] = [0, 1, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4];

/// Return the position of the highest set bit in `x`, or `None` if `x`
/// is zero. Constant-time on every supported target: a hardware CLZ
/// where available, a two-nibble table lookup otherwise.
#[inline]
pub(crate) fn highest_set_bit(x: u16) -> Option<u32> {
    if x == 0 {
        return None;
    }

    if HAS_CLZ {
        Some(15 - x.leading_zeros())
    } else {
        // Combine look-ups of the four nibbles, high half first.
        let hi = (x >> 8) as usize;
        let lo = (x & 0xff) as usize;
        let bit = if hi != 0 {
            let n = if hi >= 0x10 {
                NIBBLE_MSB[hi >> 4] + 4
            } else {
                NIBBLE_MSB[hi]
            };
            n + 8
        } else if lo >= 0x10 {
            NIBBLE_MSB[lo >> 4] + 4
        } else {
            NIBBLE_MSB[lo]
        };
        Some(u32::from(bit) - 1)
    }
}
