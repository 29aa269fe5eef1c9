//! Randomized decisions used for sampling and trace back-off.

use rand::Rng;

/// Largest exponent accepted by [`back_off`]; `1 << 30` still fits in a `u32`.
pub const MAX_BACK_OFF: u32 = 30;

/// Returns `true` with probability `1 / interval`.
///
/// An interval of 0 or 1 always samples, without touching the thread rng.
#[inline]
pub fn sample(interval: u32) -> bool {
    interval <= 1 || rand::thread_rng().gen_range(0..interval) == 0
}

/// Returns `true` with probability `1 / 2^min(exponent, MAX_BACK_OFF)`.
#[inline]
pub fn back_off(exponent: u32) -> bool {
    let exponent = exponent.min(MAX_BACK_OFF);
    exponent == 0 || rand::thread_rng().gen_range(0..1u32 << exponent) == 0
}
