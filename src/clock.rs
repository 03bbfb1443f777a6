//! Clock synchronization and truncated-counter reconstruction.
//!
//! Controller units report time as raw hardware ticks, and several wire
//! fields carry only the low bits of a wider counter. This module holds the
//! linear tick-to-time model and the half-modulus extension used to recover
//! full-width values from their truncated forms.

/// Extend a truncated counter against a known-approximate reference.
///
/// `value` carries only the bits covered by `mask`. The result is the full
/// counter closest to `reference` whose low bits equal `value`, which makes
/// the reconstruction exact as long as the reference is within half the
/// modulus of the true value. Used with mask `0xf` for short sequence
/// numbers and `0xffffffff` for 32-bit tick counters.
pub fn add_high_bits(value: i64, reference: i64, mask: i64) -> i64 {
    let half = (mask + 1) / 2;
    let mut diff = value - (reference & mask);
    if diff < -half {
        diff += mask + 1;
    } else if diff > half {
        diff -= mask + 1;
    }
    reference + diff
}

/// Linear model mapping a unit's hardware tick count to log time.
///
/// Captured wholesale from `clocksync state:` lines; a newer estimate
/// replaces the previous one outright, with no blending.
#[derive(Clone, Copy, Debug)]
pub struct ClockEstimate {
    pub sample_time: f64,
    pub sample_clock: i64,
    pub freq: f64,
}

impl Default for ClockEstimate {
    /// Identity clock, used when the owning unit is unknown.
    fn default() -> Self {
        Self {
            sample_time: 0.0,
            sample_clock: 0,
            freq: 1.0,
        }
    }
}

impl ClockEstimate {
    /// Convert a (full-width) tick count to a timestamp.
    pub fn clock_to_time(&self, clock: f64) -> f64 {
        self.sample_time + (clock - self.sample_clock as f64) / self.freq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_high_bits_round_trip() {
        // Truncating an arbitrary value and reconstructing against any
        // reference within half the modulus must return the exact value.
        for mask in [0xf_i64, 0xffff_ffff] {
            let value = 0x123_4567_89ab_i64;
            let half = (mask + 1) / 2;
            for offset in [-half + 1, -3, 0, 3, half - 1] {
                let reference = value + offset;
                assert_eq!(
                    add_high_bits(value & mask, reference, mask),
                    value,
                    "mask {:#x} offset {}",
                    mask,
                    offset
                );
            }
        }
    }

    #[test]
    fn test_add_high_bits_wraparound() {
        // Low bits wrapped past zero while the reference lags behind.
        assert_eq!(add_high_bits(0x1, 0xff, 0xf), 0x101);
        // Reference ran ahead of a value that has not wrapped yet.
        assert_eq!(add_high_bits(0xf, 0x101, 0xf), 0xff);
        // In range, no adjustment.
        assert_eq!(add_high_bits(0x5, 0x104, 0xf), 0x105);
    }

    #[test]
    fn test_clock_to_time() {
        let identity = ClockEstimate::default();
        assert_eq!(identity.clock_to_time(123.0), 123.0);

        let est = ClockEstimate {
            sample_time: 100.0,
            sample_clock: 16_000_000,
            freq: 16_000_000.0,
        };
        // One full second of ticks past the sample point.
        assert!((est.clock_to_time(32_000_000.0) - 101.0).abs() < 1e-9);
        // Ticks before the sample point map to earlier times.
        assert!((est.clock_to_time(0.0) - 99.0).abs() < 1e-9);
    }
}
