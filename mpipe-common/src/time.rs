//! Timestamp utilities
//!
//! Media time is carried as [`Mtime`]: signed microseconds on the stream's
//! own time base.

/// Media time in microseconds
pub type Mtime = i64;

/// Media clock frequency (ticks per second of [`Mtime`])
pub const CLOCK_FREQ: i64 = 1_000_000;

/// Duration of `samples` sample frames at `rate` Hz, truncated to whole microseconds.
///
/// Returns 0 for a zero rate rather than dividing by zero.
pub fn samples_to_mtime(samples: u64, rate: u32) -> Mtime {
    if rate == 0 {
        return 0;
    }
    ((samples as i128 * CLOCK_FREQ as i128) / rate as i128) as Mtime
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_to_mtime_exact_rates() {
        assert_eq!(samples_to_mtime(44_100, 44_100), 1_000_000);
        assert_eq!(samples_to_mtime(480, 48_000), 10_000);
        assert_eq!(samples_to_mtime(0, 48_000), 0);
    }

    #[test]
    fn test_samples_to_mtime_truncates() {
        // 1 sample at 44.1kHz = 22.675...us
        assert_eq!(samples_to_mtime(1, 44_100), 22);
    }

    #[test]
    fn test_samples_to_mtime_zero_rate() {
        assert_eq!(samples_to_mtime(1024, 0), 0);
    }
}
