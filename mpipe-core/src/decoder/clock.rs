use crate::error::{Error, Result};
use mpipe_common::time::CLOCK_FREQ;
use mpipe_common::Mtime;

/// Running presentation timestamp for decoded output
///
/// Advancing by `n` samples adds `n / rate` seconds using integer arithmetic.
/// The sub-microsecond remainder is carried into the next increment instead
/// of being dropped, so the clock never accumulates rounding error: advancing
/// by `a` then `b` samples lands on exactly the same date as advancing by `a + b`.
#[derive(Debug, Clone)]
pub struct PresentationClock {
    rate: u32,
    date: Mtime,
    /// Carried numerator (`< rate`), in units of samples * CLOCK_FREQ
    remainder: u64,
    started: bool,
}

impl PresentationClock {
    /// Create a clock for `rate` Hz output, not yet seeded with a date
    ///
    /// A zero rate is clamped to 1 Hz so increments never divide by zero.
    pub fn new(rate: u32) -> Self {
        Self {
            rate: rate.max(1),
            date: 0,
            remainder: 0,
            started: false,
        }
    }

    /// Seed (or re-seed) the clock, dropping any carried remainder
    pub fn set(&mut self, date: Mtime) {
        self.date = date;
        self.remainder = 0;
        self.started = true;
    }

    /// Current date, or `None` before the first [`set`](Self::set)
    pub fn get(&self) -> Option<Mtime> {
        self.started.then_some(self.date)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Advance by `samples` sample frames and return the new date
    ///
    /// Fails without moving the clock if the date would overflow [`Mtime`].
    pub fn increment(&mut self, samples: u32) -> Result<Mtime> {
        let rate = self.rate as u64;
        let total = samples as u64 * CLOCK_FREQ as u64 + self.remainder;
        self.date = self
            .date
            .checked_add((total / rate) as Mtime)
            .ok_or(Error::ClockOverflow(self.date))?;
        self.remainder = total % rate;
        Ok(self.date)
    }
}
