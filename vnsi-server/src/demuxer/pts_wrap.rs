//! Presentation timestamp unwrapping across 33-bit rollovers.
//!
//! The expected timestamp is extrapolated linearly from a reference pair
//! `(wall-clock ms, raw pts)`. A raw value far below the expectation is a
//! rollover: the wrap offset grows by one period, the reference moves to the
//! wrapped value and further wraps are suppressed until the guard window ends.

/// Size of the PTS space (2^33 ticks of 90 kHz).
pub const PTS_PERIOD: u64 = 1 << 33;

const HALF_PERIOD: u64 = PTS_PERIOD / 2;

/// Ticks of the 90 kHz clock per millisecond.
const TICKS_PER_MS: i64 = 90;

/// Wall-clock time after a wrap during which no second wrap is accepted.
const WRAP_GUARD_MS: i64 = 60 * 60 * 1000;

/// Tracker state for one live stream.
#[derive(Debug, Default, Clone)]
pub struct PtsWrapState {
    /// Wall-clock ms of the reference sample.
    reference_time: Option<i64>,
    /// Unwrapped pts of the reference sample.
    reference_pts: u64,
    /// Wall-clock ms of the last declared wrap; opens the guard window.
    wrap_time: Option<i64>,
    /// Number of periods added to raw values.
    wraps: u64,
}

impl PtsWrapState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything; the next sample becomes the reference.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn offset(&self) -> u64 {
        self.wraps * PTS_PERIOD
    }

    /// Observe a raw 33-bit pts received at `now_ms` and return it unwrapped.
    pub fn observe(&mut self, raw: u64, now_ms: i64) -> u64 {
        let raw = raw & (PTS_PERIOD - 1);

        let Some(reference_time) = self.reference_time else {
            self.reference_time = Some(now_ms);
            self.reference_pts = raw;
            return raw;
        };

        let elapsed = (now_ms - reference_time).max(0);
        let expected = self.reference_pts + (elapsed * TICKS_PER_MS) as u64;
        let mut corrected = self.unwrap_near(raw, expected);

        if corrected + HALF_PERIOD < expected
            && expected - corrected < PTS_PERIOD + HALF_PERIOD
            && self.wrap_time.map_or(true, |t| now_ms >= t + WRAP_GUARD_MS)
        {
            self.wraps += 1;
            corrected += PTS_PERIOD;
            self.wrap_time = Some(now_ms);
            self.reference_time = Some(now_ms);
            self.reference_pts = corrected;
        }

        corrected
    }

    /// Apply the current offset without detecting wraps, e.g. for DTS values.
    pub fn correct(&self, raw: u64) -> u64 {
        let raw = raw & (PTS_PERIOD - 1);
        let anchor = self.reference_pts;
        self.unwrap_near(raw, anchor)
    }

    /// `raw` plus the current offset, pulled back one period if that lands
    /// more than half a period past `expected` (a late pre-wrap sample).
    fn unwrap_near(&self, raw: u64, expected: u64) -> u64 {
        let candidate = raw + self.offset();
        if self.wraps > 0 && candidate > expected + HALF_PERIOD {
            candidate - PTS_PERIOD
        } else {
            candidate
        }
    }
}

/// Convert 90 kHz ticks to microseconds.
pub fn ticks_to_micros(ticks: u64) -> i64 {
    (ticks as i128 * 100 / 9) as i64
}
