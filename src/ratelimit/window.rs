//! Fixed time windows used to bucket counters.

use std::time::Duration;

/// A fixed, epoch-aligned time window.
///
/// Counters are keyed by the index of the window they fall in, so every
/// worker that reads the same clock lands on the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    secs: u64,
}

impl TimeWindow {
    /// One-second windows
    pub const SECOND: TimeWindow = TimeWindow { secs: 1 };

    /// A window of the given length. Zero is treated as one second.
    pub fn of(length: Duration) -> Self {
        Self {
            secs: length.as_secs().max(1),
        }
    }

    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.secs)
    }

    /// Index of the window containing `now` (an epoch offset), e.g. the
    /// epoch second for [`TimeWindow::SECOND`].
    pub fn index(&self, now: Duration) -> u64 {
        now.as_secs() / self.secs
    }

    /// Time remaining until the window containing `now` closes.
    pub fn until_reset(&self, now: Duration) -> Duration {
        let start = Duration::from_secs(self.index(now) * self.secs);
        self.duration() - (now - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minute() -> TimeWindow {
        TimeWindow::of(Duration::from_secs(60))
    }

    #[test]
    fn test_time_window_duration() {
        assert_eq!(TimeWindow::SECOND.duration(), Duration::from_secs(1));
        assert_eq!(minute().duration(), Duration::from_secs(60));
        assert_eq!(TimeWindow::of(Duration::from_secs(90)).duration(), Duration::from_secs(90));
        assert_eq!(TimeWindow::of(Duration::ZERO), TimeWindow::SECOND);
    }

    #[test]
    fn test_window_index() {
        let now = Duration::from_millis(1_700_000_123_456);
        assert_eq!(TimeWindow::SECOND.index(now), 1_700_000_123);
        assert_eq!(minute().index(now), 1_700_000_123 / 60);
    }

    #[test]
    fn test_until_reset() {
        let now = Duration::from_millis(120_250);
        assert_eq!(TimeWindow::SECOND.until_reset(now), Duration::from_millis(750));
        assert_eq!(minute().until_reset(now), Duration::from_millis(59_750));

        let on_boundary = Duration::from_secs(120);
        assert_eq!(TimeWindow::SECOND.until_reset(on_boundary), Duration::from_secs(1));
    }
}
