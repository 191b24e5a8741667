use std::time::Duration;

/// Wall-clock progress guess for workers that stay silent.
///
/// Kicks in only after `grace` has elapsed without a real progress line, grows
/// linearly towards `expected`, and never exceeds `cap` (always below 100).
#[derive(Debug, Clone)]
pub(crate) struct ProgressEstimator {
    grace: Duration,
    expected: Duration,
    cap: f64,
    saw_real_progress: bool,
}

impl ProgressEstimator {
    pub fn new(grace: Duration, expected: Duration, cap: f64) -> Self {
        Self {
            grace,
            expected: expected.max(Duration::from_millis(1)),
            cap: cap.clamp(0.0, 99.0),
            saw_real_progress: false,
        }
    }

    /// Called whenever the worker reports progress itself.
    pub fn mark_real_progress(&mut self) {
        self.saw_real_progress = true;
    }

    /// `(percent, eta_seconds)` for the given elapsed time, or `None` while the
    /// worker is still inside its grace period or has reported on its own.
    pub fn estimate(&self, elapsed: Duration) -> Option<(f64, f64)> {
        if self.saw_real_progress || elapsed < self.grace {
            return None;
        }
        let ratio = elapsed.as_secs_f64() / self.expected.as_secs_f64();
        let percent = (ratio * 100.0).min(self.cap);
        let eta = self.expected.saturating_sub(elapsed).as_secs_f64();
        Some((percent, eta))
    }
}
