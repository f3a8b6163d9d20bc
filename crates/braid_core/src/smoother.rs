//! Exponentially smoothed totals and rates.

/// Tracks an instantaneous total and exposes an exponentially smoothed view
/// of it, decaying toward the true total with time constant `folding_time`
/// (seconds). Time is passed in explicitly so callers and tests share one
/// clock.
#[derive(Clone, Debug)]
pub struct Smoother {
    folding_time: f64,
    total: f64,
    time: f64,
    estimate: f64,
}

impl Smoother {
    pub fn new(folding_time: f64) -> Self {
        assert!(folding_time > 0.0);
        Self {
            folding_time,
            total: 0.0,
            time: 0.0,
            estimate: 0.0,
        }
    }

    /// Forget all history and restart from `value`.
    pub fn reset(&mut self, value: f64) {
        self.total = value;
        self.estimate = value;
        self.time = 0.0;
    }

    pub fn set_total(&mut self, value: f64, now: f64) {
        self.advance(now);
        self.total = value;
    }

    pub fn add_delta(&mut self, delta: f64, now: f64) {
        self.advance(now);
        self.total += delta;
    }

    /// The smoothed total.
    pub fn smooth_total(&mut self, now: f64) -> f64 {
        self.advance(now);
        self.estimate
    }

    /// The rate at which the smoothed total is currently approaching the
    /// true total.
    pub fn smooth_rate(&mut self, now: f64) -> f64 {
        self.advance(now);
        (self.total - self.estimate) / self.folding_time
    }

    fn advance(&mut self, now: f64) {
        let elapsed = now - self.time;
        if elapsed > 0.0 {
            self.estimate +=
                (self.total - self.estimate) * (1.0 - (-elapsed / self.folding_time).exp());
            self.time = now;
        }
    }
}
