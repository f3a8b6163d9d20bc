//! Monotonic notified values.
//!
//! The pipeline's ordering points (`version`, `queue_committed_version`,
//! the per-proxy batch counters) are monotonically increasing values that
//! other tasks wait on. They are thin wrappers over `tokio::sync::watch`
//! so waiters suspend instead of polling.

use tokio::sync::watch;

/// A monotonically increasing `i64` that tasks can await crossing a
/// threshold.
#[derive(Debug)]
pub struct NotifiedVersion {
    tx: watch::Sender<i64>,
}

impl NotifiedVersion {
    pub fn new(initial: i64) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> i64 {
        *self.tx.borrow()
    }

    /// Advance to `value`. Regressions are a logic error.
    pub fn set(&self, value: i64) {
        self.tx.send_modify(|current| {
            assert!(
                value >= *current,
                "notified version regressed: {value} < {current}"
            );
            *current = value;
        });
    }

    /// Advance to `max(current, value)`.
    pub fn set_at_least(&self, value: i64) {
        self.tx.send_if_modified(|current| {
            if value > *current {
                *current = value;
                true
            } else {
                false
            }
        });
    }

    /// Resolve once the value is `>= target`. Returns the observed value.
    pub async fn when_at_least(&self, target: i64) -> i64 {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for cannot fail while we hold it.
        let value = rx
            .wait_for(|v| *v >= target)
            .await
            .expect("notified version sender dropped");
        *value
    }
}

/// A monotonically increasing `f64`, used for wall-clock watermarks such as
/// the last successful commit time.
#[derive(Debug)]
pub struct NotifiedTime {
    tx: watch::Sender<f64>,
}

impl NotifiedTime {
    pub fn new(initial: f64) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> f64 {
        *self.tx.borrow()
    }

    pub fn set_at_least(&self, value: f64) {
        self.tx.send_if_modified(|current| {
            if value > *current {
                *current = value;
                true
            } else {
                false
            }
        });
    }

    pub async fn when_at_least(&self, target: f64) -> f64 {
        let mut rx = self.tx.subscribe();
        let value = rx
            .wait_for(|v| *v >= target)
            .await
            .expect("notified time sender dropped");
        *value
    }
}
