use std::num::NonZeroU64;

use chrono::{DateTime, Utc};

/// Throughput of one closed window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowReport {
    pub elapsed_ms: i64,
    pub element_diff: u64,
    /// elements per second, infinite when the window closed within the same millisecond.
    pub rate: f64,
}

/// Rolling throughput over windows of `log_freq` received records. The first boundary only
/// captures the baseline, so the first window is never reported.
#[derive(Debug, Clone)]
pub(crate) struct ThroughputWindow {
    log_freq: Option<NonZeroU64>,
    baseline: Option<(DateTime<Utc>, u64)>,
}

impl ThroughputWindow {
    pub(crate) fn new(log_freq: Option<NonZeroU64>) -> Self {
        Self {
            log_freq,
            baseline: None,
        }
    }

    /// Observes the running `received` count. Returns a report when `received` closes a window
    /// that has a baseline.
    pub(crate) fn observe(&mut self, received: u64, now: DateTime<Utc>) -> Option<WindowReport> {
        let log_freq = self.log_freq?;
        if received % log_freq.get() != 0 {
            return None;
        }

        let report = self.baseline.map(|(window_start, window_baseline)| {
            let elapsed_ms = (now - window_start).num_milliseconds();
            let element_diff = received - window_baseline;
            WindowReport {
                elapsed_ms,
                element_diff,
                rate: element_diff as f64 * (1000.0 / elapsed_ms as f64),
            }
        });
        self.baseline = Some((now, received));
        report
    }
}
