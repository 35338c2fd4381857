//! Fault injection for the partitioned hops, used to drive the acknowledgement and replay path.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// What happens to a delivery that draws an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// The record still reaches the downstream instance but the delivery is reported failed.
    Fail,
    /// The record never reaches the downstream instance and nobody is told. A tracked delivery
    /// is only noticed once its tree times out.
    Drop,
}

/// Controller for injecting faults into a hop. Shared between every writer of the hop.
#[derive(Debug, Default)]
pub struct ErrorInjector {
    /// Fail the next N deliveries.
    fail_next_deliveries: AtomicUsize,
    /// Skip the first N deliveries before starting to fail.
    skip_deliveries_before_fail: AtomicUsize,
    /// Drop the next N deliveries.
    drop_next_deliveries: AtomicUsize,
    /// Artificial delivery latency in milliseconds.
    delivery_latency_ms: AtomicU64,
}

impl ErrorInjector {
    /// Create a new error injector with all faults disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the next N deliveries as failed.
    pub fn fail_deliveries(&self, count: usize) {
        self.fail_next_deliveries.store(count, Ordering::Relaxed);
    }

    /// Let the first `skip` deliveries through, then report the next `fail` as failed.
    pub fn skip_deliveries_then_fail(&self, skip: usize, fail: usize) {
        self.skip_deliveries_before_fail
            .store(skip, Ordering::Relaxed);
        self.fail_next_deliveries.store(fail, Ordering::Relaxed);
    }

    /// Silently lose the next N deliveries.
    pub fn drop_deliveries(&self, count: usize) {
        self.drop_next_deliveries.store(count, Ordering::Relaxed);
    }

    pub fn set_delivery_latency(&self, ms: u64) {
        self.delivery_latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Draws the fault for the next delivery, if any. Skipped deliveries only count toward the
    /// failure countdown.
    pub(crate) fn next_fault(&self) -> Option<Fault> {
        if Self::decrement_counter(&self.drop_next_deliveries) {
            return Some(Fault::Drop);
        }

        let skip = self
            .skip_deliveries_before_fail
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok();
        if skip {
            return None;
        }

        Self::decrement_counter(&self.fail_next_deliveries).then_some(Fault::Fail)
    }

    /// Decrements the counter and returns true if it was > 0.
    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }

    pub(crate) async fn apply_delivery_latency(&self) {
        let ms = self.delivery_latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}
