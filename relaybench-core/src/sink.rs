//! Sink is the terminal stage. It counts what it receives, reports the rolling throughput every
//! `logFreq` records and reports the latency of sampled records, then acks the delivery.
//!
//! Latency is only computed when the record was stamped on this very host. Capture and
//! observation on different machines would subtract readings of two unsynchronized clocks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Result;
use crate::config::components::SinkConfig;
use crate::delivery::DeliveryMode;
use crate::message::{CaptureTime, Delivery};
use crate::metrics::{bench_metrics, stage_metric_labels};
use crate::shared::clock::SharedClock;

/// Rolling throughput window of the Sink.
pub mod window;

use window::{ThroughputWindow, WindowReport};

const STAGE: &str = "sink";

/// What a single processed delivery produced.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SinkReport {
    pub throughput: Option<WindowReport>,
    pub latency_ms: Option<i64>,
}

/// Counts of a Sink instance at the time it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SinkSummary {
    pub received: u64,
    /// throughput windows reported, the baseline window excluded.
    pub reports: u64,
    pub latency_samples: u64,
    pub elapsed_ms: i64,
}

pub struct Sink<M> {
    mode: M,
    clock: SharedClock,
    host: Arc<str>,
    window: ThroughputWindow,
    start: Option<DateTime<Utc>>,
    received: u64,
    reports: u64,
    latency_samples: u64,
    replica: usize,
    metric_labels: Vec<(String, String)>,
}

impl<M: DeliveryMode> Sink<M> {
    pub fn new(config: SinkConfig, mode: M, host: Arc<str>, clock: SharedClock) -> Self {
        Self {
            mode,
            clock,
            host,
            window: ThroughputWindow::new(config.log_freq),
            start: None,
            received: 0,
            reports: 0,
            latency_samples: 0,
            replica: 0,
            metric_labels: stage_metric_labels("", STAGE, 0),
        }
    }

    /// Names the instance in logs and metrics.
    pub fn with_replica(mut self, name: &str, replica: usize) -> Self {
        self.replica = replica;
        self.metric_labels = stage_metric_labels(name, STAGE, replica);
        self
    }

    /// Processes one delivery and acks it.
    pub async fn process(&mut self, delivery: Delivery) -> Result<SinkReport> {
        let now = self.clock.now();
        if self.start.is_none() {
            self.start = Some(now);
        }
        self.received += 1;
        bench_metrics()
            .received
            .get_or_create(&self.metric_labels)
            .inc();

        let throughput = self.window.observe(self.received, now);
        if let Some(report) = throughput {
            self.reports += 1;
            info!(
                replica = self.replica,
                "During the last {} ms, we received {} elements. That's {} elements/second/core",
                report.elapsed_ms,
                report.element_diff,
                report.rate
            );
            if report.rate.is_finite() {
                bench_metrics()
                    .throughput
                    .get_or_create(&self.metric_labels)
                    .set(report.rate);
            }
        }

        let latency_ms = match delivery.record.capture_time {
            CaptureTime::Sampled(captured) if *delivery.record.origin_host == *self.host => {
                Some((now - captured).num_milliseconds())
            }
            _ => None,
        };
        if let Some(latency_ms) = latency_ms {
            self.latency_samples += 1;
            info!(
                replica = self.replica,
                "Latency {} ms from machine {}", latency_ms, delivery.record.origin_host
            );
            bench_metrics()
                .latency
                .get_or_create(&self.metric_labels)
                .observe(latency_ms as f64);
        }

        self.mode.ack(delivery.handle.as_ref()).await?;

        Ok(SinkReport {
            throughput,
            latency_ms,
        })
    }

    pub fn summary(&self) -> SinkSummary {
        SinkSummary {
            received: self.received,
            reports: self.reports,
            latency_samples: self.latency_samples,
            elapsed_ms: self
                .start
                .map(|start| (self.clock.now() - start).num_milliseconds())
                .unwrap_or_default(),
        }
    }

    /// Processes deliveries until the channel closes or the pipeline is cancelled.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Delivery>,
        cln_token: CancellationToken,
    ) -> Result<SinkSummary> {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cln_token.cancelled() => break,
                delivery = input.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            if let Err(e) = self.process(delivery).await {
                if cln_token.is_cancelled() {
                    debug!(?e, replica = self.replica, "Sink stopped during shutdown");
                    break;
                }
                return Err(e);
            }
        }

        let summary = self.summary();
        let average = if summary.elapsed_ms > 0 {
            summary.received as f64 * 1000.0 / summary.elapsed_ms as f64
        } else {
            0.0
        };
        info!(
            replica = self.replica,
            received = summary.received,
            elapsed_ms = summary.elapsed_ms,
            "Sink stopped, {} elements/second on average",
            average
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::delivery::{FaultTolerant, Unanchored};
    use crate::message::{Record, RecordId};
    use crate::shared::clock::ManualClock;
    use crate::tracker::{Outcome, TrackerHandle};

    use super::*;

    const HOST: &str = "sink-host";

    fn record(id: RecordId, host: &str, capture_time: CaptureTime) -> Record {
        Record {
            id,
            origin_host: Arc::from(host),
            capture_time,
            payload: Bytes::from_static(&[0u8; 10]),
        }
    }

    fn sink<M: DeliveryMode>(log_freq: u64, mode: M, clock: &ManualClock) -> Sink<M> {
        Sink::new(
            SinkConfig {
                log_freq: NonZeroU64::new(log_freq),
            },
            mode,
            Arc::from(HOST),
            SharedClock::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_three_windows_yield_two_reports() {
        let clock = ManualClock::starting_at(1_000_000);
        let log_freq = 100;
        let mut sink = sink(log_freq, Unanchored, &clock);

        let mut reports = vec![];
        for id in 0..3 * log_freq {
            clock.advance(2);
            let report = sink
                .process(Delivery::new(record(id, HOST, CaptureTime::NotSampled), None))
                .await
                .unwrap();
            reports.extend(report.throughput);
        }

        assert_eq!(reports.len(), 2);
        for report in reports {
            assert_eq!(report.element_diff, log_freq);
            assert_eq!(report.elapsed_ms, 200);
            assert!((report.rate - 500.0).abs() < 1e-9);
        }
        let summary = sink.summary();
        assert_eq!(summary.received, 300);
        assert_eq!(summary.reports, 2);
        // start is the first record
        assert_eq!(summary.elapsed_ms, 598);
    }

    #[tokio::test]
    async fn test_latency_only_for_local_origin() {
        let clock = ManualClock::starting_at(5_000);
        let mut sink = sink(0, Unanchored, &clock);
        let captured = DateTime::from_timestamp_millis(4_750).unwrap();

        let report = sink
            .process(Delivery::new(
                record(1, HOST, CaptureTime::Sampled(captured)),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(report.latency_ms, Some(250));

        let report = sink
            .process(Delivery::new(
                record(2, "other-host", CaptureTime::Sampled(captured)),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(report.latency_ms, None);

        let report = sink
            .process(Delivery::new(record(3, HOST, CaptureTime::NotSampled), None))
            .await
            .unwrap();
        assert_eq!(report, SinkReport::default());
        assert_eq!(sink.summary().latency_samples, 1);
    }

    #[tokio::test]
    async fn test_latency_is_non_negative_and_tracks_now() {
        let clock = ManualClock::starting_at(10_000);
        let mut sink = sink(0, Unanchored, &clock);
        let captured = DateTime::from_timestamp_millis(10_000).unwrap();

        let report = sink
            .process(Delivery::new(
                record(1, HOST, CaptureTime::Sampled(captured)),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(report.latency_ms, Some(0));

        clock.advance(37);
        let report = sink
            .process(Delivery::new(
                record(2, HOST, CaptureTime::Sampled(captured)),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(report.latency_ms, Some(37));
    }

    #[tokio::test]
    async fn test_fault_tolerant_sink_acks() {
        let clock = ManualClock::starting_at(0);
        let (tracker, mut outcomes) = TrackerHandle::new(Duration::from_secs(30), 1);
        let mut sink = sink(10, FaultTolerant::new(tracker.clone()), &clock);

        let handle = tracker.register(4).await.unwrap();
        sink.process(Delivery::new(
            record(4, HOST, CaptureTime::NotSampled),
            Some(handle),
        ))
        .await
        .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), outcomes[0].recv())
            .await
            .unwrap();
        assert_eq!(outcome, Some(Outcome::Acked(4)));
    }

    #[tokio::test]
    async fn test_run_until_input_closes() {
        let clock = ManualClock::starting_at(0);
        let sink = sink(2, Unanchored, &clock);
        let (tx, rx) = mpsc::channel(10);
        let handle = tokio::spawn(sink.run(rx, CancellationToken::new()));

        for id in 0..6 {
            tx.send(Delivery::new(record(id, HOST, CaptureTime::NotSampled), None))
                .await
                .unwrap();
        }
        drop(tx);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.received, 6);
        assert_eq!(summary.reports, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let clock = ManualClock::starting_at(0);
        let sink = sink(2, Unanchored, &clock);
        let (_tx, rx) = mpsc::channel(10);
        let cln_token = CancellationToken::new();
        let handle = tokio::spawn(sink.run(rx, cln_token.clone()));

        cln_token.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary, SinkSummary::default());
    }
}
