//! Generator produces the benchmark load. Every emission goes through the rate controller first,
//! then the latency sampler decides whether the record is stamped with the emission time. Ids
//! start at 0 and grow by one per fresh record.
//!
//! In fault-tolerant mode every emitted id is tracked and its outcome comes back from the
//! [Tracker](crate::tracker). A failed id is replayed right away with the same id and without a
//! capture time, as often as it takes. There is no retry limit and no backoff.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::Result;
use crate::config::components::GeneratorConfig;
use crate::delivery::DeliveryMode;
use crate::error::Error;
use crate::isb::Writer;
use crate::message::{CaptureTime, Delivery, Record, RecordId};
use crate::metrics::{bench_metrics, stage_metric_labels};
use crate::ratelimit::RateController;
use crate::sampler::{LatencySampler, SamplerState};
use crate::shared::clock::SharedClock;
use crate::tracker::Outcome;

const STAGE: &str = "generator";

/// Counts of a Generator instance at the time it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorSummary {
    /// fresh records, replays excluded.
    pub generated: u64,
    pub replayed: u64,
    pub acked: u64,
    pub failed: u64,
}

/// Why the emission loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// bounded run done and every tracked id settled.
    Finished,
    Cancelled,
    /// shutdown woke the rate controller up, fatal to the instance.
    Interrupted,
}

pub struct Generator<M> {
    rate: RateController,
    sampler: LatencySampler,
    sampler_state: SamplerState,
    mode: M,
    writer: Writer,
    host: Arc<str>,
    clock: SharedClock,
    payload: Bytes,
    max_records: Option<u64>,
    next_id: RecordId,
    /// tracked ids without an outcome yet.
    pending: u64,
    summary: GeneratorSummary,
    replica: usize,
    metric_labels: Vec<(String, String)>,
}

impl<M: DeliveryMode> Generator<M> {
    pub fn new(
        config: GeneratorConfig,
        mode: M,
        writer: Writer,
        host: Arc<str>,
        clock: SharedClock,
    ) -> Self {
        Self {
            rate: RateController::new(config.rate),
            sampler: LatencySampler::new(config.sampler),
            sampler_state: SamplerState::default(),
            mode,
            writer,
            host,
            clock,
            payload: Bytes::from(vec![0u8; config.payload_size]),
            max_records: config.max_records,
            next_id: 0,
            pending: 0,
            summary: GeneratorSummary::default(),
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

    fn record(&self, id: RecordId, capture_time: CaptureTime) -> Record {
        Record {
            id,
            origin_host: Arc::clone(&self.host),
            capture_time,
            payload: self.payload.clone(),
        }
    }

    /// Tracks and writes a record, returns whether it is tracked.
    async fn send(&self, record: Record) -> Result<bool> {
        let handle = self.mode.track(record.id).await?;
        let tracked = handle.is_some();
        self.writer.write(Delivery::new(record, handle)).await?;
        Ok(tracked)
    }

    /// Emits the record for the current id and moves on to the next id. Returns
    /// [Error::Interrupted] without emitting anything if shutdown interrupts the rate controller.
    pub async fn emit_next(&mut self, cln_token: &CancellationToken) -> Result<Record> {
        let id = self.next_id;
        self.rate.throttle(id, cln_token).await?;

        let (sampler_state, sampled) = self.sampler.advance(self.sampler_state, id);
        self.sampler_state = sampler_state;
        let capture_time = if sampled {
            CaptureTime::Sampled(self.clock.now())
        } else {
            CaptureTime::NotSampled
        };

        let record = self.record(id, capture_time);
        if self.send(record.clone()).await? {
            self.pending += 1;
        }
        self.next_id += 1;
        self.summary.generated += 1;
        bench_metrics()
            .generated
            .get_or_create(&self.metric_labels)
            .inc();
        Ok(record)
    }

    /// Replays `id` without a capture time. The id counter is not touched.
    pub async fn on_delivery_failed(&mut self, id: RecordId) -> Result<Record> {
        info!(replica = self.replica, "Failed message {}", id);
        self.summary.failed += 1;
        bench_metrics()
            .failed
            .get_or_create(&self.metric_labels)
            .inc();

        let record = self.record(id, CaptureTime::NotSampled);
        self.send(record.clone()).await?;
        self.summary.replayed += 1;
        bench_metrics()
            .replayed
            .get_or_create(&self.metric_labels)
            .inc();
        Ok(record)
    }

    pub fn on_delivery_succeeded(&mut self, id: RecordId) {
        trace!(replica = self.replica, id, "Delivery acked");
        self.pending = self.pending.saturating_sub(1);
        self.summary.acked += 1;
        bench_metrics()
            .acked
            .get_or_create(&self.metric_labels)
            .inc();
    }

    async fn handle_outcome(&mut self, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Acked(id) => self.on_delivery_succeeded(id),
            Outcome::Failed(id) => {
                self.on_delivery_failed(id).await?;
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> GeneratorSummary {
        self.summary
    }

    fn exhausted(&self) -> bool {
        self.max_records
            .is_some_and(|max| self.summary.generated >= max)
    }

    /// Emits records until cancelled. A bounded run stops emitting after `max_records` fresh
    /// records and keeps replaying failed ids until every tracked id is acked.
    pub async fn run(
        mut self,
        mut outcomes: Option<mpsc::UnboundedReceiver<Outcome>>,
        cln_token: CancellationToken,
    ) -> Result<GeneratorSummary> {
        let reason = match self.run_loop(&mut outcomes, &cln_token).await {
            Ok(reason) => reason,
            Err(e) if cln_token.is_cancelled() => {
                debug!(?e, replica = self.replica, "Generator stopped during shutdown");
                StopReason::Cancelled
            }
            Err(e) => return Err(e),
        };
        if reason == StopReason::Interrupted {
            info!(
                replica = self.replica,
                "Generator terminated, rate limiting was interrupted by shutdown"
            );
        }

        info!(
            replica = self.replica,
            ?reason,
            generated = self.summary.generated,
            replayed = self.summary.replayed,
            acked = self.summary.acked,
            pending = self.pending,
            "Generator stopped"
        );
        Ok(self.summary)
    }

    async fn run_loop(
        &mut self,
        outcomes: &mut Option<mpsc::UnboundedReceiver<Outcome>>,
        cln_token: &CancellationToken,
    ) -> Result<StopReason> {
        loop {
            // settle whatever already came back before emitting more
            while let Some(outcome) = outcomes.as_mut().and_then(|rx| rx.try_recv().ok()) {
                self.handle_outcome(outcome).await?;
            }

            if self.exhausted() {
                if self.pending == 0 {
                    return Ok(StopReason::Finished);
                }
                let outcome = tokio::select! {
                    biased;
                    _ = cln_token.cancelled() => return Ok(StopReason::Cancelled),
                    outcome = recv_outcome(outcomes) => outcome,
                };
                match outcome {
                    Some(outcome) => self.handle_outcome(outcome).await?,
                    None => return Ok(StopReason::Finished),
                }
                continue;
            }

            if cln_token.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            // the emission sees the shutdown first while it sleeps in the rate controller, the
            // cancellation arm only unblocks a write stuck on a full channel
            tokio::select! {
                biased;
                result = self.emit_next(cln_token) => match result {
                    Ok(_) => {}
                    Err(Error::Interrupted) => return Ok(StopReason::Interrupted),
                    Err(e) => return Err(e),
                },
                _ = cln_token.cancelled() => return Ok(StopReason::Cancelled),
            }
        }
    }
}

async fn recv_outcome(outcomes: &mut Option<mpsc::UnboundedReceiver<Outcome>>) -> Option<Outcome> {
    match outcomes.as_mut() {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
