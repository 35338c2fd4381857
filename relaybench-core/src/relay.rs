//! Relay forwards every record unchanged to the next stage, partitioned by id. In fault-tolerant
//! mode the outbound delivery is anchored on the inbound one and the inbound delivery is acked
//! right after the hand-off, so a failure further down the chain is still attributed to the
//! record the Generator registered.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Result;
use crate::delivery::DeliveryMode;
use crate::isb::Writer;
use crate::message::Delivery;
use crate::metrics::{bench_metrics, stage_metric_labels};

/// Counts of a Relay instance at the time it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub forwarded: u64,
    /// inbound deliveries acked, one per delivery handle.
    pub acked: u64,
}

pub struct Relay<M> {
    mode: M,
    writer: Writer,
    summary: RelaySummary,
    stage: usize,
    replica: usize,
    metric_labels: Vec<(String, String)>,
}

impl<M: DeliveryMode> Relay<M> {
    pub fn new(mode: M, writer: Writer) -> Self {
        Self {
            mode,
            writer,
            summary: RelaySummary::default(),
            stage: 0,
            replica: 0,
            metric_labels: stage_metric_labels("", "relay-0", 0),
        }
    }

    /// Names the instance in logs and metrics. `stage` is the position of the Relay stage in the
    /// chain.
    pub fn with_replica(mut self, name: &str, stage: usize, replica: usize) -> Self {
        self.stage = stage;
        self.replica = replica;
        self.metric_labels = stage_metric_labels(name, &format!("relay-{stage}"), replica);
        self
    }

    pub async fn forward(&mut self, delivery: Delivery) -> Result<()> {
        let inbound = delivery.handle;
        let outbound = self.mode.anchor(inbound.as_ref()).await?;
        self.writer
            .write(Delivery::new(delivery.record, outbound))
            .await?;
        self.summary.forwarded += 1;
        bench_metrics()
            .forwarded
            .get_or_create(&self.metric_labels)
            .inc();

        self.mode.ack(inbound.as_ref()).await?;
        if inbound.is_some() {
            self.summary.acked += 1;
        }
        Ok(())
    }

    pub fn summary(&self) -> RelaySummary {
        self.summary
    }

    /// Forwards deliveries until the channel closes or the pipeline is cancelled. The writer is
    /// dropped on return, which closes the channels of the next stage once every instance of this
    /// stage has stopped.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Delivery>,
        cln_token: CancellationToken,
    ) -> Result<RelaySummary> {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cln_token.cancelled() => break,
                delivery = input.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            if let Err(e) = self.forward(delivery).await {
                if cln_token.is_cancelled() {
                    debug!(
                        ?e,
                        stage = self.stage,
                        replica = self.replica,
                        "Relay stopped during shutdown"
                    );
                    break;
                }
                return Err(e);
            }
        }

        info!(
            stage = self.stage,
            replica = self.replica,
            forwarded = self.summary.forwarded,
            acked = self.summary.acked,
            "Relay stopped"
        );
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::delivery::{FaultTolerant, Unanchored};
    use crate::isb::ErrorInjector;
    use crate::message::{CaptureTime, Record, RecordId};
    use crate::tracker::{Outcome, TrackerHandle};

    use super::*;

    fn record(id: RecordId) -> Record {
        Record {
            id,
            origin_host: Arc::from("host-a"),
            capture_time: CaptureTime::NotSampled,
            payload: Bytes::from_static(b"relay"),
        }
    }

    #[tokio::test]
    async fn test_unanchored_forward() {
        let (tx, mut rx) = mpsc::channel(10);
        let writer = Writer::new(vec![tx], None, Arc::new(ErrorInjector::new()));
        let mut relay = Relay::new(Unanchored, writer);

        relay.forward(Delivery::new(record(3), None)).await.unwrap();
        let out = rx.recv().await.unwrap();
        assert_eq!(out.record, record(3));
        assert_eq!(out.handle, None);
        assert_eq!(
            relay.summary(),
            RelaySummary {
                forwarded: 1,
                acked: 0
            }
        );
    }

    #[tokio::test]
    async fn test_fault_tolerant_forward_anchors_then_acks() {
        let (tracker, mut outcomes) = TrackerHandle::new(Duration::from_secs(30), 1);
        let (tx, mut rx) = mpsc::channel(10);
        let writer = Writer::new(
            vec![tx],
            Some(tracker.clone()),
            Arc::new(ErrorInjector::new()),
        );
        let mut relay = Relay::new(FaultTolerant::new(tracker.clone()), writer);

        let inbound = tracker.register(8).await.unwrap();
        relay
            .forward(Delivery::new(record(8), Some(inbound)))
            .await
            .unwrap();

        let out = rx.recv().await.unwrap();
        let outbound = out.handle.unwrap();
        assert_eq!(outbound.tree, inbound.tree);
        assert_ne!(outbound.edge, inbound.edge);

        // the inbound edge is acked, the anchored one keeps the tree open
        assert_eq!(tracker.outstanding().await.unwrap(), 1);
        assert!(outcomes[0].try_recv().is_err());

        tracker.ack(&outbound).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(1), outcomes[0].recv())
            .await
            .unwrap();
        assert_eq!(outcome, Some(Outcome::Acked(8)));
        assert_eq!(relay.summary().acked, 1);
    }

    #[tokio::test]
    async fn test_run_preserves_partitioning() {
        let (tx0, mut rx0) = mpsc::channel(10);
        let (tx1, mut rx1) = mpsc::channel(10);
        let writer = Writer::new(vec![tx0, tx1], None, Arc::new(ErrorInjector::new()));
        let relay = Relay::new(Unanchored, writer);

        let (input_tx, input_rx) = mpsc::channel(10);
        let handle = tokio::spawn(relay.run(input_rx, CancellationToken::new()));
        for id in [5, 2, 9, 4] {
            input_tx
                .send(Delivery::new(record(id), None))
                .await
                .unwrap();
        }
        drop(input_tx);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.forwarded, 4);

        let mut odd = vec![];
        while let Some(d) = rx1.recv().await {
            odd.push(d.record.id);
        }
        let mut even = vec![];
        while let Some(d) = rx0.recv().await {
            even.push(d.record.id);
        }
        assert_eq!(odd, vec![5, 9]);
        assert_eq!(even, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_closed_downstream_is_an_error() {
        let (tx, rx) = mpsc::channel(10);
        drop(rx);
        let writer = Writer::new(vec![tx], None, Arc::new(ErrorInjector::new()));
        let relay = Relay::new(Unanchored, writer);

        let (input_tx, input_rx) = mpsc::channel(10);
        input_tx
            .send(Delivery::new(record(1), None))
            .await
            .unwrap();
        let result = relay.run(input_rx, CancellationToken::new()).await;
        assert!(matches!(result, Err(crate::Error::Delivery(_))));
    }
}
