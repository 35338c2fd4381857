use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::Result;
use crate::error::Error;
use crate::isb::error_injector::{ErrorInjector, Fault};
use crate::message::Delivery;
use crate::tracker::TrackerHandle;

/// Writes deliveries of one hop to the instances of the downstream stage. Every delivery goes to
/// instance `id mod n`, so a given id always lands on the same instance. Writing waits while the
/// channel of that instance is full.
#[derive(Clone)]
pub struct Writer {
    partitions: Vec<mpsc::Sender<Delivery>>,
    tracker: Option<TrackerHandle>,
    error_injector: Arc<ErrorInjector>,
}

impl Writer {
    pub fn new(
        partitions: Vec<mpsc::Sender<Delivery>>,
        tracker: Option<TrackerHandle>,
        error_injector: Arc<ErrorInjector>,
    ) -> Self {
        Self {
            partitions,
            tracker,
            error_injector,
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    pub async fn write(&self, delivery: Delivery) -> Result<()> {
        self.error_injector.apply_delivery_latency().await;

        match self.error_injector.next_fault() {
            Some(Fault::Drop) => {
                debug!(record = %delivery.record, "Injected fault, dropping delivery");
                return Ok(());
            }
            Some(Fault::Fail) => {
                debug!(record = %delivery.record, "Injected fault, reporting delivery as failed");
                if let (Some(tracker), Some(handle)) = (&self.tracker, &delivery.handle) {
                    tracker.fail(handle).await?;
                }
            }
            None => {}
        }

        let partition = delivery.record.partition(self.partitions.len());
        let Some(sender) = self.partitions.get(partition) else {
            return Err(Error::Delivery("no downstream partitions".to_string()));
        };

        trace!(record = %delivery.record, partition, "Writing delivery");
        sender
            .send(delivery)
            .await
            .map_err(|_| Error::Delivery(format!("partition {partition} is closed")))
    }
}
