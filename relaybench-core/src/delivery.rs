//! Delivery mode of a pipeline, chosen once when the stages are built. In fault-tolerant mode
//! every emission is tracked: the Generator registers the record id, every Relay anchors its
//! emission on the inbound delivery and acks the inbound delivery, and the Sink acks. In
//! unanchored mode nothing is tracked and nothing is acked, which is how raw throughput is
//! measured without tracking overhead. Stages call the mode unconditionally.

use crate::Result;
use crate::message::{DeliveryHandle, RecordId};
use crate::tracker::TrackerHandle;

#[trait_variant::make(Send)]
pub trait DeliveryMode {
    /// Starts tracking a record emitted by a Generator instance, returns the handle of its first
    /// delivery when tracked.
    async fn track(&self, id: RecordId) -> Result<Option<DeliveryHandle>>;

    /// Returns the handle of a delivery causally linked to `inbound`.
    async fn anchor(&self, inbound: Option<&DeliveryHandle>) -> Result<Option<DeliveryHandle>>;

    /// Acknowledges the inbound delivery.
    async fn ack(&self, inbound: Option<&DeliveryHandle>) -> Result<()>;
}

/// Every delivery is tracked by the [Tracker](crate::tracker).
#[derive(Clone, Debug)]
pub struct FaultTolerant(TrackerHandle);

impl FaultTolerant {
    pub fn new(tracker: TrackerHandle) -> Self {
        Self(tracker)
    }
}

impl DeliveryMode for FaultTolerant {
    async fn track(&self, id: RecordId) -> Result<Option<DeliveryHandle>> {
        self.0.register(id).await.map(Some)
    }

    async fn anchor(&self, inbound: Option<&DeliveryHandle>) -> Result<Option<DeliveryHandle>> {
        match inbound {
            Some(inbound) => self.0.anchor(inbound).await.map(Some),
            None => Ok(None),
        }
    }

    async fn ack(&self, inbound: Option<&DeliveryHandle>) -> Result<()> {
        match inbound {
            Some(inbound) => self.0.ack(inbound).await,
            None => Ok(()),
        }
    }
}

/// Fire and forget, no handles and no acks.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unanchored;

impl DeliveryMode for Unanchored {
    async fn track(&self, _id: RecordId) -> Result<Option<DeliveryHandle>> {
        Ok(None)
    }

    async fn anchor(&self, _inbound: Option<&DeliveryHandle>) -> Result<Option<DeliveryHandle>> {
        Ok(None)
    }

    async fn ack(&self, _inbound: Option<&DeliveryHandle>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::tracker::Outcome;

    use super::*;

    #[tokio::test]
    async fn test_unanchored_mode() {
        let mode = Unanchored;
        assert_eq!(mode.track(1).await.unwrap(), None);
        let inbound = DeliveryHandle { tree: 0, edge: 0 };
        assert_eq!(mode.anchor(Some(&inbound)).await.unwrap(), None);
        assert!(mode.ack(Some(&inbound)).await.is_ok());
    }

    #[tokio::test]
    async fn test_fault_tolerant_mode_tracks_chain() {
        let (tracker, mut outcomes) = TrackerHandle::new(Duration::from_secs(30), 1);
        let mode = FaultTolerant::new(tracker.clone());

        let root = mode.track(9).await.unwrap().unwrap();
        let relayed = mode.anchor(Some(&root)).await.unwrap().unwrap();
        assert_eq!(relayed.tree, root.tree);

        // a delivery without a handle has nothing to anchor on or ack
        assert_eq!(mode.anchor(None).await.unwrap(), None);
        assert!(mode.ack(None).await.is_ok());

        mode.ack(Some(&root)).await.unwrap();
        mode.ack(Some(&relayed)).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), outcomes[0].recv())
            .await
            .unwrap();
        assert_eq!(outcome, Some(Outcome::Acked(9)));
        assert_eq!(tracker.outstanding().await.unwrap(), 0);
    }
}
