//! Record is the unit of data generated by the [Generator](crate::generator), forwarded unchanged
//! by every [Relay](crate::relay) and consumed by the [Sink](crate::sink). A stage instance never
//! receives a bare record, it receives a [Delivery], which is the record together with the
//! [DeliveryHandle] used to acknowledge or fail it. Unanchored deliveries carry no handle.
//!
//! NOTE: Records are cheap to clone, the payload and the host name are reference counted.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Sequence number assigned by a Generator instance. It is also the partition key of every hop
/// and the replay identifier.
pub type RecordId = u64;

/// Whether the Generator stamped the record with its wall-clock time at emission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureTime {
    #[default]
    NotSampled,
    Sampled(DateTime<Utc>),
}

impl CaptureTime {
    pub fn is_sampled(&self) -> bool {
        matches!(self, CaptureTime::Sampled(_))
    }

    /// Milliseconds since epoch, `0` when the record was not sampled.
    pub fn timestamp_millis(&self) -> i64 {
        match self {
            CaptureTime::NotSampled => 0,
            CaptureTime::Sampled(ts) => ts.timestamp_millis(),
        }
    }
}

impl fmt::Display for CaptureTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureTime::NotSampled => write!(f, "NotSampled"),
            CaptureTime::Sampled(ts) => write!(f, "Sampled({})", ts.timestamp_millis()),
        }
    }
}

/// The record that flows from the Generator to the Sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// id of the record, strictly increasing per Generator instance and reused only on replay.
    pub id: RecordId,
    /// host of the Generator instance that created the record.
    pub origin_host: Arc<str>,
    /// set only at the Generator, read by the Sink.
    pub capture_time: CaptureTime,
    /// fixed size filler, never inspected downstream.
    pub payload: Bytes,
}

impl Record {
    /// Every hop partitions by id.
    pub fn partition_key(&self) -> RecordId {
        self.id
    }

    /// Index of the downstream instance this record is routed to when there are `partitions`
    /// instances.
    pub fn partition(&self, partitions: usize) -> usize {
        self.partition_key()
            .checked_rem(partitions as u64)
            .unwrap_or_default() as usize
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} capture={} payload={}B",
            self.id,
            self.origin_host,
            self.capture_time,
            self.payload.len()
        )
    }
}

/// Identifies a single tracked delivery. `tree` is the tracking tree opened when the Generator
/// registered the record and `edge` is unique for every delivery inside that tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryHandle {
    pub(crate) tree: u64,
    pub(crate) edge: u64,
}

impl fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.tree, self.edge)
    }
}

/// A record as handed to a stage instance.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub record: Record,
    pub handle: Option<DeliveryHandle>,
}

impl Delivery {
    pub fn new(record: Record, handle: Option<DeliveryHandle>) -> Self {
        Self { record, handle }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record(id: RecordId) -> Record {
        Record {
            id,
            origin_host: Arc::from("host-a"),
            capture_time: CaptureTime::NotSampled,
            payload: Bytes::from_static(&[0u8; 10]),
        }
    }

    #[test]
    fn test_partition_by_id() {
        assert_eq!(record(0).partition(4), 0);
        assert_eq!(record(7).partition(4), 3);
        assert_eq!(record(8).partition(1), 0);
        // no downstream instances, nothing to route to but it must not panic.
        assert_eq!(record(8).partition(0), 0);
        assert_eq!(record(42).partition_key(), 42);
    }

    #[test]
    fn test_capture_time() {
        let ts = Utc.timestamp_millis_opt(1_627_846_261_000).unwrap();
        let sampled = CaptureTime::Sampled(ts);
        assert!(sampled.is_sampled());
        assert_eq!(sampled.timestamp_millis(), 1_627_846_261_000);
        assert_eq!(format!("{}", sampled), "Sampled(1627846261000)");

        let not_sampled = CaptureTime::default();
        assert!(!not_sampled.is_sampled());
        assert_eq!(not_sampled.timestamp_millis(), 0);
        assert_eq!(format!("{}", not_sampled), "NotSampled");
    }

    #[test]
    fn test_record_equality_and_display() {
        let a = record(1);
        let mut b = record(1);
        assert_eq!(a, b);
        b.capture_time = CaptureTime::Sampled(Utc.timestamp_millis_opt(5).unwrap());
        assert_ne!(a, b);
        assert_eq!(format!("{}", a), "1@host-a capture=NotSampled payload=10B");
    }

    #[test]
    fn test_delivery_handle_display() {
        let handle = DeliveryHandle { tree: 3, edge: 9 };
        assert_eq!(format!("{}", handle), "3-9");
    }
}
