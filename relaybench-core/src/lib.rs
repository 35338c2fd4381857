//! Synthetic benchmark pipeline measuring the end-to-end latency and the sustained throughput of
//! a partitioned, at-least-once delivery chain: Generator → Relay × k → Sink.

pub use self::error::{Error, Result};

mod error;

/// Settings of a benchmark run and the component configurations derived from them.
pub mod config;

/// Record, capture time and delivery handles.
pub mod message;

/// Emission cadence of the Generator.
pub mod ratelimit;

/// Which records carry a capture timestamp.
pub mod sampler;

/// Load producer and replay of failed deliveries.
pub mod generator;

/// Pass-through stage.
pub mod relay;

/// Terminal stage computing throughput and latency.
pub mod sink;

/// Fault-tolerant or unanchored delivery.
pub mod delivery;

/// Acknowledgement tracking of delivery trees.
pub mod tracker;

/// Partitioned hops between stages.
pub mod isb;

/// Local topology runner.
pub mod pipeline;

pub mod metrics;

pub mod shared;

pub use config::Settings;
pub use pipeline::{Pipeline, PipelineSummary};
