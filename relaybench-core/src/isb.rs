//! In-process inter-stage buffers. Every hop of the pipeline is a set of bounded channels, one
//! per downstream instance, written through a partitioning [writer::Writer].

/// Partitioned writer of a hop.
pub mod writer;

/// Fault injection for a hop.
pub mod error_injector;

pub use error_injector::ErrorInjector;
pub use writer::Writer;
