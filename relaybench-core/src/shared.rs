/// Wall-clock access for the stages.
pub mod clock;

/// Process identity helpers.
pub(crate) mod utils;
