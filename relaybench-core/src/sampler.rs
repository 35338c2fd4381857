//! Latency sampling decides which generated records carry a capture timestamp. A countdown slot
//! starts at 1000 and a record is sampled when `id mod sample_every == slot`. Every sample moves
//! the slot down by one and the slot wraps back to 1000 after reaching 0. A block of
//! `sample_every` consecutive ids holds one sample, and successive samples land on a decreasing
//! offset of their block, so the sampled records do not line up with periodic behavior
//! downstream. The block where the slot wraps is the exception: after its sample at offset 1 the
//! slot is back at 1000, which is still ahead in the same block, so that block holds two samples.
//!
//! The countdown is a plain value owned by the Generator and advanced by [LatencySampler::advance].

use std::num::NonZeroU64;

use crate::config::SAMPLER_SLOT_START;
use crate::config::components::SamplerConfig;
use crate::message::RecordId;

/// Countdown slot of the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerState {
    next_slot: u64,
}

impl Default for SamplerState {
    fn default() -> Self {
        Self {
            next_slot: SAMPLER_SLOT_START,
        }
    }
}

impl SamplerState {
    pub fn next_slot(&self) -> u64 {
        self.next_slot
    }
}

#[derive(Debug, Clone, Default)]
pub struct LatencySampler {
    sample_every: Option<NonZeroU64>,
}

impl LatencySampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            sample_every: config.sample_every,
        }
    }

    /// Returns the state to use for the next id and whether `id` is sampled. A disabled sampler
    /// never samples and never moves the slot.
    pub fn advance(&self, state: SamplerState, id: RecordId) -> (SamplerState, bool) {
        let Some(sample_every) = self.sample_every else {
            return (state, false);
        };

        if id % sample_every.get() != state.next_slot {
            return (state, false);
        }

        let next_slot = match state.next_slot.saturating_sub(1) {
            0 => SAMPLER_SLOT_START,
            slot => slot,
        };
        (SamplerState { next_slot }, true)
    }
}
