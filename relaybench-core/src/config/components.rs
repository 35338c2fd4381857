use std::num::NonZeroU64;
use std::time::Duration;

use crate::config::Settings;

/// Period of a periodic feature, `None` when the configured value is not positive.
fn positive_period(value: i64) -> Option<NonZeroU64> {
    u64::try_from(value).ok().and_then(NonZeroU64::new)
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RateControlConfig {
    /// how long the emission loop sleeps, zero disables rate control.
    pub delay: Duration,
    /// sleep before every record whose id is a multiple of this.
    pub sleep_every: Option<NonZeroU64>,
}

impl From<&Settings> for RateControlConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            delay: u64::try_from(settings.delay_millis)
                .map(Duration::from_millis)
                .unwrap_or_default(),
            sleep_every: positive_period(settings.sleep_every_n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SamplerConfig {
    pub sample_every: Option<NonZeroU64>,
}

impl From<&Settings> for SamplerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            sample_every: positive_period(settings.sample_every_n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeneratorConfig {
    pub payload_size: usize,
    pub rate: RateControlConfig,
    pub sampler: SamplerConfig,
    /// number of fresh records to generate before the instance winds down, replays excluded.
    pub max_records: Option<u64>,
}

impl From<&Settings> for GeneratorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            payload_size: settings.payload_size,
            rate: settings.into(),
            sampler: settings.into(),
            max_records: settings.max_records,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SinkConfig {
    /// size of the rolling throughput window in records.
    pub log_freq: Option<NonZeroU64>,
}

impl From<&Settings> for SinkConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            log_freq: positive_period(settings.log_freq),
        }
    }
}
