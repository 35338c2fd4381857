use std::env;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;
use crate::error::Error;

/// Configurations of the individual components derived from [Settings].
pub mod components;

const ENV_SETTINGS: &str = "RELAYBENCH_SETTINGS";

/// Initial value of the sampler countdown. A positive sampling period up to this value can never
/// match the slot, so sampling silently never fires.
pub(crate) const SAMPLER_SLOT_START: u64 = 1000;

const DEFAULT_NAME: &str = "no_name";
const DEFAULT_PAYLOAD_SIZE: usize = 12;
const DEFAULT_SLEEP_EVERY_N: i64 = 1;
const DEFAULT_SAMPLE_EVERY_N: i64 = 10_000;
const DEFAULT_LOG_FREQ: i64 = 100_000;
const DEFAULT_ACK_TIMEOUT_MILLIS: u64 = 30_000;
const DEFAULT_CHANNEL_CAPACITY: usize = 500;

/// Settings of one benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub name: String,
    pub payload_size: usize,
    pub delay_millis: i64,
    pub sleep_every_n: i64,
    pub sample_every_n: i64,
    pub log_freq: i64,
    pub fault_tolerant: bool,
    pub relay_count: usize,
    pub source_parallelism: usize,
    pub relay_parallelism: usize,
    pub sink_parallelism: usize,
    pub ack_timeout_millis: u64,
    pub channel_capacity: usize,
    pub max_records: Option<u64>,
    pub host: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            payload_size: DEFAULT_PAYLOAD_SIZE,
            delay_millis: 0,
            sleep_every_n: DEFAULT_SLEEP_EVERY_N,
            sample_every_n: DEFAULT_SAMPLE_EVERY_N,
            log_freq: DEFAULT_LOG_FREQ,
            fault_tolerant: false,
            relay_count: 0,
            source_parallelism: 1,
            relay_parallelism: 1,
            sink_parallelism: 1,
            ack_timeout_millis: DEFAULT_ACK_TIMEOUT_MILLIS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_records: None,
            host: None,
        }
    }
}

impl Settings {
    /// Loads the settings from `RELAYBENCH_SETTINGS` (base64 encoded JSON). Defaults are used
    /// when the variable is not set.
    pub fn load() -> Result<Self> {
        match env::var(ENV_SETTINGS) {
            Ok(encoded) => Self::from_encoded(&encoded),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Decodes base64 encoded JSON settings.
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Failed to base64 decode settings: {e:?}")))?;
        serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("Failed to parse settings: {e:?}")))
    }

    /// Rejects settings the topology cannot be built with. Non-positive periods only disable the
    /// feature they control.
    pub fn validate(&self) -> Result<()> {
        for (key, parallelism) in [
            ("sourceParallelism", self.source_parallelism),
            ("relayParallelism", self.relay_parallelism),
            ("sinkParallelism", self.sink_parallelism),
        ] {
            if parallelism == 0 {
                return Err(Error::Config(format!("{key} must be greater than 0")));
            }
        }

        if self.channel_capacity == 0 {
            return Err(Error::Config(
                "channelCapacity must be greater than 0".to_string(),
            ));
        }

        if self.ack_timeout_millis == 0 && self.fault_tolerant {
            return Err(Error::Config(
                "ackTimeoutMillis must be greater than 0 in fault-tolerant mode".to_string(),
            ));
        }

        if self.delay_millis > 0 && self.sleep_every_n <= 0 {
            warn!(
                sleep_every_n = self.sleep_every_n,
                "'sleepEveryN' is not positive, rate control is disabled"
            );
        }

        if self.sample_every_n <= 0 {
            warn!(
                sample_every_n = self.sample_every_n,
                "'sampleEveryN' is not positive, latency sampling is disabled"
            );
        } else if self.sample_every_n as u64 <= SAMPLER_SLOT_START {
            warn!(
                sample_every_n = self.sample_every_n,
                "'sampleEveryN' must exceed {SAMPLER_SLOT_START} for a sample to ever be taken"
            );
        }

        if self.log_freq <= 0 {
            warn!(
                log_freq = self.log_freq,
                "'logFreq' is not positive, throughput reporting is disabled"
            );
        }

        Ok(())
    }
}
