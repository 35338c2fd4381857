//! Local topology runner. Assembles Generator → Relay(0) → … → Relay(k-1) → Sink inside one
//! runtime, every hop partitioned by record id, and runs it until cancellation or until every
//! Generator has finished a bounded run.
//!
//! Stages are wired sink-first so every writer knows its downstream channels. A stage instance
//! stops when its input channel closes, and dropping its writer closes the channels of the next
//! stage once every instance of the stage is gone. A bounded run therefore drains stage by stage.
//! A failing stage cancels the whole pipeline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;
use crate::config::Settings;
use crate::config::components::{GeneratorConfig, SinkConfig};
use crate::delivery::{DeliveryMode, FaultTolerant, Unanchored};
use crate::error::Error;
use crate::generator::{Generator, GeneratorSummary};
use crate::isb::{ErrorInjector, Writer};
use crate::message::Delivery;
use crate::relay::{Relay, RelaySummary};
use crate::shared::clock::SharedClock;
use crate::shared::utils::resolve_host;
use crate::sink::{Sink, SinkSummary};
use crate::tracker::{Outcome, TrackerHandle};

/// Per-instance counts of a finished run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSummary {
    pub generators: Vec<GeneratorSummary>,
    /// one entry per Relay stage, one summary per instance.
    pub relays: Vec<Vec<RelaySummary>>,
    pub sinks: Vec<SinkSummary>,
}

impl PipelineSummary {
    pub fn generated(&self) -> u64 {
        self.generators.iter().map(|g| g.generated).sum()
    }

    pub fn received(&self) -> u64 {
        self.sinks.iter().map(|s| s.received).sum()
    }
}

pub struct Pipeline {
    settings: Settings,
    host: Arc<str>,
    clock: SharedClock,
    /// one per hop, hop 0 is Generator → first stage.
    error_injectors: Vec<Arc<ErrorInjector>>,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let host = resolve_host(settings.host.as_deref());
        let error_injectors = (0..=settings.relay_count)
            .map(|_| Arc::new(ErrorInjector::new()))
            .collect();
        Ok(Self {
            settings,
            host,
            clock: SharedClock::default(),
            error_injectors,
        })
    }

    /// Host identity stamped on generated records.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Fault injection of the Generator's hop.
    pub fn error_injector(&self) -> Arc<ErrorInjector> {
        self.hop_error_injector(0).unwrap_or_default()
    }

    /// Fault injection of the given hop, hop `k > 0` leaves Relay stage `k - 1`.
    pub fn hop_error_injector(&self, hop: usize) -> Option<Arc<ErrorInjector>> {
        self.error_injectors.get(hop).map(Arc::clone)
    }

    pub async fn run(self, cln_token: CancellationToken) -> Result<PipelineSummary> {
        info!(
            name = %self.settings.name,
            host = %self.host,
            fault_tolerant = self.settings.fault_tolerant,
            relays = self.settings.relay_count,
            "Starting pipeline"
        );

        if self.settings.fault_tolerant {
            let (tracker, outcomes) = TrackerHandle::new(
                Duration::from_millis(self.settings.ack_timeout_millis),
                self.settings.source_parallelism,
            );
            let mode_tracker = tracker.clone();
            self.run_with_mode(
                move |origin| FaultTolerant::new(mode_tracker.with_origin(origin)),
                Some(tracker),
                outcomes.into_iter().map(Some).collect(),
                cln_token,
            )
            .await
        } else {
            let outcomes = (0..self.settings.source_parallelism).map(|_| None).collect();
            self.run_with_mode(|_| Unanchored, None, outcomes, cln_token)
                .await
        }
    }

    async fn run_with_mode<M, F>(
        self,
        mode_for: F,
        tracker: Option<TrackerHandle>,
        outcomes: Vec<Option<mpsc::UnboundedReceiver<Outcome>>>,
        cln_token: CancellationToken,
    ) -> Result<PipelineSummary>
    where
        M: DeliveryMode + Send + Sync + 'static,
        F: Fn(usize) -> M,
    {
        let settings = &self.settings;
        let name = settings.name.as_str();
        let stage_token = cln_token.child_token();

        // sinks
        let (mut downstream, sink_inputs) =
            partition_channels(settings.sink_parallelism, settings.channel_capacity);
        let sink_config = SinkConfig::from(settings);
        let sinks: Vec<_> = sink_inputs
            .into_iter()
            .enumerate()
            .map(|(replica, input)| {
                let sink = Sink::new(
                    sink_config.clone(),
                    mode_for(0),
                    Arc::clone(&self.host),
                    self.clock.clone(),
                )
                .with_replica(name, replica);
                spawn_stage(sink.run(input, stage_token.clone()), stage_token.clone())
            })
            .collect();

        // relays, last stage first
        let mut relays = Vec::with_capacity(settings.relay_count);
        for stage in (0..settings.relay_count).rev() {
            let (txs, inputs) =
                partition_channels(settings.relay_parallelism, settings.channel_capacity);
            let writer = Writer::new(
                downstream,
                tracker.clone(),
                self.hop_error_injector(stage + 1).unwrap_or_default(),
            );
            let instances: Vec<_> = inputs
                .into_iter()
                .enumerate()
                .map(|(replica, input)| {
                    let relay = Relay::new(mode_for(0), writer.clone())
                        .with_replica(name, stage, replica);
                    spawn_stage(relay.run(input, stage_token.clone()), stage_token.clone())
                })
                .collect();
            relays.push(instances);
            downstream = txs;
        }
        relays.reverse();

        // generators
        let writer = Writer::new(downstream, tracker.clone(), self.error_injector());
        let generator_config = GeneratorConfig::from(settings);
        let generators: Vec<_> = outcomes
            .into_iter()
            .enumerate()
            .map(|(replica, outcomes)| {
                let generator = Generator::new(
                    generator_config.clone(),
                    mode_for(replica),
                    writer.clone(),
                    Arc::clone(&self.host),
                    self.clock.clone(),
                )
                .with_replica(name, replica);
                spawn_stage(
                    generator.run(outcomes, stage_token.clone()),
                    stage_token.clone(),
                )
            })
            .collect();

        // only the stages hold writers and tracker handles from here on
        drop(writer);
        drop(tracker);
        drop(mode_for);

        let generators = join_stage("generator", generators).await;
        let mut relay_summaries = Vec::with_capacity(relays.len());
        for instances in relays {
            relay_summaries.push(join_stage("relay", instances).await);
        }
        let sinks = join_stage("sink", sinks).await;

        let summary = PipelineSummary {
            generators: generators?,
            relays: relay_summaries.into_iter().collect::<Result<_>>()?,
            sinks: sinks?,
        };
        info!(
            generated = summary.generated(),
            received = summary.received(),
            "Pipeline stopped"
        );
        Ok(summary)
    }
}

/// One bounded channel per downstream instance.
fn partition_channels(
    partitions: usize,
    capacity: usize,
) -> (Vec<mpsc::Sender<Delivery>>, Vec<mpsc::Receiver<Delivery>>) {
    (0..partitions).map(|_| mpsc::channel(capacity)).unzip()
}

/// Spawns a stage instance, a failing instance cancels every other stage.
fn spawn_stage<T, F>(future: F, stage_token: CancellationToken) -> JoinHandle<Result<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = future.await;
        if let Err(e) = &result {
            error!(?e, "Stage failed, stopping the pipeline");
            stage_token.cancel();
        }
        result
    })
}

/// Waits for every instance of a stage and returns the first error, if any.
async fn join_stage<T>(stage: &str, handles: Vec<JoinHandle<Result<T>>>) -> Result<Vec<T>> {
    let mut summaries = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for handle in handles {
        let result = handle
            .await
            .map_err(|e| Error::Forwarder(format!("{stage} task failed: {e:?}")))
            .and_then(|result| result);
        match result {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(summaries),
    }
}
