//! Prometheus metrics of the benchmark stages, exposed on `/metrics` next to a `/livez` probe.
//! Metrics are a side channel, the observable output of a run is still the Sink's log lines.

use std::iter;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;

use axum::Router;
use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Error;
use crate::Result;

const NAME_LABEL: &str = "name";
const STAGE_LABEL: &str = "stage";
const REPLICA_LABEL: &str = "replica";

const REGISTRY_GLOBAL_PREFIX: &str = "relaybench";

const GENERATED_TOTAL: &str = "generated";
const REPLAYED_TOTAL: &str = "replayed";
const ACKED_TOTAL: &str = "acked";
const FAILED_TOTAL: &str = "failed";
const FORWARDED_TOTAL: &str = "forwarded";
const RECEIVED_TOTAL: &str = "received";
const THROUGHPUT: &str = "throughput";
const LATENCY: &str = "latency_ms";

/// The global register of all metrics.
struct GlobalRegistry {
    // every metric is registered exactly once
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::default()),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

type Labels = Vec<(String, String)>;

/// Metrics of every stage, labelled with the run name, the stage and the replica.
pub(crate) struct BenchMetrics {
    // generator
    pub(crate) generated: Family<Labels, Counter>,
    pub(crate) replayed: Family<Labels, Counter>,
    pub(crate) acked: Family<Labels, Counter>,
    pub(crate) failed: Family<Labels, Counter>,
    // relay
    pub(crate) forwarded: Family<Labels, Counter>,
    // sink
    pub(crate) received: Family<Labels, Counter>,
    pub(crate) throughput: Family<Labels, Gauge<f64, AtomicU64>>,
    pub(crate) latency: Family<Labels, Histogram>,
}

/// Exponential bucket distribution with `length` buckets from `min` to `max`. The +Inf bucket is
/// not included.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let growth_factor = (max / min).powf(1.0 / (f64::from(length.max(2)) - 1.0));
    iter::successors(Some(min), move |bucket| Some(bucket * growth_factor)).take(length.into())
}

impl BenchMetrics {
    fn new() -> Self {
        let metrics = Self {
            generated: Family::<Labels, Counter>::default(),
            replayed: Family::<Labels, Counter>::default(),
            acked: Family::<Labels, Counter>::default(),
            failed: Family::<Labels, Counter>::default(),
            forwarded: Family::<Labels, Counter>::default(),
            received: Family::<Labels, Counter>::default(),
            throughput: Family::<Labels, Gauge<f64, AtomicU64>>::default(),
            // 1 ms to 1 minute
            latency: Family::<Labels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets_range(1.0, 60_000.0, 12))
            }),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_GLOBAL_PREFIX);
        registry.register(
            GENERATED_TOTAL,
            "A Counter to keep track of the fresh records emitted by a generator",
            metrics.generated.clone(),
        );
        registry.register(
            REPLAYED_TOTAL,
            "A Counter to keep track of the records replayed after a failed delivery",
            metrics.replayed.clone(),
        );
        registry.register(
            ACKED_TOTAL,
            "A Counter to keep track of the records whose delivery tree completed",
            metrics.acked.clone(),
        );
        registry.register(
            FAILED_TOTAL,
            "A Counter to keep track of the records whose delivery was reported as failed",
            metrics.failed.clone(),
        );
        registry.register(
            FORWARDED_TOTAL,
            "A Counter to keep track of the records forwarded by a relay",
            metrics.forwarded.clone(),
        );
        registry.register(
            RECEIVED_TOTAL,
            "A Counter to keep track of the records received by a sink",
            metrics.received.clone(),
        );
        registry.register(
            THROUGHPUT,
            "A Gauge with the elements per second of the last reported sink window",
            metrics.throughput.clone(),
        );
        registry.register(
            LATENCY,
            "A Histogram of the sampled end to end latencies, in milliseconds",
            metrics.latency.clone(),
        );
        metrics
    }
}

static BENCH_METRICS: OnceLock<BenchMetrics> = OnceLock::new();

pub(crate) fn bench_metrics() -> &'static BenchMetrics {
    BENCH_METRICS.get_or_init(BenchMetrics::new)
}

/// Labels of one stage instance.
pub(crate) fn stage_metric_labels(name: &str, stage: &str, replica: usize) -> Labels {
    vec![
        (NAME_LABEL.to_string(), name.to_string()),
        (STAGE_LABEL.to_string(), stage.to_string()),
        (REPLICA_LABEL.to_string(), replica.to_string()),
    ]
}

/// Renders every registered metric in the OpenMetrics text format.
pub fn metrics_text() -> Result<String> {
    // make sure the families are registered even before the first stage starts
    bench_metrics();
    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &registry).map_err(|e| Error::Metrics(format!("{e:?}")))?;
    Ok(buffer)
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics_text() {
        Ok(buffer) => {
            debug!("Exposing metrics: {:?}", buffer);
            (
                StatusCode::OK,
                [(
                    axum::http::header::CONTENT_TYPE,
                    "application/openmetrics-text; version=1.0.0; charset=utf-8",
                )],
                buffer,
            )
                .into_response()
        }
        Err(e) => {
            error!(?e, "Failed to encode metrics");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

/// Serves the metrics endpoints on `addr` until `cln_token` is cancelled.
pub async fn start_metrics_server(addr: SocketAddr, cln_token: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(?addr, "Starting metrics server");

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(async move { cln_token.cancelled_owned().await })
        .await
        .map_err(|e| Error::Metrics(format!("Metrics server: {e}")))
}
