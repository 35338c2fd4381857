use std::error::Error;
use std::future;
use std::net::SocketAddr;
use std::time::Duration;

use relaybench_core::metrics::start_metrics_server;
use relaybench_core::{Pipeline, PipelineSummary, Settings};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cmdline::LocalArgs;

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    match matches.subcommand() {
        Some(("local", sub_matches)) => run_local(LocalArgs::from(sub_matches)).await,
        other => Err(format!("Unsupported subcommand {other:?}").into()),
    }
}

async fn run_local(args: LocalArgs) -> Result<(), Box<dyn Error>> {
    let settings = args.apply(Settings::load()?);
    info!(?settings, "Starting local run");
    let pipeline = Pipeline::new(settings)?;
    info!(host = pipeline.host(), "Resolved host identity");

    let cln_token = CancellationToken::new();
    let shutdown_handle = tokio::spawn(cancel_on_shutdown(args.duration, cln_token.clone()));

    let metrics_addr = args
        .metrics_port
        .map(|port| SocketAddr::from(([0, 0, 0, 0], port)));
    let summary = with_metrics_server(metrics_addr, async {
        let result = pipeline.run(cln_token.clone()).await;
        cln_token.cancel();
        shutdown_handle.abort();
        // the endpoint outlives the pipeline until the summary is logged
        result.inspect(log_summary)
    })
    .await;

    summary?;
    Ok(())
}

/// Serves metrics on `addr` while `run` is in progress. The server is shut down gracefully once
/// `run` completes, whether it succeeded or not.
async fn with_metrics_server<T, E>(
    addr: Option<SocketAddr>,
    run: impl Future<Output = Result<T, E>>,
) -> Result<T, E> {
    let metrics_token = CancellationToken::new();
    let metrics_handle = addr.map(|addr| {
        info!(?addr, "Starting metrics server");
        tokio::spawn(start_metrics_server(addr, metrics_token.clone()))
    });

    let result = run.await;

    metrics_token.cancel();
    if let Some(handle) = metrics_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(?e, "Metrics server failed"),
            Err(e) => warn!(?e, "Metrics server task failed"),
        }
    }
    result
}

/// Cancels the run on Ctrl-C, SIGTERM or at the end of `duration`.
async fn cancel_on_shutdown(duration: Option<Duration>, cln_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(?e, "Failed to install Ctrl+C handler");
            return future::pending().await;
        }
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                warn!(?e, "Failed to install terminate handler");
                future::pending::<()>().await;
            }
        }
    };

    let deadline = async {
        match duration {
            Some(duration) => {
                tokio::time::sleep(duration).await;
                info!(?duration, "Run duration elapsed");
            }
            None => future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = deadline => {},
        _ = cln_token.cancelled() => return,
    }
    cln_token.cancel();
}

fn log_summary(summary: &PipelineSummary) {
    for (replica, generator) in summary.generators.iter().enumerate() {
        info!(
            replica,
            generated = generator.generated,
            replayed = generator.replayed,
            acked = generator.acked,
            failed = generator.failed,
            "Generator summary"
        );
    }
    for (stage, relays) in summary.relays.iter().enumerate() {
        for (replica, relay) in relays.iter().enumerate() {
            info!(
                stage,
                replica,
                forwarded = relay.forwarded,
                acked = relay.acked,
                "Relay summary"
            );
        }
    }
    for (replica, sink) in summary.sinks.iter().enumerate() {
        info!(
            replica,
            received = sink.received,
            reports = sink.reports,
            latency_samples = sink.latency_samples,
            elapsed_ms = sink.elapsed_ms,
            "Sink summary"
        );
    }
    info!(
        generated = summary.generated(),
        received = summary.received(),
        "Run finished"
    );
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use relaybench_core::Error as CoreError;
    use tokio::time::timeout;

    use super::*;

    fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_metrics_server_stops_when_run_fails() {
        let addr = free_addr();
        let result: Result<(), CoreError> = timeout(
            Duration::from_secs(5),
            with_metrics_server(Some(addr), async {
                // give the server time to bind
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(CoreError::Forwarder("sink task failed".to_string()))
            }),
        )
        .await
        .expect("the server should shut down after a failed run");

        assert!(matches!(result, Err(CoreError::Forwarder(_))));
        // the port is released
        TcpListener::bind(addr).unwrap();
    }

    #[tokio::test]
    async fn test_run_without_metrics_server() {
        let result: Result<u64, CoreError> = with_metrics_server(None, async { Ok(301) }).await;
        assert_eq!(result.unwrap(), 301);
    }
}
