//! Agent entrypoint: single-node funcvisor with the embedded broker.
//!
//! Usage: `funcvisor-agent [config.json]`
//!
//! The first termination signal starts graceful shutdown; a second one
//! exits the process immediately.

use std::sync::Arc;

use prometheus::Registry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use funcvisor::{
    serve_metrics, AgentConfig, AgentMetrics, AgentSupervisor, MemoryBroker, MemoryKv,
    SimulatedRunner,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = read_config(std::env::args().nth(1))?;
    cfg.validate()?;
    info!(
        pod = %cfg.pod_name,
        broker = %cfg.broker.url,
        max_instances = cfg.instances.max,
        "agent starting",
    );

    let registry = Registry::new();
    let metrics = Arc::new(AgentMetrics::register(&registry)?);

    let broker = Arc::new(MemoryBroker::new());
    let kv = Arc::new(MemoryKv::new());

    let token = CancellationToken::new();

    let metrics_addr = cfg.metrics.address.parse()?;
    let metrics_token = token.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_metrics(metrics_addr, registry, metrics_token).await {
            warn!(error = %e, "metrics endpoint failed");
        }
    });

    spawn_signal_watcher(token.clone());

    let supervisor =
        AgentSupervisor::connect(cfg, broker, kv, Arc::new(SimulatedRunner), metrics).await?;
    supervisor.run(token).await?;

    info!("agent exited cleanly");
    Ok(())
}

fn read_config(path: Option<String>) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(AgentConfig::default()),
    }
}

/// Escalating termination handling: the first signal cancels `token` so the
/// supervisor drains within its grace period, the second gives up on
/// draining and exits on the spot.
///
/// Per-kind listener tasks funnel into one channel, so the watcher only has
/// to count what arrives.
fn spawn_signal_watcher(token: CancellationToken) {
    let (tx, mut rx) = mpsc::channel::<&'static str>(4);
    spawn_signal_listeners(tx);

    tokio::spawn(async move {
        if let Some(signal) = rx.recv().await {
            info!(signal, "termination signal received, shutting down gracefully");
            token.cancel();
        }
        if let Some(signal) = rx.recv().await {
            warn!(signal, "second termination signal, exiting immediately");
            std::process::exit(1);
        }
    });
}

/// One forwarding task per signal kind: SIGINT, SIGTERM, and SIGQUIT
/// (Ctrl-C in terminals, the default kill, and systemd/Kubernetes stops
/// all land here).
#[cfg(unix)]
fn spawn_signal_listeners(tx: mpsc::Sender<&'static str>) {
    use tokio::signal::unix::SignalKind;

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::quit(), "SIGQUIT"),
    ] {
        let tx = tx.clone();
        tokio::spawn(async move {
            let Ok(mut listener) = tokio::signal::unix::signal(kind) else {
                warn!(signal = name, "signal listener registration failed");
                return;
            };
            while listener.recv().await.is_some() {
                if tx.send(name).await.is_err() {
                    return;
                }
            }
        });
    }
}

/// Ctrl-C is the only termination event tokio exposes off Unix.
#[cfg(not(unix))]
fn spawn_signal_listeners(tx: mpsc::Sender<&'static str>) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send("ctrl-c").await.is_err() {
                return;
            }
        }
    });
}
