//! Top-level supervision: builds every component from the configuration,
//! runs until a termination signal or a fatal failure, then shuts down.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, FatalScope};
use crate::discovery::ConsulRegistrator;
use crate::error::{ExporterError, Result};
use crate::metrics::MetricsRegistry;
use crate::namespace::{NamespaceProcessor, TaskFailure};
use crate::server::MetricsServer;
use crate::shutdown::{self, ShutdownCoordinator};
use crate::tail::TailOptions;

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Runs the exporter until a termination signal arrives.
pub async fn run(config: Config) -> Result<()> {
    run_until(config, shutdown::wait_for_signal()).await
}

/// Runs the exporter until `stop` resolves or an ingestion task fails
/// fatally (subject to `config.fatal_scope`).
pub async fn run_until<F>(config: Config, stop: F) -> Result<()>
where
    F: Future<Output = &'static str>,
{
    let coordinator = ShutdownCoordinator::new();
    let outcome = supervise(&config, &coordinator, stop).await;
    coordinator.shutdown().await;
    outcome
}

async fn supervise<F>(config: &Config, coordinator: &ShutdownCoordinator, stop: F) -> Result<()>
where
    F: Future<Output = &'static str>,
{
    config.check_stability()?;

    let registry = Arc::new(MetricsRegistry::new(&config.namespaces)?);
    spawn_upkeep(coordinator, registry.clone());

    if config.consul.enable {
        register_consul(config, coordinator).await?;
    }

    let (failures_tx, mut failures_rx) = mpsc::unbounded_channel::<TaskFailure>();
    let tail_options = TailOptions::from(&config.tail);
    let mut namespace_tokens: HashMap<String, CancellationToken> = HashMap::new();

    for ns in &config.namespaces {
        info!(namespace = %ns.name, "starting listener for namespace");
        let processor = NamespaceProcessor::compile(ns, &registry)?;
        let token = processor
            .start(coordinator, tail_options, failures_tx.clone())
            .await?;
        namespace_tokens.insert(ns.name.clone(), token);
    }
    drop(failures_tx);

    let address: IpAddr = config.listen.address.parse().map_err(|e| {
        ExporterError::Config(format!(
            "invalid listen address '{}': {}",
            config.listen.address, e
        ))
    })?;
    let server = MetricsServer::bind(SocketAddr::new(address, config.listen.port), registry)?;
    spawn_server(coordinator, server);

    tokio::pin!(stop);
    loop {
        tokio::select! {
            signal = &mut stop => {
                info!(signal, "caught termination signal, exiting");
                return Ok(());
            }
            Some(failure) = failures_rx.recv() => {
                match config.fatal_scope {
                    FatalScope::Process => {
                        error!(namespace = %failure.namespace, error = %failure.error, "fatal ingestion failure, terminating");
                        return Err(failure.error);
                    }
                    FatalScope::Namespace => {
                        error!(namespace = %failure.namespace, error = %failure.error, "fatal ingestion failure, stopping namespace");
                        if let Some(token) = namespace_tokens.get(&failure.namespace) {
                            token.cancel();
                        }
                    }
                }
            }
        }
    }
}

fn spawn_upkeep(coordinator: &ShutdownCoordinator, registry: Arc<MetricsRegistry>) {
    let token = coordinator.token();
    coordinator.spawn("metrics-upkeep", async move {
        let mut interval = tokio::time::interval(UPKEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => registry.run_upkeep(),
            }
        }
    });
}

async fn register_consul(config: &Config, coordinator: &ShutdownCoordinator) -> Result<()> {
    let registrator = ConsulRegistrator::new(config)?;
    registrator.register().await?;

    let token = coordinator.token();
    coordinator.spawn("consul-deregistration", async move {
        token.cancelled().await;
        if let Err(e) = registrator.deregister().await {
            warn!(error = %e, "could not unregister service from Consul");
        }
    });
    Ok(())
}

fn spawn_server(coordinator: &ShutdownCoordinator, server: MetricsServer) {
    let token = coordinator.token();
    coordinator.spawn("http-server", async move {
        if let Err(e) = server.run(token).await {
            error!(error = %e, "HTTP server failed");
        }
    });
}
