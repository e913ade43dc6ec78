//! Coordinator process: terminates wallet HTTPS traffic and drives the
//! signing quorum over the framed node connections.

use anyhow::Context;
use clap::Parser;
use mpc_common::observability::init_tracing;
use mpc_common::Environment;
use mpc_coordinator::https::{WalletHttpsServer, WalletServerConfig};
use mpc_coordinator::https::SessionConfig;
use mpc_coordinator::{
    CertManagerTlsFactory, Coordinator, CoordinatorConfig, SigningService, WalletMessageRouter,
};
use mpc_security::{create_kms, create_resource_loader, CertificateManager, ServerConfigBuilder};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "coordinator", about = "MPC signing coordinator")]
struct Cli {
    /// Named environment to load (config/<name>.env).
    #[arg(long)]
    env: String,
}

#[tokio::main]
async fn main() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("coordinator failed: {e:#}");
        eprintln!("coordinator failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let env = Environment::load(&cli.env).context("loading environment")?;
    let config = CoordinatorConfig::from_env(&env).context("resolving coordinator configuration")?;
    init_tracing(config.runtime_log_level, false);

    info!(
        coordinator_id = %config.coordinator_id,
        platform = %config.platform,
        nodes = config.nodes.len(),
        threshold = config.threshold,
        total_shards = config.total_shards,
        "starting coordinator"
    );

    let resource_loader = create_resource_loader(config.platform, &config.resource_dir)
        .context("initializing resource loader")?;
    let kms = create_kms(config.platform, &config.secrets_dir).context("initializing KMS")?;

    // Node hop: per-node client TLS via the factory.
    let tls_factory = Arc::new(CertManagerTlsFactory::new(
        Arc::clone(&resource_loader),
        Arc::clone(&kms),
        config.ca_cert_path.clone(),
    ));
    let coordinator = Arc::new(Coordinator::new(tls_factory, config.timeouts));
    coordinator.set_node_connected_callback(Arc::new(|node_id| {
        info!(node_id, "node connection established");
    }));
    coordinator.set_node_disconnected_callback(Arc::new(|node_id| {
        warn!(node_id, "node connection lost");
    }));

    for node in &config.nodes {
        coordinator
            .register_node(node.clone())
            .with_context(|| format!("registering node {}", node.node_id))?;
    }
    for node in &config.nodes {
        if let Err(e) = coordinator.connect_to_node(&node.node_id).await {
            warn!(node_id = %node.node_id, error = %e, "initial node connection failed");
        }
    }
    info!(
        connected = coordinator.get_connected_node_ids().len(),
        "initial node connections done"
    );

    // Wallet hop: TLS-terminating HTTP/1.1 ingress.
    let https_cert_manager = CertificateManager::new(
        resource_loader,
        kms,
        config.ca_cert_path.clone(),
        config.https_cert_path.clone(),
        config.https_key_id.clone(),
    );
    let https_tls = ServerConfigBuilder::new(https_cert_manager)
        .build()
        .context("building wallet HTTPS TLS configuration")?;

    let signing = Arc::new(SigningService::new(Arc::clone(&coordinator)));
    let router = Arc::new(WalletMessageRouter::new(signing, Arc::clone(&coordinator)));
    let server = WalletHttpsServer::new(
        WalletServerConfig {
            bind_address: config.https_bind.clone(),
            port: config.https_port,
            handler_threads: config.handler_threads,
            session: SessionConfig {
                max_requests: config.max_requests_per_connection,
                idle_timeout: config.idle_timeout,
                write_timeout: config.timeouts.write,
            },
            timeouts: config.timeouts,
        },
        Arc::new(https_tls),
        router,
    );
    server.start().await.context("starting wallet HTTPS server")?;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    server.stop().await;
    coordinator.disconnect_all().await;
    info!("coordinator stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
