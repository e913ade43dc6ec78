//! Node process: hosts one key share behind the framed TLS server.

use anyhow::Context;
use clap::Parser;
use mpc_common::observability::init_tracing;
use mpc_common::Environment;
use mpc_crypto::{CryptoProvider, InMemoryPersistency, LocalCryptoProvider};
use mpc_network::server::{NodeServer, NodeServerConfig, SecurityPolicy};
use mpc_node::{NodeConfig, NodeMessageRouter};
use mpc_security::{
    create_kms, create_resource_loader, CertificateManager, KernelFirewall, ServerConfigBuilder,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "node", about = "MPC signing node")]
struct Cli {
    /// Named environment to load (config/<name>.env).
    #[arg(long)]
    env: String,

    /// This node's id, as listed in NODE_IDS.
    #[arg(long)]
    id: String,
}

#[tokio::main]
async fn main() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("node failed: {e:#}");
        eprintln!("node failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let env = Environment::load(&cli.env).context("loading environment")?;
    let config = NodeConfig::from_env(&env, &cli.id).context("resolving node configuration")?;
    init_tracing(config.runtime_log_level, false);

    info!(
        node_id = %config.node_id,
        platform = %config.platform,
        port = config.port,
        shard_index = config.shard_index,
        "starting node"
    );

    let resource_loader = create_resource_loader(config.platform, &config.resource_dir)
        .context("initializing resource loader")?;
    let kms = create_kms(config.platform, &config.secrets_dir).context("initializing KMS")?;

    let cert_manager = CertificateManager::new(
        resource_loader,
        kms,
        config.ca_cert_path.clone(),
        config.server_cert_path.clone(),
        config.server_key_id.clone(),
    );
    let tls_config = ServerConfigBuilder::new(cert_manager)
        .build()
        .context("building TLS server configuration")?;

    if config.enable_kernel_firewall {
        if KernelFirewall::has_root_privilege() {
            if let Err(e) = KernelFirewall::configure_node_firewall(
                config.port,
                &config.trusted_coordinator_ip.to_string(),
                false,
            ) {
                warn!(error = %e, "kernel firewall configuration failed, continuing");
            }
        } else {
            warn!("ENABLE_KERNEL_FIREWALL set but not running as root, skipping");
        }
    }

    let persistency = Arc::new(InMemoryPersistency::new());
    let provider: Arc<dyn CryptoProvider> =
        Arc::new(LocalCryptoProvider::new(config.player_id(), persistency));
    info!(
        provider = provider.provider_name(),
        version = provider.version(),
        "crypto provider ready"
    );

    let router = Arc::new(NodeMessageRouter::new(provider));
    let server = NodeServer::new(
        NodeServerConfig {
            bind_address: config.bind_address.clone(),
            port: config.port,
            handler_threads: config.handler_threads,
            timeouts: config.timeouts,
        },
        Arc::new(tls_config),
        SecurityPolicy::new(config.trusted_coordinator_ip),
        router.into_message_handler(),
    );
    server.start().await.context("starting node server")?;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    let drained = server.prepare_shutdown(Duration::from_secs(30)).await;
    if !drained {
        warn!("pending requests were dropped during shutdown");
    }

    if config.enable_kernel_firewall && KernelFirewall::has_root_privilege() {
        if let Err(e) = KernelFirewall::remove_node_firewall(
            config.port,
            &config.trusted_coordinator_ip.to_string(),
            false,
        ) {
            warn!(error = %e, "kernel firewall cleanup failed");
        }
    }

    info!("node stopped");
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
