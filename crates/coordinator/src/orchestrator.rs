//! The coordinator's node registry and fan-out operations.
//!
//! Explicit construction, no singletons: the binary builds one
//! `Coordinator`, hands it the TLS factory, and threads `Arc`s into the
//! wallet handlers.

use crate::error::CoordinatorError;
use mpc_network::client::{ConnectionCallback, NodeClient, NodeConnectionInfo};
use mpc_network::TlsTimeouts;
use mpc_security::{CertificateManager, ClientConfigBuilder, KeyManagementService,
    ReadOnlyResourceLoader, TlsSetupError};
use mpc_types::{ConnectionStatus, PlatformType};
use mpc_wire::proto::CoordinatorNodeMessage;
use rustls::ClientConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, warn};

/// Builds the client-side TLS configuration for one node registration.
pub trait ClientTlsFactory: Send + Sync {
    fn client_config(&self, info: &NodeConnectionInfo) -> Result<Arc<ClientConfig>, TlsSetupError>;
}

/// Production factory: CA via the resource loader, per-node client
/// certificate via the loader, private key via the KMS. Nodes are dialed
/// by IP, so hostname verification is relaxed (the CA chain still binds).
pub struct CertManagerTlsFactory {
    loader: Arc<dyn ReadOnlyResourceLoader>,
    kms: Arc<dyn KeyManagementService>,
    ca_cert_path: String,
}

impl CertManagerTlsFactory {
    pub fn new(
        loader: Arc<dyn ReadOnlyResourceLoader>,
        kms: Arc<dyn KeyManagementService>,
        ca_cert_path: impl Into<String>,
    ) -> Self {
        Self {
            loader,
            kms,
            ca_cert_path: ca_cert_path.into(),
        }
    }
}

impl ClientTlsFactory for CertManagerTlsFactory {
    fn client_config(&self, info: &NodeConnectionInfo) -> Result<Arc<ClientConfig>, TlsSetupError> {
        let manager = CertificateManager::new(
            Arc::clone(&self.loader),
            Arc::clone(&self.kms),
            self.ca_cert_path.clone(),
            info.certificate_path.clone(),
            info.private_key_id.clone(),
        );
        ClientConfigBuilder::new(manager)
            .skip_hostname_verification()
            .build()
            .map(Arc::new)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub total_nodes: u32,
    pub connected_nodes: u32,
    pub error_nodes: u32,
    pub uptime_seconds: u64,
}

pub struct Coordinator {
    nodes: Mutex<HashMap<String, Arc<NodeClient>>>,
    tls_factory: Arc<dyn ClientTlsFactory>,
    timeouts: TlsTimeouts,
    start_time: Instant,
    on_node_connected: Mutex<Option<ConnectionCallback>>,
    on_node_disconnected: Mutex<Option<ConnectionCallback>>,
}

impl Coordinator {
    pub fn new(tls_factory: Arc<dyn ClientTlsFactory>, timeouts: TlsTimeouts) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            tls_factory,
            timeouts,
            start_time: Instant::now(),
            on_node_connected: Mutex::new(None),
            on_node_disconnected: Mutex::new(None),
        }
    }

    fn lock_nodes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<NodeClient>>> {
        self.nodes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Invoked synchronously from node client worker context.
    pub fn set_node_connected_callback(&self, callback: ConnectionCallback) {
        *self
            .on_node_connected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
    }

    pub fn set_node_disconnected_callback(&self, callback: ConnectionCallback) {
        *self
            .on_node_disconnected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
    }

    /// Register a node; fails on a duplicate id.
    pub fn register_node(&self, info: NodeConnectionInfo) -> Result<(), CoordinatorError> {
        let mut nodes = self.lock_nodes();
        if nodes.contains_key(&info.node_id) {
            return Err(CoordinatorError::DuplicateNode(info.node_id));
        }

        let tls_config = self.tls_factory.client_config(&info)?;
        let client = Arc::new(NodeClient::new(info.clone(), tls_config, self.timeouts));

        if let Some(callback) = self
            .on_node_connected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
        {
            client.set_connected_callback(callback);
        }
        if let Some(callback) = self
            .on_node_disconnected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
        {
            client.set_disconnected_callback(callback);
        }

        info!(node_id = %info.node_id, endpoint = %info.endpoint(), "node registered");
        nodes.insert(info.node_id, client);
        Ok(())
    }

    /// Remove a registration, disconnecting first if needed.
    pub async fn unregister_node(&self, node_id: &str) -> Result<(), CoordinatorError> {
        let client = self
            .lock_nodes()
            .remove(node_id)
            .ok_or_else(|| CoordinatorError::UnknownNode(node_id.to_string()))?;
        client.disconnect().await;
        info!(node_id, "node unregistered");
        Ok(())
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.lock_nodes().contains_key(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<Arc<NodeClient>> {
        self.lock_nodes().get(node_id).cloned()
    }

    fn require_node(&self, node_id: &str) -> Result<Arc<NodeClient>, CoordinatorError> {
        self.node(node_id)
            .ok_or_else(|| CoordinatorError::UnknownNode(node_id.to_string()))
    }

    pub async fn connect_to_node(&self, node_id: &str) -> Result<(), CoordinatorError> {
        let client = self.require_node(node_id)?;
        client.connect().await?;
        Ok(())
    }

    pub async fn disconnect_from_node(&self, node_id: &str) -> Result<(), CoordinatorError> {
        let client = self.require_node(node_id)?;
        client.disconnect().await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let clients: Vec<Arc<NodeClient>> = self.lock_nodes().values().cloned().collect();
        for client in clients {
            client.disconnect().await;
        }
    }

    pub fn is_node_connected(&self, node_id: &str) -> bool {
        self.node(node_id).map(|c| c.is_connected()).unwrap_or(false)
    }

    /// Synchronous round-trip to one node.
    pub async fn send_to_node(
        &self,
        node_id: &str,
        message: &CoordinatorNodeMessage,
    ) -> Result<CoordinatorNodeMessage, CoordinatorError> {
        let client = self.require_node(node_id)?;
        Ok(client.send_request(message).await?)
    }

    /// Fan out one request; true iff every target returned a success
    /// response. No ordering across nodes.
    pub async fn broadcast_to_nodes(
        &self,
        node_ids: &[String],
        message: &CoordinatorNodeMessage,
    ) -> bool {
        let mut clients = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            match self.node(node_id) {
                Some(client) => clients.push(client),
                None => {
                    warn!(node_id, "broadcast target not registered");
                    return false;
                }
            }
        }

        let results = futures::future::join_all(
            clients.iter().map(|client| client.send_request(message)),
        )
        .await;

        let mut all_success = true;
        for (client, result) in clients.iter().zip(results) {
            match result {
                Ok(response) if response.is_success() => {}
                Ok(_) => {
                    warn!(node_id = %client.node_id(), "broadcast target returned failure");
                    all_success = false;
                }
                Err(e) => {
                    warn!(node_id = %client.node_id(), error = %e, "broadcast send failed");
                    all_success = false;
                }
            }
        }
        all_success
    }

    pub async fn broadcast_to_all_connected(&self, message: &CoordinatorNodeMessage) -> bool {
        let targets = self.get_connected_node_ids();
        if targets.is_empty() {
            return false;
        }
        self.broadcast_to_nodes(&targets, message).await
    }

    pub fn get_connected_node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock_nodes()
            .values()
            .filter(|c| c.is_connected())
            .map(|c| c.node_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn get_all_node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_nodes().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get_nodes_by_platform(&self, platform: PlatformType) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock_nodes()
            .values()
            .filter(|c| c.info().platform == platform)
            .map(|c| c.node_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn get_nodes_by_status(&self, status: ConnectionStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock_nodes()
            .values()
            .filter(|c| c.status() == status)
            .map(|c| c.node_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn get_nodes_by_shard_index(&self, shard_index: u32) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock_nodes()
            .values()
            .filter(|c| c.info().shard_index == shard_index)
            .map(|c| c.node_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Connected nodes ordered by shard index, as `(node_id, player_id)`.
    pub fn signing_targets(&self) -> Vec<(Arc<NodeClient>, u64)> {
        let mut clients: Vec<Arc<NodeClient>> = self
            .lock_nodes()
            .values()
            .filter(|c| c.is_connected())
            .cloned()
            .collect();
        clients.sort_by_key(|c| c.info().shard_index);
        clients
            .into_iter()
            .map(|c| {
                let player_id = c.info().shard_index as u64;
                (c, player_id)
            })
            .collect()
    }

    /// `(node_id, platform, connected, shard_index)` for status reporting.
    pub fn node_summaries(&self) -> Vec<(String, PlatformType, bool, u32)> {
        let mut summaries: Vec<(String, PlatformType, bool, u32)> = self
            .lock_nodes()
            .values()
            .map(|c| {
                (
                    c.node_id().to_string(),
                    c.info().platform,
                    c.is_connected(),
                    c.info().shard_index,
                )
            })
            .collect();
        summaries.sort_by(|a, b| a.0.cmp(&b.0));
        summaries
    }

    pub fn get_stats(&self) -> CoordinatorStats {
        let nodes = self.lock_nodes();
        let total_nodes = nodes.len() as u32;
        let connected_nodes = nodes.values().filter(|c| c.is_connected()).count() as u32;
        let error_nodes = nodes
            .values()
            .filter(|c| c.status() == ConnectionStatus::Error)
            .count() as u32;
        CoordinatorStats {
            total_nodes,
            connected_nodes,
            error_nodes,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullTlsFactory;

    impl ClientTlsFactory for NullTlsFactory {
        fn client_config(
            &self,
            _info: &NodeConnectionInfo,
        ) -> Result<Arc<ClientConfig>, TlsSetupError> {
            // A syntactically valid config with no roots; registration-only
            // tests never dial.
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let roots = rustls::RootCertStore::empty();
            let config = ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|e| TlsSetupError::Config(e.to_string()))?
                .with_root_certificates(roots)
                .with_no_client_auth();
            Ok(Arc::new(config))
        }
    }

    fn info(node_id: &str, shard_index: u32) -> NodeConnectionInfo {
        NodeConnectionInfo {
            node_id: node_id.to_string(),
            platform: PlatformType::Local,
            address: "127.0.0.1".to_string(),
            port: 19100 + shard_index as u16,
            shard_index,
            certificate_path: "node.pem".to_string(),
            private_key_id: "node.key".to_string(),
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(Arc::new(NullTlsFactory), TlsTimeouts::default())
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let coordinator = coordinator();
        coordinator.register_node(info("n1", 0)).unwrap();
        assert!(matches!(
            coordinator.register_node(info("n1", 0)),
            Err(CoordinatorError::DuplicateNode(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister_unknown_fails() {
        let coordinator = coordinator();
        assert!(matches!(
            coordinator.unregister_node("ghost").await,
            Err(CoordinatorError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_queries() {
        let coordinator = coordinator();
        coordinator.register_node(info("n1", 0)).unwrap();
        coordinator.register_node(info("n2", 1)).unwrap();

        assert_eq!(coordinator.get_all_node_ids(), vec!["n1", "n2"]);
        assert!(coordinator.get_connected_node_ids().is_empty());
        assert_eq!(
            coordinator.get_nodes_by_platform(PlatformType::Local),
            vec!["n1", "n2"]
        );
        assert_eq!(coordinator.get_nodes_by_shard_index(1), vec!["n2"]);
        assert_eq!(
            coordinator.get_nodes_by_status(ConnectionStatus::Disconnected),
            vec!["n1", "n2"]
        );

        let stats = coordinator.get_stats();
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.connected_nodes, 0);

        coordinator.unregister_node("n1").await.unwrap();
        assert_eq!(coordinator.get_all_node_ids(), vec!["n2"]);
    }

    #[tokio::test]
    async fn test_broadcast_with_unknown_target_is_false() {
        let coordinator = coordinator();
        let message = CoordinatorNodeMessage::error(0, "probe");
        assert!(
            !coordinator
                .broadcast_to_nodes(&["ghost".to_string()], &message)
                .await
        );
        assert!(!coordinator.broadcast_to_all_connected(&message).await);
    }
}
