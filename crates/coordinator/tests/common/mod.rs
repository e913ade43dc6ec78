//! Shared fixtures: a throwaway PKI, a local node cluster, and a raw
//! HTTP-over-TLS client for exercising the wallet ingress.

#![allow(dead_code)]

use mpc_coordinator::{ClientTlsFactory, Coordinator};
use mpc_crypto::{CryptoProvider, InMemoryPersistency, LocalCryptoProvider};
use mpc_network::client::NodeConnectionInfo;
use mpc_network::server::{MessageHandler, NodeServer, NodeServerConfig, SecurityPolicy};
use mpc_network::TlsTimeouts;
use mpc_node::NodeMessageRouter;
use mpc_security::{
    CertificateManager, ClientConfigBuilder, LocalKms, LocalResourceLoader, ServerConfigBuilder,
    TlsSetupError,
};
use mpc_types::PlatformType;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// CA plus one CA-signed leaf with loopback SANs, shared by every endpoint
/// in a test.
pub fn write_test_pki(dir: &Path) {
    let ca_key = rcgen::KeyPair::generate().unwrap();
    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = rcgen::KeyPair::generate().unwrap();
    let leaf_cert = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .unwrap()
    .signed_by(&leaf_key, &ca_cert, &ca_key)
    .unwrap();

    std::fs::write(dir.join("ca.pem"), ca_cert.pem()).unwrap();
    std::fs::write(dir.join("leaf.pem"), leaf_cert.pem()).unwrap();
    std::fs::write(dir.join("leaf.key"), leaf_key.serialize_pem()).unwrap();
}

pub fn cert_manager(dir: &Path) -> CertificateManager {
    CertificateManager::new(
        Arc::new(LocalResourceLoader::new(dir)),
        Arc::new(LocalKms::new(dir)),
        "ca.pem",
        "leaf.pem",
        "leaf.key",
    )
}

pub fn server_tls(dir: &Path) -> Arc<rustls::ServerConfig> {
    Arc::new(ServerConfigBuilder::new(cert_manager(dir)).build().unwrap())
}

pub fn client_tls(dir: &Path) -> Arc<rustls::ClientConfig> {
    Arc::new(
        ClientConfigBuilder::new(cert_manager(dir))
            .skip_hostname_verification()
            .build()
            .unwrap(),
    )
}

/// Test factory: the same client config for every node.
pub struct FixedTlsFactory(pub Arc<rustls::ClientConfig>);

impl ClientTlsFactory for FixedTlsFactory {
    fn client_config(
        &self,
        _info: &NodeConnectionInfo,
    ) -> Result<Arc<rustls::ClientConfig>, TlsSetupError> {
        Ok(Arc::clone(&self.0))
    }
}

/// Start one node on an ephemeral loopback port. `delay` stalls every
/// handler invocation, for slow-node scenarios.
pub async fn start_node(
    dir: &Path,
    player_id: u64,
    timeouts: TlsTimeouts,
    delay: Option<Duration>,
) -> NodeServer {
    let provider: Arc<dyn CryptoProvider> = Arc::new(LocalCryptoProvider::new(
        player_id,
        Arc::new(InMemoryPersistency::new()),
    ));
    let router = Arc::new(NodeMessageRouter::new(provider));
    let inner = router.into_message_handler();
    let handler: MessageHandler = match delay {
        Some(delay) => Arc::new(move |message_type, request| {
            std::thread::sleep(delay);
            inner(message_type, request)
        }),
        None => inner,
    };

    let server = NodeServer::new(
        NodeServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            handler_threads: 4,
            timeouts,
        },
        server_tls(dir),
        SecurityPolicy::new(Ipv4Addr::LOCALHOST),
        handler,
    );
    server.start().await.unwrap();
    server
}

/// A connected 3-node cluster behind one coordinator.
pub async fn start_cluster(
    dir: &Path,
    node_count: usize,
    timeouts: TlsTimeouts,
    slow_node: Option<(usize, Duration)>,
) -> (Vec<NodeServer>, Arc<Coordinator>) {
    let mut servers = Vec::with_capacity(node_count);
    for player in 0..node_count {
        let delay = slow_node
            .filter(|(slow_index, _)| *slow_index == player)
            .map(|(_, delay)| delay);
        servers.push(start_node(dir, player as u64, timeouts, delay).await);
    }

    let coordinator = Arc::new(Coordinator::new(
        Arc::new(FixedTlsFactory(client_tls(dir))),
        timeouts,
    ));
    for (player, server) in servers.iter().enumerate() {
        let port = server.local_addr().unwrap().port();
        coordinator
            .register_node(NodeConnectionInfo {
                node_id: format!("n{player}"),
                platform: PlatformType::Local,
                address: "127.0.0.1".to_string(),
                port,
                shard_index: player as u32,
                certificate_path: "leaf.pem".to_string(),
                private_key_id: "leaf.key".to_string(),
            })
            .unwrap();
        coordinator.connect_to_node(&format!("n{player}")).await.unwrap();
    }
    (servers, coordinator)
}

pub type WalletTlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Dial the wallet HTTPS listener with the test client certificate.
pub async fn wallet_connect(dir: &Path, port: u16) -> WalletTlsStream {
    let connector = tokio_rustls::TlsConnector::from(client_tls(dir));
    let socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("127.0.0.1".to_string()).unwrap();
    connector.connect(server_name, socket).await.unwrap()
}

/// Write one POST with the headers the ingress recognizes.
pub async fn write_post<W>(writer: &mut W, path: &str, request_id: Option<&str>, body: &[u8])
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut head = format!(
        "POST {path} HTTP/1.1\r\nContent-Type: application/x-protobuf\r\nContent-Length: {}\r\nUser-Agent: wallet-test/1.0\r\n",
        body.len()
    );
    if let Some(request_id) = request_id {
        head.push_str(&format!("X-Request-ID: {request_id}\r\n"));
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await.unwrap();
    writer.write_all(body).await.unwrap();
    writer.flush().await.unwrap();
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Read one full HTTP/1.1 response (status line, headers, body by
/// Content-Length).
pub async fn read_response(
    reader: &mut BufReader<ReadHalf<WalletTlsStream>>,
) -> HttpResponse {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let status: u16 = line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .unwrap();

    let mut headers = HashMap::new();
    loop {
        let mut header_line = String::new();
        reader.read_line(&mut header_line).await.unwrap();
        let trimmed = header_line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .expect("content-length header")
        .parse()
        .unwrap();
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await.unwrap();

    HttpResponse {
        status,
        headers,
        body,
    }
}

/// Split a wallet TLS stream for independent request writing and response
/// reading.
pub fn split_wallet_stream(
    stream: WalletTlsStream,
) -> (BufReader<ReadHalf<WalletTlsStream>>, WriteHalf<WalletTlsStream>) {
    let (read_half, write_half) = tokio::io::split(stream);
    (BufReader::new(read_half), write_half)
}
