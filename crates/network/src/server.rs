//! Node-side server for the single trusted coordinator connection.
//!
//! Admission happens before the TLS handshake: an accepted socket whose
//! peer IPv4 is not the trusted coordinator is dropped with zero bytes
//! written. At most one connection is live; a new matching accept force-
//! closes the previous one. Per connection there is one receive loop, one
//! send loop draining a bounded response queue, and a handler pool bounded
//! by `handler_threads` permits.

use crate::error::{NetworkError, NetworkResult};
use crate::stream::{self, TlsTimeouts};
use mpc_common::queue::{bounded_queue, PushOutcome, QueueProducer};
use mpc_wire::proto::{self, CoordinatorNodeMessage};
use mpc_wire::{Frame, MessageType};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RESPONSE_QUEUE_CAPACITY: usize = 100;
const RESPONSE_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler invoked for each decoded request; returns the response message.
/// Runs on the handler pool; panics are caught and converted to error
/// responses.
pub type MessageHandler =
    Arc<dyn Fn(MessageType, CoordinatorNodeMessage) -> CoordinatorNodeMessage + Send + Sync>;

/// Admission policy: one trusted coordinator IPv4.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    pub trusted_coordinator_ip: Ipv4Addr,
    pub strict: bool,
}

impl SecurityPolicy {
    pub fn new(trusted_coordinator_ip: Ipv4Addr) -> Self {
        Self {
            trusted_coordinator_ip,
            strict: true,
        }
    }

    pub fn allows(&self, peer: IpAddr) -> bool {
        if !self.strict {
            return true;
        }
        match peer {
            IpAddr::V4(v4) => v4 == self.trusted_coordinator_ip,
            IpAddr::V6(v6) => v6.to_ipv4_mapped() == Some(self.trusted_coordinator_ip),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub handler_threads: usize,
    pub timeouts: TlsTimeouts,
}

/// Counters mirrored into status reporting.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_processed: u64,
    pub handler_errors: u64,
    pub rejected_connections: u64,
    pub pending_requests: usize,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    processed: AtomicU64,
    handler_errors: AtomicU64,
    rejected: AtomicU64,
}

struct ServerShared {
    policy: SecurityPolicy,
    handler: MessageHandler,
    handler_permits: Arc<Semaphore>,
    timeouts: TlsTimeouts,
    accepting: AtomicBool,
    pending_requests: AtomicUsize,
    counters: Counters,
    conn_seq: AtomicU64,
    current_conn: Mutex<Option<(u64, CancellationToken)>>,
}

impl ServerShared {
    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Option<(u64, CancellationToken)>> {
        self.current_conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub struct NodeServer {
    config: NodeServerConfig,
    acceptor: TlsAcceptor,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl NodeServer {
    pub fn new(
        config: NodeServerConfig,
        tls_config: Arc<rustls::ServerConfig>,
        policy: SecurityPolicy,
        handler: MessageHandler,
    ) -> Self {
        let handler_threads = config.handler_threads.max(1);
        let shared = Arc::new(ServerShared {
            policy,
            handler,
            handler_permits: Arc::new(Semaphore::new(handler_threads)),
            timeouts: config.timeouts,
            accepting: AtomicBool::new(true),
            pending_requests: AtomicUsize::new(0),
            counters: Counters::default(),
            conn_seq: AtomicU64::new(0),
            current_conn: Mutex::new(None),
        });
        Self {
            config,
            acceptor: TlsAcceptor::from(tls_config),
            shared,
            cancel: CancellationToken::new(),
            accept_task: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind and spawn the accept loop.
    pub async fn start(&self) -> NetworkResult<()> {
        let bind = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| NetworkError::BindFailed {
                address: bind.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| NetworkError::Syscall(e.to_string()))?;
        *self
            .local_addr
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(local_addr);

        info!(
            %local_addr,
            trusted = %self.shared.policy.trusted_coordinator_ip,
            "node server listening"
        );

        let shared = Arc::clone(&self.shared);
        let acceptor = self.acceptor.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(accept_loop(listener, acceptor, shared, cancel));
        *self.accept_task.lock().await = Some(task);
        Ok(())
    }

    /// The bound address, available after `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn has_active_connection(&self) -> bool {
        self.shared.lock_conn().is_some()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending_requests.load(Ordering::Relaxed)
    }

    pub fn stop_accepting_connections(&self) {
        self.shared.accepting.store(false, Ordering::Relaxed);
    }

    /// Stop accepting, wait for in-flight handlers to drain (bounded by
    /// `timeout`), then stop the workers. Returns whether the drain
    /// completed in time.
    pub async fn prepare_shutdown(&self, timeout: Duration) -> bool {
        self.stop_accepting_connections();
        let deadline = tokio::time::Instant::now() + timeout;
        while self.pending_requests() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    pending = self.pending_requests(),
                    "shutdown drain timed out"
                );
                self.stop().await;
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.stop().await;
        true
    }

    /// Stop workers and close the listener and any live connection.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some((_, conn)) = self.shared.lock_conn().take() {
            conn.cancel();
        }
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
    }

    pub fn stats(&self) -> ServerStats {
        let c = &self.shared.counters;
        ServerStats {
            messages_received: c.received.load(Ordering::Relaxed),
            messages_sent: c.sent.load(Ordering::Relaxed),
            messages_processed: c.processed.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            rejected_connections: c.rejected.load(Ordering::Relaxed),
            pending_requests: self.pending_requests(),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        if !shared.accepting.load(Ordering::Relaxed) {
            debug!(%peer, "rejecting connection during shutdown");
            drop(socket);
            continue;
        }

        // Admission check happens before any TLS bytes are exchanged.
        if !shared.policy.allows(peer.ip()) {
            shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(%peer, "rejected connection from untrusted address");
            drop(socket);
            continue;
        }

        // Single-connection policy: a new matching accept wins.
        let conn_cancel = cancel.child_token();
        let conn_id = shared.conn_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut current = shared.lock_conn();
            if let Some((previous_id, previous)) = current.take() {
                info!(%peer, previous_id, "force-closing previous coordinator connection");
                previous.cancel();
            }
            *current = Some((conn_id, conn_cancel.clone()));
        }

        let shared_conn = Arc::clone(&shared);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            handle_connection(socket, peer, acceptor, Arc::clone(&shared_conn), conn_cancel).await;
            // Clear the slot only if a newer connection has not replaced it.
            let mut current = shared_conn.lock_conn();
            if matches!(current.as_ref(), Some((id, _)) if *id == conn_id) {
                *current = None;
            }
        });
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
) {
    let tls_stream = match stream::accept_tls(socket, acceptor, &shared.timeouts).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, error = %e, "coordinator handshake failed");
            return;
        }
    };
    let peer_cn = stream::peer_common_name(tls_stream.get_ref().1.peer_certificates());
    info!(%peer, common_name = peer_cn.as_deref().unwrap_or("-"), "coordinator connected");

    let (mut reader, writer) = tokio::io::split(tls_stream);
    let (response_tx, response_rx) = bounded_queue::<Frame>(RESPONSE_QUEUE_CAPACITY);

    let send_shared = Arc::clone(&shared);
    let send_cancel = cancel.clone();
    let send_task = tokio::spawn(async move {
        let mut writer = writer;
        let mut queue = response_rx;
        loop {
            tokio::select! {
                _ = send_cancel.cancelled() => {
                    stream::shutdown_graceful(&mut writer).await;
                    break;
                }
                item = queue.pop() => {
                    let Some(frame) = item else {
                        stream::shutdown_graceful(&mut writer).await;
                        break;
                    };
                    if let Err(e) = stream::write_frame(&mut writer, &frame, &send_shared.timeouts).await {
                        warn!(error = %e, "send loop stopping");
                        send_cancel.cancel();
                        break;
                    }
                    send_shared.counters.sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    // Receive loop: one framed request at a time, dispatched to the pool.
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = stream::read_frame(&mut reader, &shared.timeouts) => result,
        };
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                match &e {
                    NetworkError::ConnectionClosed { .. } => {
                        info!(%peer, "coordinator closed the connection")
                    }
                    other => warn!(%peer, error = %other, "fatal receive error, closing connection"),
                }
                cancel.cancel();
                break;
            }
        };

        shared.counters.received.fetch_add(1, Ordering::Relaxed);
        let request = match proto::decode::<CoordinatorNodeMessage>(&frame.body) {
            Ok(request) => request,
            Err(e) => {
                // Protobuf failures are protocol errors, fatal to the
                // connection like any framing failure.
                warn!(%peer, error = %e, "protobuf parse failed, closing connection");
                cancel.cancel();
                break;
            }
        };
        let Some(message_type) = frame.header.message_type() else {
            cancel.cancel();
            break;
        };

        shared.pending_requests.fetch_add(1, Ordering::Relaxed);
        let handler_shared = Arc::clone(&shared);
        let response_queue = response_tx.clone();
        let request_id = frame.header.request_id;
        tokio::spawn(async move {
            let Ok(_permit) = handler_shared.handler_permits.acquire().await else {
                handler_shared.pending_requests.fetch_sub(1, Ordering::Relaxed);
                return;
            };
            let response = run_handler(&handler_shared, message_type, request);
            enqueue_response(&handler_shared, &response_queue, message_type, request_id, response)
                .await;
            handler_shared.pending_requests.fetch_sub(1, Ordering::Relaxed);
        });
    }

    cancel.cancel();
    let _ = send_task.await;
    info!(%peer, "coordinator connection closed");
}

/// Run the registered handler, converting panics into error responses; a
/// handler failure never tears down the connection.
fn run_handler(
    shared: &ServerShared,
    message_type: MessageType,
    request: CoordinatorNodeMessage,
) -> CoordinatorNodeMessage {
    let original_type = request.message_type;
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        (shared.handler)(message_type, request)
    }));
    match outcome {
        Ok(response) => {
            shared.counters.processed.fetch_add(1, Ordering::Relaxed);
            response
        }
        Err(panic) => {
            shared.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            warn!(message_type = ?message_type, %reason, "handler panicked");
            proto::CoordinatorNodeMessage::error(original_type, reason)
        }
    }
}

async fn enqueue_response(
    shared: &ServerShared,
    queue: &QueueProducer<Frame>,
    request_type: MessageType,
    request_id: u64,
    response: CoordinatorNodeMessage,
) {
    let response_type =
        MessageType::from_u16(response.message_type as u16).unwrap_or(MessageType::Error);
    let frame = Frame::new(response_type, request_id, proto::encode(&response));
    match queue
        .push_timeout(frame, RESPONSE_ENQUEUE_TIMEOUT)
        .await
    {
        PushOutcome::Success => {}
        PushOutcome::Full | PushOutcome::Timeout => {
            shared.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
            warn!(request_id, ?request_type, "response queue full, dropping response");
        }
        PushOutcome::Shutdown => {
            debug!(request_id, "connection closed before response could be sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_policy_matches_only_trusted_v4() {
        let policy = SecurityPolicy::new(Ipv4Addr::new(10, 0, 0, 1));
        assert!(policy.allows(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(!policy.allows(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
        assert!(!policy.allows("::1".parse().unwrap()));
        assert!(policy.allows("::ffff:10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_relaxed_policy_allows_all() {
        let mut policy = SecurityPolicy::new(Ipv4Addr::LOCALHOST);
        policy.strict = false;
        assert!(policy.allows(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }
}
