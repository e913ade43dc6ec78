//! Coordinator-side client for one node connection.
//!
//! The client owns a bounded outbound queue, a send worker, a receive
//! worker, and the `request_id → oneshot` table that demultiplexes
//! responses. Reconnection is not attempted here: a failed send surfaces to
//! the caller, and the coordinator decides whether to call `connect` again.

use crate::error::{NetworkError, NetworkResult};
use crate::stream::{self, TlsTimeouts};
use mpc_common::queue::{bounded_queue, PushOutcome, QueueConsumer, QueueProducer};
use mpc_types::{ConnectionStatus, PlatformType};
use mpc_wire::proto::{self, CoordinatorNodeMessage};
use mpc_wire::{Frame, MessageType};
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SEND_QUEUE_CAPACITY: usize = 100;

type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;
pub type ConnectionCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Registration record for one node.
#[derive(Debug, Clone)]
pub struct NodeConnectionInfo {
    pub node_id: String,
    pub platform: PlatformType,
    pub address: String,
    pub port: u16,
    pub shard_index: u32,
    pub certificate_path: String,
    pub private_key_id: String,
}

impl NodeConnectionInfo {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

struct ClientShared {
    node_id: String,
    status: Mutex<ConnectionStatus>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Frame>>>,
    next_request_id: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    on_connected: Mutex<Option<ConnectionCallback>>,
    on_disconnected: Mutex<Option<ConnectionCallback>>,
}

impl ClientShared {
    fn lock_status(&self) -> std::sync::MutexGuard<'_, ConnectionStatus> {
        self.status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.lock_status() = status;
    }

    fn status(&self) -> ConnectionStatus {
        *self.lock_status()
    }

    /// Fail every outstanding request with `Disconnected` by dropping its
    /// completion sender.
    fn fail_all_pending(&self) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = pending.len();
        pending.clear();
        if count > 0 {
            warn!(node_id = %self.node_id, count, "failed outstanding requests");
        }
    }

    /// Transition out of `Connected`; returns whether this call did the
    /// transition (so the disconnect callback fires once).
    fn transition_disconnected(&self, to: ConnectionStatus) -> bool {
        let mut status = self.lock_status();
        let was_connected = *status == ConnectionStatus::Connected;
        *status = to;
        was_connected
    }

    fn fire_connected(&self) {
        let callback = self
            .on_connected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(&self.node_id);
        }
    }

    fn fire_disconnected(&self) {
        let callback = self
            .on_disconnected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(&self.node_id);
        }
    }
}

struct ActiveConnection {
    send_queue: QueueProducer<Frame>,
    cancel: CancellationToken,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

pub struct NodeClient {
    info: NodeConnectionInfo,
    tls_config: Arc<rustls::ClientConfig>,
    timeouts: TlsTimeouts,
    shared: Arc<ClientShared>,
    conn: tokio::sync::Mutex<Option<ActiveConnection>>,
}

impl NodeClient {
    pub fn new(
        info: NodeConnectionInfo,
        tls_config: Arc<rustls::ClientConfig>,
        timeouts: TlsTimeouts,
    ) -> Self {
        let shared = Arc::new(ClientShared {
            node_id: info.node_id.clone(),
            status: Mutex::new(ConnectionStatus::Disconnected),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            on_connected: Mutex::new(None),
            on_disconnected: Mutex::new(None),
        });
        Self {
            info,
            tls_config,
            timeouts,
            shared,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub fn info(&self) -> &NodeConnectionInfo {
        &self.info
    }

    pub fn node_id(&self) -> &str {
        &self.info.node_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn pending_request_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn messages_sent(&self) -> u64 {
        self.shared.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.shared.messages_received.load(Ordering::Relaxed)
    }

    pub fn set_connected_callback(&self, callback: ConnectionCallback) {
        *self
            .shared
            .on_connected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
    }

    pub fn set_disconnected_callback(&self, callback: ConnectionCallback) {
        *self
            .shared
            .on_disconnected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
    }

    /// Establish the TLS connection and spawn the worker pair. A no-op when
    /// already connected.
    pub async fn connect(&self) -> NetworkResult<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Ok(());
        }

        self.shared.set_status(ConnectionStatus::Connecting);
        let endpoint = self.info.endpoint();
        let address = tokio::net::lookup_host(&endpoint)
            .await
            .map_err(|e| NetworkError::ConnectFailed {
                address: endpoint.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| NetworkError::ConnectFailed {
                address: endpoint.clone(),
                reason: "no addresses resolved".to_string(),
            })?;

        let server_name = ServerName::try_from(self.info.address.clone()).map_err(|e| {
            NetworkError::ConnectFailed {
                address: endpoint.clone(),
                reason: format!("invalid server name: {e}"),
            }
        })?;

        self.shared.set_status(ConnectionStatus::Handshaking);
        let tls_stream = match stream::connect_tls(
            address,
            server_name,
            Arc::clone(&self.tls_config),
            &self.timeouts,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.set_status(ConnectionStatus::Error);
                return Err(e);
            }
        };

        let (reader, writer) = tokio::io::split(tls_stream);
        let (producer, consumer) = bounded_queue::<Frame>(SEND_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();

        let send_task = tokio::spawn(send_worker(
            writer,
            consumer,
            cancel.clone(),
            Arc::clone(&self.shared),
            self.timeouts,
        ));
        let recv_task = tokio::spawn(recv_worker(
            reader,
            cancel.clone(),
            Arc::clone(&self.shared),
            self.timeouts,
        ));

        *conn = Some(ActiveConnection {
            send_queue: producer,
            cancel,
            send_task,
            recv_task,
        });
        self.shared.set_status(ConnectionStatus::Connected);
        info!(node_id = %self.info.node_id, %endpoint, "node connected");
        self.shared.fire_connected();
        Ok(())
    }

    /// Close the connection, join the workers, and fail every outstanding
    /// request with `Disconnected`.
    pub async fn disconnect(&self) {
        let taken = self.conn.lock().await.take();
        let Some(active) = taken else {
            return;
        };

        self.shared.set_status(ConnectionStatus::Disconnecting);
        active.cancel.cancel();
        drop(active.send_queue);
        let _ = active.send_task.await;
        let _ = active.recv_task.await;

        self.shared.fail_all_pending();
        let fired = self
            .shared
            .transition_disconnected(ConnectionStatus::Disconnected);
        if fired {
            self.shared.fire_disconnected();
        }
        info!(node_id = %self.info.node_id, "node disconnected");
    }

    /// Assign a request id, register the completion slot, and enqueue the
    /// frame. Returns the id and the future for the matching response.
    pub async fn send_request_async(
        &self,
        message: &CoordinatorNodeMessage,
    ) -> NetworkResult<(u64, oneshot::Receiver<Frame>)> {
        if !self.is_connected() {
            return Err(NetworkError::Disconnected);
        }

        let message_type = MessageType::from_u16(message.message_type as u16)
            .ok_or_else(|| NetworkError::ProtobufParse("unknown message type".to_string()))?;
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::new(message_type, request_id, proto::encode(message));

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(request_id, tx);

        let conn = self.conn.lock().await;
        let Some(active) = conn.as_ref() else {
            self.remove_pending(request_id);
            return Err(NetworkError::Disconnected);
        };
        match active.send_queue.try_push(frame) {
            PushOutcome::Success => {}
            PushOutcome::Full => {
                self.remove_pending(request_id);
                return Err(NetworkError::QueueFull);
            }
            PushOutcome::Timeout | PushOutcome::Shutdown => {
                self.remove_pending(request_id);
                return Err(NetworkError::Disconnected);
            }
        }
        Ok((request_id, rx))
    }

    /// Blocking round-trip bounded by the read timeout. On timeout the
    /// pending entry is left in place and a late response is dropped
    /// silently by the receive worker.
    pub async fn send_request(
        &self,
        message: &CoordinatorNodeMessage,
    ) -> NetworkResult<CoordinatorNodeMessage> {
        let (request_id, rx) = self.send_request_async(message).await?;
        match tokio::time::timeout(self.timeouts.read, rx).await {
            Err(_) => Err(NetworkError::Timeout(format!(
                "request {request_id} to node {}",
                self.info.node_id
            ))),
            Ok(Err(_)) => Err(NetworkError::Disconnected),
            Ok(Ok(frame)) => proto::decode::<CoordinatorNodeMessage>(&frame.body)
                .map_err(|e| NetworkError::ProtobufParse(e.to_string())),
        }
    }

    fn remove_pending(&self, request_id: u64) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&request_id);
    }
}

async fn send_worker(
    mut writer: WriteHalf<TlsStream>,
    mut queue: QueueConsumer<Frame>,
    cancel: CancellationToken,
    shared: Arc<ClientShared>,
    timeouts: TlsTimeouts,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                stream::shutdown_graceful(&mut writer).await;
                break;
            }
            item = queue.pop() => {
                let Some(frame) = item else {
                    stream::shutdown_graceful(&mut writer).await;
                    break;
                };
                if let Err(e) = stream::write_frame(&mut writer, &frame, &timeouts).await {
                    warn!(node_id = %shared.node_id, error = %e, "send worker stopping");
                    if shared.transition_disconnected(ConnectionStatus::Error) {
                        shared.fail_all_pending();
                        shared.fire_disconnected();
                    }
                    cancel.cancel();
                    break;
                }
                shared.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

async fn recv_worker(
    mut reader: ReadHalf<TlsStream>,
    cancel: CancellationToken,
    shared: Arc<ClientShared>,
    timeouts: TlsTimeouts,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = stream::read_frame(&mut reader, &timeouts) => {
                match result {
                    Ok(frame) => {
                        shared.messages_received.fetch_add(1, Ordering::Relaxed);
                        let request_id = frame.header.request_id;
                        let sender = shared
                            .pending
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .remove(&request_id);
                        match sender {
                            Some(tx) => {
                                if tx.send(frame).is_err() {
                                    debug!(
                                        node_id = %shared.node_id,
                                        request_id,
                                        "late response dropped"
                                    );
                                }
                            }
                            None => {
                                warn!(
                                    node_id = %shared.node_id,
                                    request_id,
                                    "response for unknown request id dropped"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        let next = if e.is_disconnection() {
                            ConnectionStatus::Disconnected
                        } else {
                            ConnectionStatus::Error
                        };
                        if shared.transition_disconnected(next) {
                            warn!(node_id = %shared.node_id, error = %e, "receive worker stopping");
                            shared.fail_all_pending();
                            shared.fire_disconnected();
                        }
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    }
}
