//! Accept loop and idle sweeper for the wallet HTTPS listener.

use crate::https::session::{self, now_millis, SessionConfig};
use crate::router::WalletMessageRouter;
use mpc_network::stream::accept_tls;
use mpc_network::{NetworkError, NetworkResult, TlsTimeouts};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WalletServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub handler_threads: usize,
    pub session: SessionConfig,
    pub timeouts: TlsTimeouts,
}

struct SessionHandle {
    cancel: CancellationToken,
    last_activity: Arc<AtomicU64>,
}

/// TLS-terminating HTTP/1.1 ingress for the wallet server.
pub struct WalletHttpsServer {
    config: WalletServerConfig,
    acceptor: TlsAcceptor,
    router: Arc<WalletMessageRouter>,
    handler_permits: Arc<Semaphore>,
    sessions: Arc<Mutex<HashMap<u64, SessionHandle>>>,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl WalletHttpsServer {
    pub fn new(
        config: WalletServerConfig,
        tls_config: Arc<rustls::ServerConfig>,
        router: Arc<WalletMessageRouter>,
    ) -> Self {
        let handler_threads = config.handler_threads.max(1);
        Self {
            config,
            acceptor: TlsAcceptor::from(tls_config),
            router,
            handler_permits: Arc::new(Semaphore::new(handler_threads)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> NetworkResult<()> {
        let bind = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| NetworkError::BindFailed {
                address: bind.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::Syscall(e.to_string()))?;
        *self
            .local_addr
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(local_addr);
        info!(%local_addr, "wallet HTTPS server listening");

        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.acceptor.clone(),
            Arc::clone(&self.router),
            Arc::clone(&self.handler_permits),
            Arc::clone(&self.sessions),
            self.config.clone(),
            self.cancel.clone(),
        ));
        let sweep_task = tokio::spawn(sweep_loop(
            Arc::clone(&self.sessions),
            self.config.session.idle_timeout,
            self.cancel.clone(),
        ));

        let mut tasks = self.tasks.lock().await;
        tasks.push(accept_task);
        tasks.push(sweep_task);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        {
            let sessions = self
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for handle in sessions.values() {
                handle.cancel.cancel();
            }
        }
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        info!("wallet HTTPS server stopped");
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Arc<WalletMessageRouter>,
    handler_permits: Arc<Semaphore>,
    sessions: Arc<Mutex<HashMap<u64, SessionHandle>>>,
    config: WalletServerConfig,
    cancel: CancellationToken,
) {
    let mut next_session_id = 0u64;
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "wallet accept failed");
                continue;
            }
        };

        let session_id = next_session_id;
        next_session_id += 1;

        let session_cancel = cancel.child_token();
        let activity = Arc::new(AtomicU64::new(now_millis()));
        sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                session_id,
                SessionHandle {
                    cancel: session_cancel.clone(),
                    last_activity: Arc::clone(&activity),
                },
            );

        let acceptor = acceptor.clone();
        let router = Arc::clone(&router);
        let permits = Arc::clone(&handler_permits);
        let sessions = Arc::clone(&sessions);
        let session_config = config.session.clone();
        let timeouts = config.timeouts;
        tokio::spawn(async move {
            debug!(%peer, session_id, "wallet connection accepted");
            match accept_tls(socket, acceptor, &timeouts).await {
                Ok(stream) => {
                    session::run_session(
                        stream,
                        router,
                        permits,
                        session_config,
                        session_cancel,
                        activity,
                    )
                    .await;
                }
                Err(e) => {
                    warn!(%peer, error = %e, "wallet TLS handshake failed");
                }
            }
            sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&session_id);
            debug!(%peer, session_id, "wallet connection finished");
        });
    }
}

/// Stop sessions with no activity inside the idle window.
async fn sweep_loop(
    sessions: Arc<Mutex<HashMap<u64, SessionHandle>>>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
        }
        let now = now_millis();
        let idle_ms = idle_timeout.as_millis() as u64;
        let sessions = sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (session_id, handle) in sessions.iter() {
            let last = handle.last_activity.load(Ordering::Relaxed);
            if now.saturating_sub(last) > idle_ms {
                debug!(session_id, "stopping idle wallet session");
                handle.cancel.cancel();
            }
        }
    }
}
