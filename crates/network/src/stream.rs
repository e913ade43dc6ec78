//! Exact-length I/O over TLS streams with per-operation deadlines.
//!
//! tokio-rustls absorbs the TLS layer's WANT_READ/WANT_WRITE into poll
//! readiness, so "retry until the deadline" becomes a timeout wrapped
//! around the async read/write loop. Peer close before the requested
//! length surfaces as `ConnectionClosed` with the byte counts observed.

use crate::error::{NetworkError, NetworkResult};
use mpc_wire::{Frame, FrameHeader, HEADER_LEN};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace};

/// Deadlines for one TLS connection.
#[derive(Debug, Clone, Copy)]
pub struct TlsTimeouts {
    pub handshake: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for TlsTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
        }
    }
}

/// Read exactly `buf.len()` bytes before `deadline`.
pub async fn read_exact_deadline<R>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Instant,
) -> NetworkResult<()>
where
    R: AsyncRead + Unpin,
{
    let expected = buf.len();
    let mut received = 0usize;
    while received < expected {
        let n = tokio::time::timeout_at(deadline, reader.read(&mut buf[received..]))
            .await
            .map_err(|_| NetworkError::Timeout(format!("read {received}/{expected} bytes")))?
            .map_err(NetworkError::from_io)?;
        if n == 0 {
            return Err(NetworkError::ConnectionClosed { received, expected });
        }
        received += n;
    }
    Ok(())
}

/// Write all of `buf` before `deadline`.
pub async fn write_exact_deadline<W>(
    writer: &mut W,
    buf: &[u8],
    deadline: Instant,
) -> NetworkResult<()>
where
    W: AsyncWrite + Unpin,
{
    let expected = buf.len();
    let mut written = 0usize;
    while written < expected {
        let n = tokio::time::timeout_at(deadline, writer.write(&buf[written..]))
            .await
            .map_err(|_| NetworkError::Timeout(format!("wrote {written}/{expected} bytes")))?
            .map_err(NetworkError::from_io)?;
        if n == 0 {
            return Err(NetworkError::ConnectionError(
                "peer stopped accepting bytes".to_string(),
            ));
        }
        written += n;
    }
    tokio::time::timeout_at(deadline, writer.flush())
        .await
        .map_err(|_| NetworkError::Timeout("flush".to_string()))?
        .map_err(NetworkError::from_io)?;
    Ok(())
}

/// Read one framed message.
///
/// The wait for the 32-byte header is unbounded (an idle connection is not
/// an error); once the header arrives, the body must land within
/// `timeouts.read`. Any validation failure is fatal to the connection —
/// closing it is the caller's job.
pub async fn read_frame<R>(reader: &mut R, timeouts: &TlsTimeouts) -> NetworkResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_LEN];
    // First byte may arrive whenever the peer has something to say.
    let n = reader
        .read(&mut header_bytes[..1])
        .await
        .map_err(NetworkError::from_io)?;
    if n == 0 {
        return Err(NetworkError::ConnectionClosed {
            received: 0,
            expected: HEADER_LEN,
        });
    }

    let deadline = Instant::now() + timeouts.read;
    read_exact_deadline(reader, &mut header_bytes[1..], deadline).await?;

    let header = FrameHeader::from_bytes(&header_bytes);
    header.validate_basic()?;

    let mut body = vec![0u8; header.body_length as usize];
    read_exact_deadline(reader, &mut body, deadline).await?;

    let frame = Frame { header, body };
    frame.validate()?;
    trace!(
        request_id = frame.header.request_id,
        message_type = frame.header.message_type,
        body_len = frame.body.len(),
        "frame received"
    );
    Ok(frame)
}

/// Write one framed message within `timeouts.write`.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, timeouts: &TlsTimeouts) -> NetworkResult<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = frame.encode();
    let deadline = Instant::now() + timeouts.write;
    write_exact_deadline(writer, &encoded, deadline).await?;
    trace!(
        request_id = frame.header.request_id,
        message_type = frame.header.message_type,
        body_len = frame.body.len(),
        "frame sent"
    );
    Ok(())
}

fn map_handshake_error(error: std::io::Error) -> NetworkError {
    if let Some(inner) = error.get_ref() {
        if let Some(tls) = inner.downcast_ref::<rustls::Error>() {
            if matches!(tls, rustls::Error::InvalidCertificate(_)) {
                return NetworkError::CertificateVerifyFailed(tls.to_string());
            }
        }
    }
    NetworkError::HandshakeFailed(error.to_string())
}

/// Dial and complete a client-side mTLS handshake:
/// Disconnected → Connecting → Handshaking → Connected.
pub async fn connect_tls(
    address: SocketAddr,
    server_name: ServerName<'static>,
    config: Arc<rustls::ClientConfig>,
    timeouts: &TlsTimeouts,
) -> NetworkResult<tokio_rustls::client::TlsStream<TcpStream>> {
    debug!(%address, "connecting");
    let socket = tokio::time::timeout(timeouts.handshake, TcpStream::connect(address))
        .await
        .map_err(|_| NetworkError::Timeout(format!("tcp connect to {address}")))?
        .map_err(|e| NetworkError::ConnectFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    socket
        .set_nodelay(true)
        .map_err(|e| NetworkError::Syscall(e.to_string()))?;

    debug!(%address, "handshaking");
    let connector = TlsConnector::from(config);
    let stream = tokio::time::timeout(timeouts.handshake, connector.connect(server_name, socket))
        .await
        .map_err(|_| NetworkError::Timeout(format!("tls handshake with {address}")))?
        .map_err(map_handshake_error)?;

    debug!(%address, "connected");
    Ok(stream)
}

/// Complete a server-side mTLS handshake on an accepted socket.
pub async fn accept_tls(
    socket: TcpStream,
    acceptor: TlsAcceptor,
    timeouts: &TlsTimeouts,
) -> NetworkResult<tokio_rustls::server::TlsStream<TcpStream>> {
    socket
        .set_nodelay(true)
        .map_err(|e| NetworkError::Syscall(e.to_string()))?;
    tokio::time::timeout(timeouts.handshake, acceptor.accept(socket))
        .await
        .map_err(|_| NetworkError::Timeout("tls accept handshake".to_string()))?
        .map_err(map_handshake_error)
}

/// Graceful close: send TLS close_notify, then close the socket. A forced
/// close is simply dropping the stream.
pub async fn shutdown_graceful<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    let _ = tokio::time::timeout(Duration::from_secs(2), stream.shutdown()).await;
}

/// Common name from the peer's leaf certificate, for logging.
pub fn peer_common_name(
    certs: Option<&[rustls::pki_types::CertificateDer<'_>]>,
) -> Option<String> {
    use x509_parser::prelude::*;
    let cert = certs?.first()?;
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let result = parsed
        .subject()
        .iter_common_name()
        .next()?
        .as_str()
        .ok()
        .map(str::to_string);
    result
}
