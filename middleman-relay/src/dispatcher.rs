//! Control-plane front door.
//!
//! Each inbound TCP connection carries one length-prefixed
//! [`ControlRequest`]. The dispatcher resolves it against the
//! [`RoomRegistry`], writes one [`ControlResponse`], and then either hands
//! the connection to the room as a relay client (success) or closes it
//! (error).
//!
//! The reply is always written before the hand-off so that no relay bytes
//! can reach the client ahead of it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use middleman_proto::codec::{self, CodecError, HEADER_LEN};
use middleman_proto::control::{ControlRequest, ControlResponse, ErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::registry::{RegistryError, RoomRegistry};
use crate::room::RoomHandle;

/// Limits applied to control handshakes.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Largest accepted request payload in bytes.
    pub max_control_frame: usize,
    /// Upper bound on reading the request.
    pub control_timeout: Duration,
    /// Handshakes processed concurrently; further connections wait.
    pub max_pending_handshakes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_control_frame: 4096,
            control_timeout: Duration::from_secs(5),
            max_pending_handshakes: 10,
        }
    }
}

/// Errors reported back to the requesting control connection.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The request could not be read or decoded.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// No live room has the join code.
    #[error("invalid join code: {0}")]
    InvalidJoinCode(String),
    /// Room creation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<CodecError> for DispatchError {
    fn from(err: CodecError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl DispatchError {
    /// Wire classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::InvalidJoinCode(_) => ErrorKind::InvalidJoinCode,
            Self::Registry(RegistryError::ServiceUnavailable(_)) => ErrorKind::ServiceUnavailable,
            Self::Registry(RegistryError::BackendUnreachable { .. }) => {
                ErrorKind::BackendUnreachable
            }
            Self::Registry(RegistryError::CapacityReached(_)) => ErrorKind::RoomLimitReached,
            Self::Registry(RegistryError::ShuttingDown) => ErrorKind::ShuttingDown,
        }
    }

    /// Error reply for this error.
    #[must_use]
    pub fn to_response(&self) -> ControlResponse {
        ControlResponse::error(self.kind(), self.to_string())
    }
}

/// Reads one length-prefixed request from `stream`.
///
/// Reads exactly the frame and nothing after it.
///
/// # Errors
///
/// Returns [`DispatchError::InvalidRequest`] on I/O failure, an empty or
/// oversized frame, or an undecodable payload.
pub async fn read_request<S>(stream: &mut S, max_frame: usize) -> Result<ControlRequest, DispatchError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| DispatchError::InvalidRequest(format!("failed to read frame header: {e}")))?;

    let len = codec::payload_len(header);
    if len == 0 {
        return Err(DispatchError::InvalidRequest("empty request frame".to_string()));
    }
    if len > max_frame {
        return Err(DispatchError::InvalidRequest(format!(
            "request frame too large: {len} bytes (max {max_frame})"
        )));
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| DispatchError::InvalidRequest(format!("failed to read request: {e}")))?;

    Ok(codec::decode_request(&payload)?)
}

/// Writes one length-prefixed response to `stream`.
///
/// # Errors
///
/// Returns an I/O error if encoding or the write fails.
pub async fn write_response<S>(stream: &mut S, response: &ControlResponse) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let framed = codec::encode_response(response)
        .and_then(|payload| codec::frame(&payload))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_all(&framed).await?;
    stream.flush().await
}

/// Accepts control connections and routes them into rooms.
pub struct Dispatcher {
    registry: Arc<RoomRegistry>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    /// Creates a dispatcher over `registry`.
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>, config: DispatcherConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_pending_handshakes.max(1)));
        Self {
            registry,
            config,
            permits,
        }
    }

    /// Runs the accept loop until the listener fails permanently.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept control connection");
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                tracing::error!("handshake semaphore closed, stopping accept loop");
                return;
            };

            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                dispatcher.handle_connection(stream, peer).await;
                drop(permit);
            });
        }
    }

    /// Serves one control connection end to end.
    pub async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        tracing::debug!(peer = %peer, "control connection accepted");

        let (room, reply) = match self.resolve(&mut stream).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "control request rejected");
                if let Err(write_err) = write_response(&mut stream, &e.to_response()).await {
                    tracing::debug!(peer = %peer, error = %write_err, "failed to send error reply");
                }
                let _ = stream.shutdown().await;
                return;
            }
        };

        if let Err(e) = write_response(&mut stream, &reply).await {
            tracing::warn!(peer = %peer, join_code = %room.join_code(), error = %e, "failed to send reply");
            return;
        }

        if let Err(e) = room.add_client(stream) {
            tracing::warn!(peer = %peer, join_code = %room.join_code(), error = %e, "room closed before client attached");
        }
    }

    /// Reads the request and resolves it to a room plus the success reply.
    async fn resolve(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(RoomHandle, ControlResponse), DispatchError> {
        let request = tokio::time::timeout(
            self.config.control_timeout,
            read_request(stream, self.config.max_control_frame),
        )
        .await
        .map_err(|_| DispatchError::InvalidRequest("timed out waiting for request".to_string()))??;

        match request {
            ControlRequest::CreateRoom { service_name } => {
                let room = self.registry.create_room(&service_name).await?;
                let reply = ControlResponse::success(Some(room.join_code().to_string()));
                Ok((room, reply))
            }
            ControlRequest::JoinRoom { join_code } => {
                let room = self
                    .registry
                    .get_room(&join_code)
                    .filter(|room| room.state().is_open())
                    .ok_or(DispatchError::InvalidJoinCode(join_code))?;
                tracing::info!(join_code = %room.join_code(), "client joining room");
                Ok((room, ControlResponse::success(None)))
            }
        }
    }
}

/// Binds the control listener and spawns the accept loop.
///
/// Returns the bound address (useful with port `0`) and the accept loop's
/// join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
    registry: Arc<RoomRegistry>,
    config: DispatcherConfig,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let dispatcher = Arc::new(Dispatcher::new(registry, config));
    let handle = tokio::spawn(dispatcher.serve(listener));

    Ok((bound_addr, handle))
}
