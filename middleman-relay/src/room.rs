//! Room relay engine.
//!
//! A [`Room`] owns one backend connection and the client connections
//! attached to it. Once started it runs on its own task, waiting on
//! readiness for the backend, every client, and its command mailbox, and
//! relays raw bytes:
//!
//! - client data is written verbatim to the backend;
//! - backend data is written verbatim to every client in attach order.
//!
//! Backend data is left in the socket until the first client attaches.
//! A failing client is removed on its own. A failing backend, an explicit
//! stop, or an empty client set closes the whole room.
//!
//! # Lifecycle
//!
//! `Init -> ConnectingBackend -> Active -> Closing -> Closed`
//!
//! A backend connect failure goes `ConnectingBackend -> Closing -> Closed`
//! without reaching `Active`. `Closed` is terminal.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::directory::BackendAddress;
use crate::registry::RoomRegistry;

/// Lifecycle state of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Created, not yet started.
    Init,
    /// Connecting to the backend service.
    ConnectingBackend,
    /// Relaying traffic.
    Active,
    /// Releasing sockets and leaving the registry.
    Closing,
    /// Fully torn down.
    Closed,
}

impl RoomState {
    /// Returns `true` if the state machine permits moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::ConnectingBackend)
                | (Self::ConnectingBackend, Self::Active | Self::Closing)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    /// Returns `true` while the room can still accept clients.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Init | Self::ConnectingBackend | Self::Active)
    }
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::ConnectingBackend => "connecting_backend",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by room operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The backend connection could not be established.
    #[error("backend {addr} unreachable: {source}")]
    BackendUnreachable {
        /// Address that was dialed.
        addr: BackendAddress,
        /// Underlying connect error.
        source: io::Error,
    },
    /// The room is closing or closed and accepts no further operations.
    #[error("room is closed")]
    Closed,
}

/// Tuning knobs for a room's relay loop.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Upper bound on a single readiness wait.
    pub poll_interval: Duration,
    /// Maximum bytes read from one socket per event.
    pub read_chunk_size: usize,
    /// Upper bound on the backend connect at start.
    pub connect_timeout: Duration,
    /// Upper bound on writing one chunk to one client.
    pub client_write_timeout: Duration,
    /// Upper bound on writing one chunk to the backend.
    pub backend_write_timeout: Duration,
    /// How long a room that never had a client may stay open.
    pub join_grace: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            read_chunk_size: 4096,
            connect_timeout: Duration::from_secs(5),
            client_write_timeout: Duration::from_secs(5),
            backend_write_timeout: Duration::from_secs(5),
            join_grace: Duration::from_secs(10),
        }
    }
}

/// Messages delivered to a running room.
#[derive(Debug)]
enum RoomCommand {
    AddClient(TcpStream),
    Stop,
}

/// State shared between a room's task and its handles.
#[derive(Debug)]
struct RoomShared {
    state: watch::Sender<RoomState>,
    client_count: AtomicUsize,
}

/// Cloneable handle to a room, held by the registry and the dispatcher.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    join_code: Arc<str>,
    backend_addr: BackendAddress,
    commands: mpsc::UnboundedSender<RoomCommand>,
    shared: Arc<RoomShared>,
}

impl RoomHandle {
    /// Join code of the room.
    #[must_use]
    pub fn join_code(&self) -> &str {
        &self.join_code
    }

    /// Backend the room relays to.
    #[must_use]
    pub const fn backend_addr(&self) -> &BackendAddress {
        &self.backend_addr
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RoomState {
        *self.shared.state.borrow()
    }

    /// Number of clients currently attached.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.client_count.load(Ordering::Acquire)
    }

    /// Hands a client connection to the room.
    ///
    /// Safe to call while the room loop is running; the loop picks the
    /// client up on its next wake.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Closed`] if the room is closing or closed. The
    /// stream is dropped (and therefore closed) in that case.
    pub fn add_client(&self, stream: TcpStream) -> Result<(), RoomError> {
        if !self.state().is_open() {
            return Err(RoomError::Closed);
        }
        self.commands
            .send(RoomCommand::AddClient(stream))
            .map_err(|_| RoomError::Closed)
    }

    /// Asks the room to close. A no-op once the room is closed.
    pub fn stop(&self) {
        let _ = self.commands.send(RoomCommand::Stop);
    }

    /// Returns `true` if both handles drive the same room.
    #[must_use]
    pub fn same_room(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Waits until the room reaches [`RoomState::Closed`].
    pub async fn wait_closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == RoomState::Closed).await;
    }
}

/// Why a room is closing.
#[derive(Debug)]
enum CloseReason {
    BackendClosed,
    BackendError(io::Error),
    Empty,
    Stopped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BackendClosed => f.write_str("backend closed the connection"),
            Self::BackendError(e) => write!(f, "backend i/o error: {e}"),
            Self::Empty => f.write_str("no clients left"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// One wake of the relay loop.
#[derive(Debug)]
enum Event {
    Backend(io::Result<()>),
    Client(u64, io::Result<()>),
    Command(Option<RoomCommand>),
    Tick,
}

#[derive(Debug)]
struct ClientConnection {
    id: u64,
    peer: Option<SocketAddr>,
    stream: TcpStream,
}

/// The relay engine for one room. Owned by the room's task once started.
pub struct Room {
    join_code: Arc<str>,
    backend_addr: BackendAddress,
    config: RoomConfig,
    registry: Arc<RoomRegistry>,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
    shared: Arc<RoomShared>,
    backend: Option<TcpStream>,
    clients: Vec<ClientConnection>,
    next_client_id: u64,
    had_client: bool,
    opened_at: Instant,
}

impl Room {
    /// Creates a room in [`RoomState::Init`] and the handle that drives it.
    #[must_use]
    pub fn new(
        join_code: &str,
        backend_addr: BackendAddress,
        config: RoomConfig,
        registry: Arc<RoomRegistry>,
    ) -> (Self, RoomHandle) {
        let join_code: Arc<str> = Arc::from(join_code);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RoomShared {
            state: watch::Sender::new(RoomState::Init),
            client_count: AtomicUsize::new(0),
        });

        let handle = RoomHandle {
            join_code: Arc::clone(&join_code),
            backend_addr: backend_addr.clone(),
            commands: tx,
            shared: Arc::clone(&shared),
        };

        let room = Self {
            join_code,
            backend_addr,
            config,
            registry,
            commands: rx,
            shared,
            backend: None,
            clients: Vec::new(),
            next_client_id: 0,
            had_client: false,
            opened_at: Instant::now(),
        };

        (room, handle)
    }

    /// Connects to the backend and spawns the relay loop on its own task.
    ///
    /// On failure the room goes straight to [`RoomState::Closed`]; the
    /// caller is responsible for dropping any registry entry it made.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::BackendUnreachable`] if the connect fails or
    /// exceeds the configured timeout.
    pub async fn start(mut self) -> Result<JoinHandle<()>, RoomError> {
        self.transition(RoomState::ConnectingBackend);

        let addr = self.backend_addr.to_string();
        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(addr.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.abort_start(e)),
            Err(_) => {
                return Err(self.abort_start(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "backend connect timed out",
                )));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(join_code = %self.join_code, error = %e, "failed to set TCP_NODELAY on backend");
        }

        self.backend = Some(stream);
        self.opened_at = Instant::now();
        self.transition(RoomState::Active);
        tracing::info!(join_code = %self.join_code, backend = %self.backend_addr, "room active");

        Ok(tokio::spawn(self.run()))
    }

    fn abort_start(mut self, source: io::Error) -> RoomError {
        tracing::warn!(
            join_code = %self.join_code,
            backend = %self.backend_addr,
            error = %source,
            "backend connect failed"
        );
        self.transition(RoomState::Closing);
        // Clients queued before the connect finished are dropped with the mailbox.
        self.commands.close();
        self.transition(RoomState::Closed);
        RoomError::BackendUnreachable {
            addr: self.backend_addr.clone(),
            source,
        }
    }

    async fn run(mut self) {
        let mut buf = vec![0u8; self.config.read_chunk_size.max(1)];

        let reason = loop {
            let event = self.next_event().await;
            if let Some(reason) = self.handle_event(event, &mut buf).await {
                break reason;
            }
            if self.clients.is_empty() && self.empty_rule_applies() {
                break CloseReason::Empty;
            }
        };

        self.close(reason).await;
    }

    /// Waits for the next readiness event, command, or poll timeout.
    async fn next_event(&mut self) -> Event {
        let Some(backend) = self.backend.as_ref() else {
            return Event::Backend(Err(io::ErrorKind::NotConnected.into()));
        };

        // Backend data stays queued in the socket until someone can receive it.
        let watch_backend = self.had_client;
        let mut readable: FuturesUnordered<_> = self
            .clients
            .iter()
            .map(|client| async move { (client.id, client.stream.readable().await) })
            .collect();

        tokio::select! {
            ready = backend.readable(), if watch_backend => Event::Backend(ready),
            Some((id, ready)) = readable.next() => Event::Client(id, ready),
            command = self.commands.recv() => Event::Command(command),
            () = tokio::time::sleep(self.config.poll_interval) => Event::Tick,
        }
    }

    async fn handle_event(&mut self, event: Event, buf: &mut [u8]) -> Option<CloseReason> {
        match event {
            Event::Tick => None,
            Event::Command(Some(RoomCommand::AddClient(stream))) => {
                self.attach(stream);
                None
            }
            // All handles gone means nobody can reach this room any more.
            Event::Command(Some(RoomCommand::Stop) | None) => Some(CloseReason::Stopped),
            Event::Backend(Ok(())) => self.relay_from_backend(buf).await,
            Event::Backend(Err(e)) => Some(CloseReason::BackendError(e)),
            Event::Client(id, Ok(())) => self.relay_from_client(id, buf).await,
            Event::Client(id, Err(e)) => {
                tracing::warn!(join_code = %self.join_code, client_id = id, error = %e, "client readiness error");
                self.remove_client(id).await;
                None
            }
        }
    }

    async fn relay_from_backend(&mut self, buf: &mut [u8]) -> Option<CloseReason> {
        let backend = self.backend.as_ref()?;
        let n = match backend.try_read(buf) {
            Ok(0) => return Some(CloseReason::BackendClosed),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(e) => return Some(CloseReason::BackendError(e)),
        };
        self.broadcast(buf.get(..n).unwrap_or_default()).await;
        None
    }

    /// Writes `data` to every client in attach order, removing the ones
    /// that fail without interrupting delivery to the rest.
    async fn broadcast(&mut self, data: &[u8]) {
        let timeout = self.config.client_write_timeout;
        let mut failed = Vec::new();

        for client in &mut self.clients {
            match tokio::time::timeout(timeout, client.stream.write_all(data)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(join_code = %self.join_code, client_id = client.id, error = %e, "client send failed");
                    failed.push(client.id);
                }
                Err(_) => {
                    tracing::warn!(join_code = %self.join_code, client_id = client.id, "client send timed out");
                    failed.push(client.id);
                }
            }
        }

        for id in failed {
            self.remove_client(id).await;
        }
    }

    async fn relay_from_client(&mut self, id: u64, buf: &mut [u8]) -> Option<CloseReason> {
        let client = self.clients.iter().find(|c| c.id == id)?;
        let n = match client.stream.try_read(buf) {
            Ok(0) => {
                tracing::debug!(join_code = %self.join_code, client_id = id, "client disconnected");
                self.remove_client(id).await;
                return None;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(e) => {
                tracing::warn!(join_code = %self.join_code, client_id = id, error = %e, "client read failed");
                self.remove_client(id).await;
                return None;
            }
        };

        // Keep serving the mailbox while the backend is slow so a stop still
        // lands; clients arriving meanwhile are attached after the write.
        let mut arrived = Vec::new();
        let outcome = {
            let backend = self.backend.as_mut()?;
            let write = tokio::time::timeout(
                self.config.backend_write_timeout,
                backend.write_all(buf.get(..n).unwrap_or_default()),
            );
            tokio::pin!(write);

            loop {
                tokio::select! {
                    result = &mut write => break match result {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(CloseReason::BackendError(e)),
                        Err(_) => Some(CloseReason::BackendError(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "backend write timed out",
                        ))),
                    },
                    command = self.commands.recv() => match command {
                        Some(RoomCommand::AddClient(stream)) => arrived.push(stream),
                        Some(RoomCommand::Stop) | None => break Some(CloseReason::Stopped),
                    },
                }
            }
        };

        for stream in arrived {
            self.attach(stream);
        }
        outcome
    }

    fn attach(&mut self, stream: TcpStream) {
        let id = self.next_client_id;
        self.next_client_id += 1;
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(join_code = %self.join_code, client_id = id, error = %e, "failed to set TCP_NODELAY on client");
        }

        self.clients.push(ClientConnection { id, peer, stream });
        self.had_client = true;
        self.shared
            .client_count
            .store(self.clients.len(), Ordering::Release);

        tracing::info!(
            join_code = %self.join_code,
            client_id = id,
            peer = ?peer,
            clients = self.clients.len(),
            "client attached"
        );
    }

    async fn remove_client(&mut self, id: u64) {
        let Some(pos) = self.clients.iter().position(|c| c.id == id) else {
            return;
        };
        let mut client = self.clients.remove(pos);
        let _ = client.stream.shutdown().await;
        self.shared
            .client_count
            .store(self.clients.len(), Ordering::Release);

        tracing::info!(
            join_code = %self.join_code,
            client_id = id,
            peer = ?client.peer,
            clients = self.clients.len(),
            "client removed"
        );
    }

    fn empty_rule_applies(&self) -> bool {
        self.had_client || self.opened_at.elapsed() >= self.config.join_grace
    }

    /// Tears the room down. Runs its body at most once; later calls return
    /// without touching anything.
    async fn close(&mut self, reason: CloseReason) {
        if !self.transition(RoomState::Closing) {
            return;
        }
        match &reason {
            CloseReason::BackendError(_) => {
                tracing::warn!(join_code = %self.join_code, reason = %reason, "room closing");
            }
            _ => tracing::info!(join_code = %self.join_code, reason = %reason, "room closing"),
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let RoomCommand::AddClient(mut stream) = command {
                let _ = stream.shutdown().await;
            }
        }

        for mut client in std::mem::take(&mut self.clients) {
            let _ = client.stream.shutdown().await;
        }
        self.shared.client_count.store(0, Ordering::Release);

        if let Some(mut backend) = self.backend.take() {
            let _ = backend.shutdown().await;
        }

        let shared = &self.shared;
        self.registry
            .release_room(&self.join_code, |entry| Arc::ptr_eq(&entry.shared, shared));
        self.transition(RoomState::Closed);
        tracing::info!(join_code = %self.join_code, "room closed");
    }

    /// Moves to `next` if the state machine allows it.
    fn transition(&self, next: RoomState) -> bool {
        let mut moved = false;
        self.shared.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                moved = true;
            }
            moved
        });
        if !moved {
            tracing::debug!(join_code = %self.join_code, to = %next, "ignored state transition");
        }
        moved
    }
}
