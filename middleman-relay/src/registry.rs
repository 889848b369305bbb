//! Room registry for the relay server.
//!
//! Maps join codes to live [`RoomHandle`]s. The dispatcher inserts entries
//! when rooms are created and looks them up on join; each room removes its
//! own entry when it closes. All access goes through one lock so no caller
//! sees a half-updated table.
//!
//! Room entries are ephemeral and lost on restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rand::Rng;

use crate::directory::{BackendAddress, ServiceDirectory};
use crate::room::{Room, RoomConfig, RoomError, RoomHandle};

/// Characters join codes are drawn from.
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Consecutive collisions tolerated before giving up on a new code.
const MAX_CODE_ATTEMPTS: usize = 1000;

/// Produces candidate join codes.
pub type CodeGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Errors that can occur during room registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No backend is registered under the service name.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// The backend could not be reached when starting the room.
    #[error("backend {addr} unreachable: {source}")]
    BackendUnreachable {
        /// Address that was dialed.
        addr: BackendAddress,
        /// Underlying connect error.
        source: std::io::Error,
    },
    /// The registry is full, or no free join code could be found.
    #[error("room limit reached (max {0} rooms)")]
    CapacityReached(usize),
    /// The registry has been shut down.
    #[error("relay is shutting down")]
    ShuttingDown,
}

impl From<RoomError> for RegistryError {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::BackendUnreachable { addr, source } => {
                Self::BackendUnreachable { addr, source }
            }
            RoomError::Closed => Self::ShuttingDown,
        }
    }
}

/// Registry limits and the configuration handed to every room.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of live rooms.
    pub max_rooms: usize,
    /// Length of generated join codes.
    pub join_code_len: usize,
    /// Relay loop settings for new rooms.
    pub room: RoomConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_rooms: 1000,
            join_code_len: 6,
            room: RoomConfig::default(),
        }
    }
}

/// Generates a random join code of `len` characters from `A-Z0-9`.
#[must_use]
pub fn generate_join_code(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..JOIN_CODE_ALPHABET.len());
            char::from(JOIN_CODE_ALPHABET.get(idx).copied().unwrap_or(b'A'))
        })
        .collect()
}

/// Authoritative store of live rooms.
pub struct RoomRegistry {
    services: Arc<ServiceDirectory>,
    rooms: RwLock<HashMap<String, RoomHandle>>,
    config: RegistryConfig,
    generate_code: CodeGenerator,
    shutting_down: AtomicBool,
}

impl RoomRegistry {
    /// Creates an empty registry resolving services through `services`.
    #[must_use]
    pub fn new(services: Arc<ServiceDirectory>, config: RegistryConfig) -> Self {
        let len = config.join_code_len;
        Self {
            services,
            rooms: RwLock::new(HashMap::new()),
            config,
            generate_code: Box::new(move || generate_join_code(len)),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Replaces the join code generator.
    #[must_use]
    pub fn with_code_generator(mut self, generate: CodeGenerator) -> Self {
        self.generate_code = generate;
        self
    }

    /// Creates a room for `service_name`, connects its backend, and starts
    /// its relay loop.
    ///
    /// The entry is inserted before the backend connect so the join code
    /// stays reserved, and removed again if the connect fails.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ServiceUnavailable`] for an unknown service,
    /// [`RegistryError::CapacityReached`] when full,
    /// [`RegistryError::ShuttingDown`] after [`RoomRegistry::shutdown`], and
    /// [`RegistryError::BackendUnreachable`] if the backend connect fails.
    /// No entry remains in the registry after any of these.
    pub async fn create_room(self: &Arc<Self>, service_name: &str) -> Result<RoomHandle, RegistryError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RegistryError::ShuttingDown);
        }
        let backend_addr = self
            .services
            .lookup(service_name)
            .ok_or_else(|| RegistryError::ServiceUnavailable(service_name.to_string()))?;

        let (room, handle) = {
            let mut rooms = self.rooms.write();
            // Checked again under the lock so `shutdown` cannot miss this room.
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(RegistryError::ShuttingDown);
            }
            if rooms.len() >= self.config.max_rooms {
                return Err(RegistryError::CapacityReached(self.config.max_rooms));
            }
            let join_code = self
                .unused_code(&rooms)
                .ok_or(RegistryError::CapacityReached(self.config.max_rooms))?;

            let (room, handle) = Room::new(
                &join_code,
                backend_addr,
                self.config.room.clone(),
                Arc::clone(self),
            );
            rooms.insert(join_code, handle.clone());
            (room, handle)
        };

        if let Err(e) = room.start().await {
            self.release_room(handle.join_code(), |entry| entry.same_room(&handle));
            return Err(e.into());
        }

        tracing::info!(
            join_code = %handle.join_code(),
            service = %service_name,
            backend = %handle.backend_addr(),
            "room created"
        );
        Ok(handle)
    }

    fn unused_code(&self, rooms: &HashMap<String, RoomHandle>) -> Option<String> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = (self.generate_code)();
            if !rooms.contains_key(&code) {
                return Some(code);
            }
            tracing::debug!(join_code = %code, "join code collision, retrying");
        }
        tracing::error!(attempts = MAX_CODE_ATTEMPTS, "no free join code found");
        None
    }

    /// Returns the room with `join_code`, if it is live.
    #[must_use]
    pub fn get_room(&self, join_code: &str) -> Option<RoomHandle> {
        self.rooms.read().get(join_code).cloned()
    }

    /// Removes the entry for `join_code`. Removing an absent code is a no-op.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_room(&self, join_code: &str) -> bool {
        let removed = self.rooms.write().remove(join_code).is_some();
        if removed {
            tracing::debug!(join_code = %join_code, "room entry removed");
        }
        removed
    }

    /// Removes the entry for `join_code` only if `is_owner` accepts it.
    ///
    /// A room that closes after its entry was removed externally must not
    /// evict a newer room that was handed the same code.
    pub(crate) fn release_room(
        &self,
        join_code: &str,
        is_owner: impl FnOnce(&RoomHandle) -> bool,
    ) -> bool {
        let mut rooms = self.rooms.write();
        if !rooms.get(join_code).is_some_and(is_owner) {
            return false;
        }
        rooms.remove(join_code);
        drop(rooms);
        tracing::debug!(join_code = %join_code, "room entry released");
        true
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Join codes of every live room, sorted.
    #[must_use]
    pub fn join_codes(&self) -> Vec<String> {
        let mut codes: Vec<_> = self.rooms.read().keys().cloned().collect();
        codes.sort();
        codes
    }

    /// Stops every live room and waits for each to close.
    ///
    /// After this returns, `create_room` fails with
    /// [`RegistryError::ShuttingDown`].
    pub async fn shutdown(&self) {
        let rooms: Vec<RoomHandle> = {
            let rooms = self.rooms.write();
            self.shutting_down.store(true, Ordering::Release);
            rooms.values().cloned().collect()
        };
        tracing::info!(rooms = rooms.len(), "stopping all rooms");
        for room in &rooms {
            room.stop();
        }
        futures_util::future::join_all(rooms.iter().map(|room| room.wait_closed())).await;
    }
}
