//! Control-plane message types.
//!
//! A control connection carries exactly one [`ControlRequest`] from the
//! client and one [`ControlResponse`] back. Both are JSON objects; see
//! [`crate::codec`] for the framing around them.

use serde::{Deserialize, Serialize};

/// A request sent by a client on a fresh control connection.
///
/// Serialized with an `action` tag:
///
/// ```json
/// {"action": "create_room", "service_name": "trivia"}
/// {"action": "join_room", "join_code": "K3Q9ZP"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Create a room bound to the named backend service.
    ///
    /// On success the requesting connection becomes the room's first client.
    CreateRoom {
        /// Name the backend service was registered under.
        service_name: String,
    },

    /// Attach to an existing room.
    JoinRoom {
        /// Join code returned by an earlier `create_room`.
        join_code: String,
    },
}

/// Outcome of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The request succeeded; the connection now relays room traffic.
    Success,
    /// The request failed; the server closes the connection after replying.
    Error,
}

/// Machine-readable reason carried by an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No backend is registered under the requested service name.
    ServiceUnavailable,
    /// No live room has the requested join code.
    InvalidJoinCode,
    /// The request could not be read or decoded.
    InvalidRequest,
    /// The backend for the service refused or timed out the connection.
    BackendUnreachable,
    /// The server cannot hold more rooms.
    RoomLimitReached,
    /// The server is shutting down and no longer creates rooms.
    ShuttingDown,
}

/// Reply to a [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Whether the request succeeded.
    pub status: Status,
    /// Join code of the created room (only set for `create_room`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_code: Option<String>,
    /// Human-readable error description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error classification, set on every error reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl ControlResponse {
    /// Builds a success reply, optionally carrying a join code.
    #[must_use]
    pub const fn success(join_code: Option<String>) -> Self {
        Self {
            status: Status::Success,
            join_code,
            message: None,
            kind: None,
        }
    }

    /// Builds an error reply.
    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            join_code: None,
            message: Some(message.into()),
            kind: Some(kind),
        }
    }

    /// Returns `true` for a success reply.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}
