//! Middleman relay server library.
//!
//! Exposes the relay for use in tests and embedding. The server accepts
//! control connections, creates or joins rooms by join code, and each room
//! relays raw bytes between one backend service connection and its attached
//! clients.

pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod registry;
pub mod room;
