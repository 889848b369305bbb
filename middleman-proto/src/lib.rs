//! Shared control-plane definitions for the middleman relay.

pub mod codec;
pub mod control;
