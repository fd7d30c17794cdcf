//! WebSocket chat server that fans every message out to all other
//! participants.
//!
//! - [`task_group`] runs a fixed set of operations under one cancellation
//!   token and reports the first failure.
//! - [`message`] holds client identity, display names and the
//!   `name:payload` text framing.
//! - [`hub`] is the actor that owns the set of connected clients and performs
//!   broadcast fan-out.
//! - [`pump`] drives one connection: a reader feeding the hub and a writer
//!   draining the client's outbound queue, with ping/pong keepalive.
//! - [`server`] exposes `/chat` over axum and binds each upgraded socket to a
//!   pump.
//! - [`client`] is a line-oriented terminal client built on the same task
//!   group.
//! - [`cli`] parses the command-line interface for both modes.

pub mod cli;
pub mod client;
pub mod hub;
pub mod message;
pub mod pump;
pub mod server;
pub mod task_group;
