//! Websocket message hub that fans out across nodes over a redis backplane.
//!
//! Clients connect with an identity and a group. Anything a client sends is
//! echoed to its whole group and to every connection of its identity, on this
//! node and, through the backplane, on every other node. Each module owns one
//! concern:
//!
//! - [`hub`] runs the single coordination loop that owns the registry and
//!   makes every routing decision.
//! - [`registry`] indexes live connections by group and by identity.
//! - [`connection`] holds the per-connection read and write loops and the
//!   bounded outbound queue between the hub and the writer.
//! - [`backplane`] bridges to redis pub/sub (or an in-process stand-in) and
//!   keeps messages from looping between nodes.
//! - [`message`] defines routed messages, origins, and the JSON envelope used
//!   on the wire between nodes.
//! - [`server`] exposes health, stats, admin notifications, and the websocket
//!   upgrade over axum.
//! - [`config`] and [`cli`] carry the tunables and their defaults.
//!
//! Delivery is best-effort. A client whose queue is full when a message
//! arrives is disconnected rather than allowed to slow everybody else down.

pub mod backplane;
pub mod cli;
pub mod config;
pub mod connection;
pub mod hub;
pub mod message;
pub mod registry;
pub mod server;
