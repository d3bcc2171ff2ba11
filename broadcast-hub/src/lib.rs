//! Real-time broadcast hub over WebSockets.
//!
//! Every client connects to `/ws/{client_id}`; every text frame one client
//! sends is relayed, tagged with the sender's id, to all connected clients
//! (the sender included). Joins and departures are announced the same way.
//!
//! - [`registry`] tracks live connections behind a mutex and hands out
//!   point-in-time snapshots.
//! - [`dispatcher`] fans one message out over a snapshot, concurrently and
//!   with a per-recipient timeout, absorbing failures.
//! - [`session`] runs one connection: register, announce, relay, deregister.
//! - [`server`] wires sessions into an axum router next to the landing page.
//! - [`message`] holds the wording of the notices.
//! - [`cli`] and [`client`] provide the `serve` and `client` commands.
//!
//! Integration tests use this crate directly to exercise the hub over real
//! sockets.

pub mod cli;
pub mod client;
pub mod dispatcher;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
