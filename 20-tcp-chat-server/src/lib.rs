//! Line-oriented TCP chat server with presence notifications.
//!
//! Clients speak a small text protocol, one UTF-8 line per frame:
//!
//! - `CMD:JOIN:<username>` registers a username and announces it.
//! - `CMD:LEAVE:<username>` announces a departure.
//! - `CMD:USERS:<a>,<b>,...` is the roster the server sends to a joiner.
//! - any other line is chat, relayed verbatim to every other client.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`server`] accepts TCP connections and owns the shared [`registry`].
//! - [`registry`] maps live connections to usernames under one lock.
//! - [`broadcast`] fans frames out to per-connection write queues.
//! - [`session`] runs one accepted connection from registration to close.
//! - [`client`] is a terminal client for manual testing.
//! - [`frame`] parses and renders the wire protocol.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod frame;
pub mod registry;
pub mod server;
pub mod session;
