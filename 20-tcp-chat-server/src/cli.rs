use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{broadcast::MAX_OUTBOX_CAPACITY, server::ServerConfig};

/// Largest frame the server can be configured to accept.
pub const MAX_FRAME_LEN_LIMIT: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a chat server and participate from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_LISTEN", default_value = "127.0.0.1:13000")]
    pub listen: SocketAddr,

    /// Lines buffered per client before broadcasts to it are dropped.
    #[arg(
        long,
        env = "CHAT_OUTBOX_CAPACITY",
        default_value_t = 64,
        value_parser = clap::value_parser!(u64).range(1..=MAX_OUTBOX_CAPACITY as u64)
    )]
    pub outbox_capacity: u64,

    /// Milliseconds a single write to a client may take.
    #[arg(
        long,
        env = "CHAT_WRITE_TIMEOUT_MS",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(1..=3_600_000)
    )]
    pub write_timeout_ms: u64,

    /// Longest frame accepted from a client, in bytes.
    #[arg(
        long,
        env = "CHAT_MAX_FRAME_LEN",
        default_value_t = 4096,
        value_parser = clap::value_parser!(u64).range(1..=MAX_FRAME_LEN_LIMIT)
    )]
    pub max_frame_len: u64,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            // Both values are range-checked by clap and fit any usize.
            outbox_capacity: self.outbox_capacity as usize,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            max_frame_len: self.max_frame_len as usize,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username announced when joining the chat.
    #[arg(long)]
    pub username: String,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:13000")]
    pub server: SocketAddr,
}
