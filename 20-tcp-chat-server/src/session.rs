use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    io::AsyncRead,
    net::TcpStream,
    select,
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::{
    broadcast::{Outbox, run_writer},
    frame::{Frame, LineReader, line_reader, next_line},
    registry::{ConnectionId, Registry},
    server::ServerConfig,
};

enum Flow {
    Continue,
    Leave,
}

/// Serves one accepted connection from registration to close.
///
/// The connection is registered before its first frame is read. Whatever ends
/// the session (end of stream, a read error, a leave frame or server shutdown),
/// the entry is departed and the writer task is awaited, which closes the
/// socket.
pub async fn handle_connection(
    stream: TcpStream,
    registry: Arc<Registry>,
    config: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let peer = stream.peer_addr().context("peer address unavailable")?;
    let (reader, writer) = stream.into_split();

    let (outbox, queue) = Outbox::channel(config.outbox_capacity);
    let id = registry.register(peer, outbox).await;
    let writer_task = tokio::spawn(run_writer(queue, writer, config.write_timeout, id));

    let mut lines = line_reader(reader, config.max_frame_len);
    let result = run_session(&registry, id, &mut lines, &mut shutdown)
        .await
        .with_context(|| format!("session {id} with {peer} failed"));

    // A leave frame may already have departed; this is then a no-op.
    registry.depart(id).await;
    if let Err(error) = writer_task.await {
        warn!(connection = %id, ?error, "writer task panicked");
    }

    result
}

async fn run_session<R>(
    registry: &Registry,
    id: ConnectionId,
    lines: &mut LineReader<R>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        select! {
            line = next_line(lines) => {
                let Some(line) = line? else {
                    debug!(connection = %id, "peer closed the connection");
                    break;
                };
                if let Flow::Leave = handle_line(registry, id, &line).await {
                    break;
                }
            }
            _ = shutdown.changed() => {
                info!(connection = %id, "closing session for shutdown");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_line(registry: &Registry, id: ConnectionId, line: &str) -> Flow {
    debug!(connection = %id, line, "received frame");

    match Frame::parse(line) {
        Ok(Frame::Join { username }) => {
            registry.join(id, &username).await;
            Flow::Continue
        }
        Ok(Frame::Leave { username }) => {
            // The registered name wins over whatever the frame claims.
            match registry.depart(id).await {
                Some(left) if left != username => {
                    debug!(connection = %id, claimed = %username, %left, "leave frame named another user");
                }
                _ => {}
            }
            Flow::Leave
        }
        Ok(frame @ Frame::Chat { .. }) => {
            registry.broadcast(&frame, Some(id)).await;
            Flow::Continue
        }
        Ok(Frame::Users { .. }) => {
            debug!(connection = %id, "ignoring user list sent by client");
            Flow::Continue
        }
        Err(error) => {
            debug!(connection = %id, %error, "ignoring malformed frame");
            Flow::Continue
        }
    }
}
