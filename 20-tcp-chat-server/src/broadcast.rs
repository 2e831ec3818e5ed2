use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc::{self, error::TrySendError},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    frame::{Frame, encode},
    registry::{ConnectionId, Entry},
};

/// Upper bound on queued lines per connection.
pub const MAX_OUTBOX_CAPACITY: usize = 65_536;

/// An encoded line shared by every recipient of one broadcast.
pub type Line = Arc<str>;

/// Sending side of a connection's write queue.
///
/// Queuing never waits, so a broadcast can run under the registry lock without
/// being held up by a slow peer. The matching [`run_writer`] task owns the
/// socket and performs the actual writes.
#[derive(Debug, Clone)]
pub struct Outbox {
    sender: mpsc::Sender<Line>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum OutboxError {
    Full,
    Closed,
}

impl Outbox {
    /// `capacity` is clamped to `1..=MAX_OUTBOX_CAPACITY`.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Line>) {
        let (sender, receiver) = mpsc::channel(capacity.clamp(1, MAX_OUTBOX_CAPACITY));
        (Self { sender }, receiver)
    }

    pub fn push(&self, line: Line) -> Result<(), OutboxError> {
        self.sender.try_send(line).map_err(|err| match err {
            TrySendError::Full(_) => OutboxError::Full,
            TrySendError::Closed(_) => OutboxError::Closed,
        })
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

/// Queues `frame` for every entry except `exclude`.
///
/// A recipient whose outbox is full or closed is logged and skipped. Its entry
/// is left alone; only the owning session removes it.
pub(crate) fn fan_out<'a, I>(entries: I, frame: &Frame, exclude: Option<ConnectionId>) -> Delivery
where
    I: IntoIterator<Item = (&'a ConnectionId, &'a Entry)>,
{
    let line: Line = Arc::from(encode(frame));
    let mut delivery = Delivery::default();

    for (id, entry) in entries {
        if Some(*id) == exclude {
            continue;
        }
        match entry.outbox.push(Arc::clone(&line)) {
            Ok(()) => delivery.delivered += 1,
            Err(error) => {
                warn!(connection = %id, peer = %entry.peer, ?error, "dropping broadcast for recipient");
                delivery.dropped += 1;
            }
        }
    }

    delivery
}

/// Drains `queue` into `writer` until every [`Outbox`] handle is dropped.
///
/// Each write is bounded by `write_timeout`. The first failed or timed out
/// write ends the task; the writer is shut down either way.
pub async fn run_writer<W>(
    mut queue: mpsc::Receiver<Line>,
    mut writer: W,
    write_timeout: Duration,
    connection: ConnectionId,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = queue.recv().await {
        match timeout(write_timeout, write_line(&mut writer, &line)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(%connection, ?error, "failed to deliver line to client");
                break;
            }
            Err(_) => {
                warn!(%connection, ?write_timeout, "write to client timed out");
                break;
            }
        }
    }

    if let Err(error) = writer.shutdown().await {
        debug!(%connection, ?error, "failed to shut down client writer");
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
