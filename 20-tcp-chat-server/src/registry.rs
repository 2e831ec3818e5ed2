use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    broadcast::{Delivery, Outbox, fan_out},
    frame::{Frame, encode},
};

/// Identifies one accepted connection for the lifetime of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct Entry {
    pub(crate) peer: SocketAddr,
    /// Empty until the connection sends a join frame.
    pub(crate) username: String,
    pub(crate) outbox: Outbox,
}

impl Entry {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_joined(&self) -> bool {
        !self.username.is_empty()
    }
}

/// A row of [`Registry::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub username: String,
}

/// Live connections and the usernames they registered.
///
/// Every read and write goes through a single lock. The compound operations
/// ([`Registry::join`], [`Registry::depart`], [`Registry::broadcast`]) hold it
/// for their whole duration, so no other mutation can interleave with the
/// fan-out they perform. Entries are kept in accept order.
pub struct Registry {
    entries: Mutex<BTreeMap<ConnectionId, Entry>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a freshly accepted connection with an empty username.
    pub async fn register(&self, peer: SocketAddr, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.lock().await;
        entries.insert(
            id,
            Entry {
                peer,
                username: String::new(),
                outbox,
            },
        );
        info!(connection = %id, %peer, total = entries.len(), "client connected");
        id
    }

    /// Overwrites the username, returning the previous one. `None` if the
    /// connection is no longer registered.
    pub async fn set_username(&self, id: ConnectionId, username: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&id)?;
        Some(std::mem::replace(&mut entry.username, username.to_string()))
    }

    /// Removes the entry; removing twice is a no-op.
    pub async fn remove(&self, id: ConnectionId) -> Option<Entry> {
        self.entries.lock().await.remove(&id)
    }

    pub async fn snapshot(&self) -> Vec<Participant> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(id, entry)| Participant {
                id: *id,
                peer: entry.peer,
                username: entry.username.clone(),
            })
            .collect()
    }

    /// Usernames of joined connections, in accept order.
    pub async fn usernames(&self) -> Vec<String> {
        roster(&*self.entries.lock().await)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn broadcast(&self, frame: &Frame, exclude: Option<ConnectionId>) -> Delivery {
        let entries = self.entries.lock().await;
        fan_out(&*entries, frame, exclude)
    }

    /// Records `username` for `id`, announces it to everyone else and hands the
    /// joiner the full roster. Returns `None` if `id` is not registered.
    pub async fn join(&self, id: ConnectionId, username: &str) -> Option<Delivery> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&id)?;
        entry.username = username.to_string();

        let delivery = fan_out(
            &*entries,
            &Frame::Join {
                username: username.to_string(),
            },
            Some(id),
        );

        let users = Frame::Users {
            usernames: roster(&entries),
        };
        let queued = entries
            .get(&id)
            .map(|entry| entry.outbox.push(encode(&users).into()));
        if let Some(Err(error)) = queued {
            warn!(connection = %id, ?error, "failed to queue user list");
        }

        info!(connection = %id, username, "user joined");
        Some(delivery)
    }

    /// Removes `id` and, if it had joined, announces its departure to the
    /// remaining connections. Returns the removed entry's username only when a
    /// leave was broadcast, so concurrent callers see exactly one `Some`.
    pub async fn depart(&self, id: ConnectionId) -> Option<String> {
        let mut entries = self.entries.lock().await;
        let entry = entries.remove(&id)?;
        info!(connection = %id, peer = %entry.peer, total = entries.len(), "client disconnected");

        if !entry.is_joined() {
            return None;
        }

        fan_out(
            &*entries,
            &Frame::Leave {
                username: entry.username.clone(),
            },
            None,
        );
        info!(connection = %id, username = %entry.username, "user left");
        Some(entry.username)
    }
}

fn roster(entries: &BTreeMap<ConnectionId, Entry>) -> Vec<String> {
    entries
        .values()
        .filter(|entry| entry.is_joined())
        .map(|entry| entry.username.clone())
        .collect()
}
