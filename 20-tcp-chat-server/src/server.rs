use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
    task::JoinSet,
};
use tracing::{info, warn};

use crate::{registry::Registry, session::handle_connection};

/// Per-connection limits applied by every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Lines queued for one client before further broadcasts to it are dropped.
    pub outbox_capacity: usize,
    /// Upper bound on a single socket write.
    pub write_timeout: Duration,
    /// Longest accepted frame, in bytes, excluding the line terminator.
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 64,
            write_timeout: Duration::from_secs(5),
            max_frame_len: 4096,
        }
    }
}

pub struct ChatServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: ServerConfig,
}

impl ChatServer {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` resolves, then tells every session
    /// to stop and waits for their cleanup to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer {
            listener,
            registry,
            config,
        } = self;
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(active = sessions.len(), "chat server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, config, &stop_rx, &mut sessions);
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(error) = finished {
                        warn!(?error, "session task panicked");
                    }
                }
            }
        }

        drop(listener);
        let _ = stop_tx.send(true);
        while let Some(finished) = sessions.join_next().await {
            if let Err(error) = finished {
                warn!(?error, "session task panicked");
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
    config: ServerConfig,
    stop_rx: &watch::Receiver<bool>,
    sessions: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            let registry = Arc::clone(registry);
            let shutdown = stop_rx.clone();
            sessions.spawn(async move {
                if let Err(err) = handle_connection(stream, registry, config, shutdown).await {
                    warn!(peer = %peer, error = ?err, "client connection closed with error");
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}
