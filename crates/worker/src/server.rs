//! TCP accept loop for gateway connections.

use std::net::SocketAddr;
use std::sync::Arc;

use proto::WorkerError;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;

/// Accepts gateway connections and serves each with the shared dispatcher
pub struct WorkerServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl WorkerServer {
    /// Binds the listener.
    pub async fn bind(addr: SocketAddr, dispatcher: Dispatcher) -> Result<Self, WorkerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WorkerError::Bind(format!("{addr}: {e}")))?;
        info!("Worker listening on {addr}");
        Ok(Self::from_listener(listener, dispatcher))
    }

    /// Wraps an already bound listener.
    pub fn from_listener(listener: TcpListener, dispatcher: Dispatcher) -> Self {
        Self {
            listener,
            dispatcher: Arc::new(dispatcher),
        }
    }

    /// Local address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, WorkerError> {
        self.listener
            .local_addr()
            .map_err(|e| WorkerError::Bind(e.to_string()))
    }

    /// Accept loop. Returns once `shutdown` fires and every connection has drained.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        info!("Worker accept loop started");
        let mut connections = JoinSet::new();

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        info!(%remote, "Gateway connected");
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(%remote, "Failed to set TCP_NODELAY: {e}");
                        }
                        let dispatcher = self.dispatcher.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            match dispatcher.serve(stream, shutdown).await {
                                Ok(()) => info!(%remote, "Gateway disconnected"),
                                Err(e) => warn!(%remote, "Gateway connection failed: {e}"),
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept connection: {e}"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!("Worker accept loop stopped");
        for record in self.dispatcher.registry().snapshot() {
            let running_for = chrono::Utc::now() - record.started_at;
            info!(
                command_id = %record.command_id,
                pid = record.pid,
                running_secs = running_for.num_seconds(),
                "Killing command still running at shutdown"
            );
        }
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}
