//! WebSocket signaling server
//!
//! Binds a TCP listener and runs the accept loop on the current tokio runtime.
//! Binding to port 0 picks a free port; [`WebSocketServerHandle::local_addr`]
//! reports the one actually bound.

use super::handler::handle_connection;
use crate::relay::SignalingHub;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// WebSocket signaling server
pub struct WebSocketSignalingServer {
    /// Address to bind
    addr: SocketAddr,

    /// Shared relay state
    hub: Arc<SignalingHub>,
}

impl WebSocketSignalingServer {
    pub fn new(addr: SocketAddr, hub: Arc<SignalingHub>) -> Self {
        Self { addr, hub }
    }

    /// Get shared state (for external access)
    pub fn hub(&self) -> Arc<SignalingHub> {
        Arc::clone(&self.hub)
    }

    /// Get the configured bind address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind and start accepting connections.
    ///
    /// Returns once the listener is bound; the accept loop keeps running until
    /// [`WebSocketServerHandle::shutdown`] is called.
    pub async fn start(self) -> std::io::Result<WebSocketServerHandle> {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!("Failed to bind WebSocket server to {}: {}", self.addr, e);
            e
        })?;
        let local_addr = listener.local_addr()?;
        info!("WebSocket signaling server listening on ws://{}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let hub = Arc::clone(&self.hub);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let hub = Arc::clone(&hub);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, peer_addr, hub).await {
                                        error!("WebSocket connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept WebSocket connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("WebSocket signaling server received shutdown signal");
                        break;
                    }
                }
            }

            // Wake every connection task so they deregister and exit
            for conn in hub.registry().snapshot() {
                conn.close();
            }
            info!("WebSocket signaling server accept loop exited");
        });

        Ok(WebSocketServerHandle {
            local_addr,
            task: Some(task),
            shutdown_tx,
        })
    }
}

/// Handle for controlling the WebSocket server
pub struct WebSocketServerHandle {
    local_addr: SocketAddr,
    task: Option<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close live connections and wait for the accept loop
    pub async fn shutdown(mut self) {
        info!("Sending shutdown signal to WebSocket server");
        let _ = self.shutdown_tx.send(());

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("WebSocket accept loop failed: {}", e);
            }
        }
    }
}
