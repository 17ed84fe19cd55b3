//! Liveness monitor
//!
//! Three independent sweeps keep the relay consistent with reality:
//!
//! - **heartbeat**: pings every open connection once its device-specific
//!   interval has elapsed
//! - **dead connections**: terminates connections silent for longer than
//!   their device-specific timeout, with a `bye` and a short grace window
//! - **room cleanup**: drops empty rooms and members whose transport closed
//!
//! Each sweep snapshots the registry or room store and then acts, so message
//! handling is never blocked behind a scan. Sweeps take the current instant as
//! a parameter; the background loops pass `Instant::now()`.

use crate::config::DevicePolicy;
use crate::protocol::{self, ServerMessage, REASON_TIMEOUT};
use crate::registry::{Connection, ConnectionId};
use crate::relay::SignalingHub;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

fn scaled(base: Duration, multiplier: f64) -> Duration {
    base.mul_f64(multiplier)
}

/// Outcome of a room cleanup sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub rooms_removed: Vec<String>,
    pub members_pruned: usize,
}

/// Background liveness management for a [`SignalingHub`]
pub struct LivenessMonitor {
    hub: Arc<SignalingHub>,
}

impl LivenessMonitor {
    pub fn new(hub: Arc<SignalingHub>) -> Self {
        Self { hub }
    }

    fn policy(&self, conn: &Connection) -> DevicePolicy {
        self.hub
            .config()
            .device_policies
            .for_device(conn.device_type())
    }

    /// Heartbeat interval for a connection
    pub fn heartbeat_interval(&self, conn: &Connection) -> Duration {
        scaled(
            self.hub.config().liveness.heartbeat_interval(),
            self.policy(conn).heartbeat_multiplier,
        )
    }

    /// Silence tolerated before a connection is terminated
    pub fn dead_timeout(&self, conn: &Connection) -> Duration {
        scaled(
            self.hub.config().liveness.dead_connection_timeout(),
            self.policy(conn).timeout_multiplier,
        )
    }

    /// Ping every open connection whose heartbeat is due.
    ///
    /// Returns the number of connections pinged.
    pub fn heartbeat_sweep(&self, now: Instant) -> usize {
        let mut pinged = 0;
        for conn in self.hub.registry().snapshot() {
            if !conn.is_open() {
                continue;
            }
            let due = conn
                .last_ping_sent()
                .is_none_or(|sent| now.saturating_duration_since(sent) >= self.heartbeat_interval(&conn));
            if !due {
                continue;
            }

            if let Err(e) = conn.send_ping() {
                debug!(connection_id = %conn.id(), error = %e, "Ping frame not queued");
            }
            self.hub.send(
                &conn,
                &ServerMessage::Ping {
                    timestamp: protocol::current_timestamp(),
                    keep_alive: true,
                },
            );
            conn.mark_ping_sent(now);
            pinged += 1;
        }
        pinged
    }

    /// Terminate connections that stopped acknowledging heartbeats.
    ///
    /// Open connections get `bye {reason: "timeout"}` and are closed after
    /// the grace window; connections whose transport is already gone are torn
    /// down immediately. Returns the connections scheduled for termination.
    pub fn dead_connection_sweep(&self, now: Instant) -> Vec<ConnectionId> {
        let grace = self.hub.config().liveness.close_grace();
        let mut terminated = Vec::new();

        for conn in self.hub.registry().snapshot() {
            let silent = now.saturating_duration_since(conn.last_ack());
            let timeout = self.dead_timeout(&conn);
            if silent <= timeout || !conn.begin_termination() {
                continue;
            }

            warn!(
                connection_id = %conn.id(),
                device_type = %conn.device_type(),
                silent_secs = silent.as_secs(),
                timeout_secs = timeout.as_secs(),
                "Connection unresponsive, terminating"
            );
            self.hub.metrics().connection_timed_out();
            terminated.push(conn.id().to_string());

            if conn.is_open() {
                self.hub.send(
                    &conn,
                    &ServerMessage::Bye {
                        reason: REASON_TIMEOUT.to_string(),
                    },
                );
                let conn = Arc::clone(&conn);
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    conn.close();
                });
            } else {
                self.hub.disconnect(&conn);
            }
        }
        terminated
    }

    /// Remove empty rooms and prune members whose transport closed.
    ///
    /// A room emptied by pruning is removed on the following sweep.
    pub fn room_cleanup_sweep(&self) -> CleanupReport {
        let rooms = self.hub.rooms();
        let report = CleanupReport {
            rooms_removed: rooms.remove_empty_rooms(),
            members_pruned: rooms.prune_closed_members(),
        };
        if !report.rooms_removed.is_empty() || report.members_pruned > 0 {
            info!(
                rooms_removed = report.rooms_removed.len(),
                members_pruned = report.members_pruned,
                rooms_remaining = rooms.room_count(),
                "Room cleanup"
            );
        }
        self.hub
            .metrics()
            .rooms_removed(report.rooms_removed.len() as u64);
        report
    }

    /// Spawn the three sweep loops; each stops on the shutdown broadcast
    pub fn spawn(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let liveness = &self.hub.config().liveness;
        vec![
            tokio::spawn(Arc::clone(self).run_loop(
                "heartbeat",
                liveness.heartbeat_interval(),
                shutdown.subscribe(),
                |m| {
                    m.heartbeat_sweep(Instant::now());
                },
            )),
            tokio::spawn(Arc::clone(self).run_loop(
                "dead-connection",
                liveness.dead_check_interval(),
                shutdown.subscribe(),
                |m| {
                    m.dead_connection_sweep(Instant::now());
                },
            )),
            tokio::spawn(Arc::clone(self).run_loop(
                "room-cleanup",
                liveness.room_cleanup_interval(),
                shutdown.subscribe(),
                |m| {
                    m.room_cleanup_sweep();
                },
            )),
        ]
    }

    async fn run_loop(
        self: Arc<Self>,
        name: &'static str,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
        sweep: fn(&LivenessMonitor),
    ) {
        info!("Liveness {} sweep started (interval: {:?})", name, period);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => sweep(self.as_ref()),
                _ = shutdown_rx.recv() => {
                    info!("Liveness {} sweep shutting down", name);
                    break;
                }
            }
        }
    }
}
