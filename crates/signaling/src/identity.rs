//! Device identity and reconnect reconciliation

use crate::device::ClientMetadata;
use crate::registry::{Connection, ConnectionRegistry};
use crate::room::{JoinOutcome, RoomStore};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Stable key identifying a physical device across reconnects
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already computed hex digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a reconcile-then-join
#[derive(Debug)]
pub struct Reconciliation {
    /// Outcome of the join itself
    pub outcome: JoinOutcome,

    /// Stale connections that were members of the joined room
    pub removed_from_room: Vec<Arc<Connection>>,

    /// Every stale connection that has to be closed
    pub evicted: Vec<Arc<Connection>>,
}

impl Reconciliation {
    pub fn evicted_count(&self) -> usize {
        self.evicted.len()
    }
}

/// Fingerprints devices and supersedes stale connections on reconnect
pub struct DeviceResolver {
    registry: Arc<ConnectionRegistry>,
    reconnect_counts: Mutex<HashMap<Fingerprint, u32>>,
}

impl DeviceResolver {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            reconnect_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Derive the fingerprint of a device.
    ///
    /// A client-supplied device id is authoritative and only combined with the
    /// source address; otherwise the user-agent and forwarding header stand in.
    pub fn fingerprint(metadata: &ClientMetadata, device_id: Option<&str>) -> Fingerprint {
        let ip = metadata.source_ip();
        let input = match device_id {
            Some(id) => format!("{}-{}", id, ip),
            None => format!(
                "{}-{}-{}",
                metadata.user_agent.as_deref().unwrap_or_default(),
                ip,
                metadata.forwarded_for.as_deref().unwrap_or_default()
            ),
        };
        Fingerprint(hex::encode(Sha256::digest(input.as_bytes())))
    }

    /// Select connections superseded by `new_conn`.
    ///
    /// Room members match on fingerprint or device id; outside the room only
    /// the device-id owner is considered.
    fn stale_connections(
        &self,
        members: &[Arc<Connection>],
        new_conn: &Connection,
        fingerprint: &Fingerprint,
        device_id: Option<&str>,
    ) -> Vec<Arc<Connection>> {
        let mut stale: Vec<Arc<Connection>> = members
            .iter()
            .filter(|m| m.id() != new_conn.id())
            .filter(|m| {
                m.fingerprint().as_ref() == Some(fingerprint)
                    || (device_id.is_some() && m.device_id().as_deref() == device_id)
            })
            .cloned()
            .collect();

        if let Some(owner) = device_id.and_then(|id| self.registry.device_owner(id)) {
            if owner.id() != new_conn.id() && !stale.iter().any(|s| s.id() == owner.id()) {
                stale.push(owner);
            }
        }
        stale
    }

    /// Evict stale connections for the device and join `room`.
    ///
    /// Selection, removal and the capacity check run in one room-store
    /// critical section, so an old and a new connection for the same device
    /// never both count against capacity. Closing the evicted transports and
    /// notifying peers is left to the caller.
    pub fn reconcile(
        &self,
        rooms: &RoomStore,
        room: &str,
        new_conn: &Arc<Connection>,
        fingerprint: &Fingerprint,
        device_id: Option<&str>,
    ) -> Reconciliation {
        new_conn.set_identity(fingerprint.clone(), device_id.map(str::to_string));

        let mut evicted = Vec::new();
        let (outcome, removed_from_room) = rooms.join_with(room, new_conn, |members| {
            evicted = self.stale_connections(members, new_conn, fingerprint, device_id);
            evicted.iter().map(|c| c.id().to_string()).collect()
        });

        if let Some(id) = device_id {
            self.registry.bind_device_id(id, new_conn.id());
        }

        if !evicted.is_empty() {
            let count = {
                let mut counts = self.reconnect_counts.lock();
                let count = counts.entry(fingerprint.clone()).or_insert(0);
                *count += 1;
                *count
            };
            info!(
                room = %room,
                connection_id = %new_conn.id(),
                evicted = evicted.len(),
                reconnects = count,
                "Device reconnected, superseding stale connections"
            );
        }

        Reconciliation {
            outcome,
            removed_from_room,
            evicted,
        }
    }

    /// Force-close an evicted connection; closing twice is harmless
    pub fn evict(&self, conn: &Connection) {
        if conn.close() {
            debug!(connection_id = %conn.id(), "Stale connection closed");
        }
    }

    /// Number of reconnects observed for a fingerprint
    pub fn reconnect_count(&self, fingerprint: &Fingerprint) -> u32 {
        self.reconnect_counts
            .lock()
            .get(fingerprint)
            .copied()
            .unwrap_or(0)
    }
}
