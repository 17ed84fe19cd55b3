//! Connection registry
//!
//! Tracks every live transport connection, its identity, device class and
//! liveness timestamps. Outbound delivery goes through a bounded queue that a
//! writer task drains into the socket; enqueueing never blocks.

use crate::device::{ClientMetadata, DeviceType};
use crate::error::{Error, Result};
use crate::identity::Fingerprint;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::debug;

/// Unique connection identity (UUID v4)
pub type ConnectionId = String;

/// Frames queued for the transport writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text message
    Text(String),
    /// Transport-level ping frame
    Ping(Vec<u8>),
    /// Close the transport
    Close,
}

/// Mutable per-connection state
#[derive(Debug)]
struct ConnectionState {
    room: Option<String>,
    fingerprint: Option<Fingerprint>,
    device_id: Option<String>,
    last_ping_sent: Option<Instant>,
    last_ack: Instant,
    terminating: bool,
}

/// A live client connection
pub struct Connection {
    id: ConnectionId,
    device_type: DeviceType,
    metadata: ClientMetadata,
    tx: mpsc::Sender<Outbound>,
    open: AtomicBool,
    closed: Notify,
    state: Mutex<ConnectionState>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("device_type", &self.device_type)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Create a connection with a fresh identity.
    ///
    /// The device type is classified from `metadata`, and the connection
    /// counts as acknowledged at creation so it is not timed out immediately.
    pub fn new(metadata: ClientMetadata, tx: mpsc::Sender<Outbound>) -> Self {
        let device_type = metadata.device_type();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_type,
            metadata,
            tx,
            open: AtomicBool::new(true),
            closed: Notify::new(),
            state: Mutex::new(ConnectionState {
                room: None,
                fingerprint: None,
                device_id: None,
                last_ping_sent: None,
                last_ack: Instant::now(),
                terminating: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn metadata(&self) -> &ClientMetadata {
        &self.metadata
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue a text frame
    pub fn send_text(&self, text: String) -> Result<()> {
        self.enqueue(Outbound::Text(text))
    }

    /// Queue a transport-level ping frame
    pub fn send_ping(&self) -> Result<()> {
        self.enqueue(Outbound::Ping(Vec::new()))
    }

    fn enqueue(&self, frame: Outbound) -> Result<()> {
        if !self.is_open() {
            return Err(Error::SendFailed {
                connection: self.id.clone(),
                reason: "connection closed".to_string(),
            });
        }
        self.tx.try_send(frame).map_err(|e| Error::SendFailed {
            connection: self.id.clone(),
            reason: match e {
                mpsc::error::TrySendError::Full(_) => "outbound queue full".to_string(),
                mpsc::error::TrySendError::Closed(_) => "transport gone".to_string(),
            },
        })
    }

    /// Force-close the transport.
    ///
    /// Returns `false` when the connection was already closed; calling this
    /// more than once is harmless.
    pub fn close(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.try_send(Outbound::Close);
        self.closed.notify_one();
        debug!(connection_id = %self.id, "Connection closed");
        true
    }

    /// Resolves once [`Connection::close`] has been called
    pub async fn closed(&self) {
        if !self.is_open() {
            return;
        }
        self.closed.notified().await;
    }

    pub fn room(&self) -> Option<String> {
        self.state.lock().room.clone()
    }

    pub(crate) fn set_room(&self, room: Option<String>) {
        self.state.lock().room = room;
    }

    /// Clear the room only if it still equals `room`
    pub(crate) fn clear_room_if(&self, room: &str) {
        let mut state = self.state.lock();
        if state.room.as_deref() == Some(room) {
            state.room = None;
        }
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.state.lock().fingerprint.clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.state.lock().device_id.clone()
    }

    pub(crate) fn set_identity(&self, fingerprint: Fingerprint, device_id: Option<String>) {
        let mut state = self.state.lock();
        state.fingerprint = Some(fingerprint);
        state.device_id = device_id;
    }

    pub fn last_ping_sent(&self) -> Option<Instant> {
        self.state.lock().last_ping_sent
    }

    pub fn last_ack(&self) -> Instant {
        self.state.lock().last_ack
    }

    pub(crate) fn mark_ping_sent(&self, at: Instant) {
        self.state.lock().last_ping_sent = Some(at);
    }

    /// Record a heartbeat acknowledgement
    pub fn mark_alive(&self, at: Instant) {
        let mut state = self.state.lock();
        if at > state.last_ack {
            state.last_ack = at;
        }
    }

    /// Flag the connection for termination; `false` if already flagged
    pub(crate) fn begin_termination(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.terminating, true)
    }
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    device_index: HashMap<String, ConnectionId>,
}

/// Registry of all live connections
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a client from its handshake metadata
    pub fn classify(metadata: &ClientMetadata) -> DeviceType {
        metadata.device_type()
    }

    /// Register a connection and return its identity
    pub fn register(&self, conn: Arc<Connection>) -> ConnectionId {
        let id = conn.id().to_string();
        let mut inner = self.inner.write();
        inner.connections.insert(id.clone(), conn);
        debug!(connection_id = %id, total = inner.connections.len(), "Connection registered");
        id
    }

    /// Remove a connection and its device-id index entry.
    ///
    /// The index entry is only dropped if it still points at this connection,
    /// since a newer connection for the same device may have claimed it.
    pub fn unregister(&self, id: &str) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write();
        let conn = inner.connections.remove(id)?;
        if let Some(device_id) = conn.device_id() {
            if inner.device_index.get(&device_id).map(String::as_str) == Some(id) {
                inner.device_index.remove(&device_id);
            }
        }
        debug!(connection_id = %id, total = inner.connections.len(), "Connection unregistered");
        Some(conn)
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner.read().connections.get(id).cloned()
    }

    /// Point a device id at a connection, returning the previous owner
    pub fn bind_device_id(&self, device_id: &str, id: &str) -> Option<ConnectionId> {
        self.inner
            .write()
            .device_index
            .insert(device_id.to_string(), id.to_string())
    }

    /// Connection currently owning a device id
    pub fn device_owner(&self, device_id: &str) -> Option<Arc<Connection>> {
        let inner = self.inner.read();
        let id = inner.device_index.get(device_id)?;
        inner.connections.get(id).cloned()
    }

    /// Snapshot of all registered connections
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.read().connections.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of connections per device type, every type included
    pub fn device_counts(&self) -> BTreeMap<DeviceType, usize> {
        let mut counts: BTreeMap<DeviceType, usize> =
            DeviceType::ALL.iter().map(|d| (*d, 0)).collect();
        for conn in self.inner.read().connections.values() {
            *counts.entry(conn.device_type()).or_default() += 1;
        }
        counts
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = test_connection(WEB_UA, "10.0.0.1:4000");

        let id = registry.register(Arc::clone(&conn));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&id).is_some());

        assert!(registry.unregister(&id).is_some());
        assert!(registry.lookup(&id).is_none());
        assert!(registry.unregister(&id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_keeps_newer_device_binding() {
        let registry = ConnectionRegistry::new();
        let (old, _rx1) = test_connection(IOS_UA, "10.0.0.2:4000");
        let (new, _rx2) = test_connection(IOS_UA, "10.0.0.2:4001");
        old.set_identity(Fingerprint::from_hex("aa"), Some("device-1".to_string()));
        new.set_identity(Fingerprint::from_hex("aa"), Some("device-1".to_string()));

        registry.register(Arc::clone(&old));
        registry.register(Arc::clone(&new));
        registry.bind_device_id("device-1", old.id());
        registry.bind_device_id("device-1", new.id());

        registry.unregister(old.id());
        let owner = registry.device_owner("device-1").unwrap();
        assert_eq!(owner.id(), new.id());
    }

    #[tokio::test]
    async fn test_device_counts() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = test_connection(IOS_UA, "10.0.0.5:1");
        let (b, _rb) = test_connection(ANDROID_UA, "10.0.0.6:1");
        let (c, _rc) = test_connection(WEB_UA, "10.0.0.7:1");
        for conn in [a, b, c] {
            registry.register(conn);
        }

        let counts = registry.device_counts();
        assert_eq!(counts[&DeviceType::Ios], 1);
        assert_eq!(counts[&DeviceType::Android], 1);
        assert_eq!(counts[&DeviceType::Web], 1);
        assert_eq!(counts[&DeviceType::Unknown], 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, mut rx) = test_connection(WEB_UA, "10.0.0.8:1");
        assert!(conn.close());
        assert!(!conn.close());
        assert!(!conn.is_open());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(rx.try_recv().is_err());
        assert!(conn.send_text("{}".to_string()).is_err());

        // Already closed: resolves immediately
        conn.closed().await;
    }

    #[tokio::test]
    async fn test_send_to_full_queue_fails() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(ClientMetadata::default(), tx);
        assert_eq!(conn.device_type(), DeviceType::Unknown);
        conn.send_text("one".to_string()).unwrap();
        let err = conn.send_text("two".to_string()).unwrap_err();
        assert!(err.is_transport_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_alive_never_moves_backwards() {
        let (conn, _rx) = test_connection(WEB_UA, "10.0.0.9:1");
        let start = conn.last_ack();
        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        let later = Instant::now();
        conn.mark_alive(later);
        conn.mark_alive(start);
        assert_eq!(conn.last_ack(), later);
    }
}
