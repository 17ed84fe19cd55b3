//! Signaling relay
//!
//! [`SignalingHub`] owns the connection registry, the room store and the
//! device resolver, and implements the per-message relay rules. Transport
//! handlers feed it text frames; it never awaits, so it can be called from
//! any task.

use crate::config::RelayConfig;
use crate::device::{ClientMetadata, DeviceType};
use crate::error::Result;
use crate::identity::DeviceResolver;
use crate::metrics::RelayMetrics;
use crate::protocol::{
    self, CandidateParams, CapabilitiesParams, ClientMessage, JoinParams, RoomParams, SdpParams,
    ServerMessage, INVALID_MESSAGE_FORMAT, REASON_RECONNECTED,
};
use crate::registry::{Connection, ConnectionRegistry, Outbound};
use crate::room::{JoinOutcome, RoomStore, StoredOffer};
use crate::sdp;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shared relay state
pub struct SignalingHub {
    config: Arc<RelayConfig>,
    registry: Arc<ConnectionRegistry>,
    rooms: RoomStore,
    resolver: DeviceResolver,
    metrics: Arc<RelayMetrics>,
    started_at: DateTime<Utc>,
}

impl SignalingHub {
    /// Create a hub from a validated configuration
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ConnectionRegistry::new());
        Ok(Self {
            rooms: RoomStore::new(config.max_room_members, config.history.clone()),
            resolver: DeviceResolver::new(Arc::clone(&registry)),
            registry,
            config: Arc::new(config),
            metrics: Arc::new(RelayMetrics::new()),
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomStore {
        &self.rooms
    }

    pub fn resolver(&self) -> &DeviceResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Register a freshly accepted transport connection
    pub fn connect(&self, metadata: ClientMetadata, tx: mpsc::Sender<Outbound>) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(metadata, tx));
        self.registry.register(Arc::clone(&conn));
        self.metrics.connection_opened();
        info!(
            connection_id = %conn.id(),
            device_type = %conn.device_type(),
            remote = %conn.metadata().source_ip(),
            "Client connected"
        );
        conn
    }

    /// Handle one inbound text frame.
    ///
    /// Malformed input is answered with an error and never closes the
    /// connection.
    pub fn handle_text(&self, conn: &Arc<Connection>, text: &str) {
        let inbound = match protocol::parse_client_message(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.metrics.malformed_message();
                debug!(connection_id = %conn.id(), error = %e, "Malformed message");
                self.send(conn, &ServerMessage::error(INVALID_MESSAGE_FORMAT));
                return;
            }
        };
        self.metrics.message_received();

        let size = text.len();
        match inbound.message {
            ClientMessage::Join(params) => self.handle_join(conn, params),
            ClientMessage::Offer(params) => self.handle_offer(conn, params, &inbound.raw, size),
            ClientMessage::Answer(params) => self.handle_answer(conn, params, &inbound.raw, size),
            ClientMessage::IceCandidate(params) => {
                self.handle_candidate(conn, params, &inbound.raw, size)
            }
            ClientMessage::Bye(params) => self.handle_bye(conn, params),
            ClientMessage::Ping(params) => self.handle_ping(conn, params),
            ClientMessage::Pong(params) => self.handle_pong(conn, params),
            ClientMessage::IosCapabilities(params) => self.handle_capabilities(conn, params),
            ClientMessage::Other { kind, room_id } => {
                self.handle_generic(conn, &kind, room_id.as_deref(), inbound.raw, size)
            }
        }
    }

    fn handle_join(&self, conn: &Arc<Connection>, params: JoinParams) {
        let room = params
            .room_id
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| self.config.default_room.clone());

        if let Some(current) = conn.room() {
            if current != room {
                info!(connection_id = %conn.id(), from = %current, to = %room, "Switching rooms");
                self.leave_room(conn, &current, None);
            }
        }

        let device_id = params.device_id.as_deref().filter(|d| !d.is_empty());
        let fingerprint = DeviceResolver::fingerprint(conn.metadata(), device_id);
        let reconciliation =
            self.resolver
                .reconcile(&self.rooms, &room, conn, &fingerprint, device_id);

        // Stale connections are notified and closed outside the room lock
        for old in &reconciliation.removed_from_room {
            let notice = ServerMessage::UserLeft {
                user_id: old.id().to_string(),
                reason: Some(REASON_RECONNECTED.to_string()),
                device_type: None,
            };
            self.broadcast(&self.rooms.peers(&room, conn.id()), &notice);
        }
        for old in &reconciliation.evicted {
            self.resolver.evict(old);
        }
        if !reconciliation.evicted.is_empty() {
            self.metrics
                .reconnect_evicted(reconciliation.evicted_count() as u64);
        }

        let peers = match reconciliation.outcome {
            JoinOutcome::Admitted { peers } => peers,
            JoinOutcome::AlreadyMember => {
                debug!(connection_id = %conn.id(), room = %room, "Already in room, ignoring join");
                return;
            }
            JoinOutcome::Full { max } => {
                warn!(connection_id = %conn.id(), room = %room, max, "Join rejected, room is full");
                self.metrics.join_rejected();
                self.send(conn, &ServerMessage::room_full(max));
                return;
            }
        };

        let is_reconnect = params.reconnect || !reconciliation.evicted.is_empty();
        self.broadcast(
            &peers,
            &ServerMessage::UserJoined {
                user_id: conn.id().to_string(),
                device_type: conn.device_type(),
                is_reconnect: is_reconnect.then_some(true),
            },
        );

        if let Some(capabilities) = params.capabilities {
            self.rooms
                .update_stats(&room, |s| s.ios_capabilities = Some(capabilities));
        }

        // Replay: latest offer, recent candidates, then the room summary
        if let Some(offer) = self.rooms.latest_offer(&room) {
            let adapted = self.adapt_offer(&offer, conn.device_type());
            self.deliver(conn, adapted.to_string());
            debug!(connection_id = %conn.id(), room = %room, "Replayed latest offer");
        }
        for candidate in self
            .rooms
            .recent_candidates(&room, self.config.history.replay_candidates)
        {
            self.deliver(conn, candidate.to_string());
        }
        self.send(
            conn,
            &ServerMessage::RoomInfo {
                clients: self.rooms.members(&room).len(),
                room: room.clone(),
                device_types: self.rooms.device_types(&room),
            },
        );
    }

    /// Room the sender belongs to, if a room-scoped message may proceed.
    ///
    /// Messages before join or naming another room are dropped.
    fn joined_room(&self, conn: &Connection, named: Option<&str>, kind: &str) -> Option<String> {
        let Some(room) = conn.room() else {
            debug!(connection_id = %conn.id(), kind, "Dropping message before join");
            return None;
        };
        if let Some(named) = named.filter(|n| *n != room) {
            debug!(connection_id = %conn.id(), kind, room = %named, "Dropping message for another room");
            return None;
        }
        if !self.rooms.contains(&room, conn.id()) {
            debug!(connection_id = %conn.id(), kind, room = %room, "Dropping message, not a member");
            return None;
        }
        Some(room)
    }

    fn handle_offer(&self, conn: &Arc<Connection>, params: SdpParams, raw: &Map<String, Value>, size: usize) {
        let Some(room) = self.joined_room(conn, params.room_id.as_deref(), "offer") else {
            return;
        };

        let report = sdp::analyze(&params.sdp);
        info!(
            connection_id = %conn.id(),
            room = %room,
            video = report.has_video,
            audio = report.has_audio,
            codec = ?report.codec,
            resolution = ?report.resolution,
            fps = ?report.fps,
            bitrate_kbps = ?report.bitrate_kbps,
            "Offer received"
        );
        self.rooms.update_stats(&room, |s| {
            if report.resolution.is_some() {
                s.resolution = report.resolution.clone();
            }
            if report.fps.is_some() {
                s.fps = report.fps;
            }
            if let Some(codec) = report.codec {
                s.codec = Some(codec.to_string());
            }
            if report.pixel_format.is_some() {
                s.pixel_format = report.pixel_format.clone();
            }
            if report.h264_profile.is_some() {
                s.h264_profile = report.h264_profile.clone();
            }
        });

        let stored = StoredOffer {
            message: protocol::stamp(
                raw,
                conn.id(),
                conn.device_type(),
                protocol::current_timestamp(),
            ),
            quality_hint: report.quality_hint(),
        };
        self.rooms.record_offer(&room, stored.clone());

        // One adaptation per destination device type
        let mut variants: HashMap<DeviceType, String> = HashMap::new();
        for peer in self.rooms.peers(&room, conn.id()) {
            if !peer.is_open() {
                continue;
            }
            let text = variants
                .entry(peer.device_type())
                .or_insert_with(|| self.adapt_offer(&stored, peer.device_type()).to_string());
            self.deliver(&peer, text.clone());
        }
        self.rooms.touch(&room, size);
    }

    fn adapt_offer(&self, offer: &StoredOffer, destination: DeviceType) -> Value {
        match offer.message.get("sdp").and_then(Value::as_str) {
            Some(original) => {
                let adapted = sdp::adapt(
                    original,
                    destination,
                    offer.quality_hint.as_deref(),
                    &self.config,
                );
                protocol::with_sdp(&offer.message, adapted)
            }
            None => offer.message.clone(),
        }
    }

    fn handle_answer(&self, conn: &Arc<Connection>, params: SdpParams, raw: &Map<String, Value>, size: usize) {
        let Some(room) = self.joined_room(conn, params.room_id.as_deref(), "answer") else {
            return;
        };

        let report = sdp::analyze(&params.sdp);
        debug!(
            connection_id = %conn.id(),
            room = %room,
            codec = ?report.codec,
            resolution = ?report.resolution,
            "Answer received"
        );

        let stamped = protocol::stamp(raw, conn.id(), conn.device_type(), protocol::current_timestamp());
        self.rooms.record_answer(&room, stamped.clone());
        self.broadcast_value(&self.rooms.peers(&room, conn.id()), &stamped);
        self.rooms.touch(&room, size);
    }

    fn handle_candidate(
        &self,
        conn: &Arc<Connection>,
        params: CandidateParams,
        raw: &Map<String, Value>,
        size: usize,
    ) {
        let Some(room) = self.joined_room(conn, params.room_id.as_deref(), "ice-candidate") else {
            return;
        };

        let stamped = protocol::stamp(raw, conn.id(), conn.device_type(), protocol::current_timestamp());
        if !self.rooms.record_candidate(&room, stamped.clone()) {
            debug!(connection_id = %conn.id(), room = %room, "Duplicate ICE candidate ignored");
            return;
        }
        self.broadcast_value(&self.rooms.peers(&room, conn.id()), &stamped);
        self.rooms.touch(&room, size);
    }

    // Control messages count as activity but stay out of the bandwidth estimate
    fn handle_bye(&self, conn: &Arc<Connection>, params: RoomParams) {
        let Some(room) = self.joined_room(conn, params.room_id.as_deref(), "bye") else {
            return;
        };
        info!(connection_id = %conn.id(), room = %room, "Peer said bye");
        self.broadcast(
            &self.rooms.peers(&room, conn.id()),
            &ServerMessage::PeerDisconnected {
                user_id: conn.id().to_string(),
                device_type: conn.device_type(),
            },
        );
        self.rooms.touch(&room, 0);
    }

    fn handle_ping(&self, conn: &Arc<Connection>, _params: RoomParams) {
        conn.mark_alive(Instant::now());
        self.send(
            conn,
            &ServerMessage::Pong {
                timestamp: protocol::current_timestamp(),
            },
        );
        if let Some(room) = conn.room() {
            self.rooms.touch(&room, 0);
        }
    }

    fn handle_pong(&self, conn: &Arc<Connection>, _params: RoomParams) {
        conn.mark_alive(Instant::now());
        if let Some(room) = conn.room() {
            self.rooms.touch(&room, 0);
        }
    }

    fn handle_capabilities(&self, conn: &Arc<Connection>, params: CapabilitiesParams) {
        let Some(room) = self.joined_room(conn, params.room_id.as_deref(), "ios-capabilities") else {
            return;
        };
        debug!(connection_id = %conn.id(), room = %room, "Client capabilities updated");
        let capabilities = params.capabilities;
        self.rooms
            .update_stats(&room, |s| s.ios_capabilities = Some(capabilities.clone()));
        self.broadcast(
            &self.rooms.peers(&room, conn.id()),
            &ServerMessage::IosCapabilitiesUpdate {
                user_id: conn.id().to_string(),
                capabilities,
            },
        );
        self.rooms.touch(&room, 0);
    }

    fn handle_generic(
        &self,
        conn: &Arc<Connection>,
        kind: &str,
        named_room: Option<&str>,
        raw: Map<String, Value>,
        size: usize,
    ) {
        let Some(room) = self.joined_room(conn, named_room, kind) else {
            return;
        };
        self.broadcast_value(&self.rooms.peers(&room, conn.id()), &Value::Object(raw));
        self.rooms.touch(&room, size);
    }

    /// Leave a room and tell the remaining members
    fn leave_room(&self, conn: &Connection, room: &str, device_type: Option<DeviceType>) -> bool {
        if !self.rooms.leave(room, conn.id()) {
            return false;
        }
        self.broadcast(
            &self.rooms.peers(room, conn.id()),
            &ServerMessage::UserLeft {
                user_id: conn.id().to_string(),
                reason: None,
                device_type,
            },
        );
        true
    }

    /// Tear down a closed transport.
    ///
    /// Deregisters the connection and, if it was still a room member, tells
    /// the remaining members. Empty rooms stay until the cleanup sweep.
    /// Calling this twice is harmless.
    pub fn disconnect(&self, conn: &Arc<Connection>) {
        conn.close();
        if self.registry.unregister(conn.id()).is_none() {
            return;
        }
        self.metrics.connection_closed();

        let room = conn.room();
        if let Some(room) = &room {
            self.leave_room(conn, room, Some(conn.device_type()));
        }
        info!(
            connection_id = %conn.id(),
            device_type = %conn.device_type(),
            room = ?room,
            "Client disconnected"
        );
    }

    /// Queue a relay-generated message for one connection
    pub fn send(&self, to: &Connection, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.deliver(to, text),
            Err(e) => {
                warn!(error = %e, "Failed to encode message");
                false
            }
        }
    }

    /// Queue text for one connection; failures are logged and counted
    pub(crate) fn deliver(&self, to: &Connection, text: String) -> bool {
        match to.send_text(text) {
            Ok(()) => {
                self.metrics.message_relayed();
                true
            }
            Err(e) => {
                self.metrics.send_failed();
                warn!(connection_id = %to.id(), error = %e, "Failed to deliver message");
                false
            }
        }
    }

    fn broadcast(&self, recipients: &[Arc<Connection>], message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(text) => self.broadcast_text(recipients, &text),
            Err(e) => warn!(error = %e, "Failed to encode broadcast"),
        }
    }

    fn broadcast_value(&self, recipients: &[Arc<Connection>], message: &Value) {
        self.broadcast_text(recipients, &message.to_string());
    }

    fn broadcast_text(&self, recipients: &[Arc<Connection>], text: &str) {
        for peer in recipients.iter().filter(|p| p.is_open()) {
            self.deliver(peer, text.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::*;
    use crate::sdp::fixtures::WEB_OFFER;
    use serde_json::json;
    use std::collections::HashSet;

    fn hub(max: usize) -> SignalingHub {
        SignalingHub::new(RelayConfig::default().with_max_room_members(max)).unwrap()
    }

    fn client(hub: &SignalingHub, ua: &str, addr: &str) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        let meta = ClientMetadata::new(Some(ua.to_string()), addr.parse().ok());
        (hub.connect(meta, tx), rx)
    }

    fn join(hub: &SignalingHub, conn: &Arc<Connection>, room: &str) {
        hub.handle_text(conn, &json!({"type": "join", "roomId": room}).to_string());
    }

    fn types(messages: &[Value]) -> Vec<String> {
        messages
            .iter()
            .map(|m| m["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_web_offer_gets_bandwidth_after_user_joined() {
        let hub = hub(10);
        let (b, mut rb) = client(&hub, WEB_UA, "10.3.0.2:1");
        let (a, mut ra) = client(&hub, WEB_UA, "10.3.0.1:1");

        join(&hub, &b, "studio");
        join(&hub, &a, "studio");
        hub.handle_text(&a, &json!({"type": "offer", "sdp": WEB_OFFER, "roomId": "studio"}).to_string());

        let received = drain_json(&mut rb);
        assert_eq!(types(&received), vec!["room-info", "user-joined", "offer"]);
        assert_eq!(received[1]["userId"], a.id());
        assert_eq!(received[1]["deviceType"], "web");

        let offer = &received[2];
        assert_eq!(offer["senderId"], a.id());
        assert_eq!(offer["senderDeviceType"], "web");
        assert!(offer["timestamp"].as_i64().unwrap() > 0);
        let sdp = offer["sdp"].as_str().unwrap();
        assert!(sdp.contains("m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\nc=IN IP4 0.0.0.0\r\nb=AS:8000\r\n"));

        // The offerer gets nothing back but its own room-info
        assert_eq!(types(&drain_json(&mut ra)), vec!["room-info"]);
    }

    #[tokio::test]
    async fn test_ios_joiner_gets_compatible_h264() {
        let hub = hub(10);
        let (web_a, _ra) = client(&hub, WEB_UA, "10.3.1.1:1");
        let (web_b, mut rb) = client(&hub, WEB_UA, "10.3.1.2:1");
        join(&hub, &web_a, "studio");
        join(&hub, &web_b, "studio");
        hub.handle_text(&web_a, &json!({"type": "offer", "sdp": WEB_OFFER}).to_string());

        let (ios, mut ri) = client(&hub, IOS_UA, "10.3.1.3:1");
        join(&hub, &ios, "studio");

        let replay = drain_json(&mut ri);
        assert_eq!(types(&replay), vec!["offer", "room-info"]);
        let ios_sdp = replay[0]["sdp"].as_str().unwrap();
        assert!(ios_sdp.contains("m=video 9 UDP/TLS/RTP/SAVPF 97 96"));
        assert!(ios_sdp.contains("a=fmtp:97 profile-level-id=42e01f;packetization-mode=1"));
        assert_eq!(replay[1]["clients"], 3);
        assert_eq!(replay[1]["deviceTypes"], json!(["ios", "web"]));

        let web_copy = drain_json(&mut rb)
            .into_iter()
            .find(|m| m["type"] == "offer")
            .unwrap();
        let web_sdp = web_copy["sdp"].as_str().unwrap();
        assert!(!web_sdp.contains("profile-level-id"));
        assert!(!web_sdp.contains("packetization-mode"));
    }

    #[tokio::test]
    async fn test_offer_adapted_per_destination_type() {
        let hub = hub(10);
        let (sender, _rs) = client(&hub, WEB_UA, "10.3.2.1:1");
        let (ios, mut ri) = client(&hub, IOS_UA, "10.3.2.2:1");
        let (web, mut rw) = client(&hub, WEB_UA, "10.3.2.3:1");
        for conn in [&sender, &ios, &web] {
            join(&hub, conn, "studio");
        }
        drain_json(&mut ri);
        drain_json(&mut rw);

        hub.handle_text(&sender, &json!({"type": "offer", "sdp": WEB_OFFER}).to_string());
        let ios_offer = drain_json(&mut ri).pop().unwrap();
        let web_offer = drain_json(&mut rw).pop().unwrap();
        assert!(ios_offer["sdp"].as_str().unwrap().contains("packetization-mode=1"));
        assert!(!web_offer["sdp"].as_str().unwrap().contains("packetization-mode=1"));

        // History keeps the unadapted offer
        let stored = hub.rooms().latest_offer("studio").unwrap();
        assert_eq!(stored.message["sdp"], WEB_OFFER);
        assert_eq!(hub.rooms().stats("studio").unwrap().codec.as_deref(), Some("H264"));
    }

    #[tokio::test]
    async fn test_capacity_refusal_names_limit() {
        let hub = hub(2);
        let (a, _ra) = client(&hub, WEB_UA, "10.3.3.1:1");
        let (b, _rb) = client(&hub, ANDROID_UA, "10.3.3.2:1");
        let (c, mut rc) = client(&hub, IOS_UA, "10.3.3.3:1");
        for conn in [&a, &b, &c] {
            join(&hub, conn, "studio");
        }

        let replies = drain_json(&mut rc);
        assert_eq!(types(&replies), vec!["error"]);
        assert!(replies[0]["message"].as_str().unwrap().contains('2'));
        assert_eq!(hub.rooms().members("studio").len(), 2);
        assert_eq!(c.room(), None);
        assert_eq!(hub.metrics().snapshot().joins_rejected, 1);
    }

    #[tokio::test]
    async fn test_duplicate_join_counts_once() {
        let hub = hub(10);
        let (a, mut ra) = client(&hub, WEB_UA, "10.3.4.1:1");
        join(&hub, &a, "studio");
        join(&hub, &a, "studio");

        assert_eq!(hub.rooms().members("studio").len(), 1);
        assert_eq!(types(&drain_json(&mut ra)), vec!["room-info"]);
    }

    #[tokio::test]
    async fn test_join_without_room_uses_default() {
        let hub = hub(10);
        let (a, _ra) = client(&hub, IOS_UA, "10.3.5.1:1");
        hub.handle_text(&a, r#"{"type":"join"}"#);
        assert_eq!(a.room().as_deref(), Some("ios-camera"));
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_and_notifies() {
        let hub = hub(2);
        let (viewer, mut rv) = client(&hub, WEB_UA, "10.3.6.1:1");
        let (old, _ro) = client(&hub, IOS_UA, "10.3.6.2:1000");
        join(&hub, &viewer, "studio");
        hub.handle_text(&old, &json!({"type": "join", "roomId": "studio", "deviceId": "cam"}).to_string());
        drain_json(&mut rv);

        let (new, _rn) = client(&hub, IOS_UA, "10.3.6.2:1001");
        hub.handle_text(
            &new,
            &json!({"type": "join", "roomId": "studio", "deviceId": "cam", "reconnect": true}).to_string(),
        );

        let members = hub.rooms().members("studio");
        assert_eq!(members.len(), 2);
        assert!(members.iter().any(|m| m.id() == new.id()));
        assert!(!old.is_open());

        let notices = drain_json(&mut rv);
        assert_eq!(types(&notices), vec!["user-left", "user-joined"]);
        assert_eq!(notices[0]["userId"], old.id());
        assert_eq!(notices[0]["reason"], "reconnected");
        assert_eq!(notices[1]["isReconnect"], true);

        // The stale transport closing later must not announce a second departure
        hub.disconnect(&old);
        assert!(drain_json(&mut rv).is_empty());
        assert_eq!(hub.metrics().snapshot().reconnect_evictions, 1);
    }

    #[tokio::test]
    async fn test_candidates_dedup_and_replay() {
        let hub = hub(10);
        let (a, _ra) = client(&hub, WEB_UA, "10.3.7.1:1");
        let (b, mut rb) = client(&hub, WEB_UA, "10.3.7.2:1");
        join(&hub, &a, "studio");
        join(&hub, &b, "studio");
        drain_json(&mut rb);

        let candidate = json!({
            "type": "ice-candidate",
            "candidate": "candidate:1 1 udp 2122260223 192.168.1.10 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        })
        .to_string();
        hub.handle_text(&a, &candidate);
        hub.handle_text(&a, &candidate);

        let relayed = drain_json(&mut rb);
        assert_eq!(types(&relayed), vec!["ice-candidate"]);
        assert_eq!(relayed[0]["senderId"], a.id());
        assert_eq!(hub.rooms().recent_candidates("studio", 10).len(), 1);

        let (c, mut rc) = client(&hub, WEB_UA, "10.3.7.3:1");
        join(&hub, &c, "studio");
        assert_eq!(types(&drain_json(&mut rc)), vec!["ice-candidate", "room-info"]);
    }

    #[tokio::test]
    async fn test_answer_relayed_verbatim() {
        let hub = hub(10);
        let (a, mut ra) = client(&hub, IOS_UA, "10.3.8.1:1");
        let (b, _rb) = client(&hub, WEB_UA, "10.3.8.2:1");
        join(&hub, &a, "studio");
        join(&hub, &b, "studio");
        drain_json(&mut ra);

        let answer_sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n";
        hub.handle_text(&b, &json!({"type": "answer", "sdp": answer_sdp}).to_string());

        let relayed = drain_json(&mut ra);
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0]["sdp"], answer_sdp);
        assert_eq!(relayed[0]["senderDeviceType"], "web");
        assert_eq!(hub.rooms().answer_history("studio").len(), 1);
    }

    #[tokio::test]
    async fn test_bye_keeps_sender_in_room() {
        let hub = hub(10);
        let (a, _ra) = client(&hub, ANDROID_UA, "10.3.9.1:1");
        let (b, mut rb) = client(&hub, WEB_UA, "10.3.9.2:1");
        join(&hub, &a, "studio");
        join(&hub, &b, "studio");
        drain_json(&mut rb);

        hub.handle_text(&a, r#"{"type":"bye","roomId":"studio"}"#);
        let notices = drain_json(&mut rb);
        assert_eq!(notices, vec![json!({"type": "peer-disconnected", "userId": a.id(), "deviceType": "android"})]);
        assert!(hub.rooms().contains("studio", a.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_replies_pong_and_refreshes_liveness() {
        let hub = hub(10);
        let (a, mut ra) = client(&hub, WEB_UA, "10.3.10.1:1");
        let before = a.last_ack();
        tokio::time::advance(std::time::Duration::from_secs(3)).await;

        hub.handle_text(&a, r#"{"type":"ping"}"#);
        let replies = drain_json(&mut ra);
        assert_eq!(types(&replies), vec!["pong"]);
        assert!(replies[0]["timestamp"].as_i64().is_some());
        assert!(a.last_ack() > before);

        tokio::time::advance(std::time::Duration::from_secs(3)).await;
        let before = a.last_ack();
        hub.handle_text(&a, r#"{"type":"pong"}"#);
        assert!(a.last_ack() > before);
        assert!(drain_json(&mut ra).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_input_keeps_connection_open() {
        let hub = hub(10);
        let (a, mut ra) = client(&hub, WEB_UA, "10.3.11.1:1");
        hub.handle_text(&a, "{not json");
        hub.handle_text(&a, r#"{"type":"offer"}"#);

        let replies = drain_json(&mut ra);
        assert_eq!(replies.len(), 2);
        for reply in replies {
            assert_eq!(reply, json!({"type": "error", "message": "Invalid message format"}));
        }
        assert!(a.is_open());
        assert_eq!(hub.metrics().snapshot().malformed_messages, 2);
    }

    #[tokio::test]
    async fn test_messages_outside_room_are_dropped() {
        let hub = hub(10);
        let (a, mut ra) = client(&hub, WEB_UA, "10.3.12.1:1");
        let (b, mut rb) = client(&hub, WEB_UA, "10.3.12.2:1");

        // Before join
        hub.handle_text(&a, &json!({"type": "offer", "sdp": WEB_OFFER}).to_string());
        assert!(drain_json(&mut ra).is_empty());

        join(&hub, &a, "studio");
        join(&hub, &b, "studio");
        drain_json(&mut rb);

        // Naming a different room
        hub.handle_text(&a, &json!({"type": "offer", "sdp": WEB_OFFER, "roomId": "lobby"}).to_string());
        assert!(drain_json(&mut rb).is_empty());
        assert!(hub.rooms().latest_offer("studio").is_none());
    }

    #[tokio::test]
    async fn test_unknown_types_relay_verbatim() {
        let hub = hub(10);
        let (a, _ra) = client(&hub, WEB_UA, "10.3.13.1:1");
        let (b, mut rb) = client(&hub, WEB_UA, "10.3.13.2:1");
        join(&hub, &a, "studio");
        join(&hub, &b, "studio");
        drain_json(&mut rb);

        hub.handle_text(&a, r#"{"type":"chat","text":"hello"}"#);
        assert_eq!(drain_json(&mut rb), vec![json!({"type": "chat", "text": "hello"})]);
    }

    #[tokio::test]
    async fn test_capabilities_are_stored_and_broadcast() {
        let hub = hub(10);
        let (ios, _ri) = client(&hub, IOS_UA, "10.3.14.1:1");
        let (web, mut rw) = client(&hub, WEB_UA, "10.3.14.2:1");
        join(&hub, &ios, "studio");
        join(&hub, &web, "studio");
        drain_json(&mut rw);

        hub.handle_text(&ios, r#"{"type":"ios-capabilities","capabilities":{"h264":true,"maxFps":60}}"#);
        let update = drain_json(&mut rw);
        assert_eq!(update[0]["type"], "ios-capabilities-update");
        assert_eq!(update[0]["capabilities"]["maxFps"], 60);
        assert_eq!(
            hub.rooms().stats("studio").unwrap().ios_capabilities,
            Some(json!({"h264": true, "maxFps": 60}))
        );
    }

    #[tokio::test]
    async fn test_disconnect_announces_departure_once() {
        let hub = hub(10);
        let (a, _ra) = client(&hub, IOS_UA, "10.3.15.1:1");
        let (b, mut rb) = client(&hub, WEB_UA, "10.3.15.2:1");
        join(&hub, &a, "studio");
        join(&hub, &b, "studio");
        drain_json(&mut rb);

        hub.disconnect(&a);
        hub.disconnect(&a);

        assert_eq!(
            drain_json(&mut rb),
            vec![json!({"type": "user-left", "userId": a.id(), "deviceType": "ios"})]
        );
        assert!(hub.registry().lookup(a.id()).is_none());
        assert_eq!(hub.rooms().stats("studio").unwrap().connections, 1);

        // Last member leaving keeps the room until the sweep
        hub.disconnect(&b);
        assert_eq!(hub.rooms().room_names(), vec!["studio".to_string()]);
        assert_eq!(hub.metrics().snapshot().active_connections, 0);
    }

    #[tokio::test]
    async fn test_switching_rooms_leaves_previous() {
        let hub = hub(10);
        let (a, _ra) = client(&hub, WEB_UA, "10.3.16.1:1");
        let (b, mut rb) = client(&hub, WEB_UA, "10.3.16.2:1");
        join(&hub, &a, "lobby");
        join(&hub, &b, "lobby");
        drain_json(&mut rb);

        join(&hub, &a, "studio");
        assert_eq!(types(&drain_json(&mut rb)), vec!["user-left"]);
        assert!(!hub.rooms().contains("lobby", a.id()));
        assert!(hub.rooms().contains("studio", a.id()));
    }

    #[tokio::test]
    async fn test_control_messages_leave_bandwidth_estimate() {
        let hub = hub(10);
        let (a, _ra) = client(&hub, WEB_UA, "10.3.17.1:1");
        let (b, _rb) = client(&hub, WEB_UA, "10.3.17.2:1");
        join(&hub, &a, "studio");
        join(&hub, &b, "studio");
        hub.handle_text(&a, &json!({"type": "offer", "sdp": WEB_OFFER, "roomId": "studio"}).to_string());

        let before = hub.rooms().stats("studio").unwrap();
        assert!(before.bandwidth > 0.0);

        for _ in 0..10 {
            hub.handle_text(&b, r#"{"type":"pong"}"#);
            hub.handle_text(&b, r#"{"type":"ping"}"#);
        }
        hub.handle_text(&b, &json!({"type": "ios-capabilities", "capabilities": {"h264": true}}).to_string());
        hub.handle_text(&b, r#"{"type":"bye"}"#);

        let after = hub.rooms().stats("studio").unwrap();
        assert_eq!(after.bandwidth, before.bandwidth);
        assert_eq!(after.messages_exchanged, before.messages_exchanged + 22);
    }

    fn roomy_client(hub: &SignalingHub, ua: &str, addr: &str) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4096);
        let meta = ClientMetadata::new(Some(ua.to_string()), addr.parse().ok());
        (hub.connect(meta, tx), rx)
    }

    #[test]
    fn test_concurrent_joins_respect_capacity_and_device_identity() {
        let hub = hub(4);
        let mut conns = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..12 {
            let (conn, rx) = roomy_client(&hub, WEB_UA, &format!("10.4.0.{}:1", i + 1));
            conns.push((conn, Some(format!("laptop-{}", i))));
            receivers.push(rx);
        }
        // Reconnect storm from one phone
        for i in 0..6 {
            let (conn, rx) = roomy_client(&hub, IOS_UA, &format!("10.4.1.1:{}", 2000 + i));
            conns.push((conn, Some("phone".to_string())));
            receivers.push(rx);
        }
        // Reconnects without a device id share a user-agent fingerprint
        for i in 0..6 {
            let (conn, rx) = roomy_client(&hub, ANDROID_UA, &format!("10.4.2.1:{}", 3000 + i));
            conns.push((conn, None));
            receivers.push(rx);
        }

        let barrier = std::sync::Barrier::new(conns.len());
        std::thread::scope(|s| {
            for (conn, device) in &conns {
                let (hub, barrier) = (&hub, &barrier);
                s.spawn(move || {
                    let mut message = json!({"type": "join", "roomId": "studio"});
                    if let Some(device) = device {
                        message["deviceId"] = json!(device);
                    }
                    barrier.wait();
                    hub.handle_text(conn, &message.to_string());
                });
            }
        });

        let members = hub.rooms().members("studio");
        assert!(!members.is_empty());
        assert!(members.len() <= 4, "{} members in a room of 4", members.len());
        assert!(members.iter().all(|m| m.is_open()));

        let fingerprints: HashSet<_> = members.iter().filter_map(|m| m.fingerprint()).collect();
        assert_eq!(fingerprints.len(), members.len());
        let phones = members
            .iter()
            .filter(|m| m.device_id().as_deref() == Some("phone"))
            .count();
        assert!(phones <= 1);
        assert_eq!(hub.rooms().stats("studio").unwrap().connections, members.len());
    }

    #[test]
    fn test_broadcast_reaches_snapshot_once_during_churn() {
        const ROUNDS: u64 = 50;
        let hub = hub(32);
        let mut listeners = Vec::new();
        let mut listener_rx = Vec::new();
        for i in 0..6 {
            let (conn, rx) = roomy_client(&hub, WEB_UA, &format!("10.5.0.{}:1", i + 1));
            join(&hub, &conn, "studio");
            listeners.push(conn);
            listener_rx.push(rx);
        }
        let mut visitors = Vec::new();
        let mut visitor_rx = Vec::new();
        for i in 0..6 {
            let (conn, rx) = roomy_client(&hub, WEB_UA, &format!("10.5.1.{}:1", i + 1));
            visitors.push(conn);
            visitor_rx.push(rx);
        }
        let snapshot = hub.rooms().members("studio");
        assert_eq!(snapshot.len(), listeners.len());

        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    for v in &visitors {
                        join(&hub, v, "studio");
                    }
                    for l in &listeners {
                        hub.rooms().leave("studio", l.id());
                    }
                    for l in &listeners {
                        join(&hub, l, "studio");
                    }
                    for v in &visitors {
                        hub.rooms().leave("studio", v.id());
                    }
                }
            });
            s.spawn(|| {
                for seq in 0..ROUNDS {
                    hub.broadcast_value(&snapshot, &json!({"type": "chat", "seq": seq}));
                }
            });
        });

        let chats = |rx: &mut mpsc::Receiver<Outbound>| -> Vec<u64> {
            drain_json(rx)
                .into_iter()
                .filter(|m| m["type"] == "chat")
                .filter_map(|m| m["seq"].as_u64())
                .collect()
        };
        for rx in &mut listener_rx {
            assert_eq!(chats(rx), (0..ROUNDS).collect::<Vec<_>>());
        }
        for rx in &mut visitor_rx {
            assert!(chats(rx).is_empty());
        }
    }
}
