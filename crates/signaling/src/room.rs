//! Room store
//!
//! Named groups of connections with bounded signaling history and aggregate
//! statistics. All rooms sit behind one lock so that reconciliation, the
//! capacity check and admission form a single critical section. Operations on
//! a room that does not exist are no-ops.

use crate::config::HistoryLimits;
use crate::device::DeviceType;
use crate::registry::{Connection, ConnectionId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a join attempt
#[derive(Debug)]
pub enum JoinOutcome {
    /// Connection added; `peers` is the membership before the join
    Admitted { peers: Vec<Arc<Connection>> },
    /// Connection was already a member, nothing changed
    AlreadyMember,
    /// Room is at its member limit
    Full { max: usize },
}

impl JoinOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, JoinOutcome::Admitted { .. })
    }
}

/// An offer kept in room history
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOffer {
    /// Relayed message as sent by the offerer, before any adaptation
    pub message: Value,

    /// Resolution hint observed in the offer
    pub quality_hint: Option<String>,
}

/// Aggregate statistics for one room
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub created_at: DateTime<Utc>,
    /// Current member count
    pub connections: usize,
    /// Admissions since the room was created
    pub total_joins: u64,
    pub peak_connections: usize,
    pub messages_exchanged: u64,
    /// Exponentially weighted message size estimate, in bytes
    pub bandwidth: f64,
    pub resolution: Option<String>,
    pub fps: Option<u32>,
    pub codec: Option<String>,
    pub pixel_format: Option<String>,
    pub h264_profile: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub ios_capabilities: Option<Value>,
}

impl RoomStats {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            connections: 0,
            total_joins: 0,
            peak_connections: 0,
            messages_exchanged: 0,
            bandwidth: 0.0,
            resolution: None,
            fps: None,
            codec: None,
            pixel_format: None,
            h264_profile: None,
            last_activity: now,
            ios_capabilities: None,
        }
    }
}

struct Room {
    members: Vec<Arc<Connection>>,
    offers: VecDeque<StoredOffer>,
    answers: VecDeque<Value>,
    candidates: VecDeque<Value>,
    stats: RoomStats,
}

impl Room {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            offers: VecDeque::new(),
            answers: VecDeque::new(),
            candidates: VecDeque::new(),
            stats: RoomStats::new(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|m| m.id() == id)
    }

    fn remove(&mut self, id: &str) -> Option<Arc<Connection>> {
        let idx = self.members.iter().position(|m| m.id() == id)?;
        let conn = self.members.remove(idx);
        self.stats.connections = self.members.len();
        Some(conn)
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, bound: usize) {
    buf.push_back(item);
    while buf.len() > bound {
        buf.pop_front();
    }
}

/// Candidate dedup key: (candidate, sdpMid, sdpMLineIndex)
fn candidate_key(message: &Value) -> (String, String, String) {
    let field = |name: &str| message.get(name).map(Value::to_string).unwrap_or_default();
    (field("candidate"), field("sdpMid"), field("sdpMLineIndex"))
}

/// Store of all rooms
pub struct RoomStore {
    max_members: usize,
    limits: HistoryLimits,
    rooms: Mutex<HashMap<String, Room>>,
}

impl RoomStore {
    pub fn new(max_members: usize, limits: HistoryLimits) -> Self {
        Self {
            max_members,
            limits,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_members(&self) -> usize {
        self.max_members
    }

    /// Create a room if absent; returns `true` when it was created
    pub fn ensure_room(&self, name: &str) -> bool {
        let mut rooms = self.rooms.lock();
        if rooms.contains_key(name) {
            return false;
        }
        rooms.insert(name.to_string(), Room::new());
        info!(room = %name, "Room created");
        true
    }

    /// Add a connection to a room, creating the room if needed
    pub fn join(&self, room: &str, conn: &Arc<Connection>) -> JoinOutcome {
        self.join_with(room, conn, |_| Vec::new()).0
    }

    /// Join with a reconciliation step inside the same critical section.
    ///
    /// `select_stale` sees the current members and returns connection ids to
    /// drop before the duplicate and capacity checks. Returns the outcome and
    /// the members that were dropped.
    pub fn join_with<F>(
        &self,
        room: &str,
        conn: &Arc<Connection>,
        select_stale: F,
    ) -> (JoinOutcome, Vec<Arc<Connection>>)
    where
        F: FnOnce(&[Arc<Connection>]) -> Vec<ConnectionId>,
    {
        let mut rooms = self.rooms.lock();
        let entry = rooms.entry(room.to_string()).or_insert_with(|| {
            info!(room = %room, "Room created");
            Room::new()
        });

        let stale = select_stale(&entry.members);
        let removed: Vec<Arc<Connection>> = stale
            .iter()
            .filter_map(|id| entry.remove(id))
            .collect();
        for old in &removed {
            old.clear_room_if(room);
        }

        if entry.contains(conn.id()) {
            debug!(room = %room, connection_id = %conn.id(), "Duplicate join ignored");
            return (JoinOutcome::AlreadyMember, removed);
        }

        if entry.members.len() >= self.max_members {
            return (
                JoinOutcome::Full {
                    max: self.max_members,
                },
                removed,
            );
        }

        let peers = entry.members.clone();
        entry.members.push(Arc::clone(conn));
        conn.set_room(Some(room.to_string()));

        let stats = &mut entry.stats;
        stats.connections = entry.members.len();
        stats.total_joins += 1;
        stats.peak_connections = stats.peak_connections.max(entry.members.len());
        stats.last_activity = Utc::now();

        info!(
            room = %room,
            connection_id = %conn.id(),
            device_type = %conn.device_type(),
            members = entry.members.len(),
            "Connection joined room"
        );
        (JoinOutcome::Admitted { peers }, removed)
    }

    /// Remove a member; the room itself is left for the cleanup sweep.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&self, room: &str, conn_id: &str) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(entry) = rooms.get_mut(room) else {
            return false;
        };
        match entry.remove(conn_id) {
            Some(conn) => {
                conn.clear_room_if(room);
                debug!(room = %room, connection_id = %conn_id, members = entry.members.len(), "Connection left room");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, room: &str, conn_id: &str) -> bool {
        self.rooms
            .lock()
            .get(room)
            .is_some_and(|r| r.contains(conn_id))
    }

    pub fn record_offer(&self, room: &str, offer: StoredOffer) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(entry) = rooms.get_mut(room) else {
            return false;
        };
        push_bounded(&mut entry.offers, offer, self.limits.offers);
        true
    }

    pub fn record_answer(&self, room: &str, answer: Value) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(entry) = rooms.get_mut(room) else {
            return false;
        };
        push_bounded(&mut entry.answers, answer, self.limits.answers);
        true
    }

    /// Record a candidate unless an identical one is already in history.
    ///
    /// Returns `false` for duplicates and unknown rooms.
    pub fn record_candidate(&self, room: &str, candidate: Value) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(entry) = rooms.get_mut(room) else {
            return false;
        };
        let key = candidate_key(&candidate);
        if entry.candidates.iter().any(|c| candidate_key(c) == key) {
            return false;
        }
        push_bounded(&mut entry.candidates, candidate, self.limits.candidates);
        true
    }

    pub fn latest_offer(&self, room: &str) -> Option<StoredOffer> {
        self.rooms.lock().get(room)?.offers.back().cloned()
    }

    /// Retained offers, oldest first
    pub fn offer_history(&self, room: &str) -> Vec<StoredOffer> {
        self.rooms
            .lock()
            .get(room)
            .map(|r| r.offers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retained answers, oldest first
    pub fn answer_history(&self, room: &str) -> Vec<Value> {
        self.rooms
            .lock()
            .get(room)
            .map(|r| r.answers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Up to `n` most recent candidates, oldest first
    pub fn recent_candidates(&self, room: &str, n: usize) -> Vec<Value> {
        let rooms = self.rooms.lock();
        let Some(entry) = rooms.get(room) else {
            return Vec::new();
        };
        let skip = entry.candidates.len().saturating_sub(n);
        entry.candidates.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self, room: &str) -> Option<RoomStats> {
        self.rooms.lock().get(room).map(|r| r.stats.clone())
    }

    /// Apply a change to a room's statistics
    pub fn update_stats<F>(&self, room: &str, f: F) -> bool
    where
        F: FnOnce(&mut RoomStats),
    {
        let mut rooms = self.rooms.lock();
        let Some(entry) = rooms.get_mut(room) else {
            return false;
        };
        f(&mut entry.stats);
        true
    }

    /// Count a message and fold its size into the bandwidth estimate
    pub fn touch(&self, room: &str, size: usize) {
        self.update_stats(room, |stats| {
            stats.messages_exchanged += 1;
            stats.last_activity = Utc::now();
            if size > 0 {
                stats.bandwidth = stats.bandwidth * 0.8 + size as f64 * 0.2;
            }
        });
    }

    /// Snapshot of a room's members
    pub fn members(&self, room: &str) -> Vec<Arc<Connection>> {
        self.rooms
            .lock()
            .get(room)
            .map(|r| r.members.clone())
            .unwrap_or_default()
    }

    /// Snapshot of members other than `excluding`
    pub fn peers(&self, room: &str, excluding: &str) -> Vec<Arc<Connection>> {
        let rooms = self.rooms.lock();
        let Some(entry) = rooms.get(room) else {
            return Vec::new();
        };
        entry
            .members
            .iter()
            .filter(|m| m.id() != excluding)
            .cloned()
            .collect()
    }

    /// Distinct device types present in a room
    pub fn device_types(&self, room: &str) -> Vec<DeviceType> {
        let rooms = self.rooms.lock();
        let Some(entry) = rooms.get(room) else {
            return Vec::new();
        };
        entry
            .members
            .iter()
            .map(|m| m.device_type())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Members per device type
    pub fn device_counts(&self, room: &str) -> BTreeMap<DeviceType, usize> {
        let mut counts = BTreeMap::new();
        if let Some(entry) = self.rooms.lock().get(room) {
            for member in &entry.members {
                *counts.entry(member.device_type()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Delete rooms with no members along with their history and statistics
    pub fn remove_empty_rooms(&self) -> Vec<String> {
        let mut rooms = self.rooms.lock();
        let empty: Vec<String> = rooms
            .iter()
            .filter(|(_, r)| r.members.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &empty {
            rooms.remove(name);
            info!(room = %name, "Empty room removed");
        }
        empty
    }

    /// Drop members whose transport is no longer open
    pub fn prune_closed_members(&self) -> usize {
        let mut rooms = self.rooms.lock();
        let mut pruned = 0;
        for (name, entry) in rooms.iter_mut() {
            let before = entry.members.len();
            entry.members.retain(|m| {
                let open = m.is_open();
                if !open {
                    debug!(room = %name, connection_id = %m.id(), "Pruning closed member");
                }
                open
            });
            entry.stats.connections = entry.members.len();
            pruned += before - entry.members.len();
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::*;
    use serde_json::json;

    fn store(max: usize) -> RoomStore {
        RoomStore::new(max, HistoryLimits::default())
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let rooms = store(2);
        let (a, _ra) = test_connection(WEB_UA, "10.2.0.1:1");
        let (b, _rb) = test_connection(WEB_UA, "10.2.0.2:1");
        let (c, _rc) = test_connection(WEB_UA, "10.2.0.3:1");

        assert!(rooms.join("studio", &a).is_admitted());
        assert!(rooms.join("studio", &b).is_admitted());
        assert!(matches!(rooms.join("studio", &c), JoinOutcome::Full { max: 2 }));
        assert_eq!(rooms.members("studio").len(), 2);
        assert_eq!(c.room(), None);
    }

    #[tokio::test]
    async fn test_duplicate_join_is_noop() {
        let rooms = store(2);
        let (a, _ra) = test_connection(WEB_UA, "10.2.0.4:1");

        assert!(rooms.join("studio", &a).is_admitted());
        assert!(matches!(rooms.join("studio", &a), JoinOutcome::AlreadyMember));
        assert_eq!(rooms.members("studio").len(), 1);

        let stats = rooms.stats("studio").unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.total_joins, 1);
    }

    #[tokio::test]
    async fn test_admitted_reports_previous_members() {
        let rooms = store(5);
        let (a, _ra) = test_connection(WEB_UA, "10.2.0.5:1");
        let (b, _rb) = test_connection(IOS_UA, "10.2.0.6:1");

        rooms.join("studio", &a);
        match rooms.join("studio", &b) {
            JoinOutcome::Admitted { peers } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].id(), a.id());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(b.room().as_deref(), Some("studio"));
        assert_eq!(rooms.device_types("studio"), vec![DeviceType::Ios, DeviceType::Web]);
        assert_eq!(rooms.peers("studio", a.id()).len(), 1);
    }

    #[tokio::test]
    async fn test_leave_keeps_room_until_swept() {
        let rooms = store(5);
        let (a, _ra) = test_connection(WEB_UA, "10.2.0.7:1");

        rooms.join("studio", &a);
        assert!(rooms.leave("studio", a.id()));
        assert!(!rooms.leave("studio", a.id()));
        assert_eq!(rooms.room_names(), vec!["studio".to_string()]);
        assert_eq!(a.room(), None);

        assert_eq!(rooms.remove_empty_rooms(), vec!["studio".to_string()]);
        assert_eq!(rooms.room_count(), 0);
        assert!(rooms.stats("studio").is_none());
    }

    #[tokio::test]
    async fn test_prune_closed_members() {
        let rooms = store(5);
        let (a, _ra) = test_connection(WEB_UA, "10.2.0.8:1");
        let (b, _rb) = test_connection(WEB_UA, "10.2.0.9:1");
        rooms.join("studio", &a);
        rooms.join("studio", &b);

        b.close();
        assert_eq!(rooms.prune_closed_members(), 1);
        assert_eq!(rooms.members("studio").len(), 1);
        assert_eq!(rooms.stats("studio").unwrap().connections, 1);
        assert_eq!(rooms.stats("studio").unwrap().peak_connections, 2);
    }

    #[test]
    fn test_offer_history_is_bounded() {
        let rooms = store(5);
        rooms.ensure_room("studio");
        for i in 0..8 {
            rooms.record_offer(
                "studio",
                StoredOffer {
                    message: json!({"type": "offer", "sdp": format!("v=0 #{}", i)}),
                    quality_hint: None,
                },
            );
        }

        let history = rooms.offer_history("studio");
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].message["sdp"], "v=0 #3");
        assert_eq!(rooms.latest_offer("studio").unwrap().message["sdp"], "v=0 #7");
    }

    #[test]
    fn test_answer_history_is_bounded() {
        let rooms = store(5);
        rooms.ensure_room("studio");
        for i in 0..6 {
            rooms.record_answer("studio", json!({"type": "answer", "n": i}));
        }
        let answers = rooms.answer_history("studio");
        assert_eq!(answers.len(), 5);
        assert_eq!(answers[0]["n"], 1);
    }

    #[test]
    fn test_candidate_dedup() {
        let rooms = store(5);
        rooms.ensure_room("studio");
        let candidate = json!({
            "type": "ice-candidate",
            "candidate": "candidate:1 1 udp 2122260223 192.168.1.10 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        });

        assert!(rooms.record_candidate("studio", candidate.clone()));
        assert!(!rooms.record_candidate("studio", candidate.clone()));

        let mut other_line = candidate;
        other_line["sdpMLineIndex"] = json!(1);
        assert!(rooms.record_candidate("studio", other_line));
        assert_eq!(rooms.recent_candidates("studio", 10).len(), 2);
    }

    #[test]
    fn test_recent_candidates_returns_newest() {
        let rooms = store(5);
        rooms.ensure_room("studio");
        for i in 0..40 {
            rooms.record_candidate("studio", json!({"candidate": format!("c{}", i), "sdpMid": "0", "sdpMLineIndex": 0}));
        }

        let recent = rooms.recent_candidates("studio", 10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0]["candidate"], "c30");
        assert_eq!(recent[9]["candidate"], "c39");
    }

    #[test]
    fn test_touch_updates_bandwidth_estimate() {
        let rooms = store(5);
        rooms.ensure_room("studio");
        rooms.touch("studio", 1000);
        rooms.touch("studio", 0);

        let stats = rooms.stats("studio").unwrap();
        assert_eq!(stats.messages_exchanged, 2);
        assert!((stats.bandwidth - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_room_is_noop() {
        let rooms = store(5);
        assert!(!rooms.leave("ghost", "nobody"));
        assert!(!rooms.record_offer(
            "ghost",
            StoredOffer {
                message: json!({}),
                quality_hint: None
            }
        ));
        assert!(!rooms.record_candidate("ghost", json!({})));
        assert!(rooms.latest_offer("ghost").is_none());
        assert!(rooms.recent_candidates("ghost", 10).is_empty());
        assert!(rooms.members("ghost").is_empty());
        rooms.touch("ghost", 10);
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn test_ensure_room_is_idempotent() {
        let rooms = store(5);
        assert!(rooms.ensure_room("studio"));
        assert!(!rooms.ensure_room("studio"));
        assert_eq!(rooms.room_count(), 1);
    }
}
