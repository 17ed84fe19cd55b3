//! Room-based signaling relay for peer-to-peer video calls
//!
//! This crate pairs browser and mobile clients into named rooms, relays
//! session descriptions and ICE candidates between them, and keeps track of
//! per-room and per-connection liveness. Media never flows through here; only
//! the textual signaling metadata does.
//!
//! # Features
//!
//! - **Rooms with bounded history**: late joiners receive the latest offer and
//!   the most recent candidates
//! - **Reconnect supersession**: a device that reconnects evicts its stale
//!   connection before the capacity check
//! - **Device-aware SDP adaptation**: bandwidth hints per quality tier, H.264
//!   ordering and profile fixes for iOS receivers
//! - **Liveness sweeps**: heartbeats, dead-peer eviction with mobile-friendly
//!   timeouts, empty-room cleanup
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  Browser / iOS / Android clients                       │
//! │  ↓ (JSON over WebSocket)                               │
//! │  WebSocketSignalingServer                              │
//! │  └─ per-connection reader + writer tasks               │
//! │     ↓                                                   │
//! │  SignalingHub                                          │
//! │  ├─ ConnectionRegistry (identities, device types)      │
//! │  ├─ RoomStore (members, history, statistics)           │
//! │  ├─ DeviceResolver (fingerprints, reconnects)          │
//! │  └─ sdp::adapt (per-destination payload rewriting)     │
//! │                                                         │
//! │  LivenessMonitor (heartbeat / dead peers / cleanup)    │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use roomcast_signaling::RelayConfig;
//!
//! let config = RelayConfig {
//!     max_room_members: 2,
//!     ..Default::default()
//! };
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.history.offers, 5);
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod device;
pub mod error;
pub mod identity;
pub mod liveness;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod room;
pub mod sdp;
pub mod websocket;

pub use config::{DevicePolicy, HistoryLimits, LivenessConfig, QualityTier, RelayConfig};
pub use device::{ClientMetadata, DeviceType};
pub use error::{Error, Result};
pub use identity::{DeviceResolver, Fingerprint};
pub use liveness::LivenessMonitor;
pub use metrics::{RelayMetrics, RelayMetricsSnapshot};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, Outbound};
pub use relay::SignalingHub;
pub use room::{JoinOutcome, RoomStats, RoomStore};
pub use websocket::{WebSocketServerHandle, WebSocketSignalingServer};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
