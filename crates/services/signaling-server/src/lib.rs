//! Room signaling server
//!
//! Runs the [`roomcast_signaling`] relay behind two listeners:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                roomcast-signaling-server             │
//! ├──────────────────────────────────────────────────────┤
//! │  WebSocket listener (ws_port)  ← join/offer/answer/… │
//! │        │                                             │
//! │        ▼                                             │
//! │  SignalingHub ◀── LivenessMonitor sweeps             │
//! │        ▲                                             │
//! │        │ read-only                                   │
//! │  HTTP status API (http_port)   ← /health /info       │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
