//! WebSocket transport for the signaling relay
//!
//! Each accepted socket gets a reader loop that feeds text frames to the
//! [`SignalingHub`](crate::SignalingHub) and a writer task that drains the
//! connection's outbound queue.

mod handler;
mod server;

pub use handler::handle_connection;
pub use server::{WebSocketServerHandle, WebSocketSignalingServer};
