//! Client device classification

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Device class inferred from client metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Ios,
    Android,
    Web,
    Unknown,
}

impl DeviceType {
    pub const ALL: [DeviceType; 4] = [
        DeviceType::Ios,
        DeviceType::Android,
        DeviceType::Web,
        DeviceType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Ios => "ios",
            DeviceType::Android => "android",
            DeviceType::Web => "web",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Phones whose OS may suspend the socket in the background
    pub fn is_mobile(&self) -> bool {
        matches!(self, DeviceType::Ios | DeviceType::Android)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata captured from the transport handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMetadata {
    /// `User-Agent` request header
    pub user_agent: Option<String>,

    /// Remote socket address
    pub remote_addr: Option<SocketAddr>,

    /// `X-Forwarded-For` request header
    pub forwarded_for: Option<String>,
}

impl ClientMetadata {
    pub fn new(user_agent: Option<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            user_agent,
            remote_addr,
            forwarded_for: None,
        }
    }

    pub fn with_forwarded_for(mut self, forwarded_for: impl Into<String>) -> Self {
        self.forwarded_for = Some(forwarded_for.into());
        self
    }

    /// Source IP as text, empty when unknown
    pub fn source_ip(&self) -> String {
        self.remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default()
    }

    /// Classify the device behind this connection
    pub fn device_type(&self) -> DeviceType {
        classify(self.user_agent.as_deref())
    }
}

const IOS_MARKERS: [&str; 3] = ["iPhone", "iPad", "iPod"];
const ANDROID_MARKERS: [&str; 1] = ["Android"];

/// Classify a user-agent string.
///
/// Returns [`DeviceType::Unknown`] only when no user-agent is available at all.
pub fn classify(user_agent: Option<&str>) -> DeviceType {
    let Some(ua) = user_agent else {
        return DeviceType::Unknown;
    };

    if IOS_MARKERS.iter().any(|m| ua.contains(m)) {
        DeviceType::Ios
    } else if ANDROID_MARKERS.iter().any(|m| ua.contains(m)) {
        DeviceType::Android
    } else {
        DeviceType::Web
    }
}
