//! Configuration types for the signaling relay

use crate::device::DeviceType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the signaling relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum concurrent members per room (default: 10)
    pub max_room_members: usize,

    /// Room used when a join message carries no roomId (default: "ios-camera")
    pub default_room: String,

    /// Signaling history bounds
    pub history: HistoryLimits,

    /// Heartbeat and cleanup timings
    pub liveness: LivenessConfig,

    /// Per-device liveness multipliers
    pub device_policies: DevicePolicies,

    /// Resolution tiers mapped to target video bitrates
    pub quality_tiers: Vec<QualityTier>,

    /// Tier used when no resolution hint matches (default: "1080p")
    pub default_quality_tier: String,

    /// H.264 parameters accepted by iOS receivers
    pub h264: H264Compat,

    /// Per-connection outbound queue capacity (default: 128)
    pub outbound_queue_size: usize,
}

/// Bounds for the per-room signaling history ring buffers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryLimits {
    /// Offers retained per room (default: 5)
    pub offers: usize,

    /// Answers retained per room (default: 5)
    pub answers: usize,

    /// ICE candidates retained per room (default: 30)
    pub candidates: usize,

    /// Candidates replayed to a newly joined member (default: 10)
    pub replay_candidates: usize,
}

/// Heartbeat, timeout and sweep timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Heartbeat sweep interval and base ping interval in milliseconds (default: 5000)
    pub heartbeat_interval_ms: u64,

    /// Base silence allowed before a connection is terminated (default: 60000)
    pub dead_connection_timeout_ms: u64,

    /// Dead-connection sweep interval in milliseconds (default: 15000)
    pub dead_check_interval_ms: u64,

    /// Room cleanup sweep interval in milliseconds (default: 30000)
    pub room_cleanup_interval_ms: u64,

    /// Delay between the timeout `bye` and the forced close (default: 2000)
    pub close_grace_ms: u64,
}

/// Multipliers applied to the base liveness timings for one device type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DevicePolicy {
    /// Multiplier on the heartbeat interval
    pub heartbeat_multiplier: f64,

    /// Multiplier on the dead-connection timeout
    pub timeout_multiplier: f64,
}

/// Liveness policy for each device type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicePolicies {
    pub ios: DevicePolicy,
    pub android: DevicePolicy,
    pub web: DevicePolicy,
    pub unknown: DevicePolicy,
}

/// A named resolution tier and its target bitrate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityTier {
    /// Tier name as it appears in hints, e.g. "1080p"
    pub name: String,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Target video bitrate in kbps
    pub bitrate_kbps: u32,
}

/// H.264 parameters required by iOS decoders
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct H264Compat {
    /// Accepted profile-level-id values, most preferred first
    pub profiles: Vec<String>,

    /// Required packetization-mode
    pub packetization_mode: u8,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_room_members: 10,
            default_room: "ios-camera".to_string(),
            history: HistoryLimits::default(),
            liveness: LivenessConfig::default(),
            device_policies: DevicePolicies::default(),
            quality_tiers: default_quality_tiers(),
            default_quality_tier: "1080p".to_string(),
            h264: H264Compat::default(),
            outbound_queue_size: 128,
        }
    }
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            offers: 5,
            answers: 5,
            candidates: 30,
            replay_candidates: 10,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            dead_connection_timeout_ms: 60_000,
            dead_check_interval_ms: 15_000,
            room_cleanup_interval_ms: 30_000,
            close_grace_ms: 2_000,
        }
    }
}

impl DevicePolicy {
    /// Policy that leaves the base timings unchanged
    pub const BASE: DevicePolicy = DevicePolicy {
        heartbeat_multiplier: 1.0,
        timeout_multiplier: 1.0,
    };

    /// Policy for phones, whose OS suspends sockets while backgrounded
    pub const MOBILE: DevicePolicy = DevicePolicy {
        heartbeat_multiplier: 1.2,
        timeout_multiplier: 5.0,
    };
}

impl Default for DevicePolicies {
    fn default() -> Self {
        Self {
            ios: DevicePolicy::MOBILE,
            android: DevicePolicy::MOBILE,
            web: DevicePolicy::BASE,
            unknown: DevicePolicy::BASE,
        }
    }
}

impl DevicePolicies {
    /// Policy for a device type
    pub fn for_device(&self, device: DeviceType) -> DevicePolicy {
        match device {
            DeviceType::Ios => self.ios,
            DeviceType::Android => self.android,
            DeviceType::Web => self.web,
            DeviceType::Unknown => self.unknown,
        }
    }
}

impl Default for H264Compat {
    fn default() -> Self {
        Self {
            profiles: vec![
                "42e01f".to_string(),
                "42001f".to_string(),
                "640c1f".to_string(),
            ],
            packetization_mode: 1,
        }
    }
}

fn default_quality_tiers() -> Vec<QualityTier> {
    [
        ("720p", 1280, 720, 5_000),
        ("1080p", 1920, 1080, 8_000),
        ("1440p", 2560, 1440, 12_000),
        ("2160p", 3840, 2160, 20_000),
    ]
    .into_iter()
    .map(|(name, width, height, bitrate_kbps)| QualityTier {
        name: name.to_string(),
        width,
        height,
        bitrate_kbps,
    })
    .collect()
}

impl LivenessConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn dead_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_connection_timeout_ms)
    }

    pub fn dead_check_interval(&self) -> Duration {
        Duration::from_millis(self.dead_check_interval_ms)
    }

    pub fn room_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.room_cleanup_interval_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

impl RelayConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `max_room_members` is 0
    /// - any history bound is 0, or `replay_candidates` exceeds `candidates`
    /// - any liveness interval is 0
    /// - a device multiplier is not a positive finite number
    /// - `quality_tiers` is empty or does not contain `default_quality_tier`
    /// - `h264.profiles` is empty
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.max_room_members == 0 {
            return Err(Error::InvalidConfig(
                "max_room_members must be at least 1".to_string(),
            ));
        }

        if self.default_room.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "default_room must not be empty".to_string(),
            ));
        }

        let h = &self.history;
        if h.offers == 0 || h.answers == 0 || h.candidates == 0 {
            return Err(Error::InvalidConfig(format!(
                "history bounds must be positive, got offers={} answers={} candidates={}",
                h.offers, h.answers, h.candidates
            )));
        }
        if h.replay_candidates > h.candidates {
            return Err(Error::InvalidConfig(format!(
                "replay_candidates ({}) cannot exceed candidates ({})",
                h.replay_candidates, h.candidates
            )));
        }

        let l = &self.liveness;
        for (name, value) in [
            ("heartbeat_interval_ms", l.heartbeat_interval_ms),
            ("dead_connection_timeout_ms", l.dead_connection_timeout_ms),
            ("dead_check_interval_ms", l.dead_check_interval_ms),
            ("room_cleanup_interval_ms", l.room_cleanup_interval_ms),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if l.dead_connection_timeout_ms <= l.heartbeat_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "dead_connection_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                l.dead_connection_timeout_ms, l.heartbeat_interval_ms
            )));
        }

        for device in DeviceType::ALL {
            let policy = self.device_policies.for_device(device);
            for value in [policy.heartbeat_multiplier, policy.timeout_multiplier] {
                if !value.is_finite() || value <= 0.0 {
                    return Err(Error::InvalidConfig(format!(
                        "liveness multipliers for {} must be positive, got {}",
                        device, value
                    )));
                }
            }
        }

        if self.quality_tiers.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one quality tier is required".to_string(),
            ));
        }
        if !self
            .quality_tiers
            .iter()
            .any(|t| t.name == self.default_quality_tier)
        {
            return Err(Error::InvalidConfig(format!(
                "default_quality_tier {} is not a configured tier",
                self.default_quality_tier
            )));
        }

        if self.h264.profiles.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one H.264 profile is required".to_string(),
            ));
        }

        if self.outbound_queue_size == 0 {
            return Err(Error::InvalidConfig(
                "outbound_queue_size must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Look up the default quality tier
    pub fn default_tier(&self) -> Option<&QualityTier> {
        self.quality_tiers
            .iter()
            .find(|t| t.name == self.default_quality_tier)
    }

    /// Create a preset that detects dead peers quickly
    ///
    /// Best for LAN deployments where suspended sockets are rare.
    ///
    /// Settings:
    /// - Heartbeat: 2s
    /// - Dead timeout: 20s (mobile still gets its multiplier)
    /// - Dead check: every 5s
    /// - Cleanup: every 10s
    ///
    /// # Example
    ///
    /// ```
    /// use roomcast_signaling::RelayConfig;
    ///
    /// let config = RelayConfig::aggressive_liveness_preset();
    /// assert!(config.validate().is_ok());
    /// assert_eq!(config.liveness.heartbeat_interval_ms, 2000);
    /// ```
    pub fn aggressive_liveness_preset() -> Self {
        Self {
            liveness: LivenessConfig {
                heartbeat_interval_ms: 2_000,
                dead_connection_timeout_ms: 20_000,
                dead_check_interval_ms: 5_000,
                room_cleanup_interval_ms: 10_000,
                close_grace_ms: 1_000,
            },
            ..Default::default()
        }
    }

    /// Set the maximum number of members per room
    pub fn with_max_room_members(mut self, max: usize) -> Self {
        self.max_room_members = max;
        self
    }

    /// Set the default room name
    pub fn with_default_room(mut self, room: &str) -> Self {
        self.default_room = room.to_string();
        self
    }

    /// Replace the liveness timings
    pub fn with_liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = liveness;
        self
    }
}
