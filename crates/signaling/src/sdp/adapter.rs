//! Per-destination rewriting of offers
//!
//! Only video sections are touched: the `b=AS` hint is raised to the tier
//! bitrate, and for iOS receivers an H.264 payload type is moved to the front
//! with decoder-compatible format parameters. Payload types are never
//! renumbered or removed.

use super::{Fmtp, MediaSection, SdpLine, SessionDescription};
use crate::config::{H264Compat, QualityTier, RelayConfig};
use crate::device::DeviceType;

/// Used when the configuration has no usable default tier
const FALLBACK_BITRATE_KBPS: u32 = 8_000;

/// Resolve a resolution hint ("1080p", "1920x1080", ...) to a quality tier.
///
/// Tier names are matched as substrings first. A `WIDTHxHEIGHT` hint picks
/// the tier with that height, else the smallest taller tier, else the tallest
/// tier. Anything else falls back to the default tier.
pub fn tier_for_hint<'a>(hint: Option<&str>, config: &'a RelayConfig) -> Option<&'a QualityTier> {
    let Some(hint) = hint else {
        return config.default_tier();
    };

    if let Some(tier) = config.quality_tiers.iter().find(|t| hint.contains(&t.name)) {
        return Some(tier);
    }

    let height = hint
        .split_once(['x', 'X'])
        .and_then(|(_, h)| h.trim().parse::<u32>().ok());
    let Some(height) = height else {
        return config.default_tier();
    };

    config
        .quality_tiers
        .iter()
        .find(|t| t.height == height)
        .or_else(|| {
            config
                .quality_tiers
                .iter()
                .filter(|t| t.height >= height)
                .min_by_key(|t| t.height)
        })
        .or_else(|| config.quality_tiers.iter().max_by_key(|t| t.height))
        .or_else(|| config.default_tier())
}

/// Target video bitrate in kbps for a resolution hint
pub fn bitrate_for_hint(hint: Option<&str>, config: &RelayConfig) -> u32 {
    tier_for_hint(hint, config).map_or(FALLBACK_BITRATE_KBPS, |t| t.bitrate_kbps)
}

/// Adapt an SDP payload for a destination device.
///
/// Pure and deterministic; applying it twice gives the same result as once.
pub fn adapt(
    payload: &str,
    destination: DeviceType,
    quality_hint: Option<&str>,
    config: &RelayConfig,
) -> String {
    if !payload.contains("m=video") {
        return payload.to_string();
    }

    let mut sdp = SessionDescription::parse(payload);
    let bitrate = bitrate_for_hint(quality_hint, config);

    for section in sdp.video_sections_mut() {
        ensure_bandwidth(section, bitrate);
        if destination == DeviceType::Ios {
            prefer_h264(section, &config.h264);
        }
    }

    sdp.to_string()
}

fn ensure_bandwidth(section: &mut MediaSection, bitrate: u32) {
    let existing = section.lines.iter_mut().find_map(|l| match l {
        SdpLine::Bandwidth { kind, value } if kind == "AS" => Some(value),
        _ => None,
    });
    if let Some(value) = existing {
        if *value < bitrate {
            *value = bitrate;
        }
        return;
    }

    // Present but unparseable: leave it alone rather than adding a second one
    if section
        .lines
        .iter()
        .any(|l| matches!(l, SdpLine::Other(raw) if raw.starts_with("b=AS:")))
    {
        return;
    }

    let at = section
        .position(|l| matches!(l, SdpLine::Connection(_)))
        .map_or(1, |i| i + 1);
    section.insert(
        at,
        SdpLine::Bandwidth {
            kind: "AS".to_string(),
            value: bitrate,
        },
    );
}

fn is_compatible(fmtp: Option<&Fmtp>, compat: &H264Compat) -> bool {
    let Some(fmtp) = fmtp else {
        return false;
    };
    let profile_ok = fmtp
        .param("profile-level-id")
        .is_some_and(|p| compat.profiles.iter().any(|c| c.eq_ignore_ascii_case(p)));
    let mode_ok = fmtp.param("packetization-mode") == Some(compat.packetization_mode.to_string().as_str());
    profile_ok && mode_ok
}

fn prefer_h264(section: &mut MediaSection, compat: &H264Compat) {
    let Some(formats) = section.media_line().map(|m| m.formats.clone()) else {
        return;
    };

    let h264: Vec<String> = section
        .rtpmaps()
        .filter(|r| r.codec().eq_ignore_ascii_case("H264"))
        .map(|r| r.payload_type.clone())
        .filter(|pt| formats.contains(pt))
        .collect();

    let Some(chosen) = h264
        .iter()
        .find(|pt| is_compatible(section.fmtp(pt), compat))
        .or_else(|| h264.first())
        .cloned()
    else {
        return;
    };

    if let Some(media) = section.media_line_mut() {
        if let Some(idx) = media.formats.iter().position(|f| *f == chosen) {
            let pt = media.formats.remove(idx);
            media.formats.insert(0, pt);
        }
    }

    let Some(preferred_profile) = compat.profiles.first() else {
        return;
    };
    let mode = compat.packetization_mode.to_string();

    match section.fmtp_mut(&chosen) {
        Some(fmtp) => {
            let profile_ok = fmtp
                .param("profile-level-id")
                .is_some_and(|p| compat.profiles.iter().any(|c| c.eq_ignore_ascii_case(p)));
            if !profile_ok {
                fmtp.set_param("profile-level-id", preferred_profile);
            }
            if fmtp.param("packetization-mode") != Some(mode.as_str()) {
                fmtp.set_param("packetization-mode", &mode);
            }
        }
        None => {
            let at = section
                .position(|l| matches!(l, SdpLine::Rtpmap(r) if r.payload_type == chosen))
                .map_or(section.lines.len(), |i| i + 1);
            section.insert(
                at,
                SdpLine::Fmtp(Fmtp {
                    payload_type: chosen.clone(),
                    params: format!(
                        "profile-level-id={};packetization-mode={}",
                        preferred_profile, mode
                    ),
                }),
            );
        }
    }
}
