//! Quality inspection of session descriptions

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

static IMAGEATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)a=imageattr:.*send.*\[x=([0-9]+)(?:-([0-9]+))?,\s*y=([0-9]+)(?:-([0-9]+))?")
        .expect("valid imageattr regex")
});
static FRAMERATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)a=framerate:([0-9]+)").expect("valid framerate regex"));
static BITRATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)b=AS:([0-9]+)").expect("valid bitrate regex"));
static PROFILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)profile-level-id=([0-9a-f]+)").expect("valid profile regex")
});

const PIXEL_FORMATS: [&str; 3] = ["420f", "420v", "BGRA"];

/// Video codec named in a description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VideoCodec {
    H264,
    Vp9,
    Vp8,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H264",
            VideoCodec::Vp9 => "VP9",
            VideoCodec::Vp8 => "VP8",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an offer or answer says about the media it proposes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub has_video: bool,
    pub has_audio: bool,
    pub codec: Option<VideoCodec>,
    /// `WIDTHxHEIGHT` from the send image attributes
    pub resolution: Option<String>,
    pub fps: Option<u32>,
    pub bitrate_kbps: Option<u32>,
    pub h264_profile: Option<String>,
    pub pixel_format: Option<String>,
}

impl QualityReport {
    /// Resolution hint for the payload adapter
    pub fn quality_hint(&self) -> Option<String> {
        self.resolution.clone()
    }
}

/// Inspect SDP text. Missing attributes are reported as `None`.
pub fn analyze(sdp: &str) -> QualityReport {
    let has_h264 = sdp.contains("H264");
    let codec = if has_h264 {
        Some(VideoCodec::H264)
    } else if sdp.contains("VP9") {
        Some(VideoCodec::Vp9)
    } else if sdp.contains("VP8") {
        Some(VideoCodec::Vp8)
    } else {
        None
    };

    // Ranges like x=640-1920 report the upper bound
    let resolution = IMAGEATTR_RE.captures(sdp).map(|c| {
        let width = c.get(2).or_else(|| c.get(1)).map_or("", |m| m.as_str());
        let height = c.get(4).or_else(|| c.get(3)).map_or("", |m| m.as_str());
        format!("{}x{}", width, height)
    });

    let number = |re: &Regex| -> Option<u32> {
        re.captures(sdp)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    };

    let (h264_profile, pixel_format) = if has_h264 {
        (
            PROFILE_RE
                .captures(sdp)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
            PIXEL_FORMATS
                .iter()
                .find(|f| sdp.contains(*f))
                .map(|f| f.to_string()),
        )
    } else {
        (None, None)
    };

    QualityReport {
        has_video: sdp.contains("m=video"),
        has_audio: sdp.contains("m=audio"),
        codec,
        resolution,
        fps: number(&*FRAMERATE_RE),
        bitrate_kbps: number(&*BITRATE_RE),
        h264_profile,
        pixel_format,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdp::fixtures::WEB_OFFER;

    #[test]
    fn test_analyze_web_offer() {
        let report = analyze(WEB_OFFER);
        assert!(report.has_video);
        assert!(report.has_audio);
        assert_eq!(report.codec, Some(VideoCodec::H264));
        assert_eq!(report.resolution, None);
        assert_eq!(report.bitrate_kbps, None);
        assert_eq!(report.h264_profile, None);
    }

    #[test]
    fn test_analyze_attributes() {
        let sdp = "v=0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
b=AS:12000\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 profile-level-id=42e01f;packetization-mode=1\r\n\
a=framerate:60\r\n\
a=imageattr:96 send [x=1280-2560,y=720-1440] recv *\r\n\
a=x-pixel-format:420f\r\n";
        let report = analyze(sdp);
        assert!(!report.has_audio);
        assert_eq!(report.resolution.as_deref(), Some("2560x1440"));
        assert_eq!(report.fps, Some(60));
        assert_eq!(report.bitrate_kbps, Some(12000));
        assert_eq!(report.h264_profile.as_deref(), Some("42e01f"));
        assert_eq!(report.pixel_format.as_deref(), Some("420f"));
        assert_eq!(report.quality_hint().as_deref(), Some("2560x1440"));
    }

    #[test]
    fn test_codec_priority_without_h264() {
        let report = analyze("m=video 9 RTP/AVP 98 96\na=rtpmap:96 VP8/90000\na=rtpmap:98 VP9/90000");
        assert_eq!(report.codec, Some(VideoCodec::Vp9));
        assert_eq!(report.pixel_format, None);
    }

    #[test]
    fn test_empty_sdp() {
        assert_eq!(analyze(""), QualityReport::default());
    }
}
