//! Session description handling
//!
//! A small line-oriented SDP model: the text is split into session-level lines
//! and media sections, the lines the relay rewrites are typed, and everything
//! else is carried verbatim. Serializing an unmodified description reproduces
//! the input byte for byte, line endings included: each line keeps its own
//! terminator, and inserted lines use the description's dominant one.

mod adapter;
mod analyze;

pub use adapter::{adapt, bitrate_for_hint, tier_for_hint};
pub use analyze::{analyze, QualityReport, VideoCodec};

use std::fmt;

/// `m=` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLine {
    pub media: String,
    pub port: String,
    pub proto: String,
    pub formats: Vec<String>,
}

/// `a=rtpmap:<pt> <encoding>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rtpmap {
    pub payload_type: String,
    /// Encoding name, clock rate and optional channels, e.g. `H264/90000`
    pub encoding: String,
}

impl Rtpmap {
    /// Encoding name without clock rate
    pub fn codec(&self) -> &str {
        self.encoding.split('/').next().unwrap_or_default()
    }
}

/// `a=fmtp:<pt> <params>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fmtp {
    pub payload_type: String,
    pub params: String,
}

impl Fmtp {
    /// Value of a `key=value` parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.split(';').find_map(|p| {
            let (k, v) = p.trim().split_once('=')?;
            (k.trim().eq_ignore_ascii_case(key)).then(|| v.trim())
        })
    }

    /// Set a parameter, replacing an existing value or appending it
    pub fn set_param(&mut self, key: &str, value: &str) {
        let mut found = false;
        let params: Vec<String> = self
            .params
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, _)) if k.trim().eq_ignore_ascii_case(key) => {
                    found = true;
                    format!("{}={}", key, value)
                }
                _ => p.to_string(),
            })
            .collect();

        self.params = params.join(";");
        if !found {
            if !self.params.is_empty() {
                self.params.push(';');
            }
            self.params.push_str(&format!("{}={}", key, value));
        }
    }
}

/// One SDP line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpLine {
    Media(MediaLine),
    /// `c=` value
    Connection(String),
    /// `b=<kind>:<kbps>`
    Bandwidth { kind: String, value: u32 },
    Rtpmap(Rtpmap),
    Fmtp(Fmtp),
    /// Anything else, kept verbatim
    Other(String),
}

impl SdpLine {
    /// Parse one line; lines that would not render back identically stay raw
    pub fn parse(raw: &str) -> Self {
        match Self::parse_typed(raw) {
            Some(line) if line.to_string() == raw => line,
            _ => SdpLine::Other(raw.to_string()),
        }
    }

    fn parse_typed(raw: &str) -> Option<Self> {
        if let Some(rest) = raw.strip_prefix("m=") {
            let mut parts = rest.split(' ');
            let media = parts.next()?.to_string();
            let port = parts.next()?.to_string();
            let proto = parts.next()?.to_string();
            let formats = parts.map(str::to_string).collect();
            return Some(SdpLine::Media(MediaLine {
                media,
                port,
                proto,
                formats,
            }));
        }
        if let Some(rest) = raw.strip_prefix("c=") {
            return Some(SdpLine::Connection(rest.to_string()));
        }
        if let Some(rest) = raw.strip_prefix("b=") {
            let (kind, value) = rest.split_once(':')?;
            return Some(SdpLine::Bandwidth {
                kind: kind.to_string(),
                value: value.parse().ok()?,
            });
        }
        if let Some(rest) = raw.strip_prefix("a=rtpmap:") {
            let (pt, encoding) = rest.split_once(' ')?;
            return Some(SdpLine::Rtpmap(Rtpmap {
                payload_type: pt.to_string(),
                encoding: encoding.to_string(),
            }));
        }
        if let Some(rest) = raw.strip_prefix("a=fmtp:") {
            let (pt, params) = rest.split_once(' ')?;
            return Some(SdpLine::Fmtp(Fmtp {
                payload_type: pt.to_string(),
                params: params.to_string(),
            }));
        }
        None
    }
}

impl fmt::Display for SdpLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpLine::Media(m) => {
                write!(f, "m={} {} {}", m.media, m.port, m.proto)?;
                for format in &m.formats {
                    write!(f, " {}", format)?;
                }
                Ok(())
            }
            SdpLine::Connection(c) => write!(f, "c={}", c),
            SdpLine::Bandwidth { kind, value } => write!(f, "b={}:{}", kind, value),
            SdpLine::Rtpmap(r) => write!(f, "a=rtpmap:{} {}", r.payload_type, r.encoding),
            SdpLine::Fmtp(p) => write!(f, "a=fmtp:{} {}", p.payload_type, p.params),
            SdpLine::Other(raw) => f.write_str(raw),
        }
    }
}

/// A media section: its `m=` line followed by the section's lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub lines: Vec<SdpLine>,
    /// Terminator read after each line; `None` for inserted lines
    endings: Vec<Option<LineEnding>>,
}

impl MediaSection {
    fn push(&mut self, line: SdpLine, ending: Option<LineEnding>) {
        self.lines.push(line);
        self.endings.push(ending);
    }

    /// Insert a new line at `at`; it is terminated with the dominant line ending
    pub fn insert(&mut self, at: usize, line: SdpLine) {
        let at = at.min(self.lines.len());
        self.lines.insert(at, line);
        self.endings.insert(at.min(self.endings.len()), None);
    }

    fn ending(&self, idx: usize) -> Option<LineEnding> {
        self.endings.get(idx).copied().flatten()
    }

    pub fn media_line(&self) -> Option<&MediaLine> {
        match self.lines.first() {
            Some(SdpLine::Media(m)) => Some(m),
            _ => None,
        }
    }

    pub fn media_line_mut(&mut self) -> Option<&mut MediaLine> {
        match self.lines.first_mut() {
            Some(SdpLine::Media(m)) => Some(m),
            _ => None,
        }
    }

    /// Media kind from the `m=` line ("video", "audio", ...)
    pub fn kind(&self) -> &str {
        match self.lines.first() {
            Some(SdpLine::Media(m)) => &m.media,
            Some(SdpLine::Other(raw)) => raw
                .strip_prefix("m=")
                .and_then(|r| r.split(' ').next())
                .unwrap_or_default(),
            _ => "",
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind() == "video"
    }

    pub fn rtpmaps(&self) -> impl Iterator<Item = &Rtpmap> {
        self.lines.iter().filter_map(|l| match l {
            SdpLine::Rtpmap(r) => Some(r),
            _ => None,
        })
    }

    pub fn fmtp(&self, payload_type: &str) -> Option<&Fmtp> {
        self.lines.iter().find_map(|l| match l {
            SdpLine::Fmtp(p) if p.payload_type == payload_type => Some(p),
            _ => None,
        })
    }

    pub fn fmtp_mut(&mut self, payload_type: &str) -> Option<&mut Fmtp> {
        self.lines.iter_mut().find_map(|l| match l {
            SdpLine::Fmtp(p) if p.payload_type == payload_type => Some(p),
            _ => None,
        })
    }

    /// Index of the first line matching `pred`
    pub fn position<F>(&self, pred: F) -> Option<usize>
    where
        F: Fn(&SdpLine) -> bool,
    {
        self.lines.iter().position(pred)
    }
}

/// Line terminator used by a description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Crlf,
    Lf,
}

impl LineEnding {
    fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Crlf => "\r\n",
            LineEnding::Lf => "\n",
        }
    }
}

/// Parsed session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Lines before the first `m=` line
    pub session: Vec<SdpLine>,
    session_endings: Vec<Option<LineEnding>>,
    pub media: Vec<MediaSection>,
    /// Terminator for inserted lines
    line_ending: LineEnding,
    trailing_newline: bool,
}

impl SessionDescription {
    /// Parse SDP text. Never fails; unrecognized lines are kept as-is.
    pub fn parse(text: &str) -> Self {
        let line_ending = if text.contains("\r\n") {
            LineEnding::Crlf
        } else {
            LineEnding::Lf
        };
        let trailing_newline = text.ends_with('\n');

        let body = text.strip_suffix('\n').unwrap_or(text);
        let mut session = Vec::new();
        let mut session_endings = Vec::new();
        let mut media: Vec<MediaSection> = Vec::new();

        if !text.is_empty() {
            let segments: Vec<&str> = body.split('\n').collect();
            let last = segments.len() - 1;
            for (idx, segment) in segments.into_iter().enumerate() {
                // A segment not followed by '\n' has no terminator to strip
                let terminated = idx < last || trailing_newline;
                let (raw, ending) = match segment.strip_suffix('\r') {
                    Some(raw) if terminated => (raw, Some(LineEnding::Crlf)),
                    _ if terminated => (segment, Some(LineEnding::Lf)),
                    _ => (segment, None),
                };
                let line = SdpLine::parse(raw);
                if raw.starts_with("m=") {
                    media.push(MediaSection {
                        lines: vec![line],
                        endings: vec![ending],
                    });
                } else if let Some(section) = media.last_mut() {
                    section.push(line, ending);
                } else {
                    session.push(line);
                    session_endings.push(ending);
                }
            }
        }

        Self {
            session,
            session_endings,
            media,
            line_ending,
            trailing_newline,
        }
    }

    pub fn video_sections(&self) -> impl Iterator<Item = &MediaSection> {
        self.media.iter().filter(|m| m.is_video())
    }

    pub fn video_sections_mut(&mut self) -> impl Iterator<Item = &mut MediaSection> {
        self.media.iter_mut().filter(|m| m.is_video())
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self
            .session
            .iter()
            .enumerate()
            .map(|(i, line)| (line, self.session_endings.get(i).copied().flatten()));
        let media = self
            .media
            .iter()
            .flat_map(|m| m.lines.iter().enumerate().map(move |(i, line)| (line, m.ending(i))));

        let total = self.session.len() + self.media.iter().map(|m| m.lines.len()).sum::<usize>();
        for (idx, (line, ending)) in session.chain(media).enumerate() {
            write!(f, "{}", line)?;
            if idx + 1 < total || self.trailing_newline {
                f.write_str(ending.unwrap_or(self.line_ending).as_str())?;
            }
        }
        Ok(())
    }
}
