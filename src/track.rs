use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Telegram chat identifier. Groups and channels are negative, users positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Playable stream location handed to the voice transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHandle(pub String);

/// Opaque handle to a live voice-chat session, owned by exactly one `ChatSession`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VoiceHandle(pub String);

impl fmt::Display for VoiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Provider tag the track was resolved by (e.g. `url`).
    pub source: String,
    /// Provider-specific identifier.
    pub id: String,
    pub title: String,
    /// `None` for live or unknown-length streams.
    #[serde(default)]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub requested_by: Option<String>,
    /// Filled in when the track becomes now playing, never at enqueue time.
    #[serde(skip)]
    pub stream: Option<StreamHandle>,
}

impl Track {
    pub fn new(source: impl Into<String>, id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            id: id.into(),
            title: title.into(),
            duration: None,
            requested_by: None,
            stream: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn requested_by(mut self, user: impl Into<String>) -> Self {
        self.requested_by = Some(user.into());
        self
    }

    /// Two tracks are the same entry when source and id match, regardless of stream state.
    pub fn same_as(&self, other: &Track) -> bool {
        self.source == other.source && self.id == other.id
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.duration {
            Some(d) => {
                let secs = d.as_secs();
                write!(f, "{} [{}:{:02}]", self.title, secs / 60, secs % 60)
            }
            None => write!(f, "{}", self.title),
        }
    }
}

/// What a user asked to play, before any provider has looked at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRequest {
    /// Explicit provider tag; `None` lets the gateway pick.
    pub source: Option<String>,
    pub query: String,
    pub requested_by: Option<String>,
}

impl TrackRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            source: None,
            query: query.into(),
            requested_by: None,
        }
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn requested_by(mut self, user: impl Into<String>) -> Self {
        self.requested_by = Some(user.into());
        self
    }

    /// Parse command text of the form `[@source] query`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if let Some(rest) = text.strip_prefix('@') {
            let (source, query) = rest.split_once(char::is_whitespace)?;
            let query = query.trim();
            if source.is_empty() || query.is_empty() {
                return None;
            }
            return Some(Self::new(query).from_source(source));
        }
        Some(Self::new(text))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    Off,
    /// Replay the current track when it completes.
    Single,
    /// Re-append finished tracks to the tail of the queue.
    All,
}

impl std::str::FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" => Ok(Self::Off),
            "single" | "one" | "track" => Ok(Self::Single),
            "all" | "queue" => Ok(Self::All),
            other => Err(format!("unknown loop mode '{}'", other)),
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Off => "off",
            Self::Single => "single",
            Self::All => "all",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_query() {
        let req = TrackRequest::parse("  never gonna give you up ").unwrap();
        assert_eq!(req.source, None);
        assert_eq!(req.query, "never gonna give you up");
    }

    #[test]
    fn parse_explicit_source() {
        let req = TrackRequest::parse("@url https://example.com/a.mp3").unwrap();
        assert_eq!(req.source.as_deref(), Some("url"));
        assert_eq!(req.query, "https://example.com/a.mp3");
    }

    #[test]
    fn parse_rejects_empty_and_bare_source() {
        assert!(TrackRequest::parse("   ").is_none());
        assert!(TrackRequest::parse("@url").is_none());
        assert!(TrackRequest::parse("@url   ").is_none());
    }

    #[test]
    fn loop_mode_parses_aliases() {
        assert_eq!("ALL".parse::<LoopMode>(), Ok(LoopMode::All));
        assert_eq!("one".parse::<LoopMode>(), Ok(LoopMode::Single));
        assert_eq!("off".parse::<LoopMode>(), Ok(LoopMode::Off));
        assert!("sometimes".parse::<LoopMode>().is_err());
    }

    #[test]
    fn display_includes_duration() {
        let t = Track::new("url", "a", "Song").with_duration(Duration::from_secs(125));
        assert_eq!(t.to_string(), "Song [2:05]");
        assert_eq!(Track::new("url", "b", "Live").to_string(), "Live");
    }
}
