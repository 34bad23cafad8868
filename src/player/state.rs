//! Per-chat playback state machine.
//!
//! `idle -> playing <-> paused -> idle`, and every non-terminal state can be
//! stopped. `PlaybackStatus::apply` is the only way a session's status changes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::InvalidStateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Playing,
    Paused,
    /// Terminal. The session is removed from the cache right after entering it.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A track became now playing (enqueue into an idle session, skip or completion with a next track).
    Start,
    Pause,
    Resume,
    /// Skip or completion left nothing to play.
    Exhaust,
    /// Explicit stop or eviction.
    Stop,
}

impl PlaybackStatus {
    pub fn apply(self, transition: Transition) -> Result<Self, InvalidStateError> {
        use PlaybackStatus::*;
        use Transition::*;

        let next = match (self, transition) {
            (Idle | Playing | Paused, Start) => Playing,
            (Playing, Pause) => Paused,
            (Paused, Resume) => Playing,
            (Idle | Playing | Paused, Exhaust) => Idle,
            (Idle | Playing | Paused, Stop) => Stopped,
            (from, transition) => return Err(InvalidStateError { from, transition }),
        };
        Ok(next)
    }

    /// Whether a voice stream is expected to exist in this state.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Playing | Self::Paused)
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Exhaust => "exhaust",
            Self::Stop => "stop",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::PlaybackStatus::*;
    use super::Transition::*;
    use super::*;

    const STATES: [PlaybackStatus; 4] = [Idle, Playing, Paused, Stopped];
    const TRANSITIONS: [Transition; 5] = [Start, Pause, Resume, Exhaust, Stop];

    fn expected(from: PlaybackStatus, t: Transition) -> Option<PlaybackStatus> {
        match (from, t) {
            (Stopped, _) => None,
            (_, Start) => Some(Playing),
            (Playing, Pause) => Some(Paused),
            (Paused, Resume) => Some(Playing),
            (_, Exhaust) => Some(Idle),
            (_, Stop) => Some(Stopped),
            _ => None,
        }
    }

    #[test]
    fn transition_table_is_exhaustive() {
        for from in STATES {
            for t in TRANSITIONS {
                let got = from.apply(t).ok();
                assert_eq!(got, expected(from, t), "{} --{}-->", from, t);
            }
        }
    }

    #[test]
    fn invalid_transition_reports_origin() {
        let err = Idle.apply(Pause).unwrap_err();
        assert_eq!(err.from, Idle);
        assert_eq!(err.transition, Pause);

        let err = Playing.apply(Resume).unwrap_err();
        assert_eq!(err.from, Playing);
    }

    #[test]
    fn stopped_is_terminal() {
        for t in TRANSITIONS {
            assert!(Stopped.apply(t).is_err());
        }
    }

    #[test]
    fn active_states() {
        assert!(Playing.is_active());
        assert!(Paused.is_active());
        assert!(!Idle.is_active());
        assert!(!Stopped.is_active());
    }
}
