//! Error taxonomy for the playback core.
//!
//! Nothing here is process-fatal. Each error is either reported to the caller
//! as a typed result or logged and skipped by the background jobs.

use std::time::Duration;
use thiserror::Error;

use crate::player::state::{PlaybackStatus, Transition};
use crate::track::ChatId;

/// A provider could not produce a track for a request.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error("no providers are registered")]
    NoProviders,

    #[error("{provider} found nothing for '{query}'")]
    NotFound { provider: String, query: String },

    #[error("{provider} did not answer within {}s", after.as_secs())]
    Timeout { provider: String, after: Duration },

    #[error("{provider} failed: {message}")]
    Provider { provider: String, message: String },
}

impl ResolutionError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn not_found(provider: impl Into<String>, query: impl Into<String>) -> Self {
        Self::NotFound {
            provider: provider.into(),
            query: query.into(),
        }
    }
}

/// A resolved track has no playable stream right now.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream for '{track}' timed out after {}s", after.as_secs())]
    Timeout { track: String, after: Duration },

    #[error("stream for '{track}' unavailable: {message}")]
    Unavailable { track: String, message: String },
}

impl StreamError {
    pub fn unavailable(track: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            track: track.into(),
            message: message.into(),
        }
    }
}

/// A command is not valid in the chat's current playback state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot {transition} while {from}")]
pub struct InvalidStateError {
    pub from: PlaybackStatus,
    pub transition: Transition,
}

/// The persistent store could not be reached or returned bad data.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
#[error("voice transport error: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors returned to the command layer by `Player`.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    InvalidState(#[from] InvalidStateError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("nothing is playing in chat {0}")]
    NoSession(ChatId),

    /// The chat was stopped or evicted while its request was being resolved.
    #[error("request for chat {0} was cancelled")]
    Cancelled(ChatId),

    #[error("no queued track at position {position} (queue has {len})")]
    InvalidPosition { position: usize, len: usize },

    /// The requested track was dropped because its stream could not be opened.
    #[error("{0} could not be streamed")]
    Unplayable(String),

    #[error("no track is playing in chat {0}")]
    NothingPlaying(ChatId),

    #[error("the length of the current track is unknown")]
    UnknownDuration,

    #[error("seek forward by at least {min_secs}s")]
    SeekTooShort { min_secs: u64 },

    #[error("cannot seek to {target_secs}s, the track is {duration_secs}s long")]
    SeekPastEnd { target_secs: u64, duration_secs: u64 },

    #[error("speed {0} is outside {min}x to {max}x", min = SPEED_RANGE.0, max = SPEED_RANGE.1)]
    SpeedOutOfRange(f64),
}

/// Accepted playback speed factors, inclusive.
pub const SPEED_RANGE: (f64, f64) = (0.5, 4.0);

/// One chat's eviction or flush failed. The job logs it and carries on.
#[derive(Debug, Error)]
#[error("{job} failed for chat {chat}: {source}")]
pub struct SchedulerTaskError {
    pub job: &'static str,
    pub chat: ChatId,
    #[source]
    pub source: TaskFailure,
}

#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl SchedulerTaskError {
    pub fn new(job: &'static str, chat: ChatId, source: impl Into<TaskFailure>) -> Self {
        Self {
            job,
            chat,
            source: source.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, PersistenceError>;
pub type PlayerResult<T> = Result<T, PlayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_message_names_both_sides() {
        let err = InvalidStateError {
            from: PlaybackStatus::Idle,
            transition: Transition::Pause,
        };
        assert_eq!(err.to_string(), "cannot pause while idle");
    }

    #[test]
    fn timeout_message_in_seconds() {
        let err = ResolutionError::Timeout {
            provider: "url".into(),
            after: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "url did not answer within 30s");
    }

    #[test]
    fn task_error_wraps_transport() {
        let err = SchedulerTaskError::new("sweep", ChatId(-100), TransportError::new("gone"));
        assert_eq!(
            err.to_string(),
            "sweep failed for chat -100: voice transport error: gone"
        );
    }
}
