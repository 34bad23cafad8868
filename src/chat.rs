use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::player::state::PlaybackStatus;
use crate::track::{ChatId, LoopMode, Track, VoiceHandle};

/// Live playback context of one chat.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub chat_id: ChatId,
    pub status: PlaybackStatus,
    pub current: Option<Track>,
    /// Upcoming tracks; appended at the tail, popped from the head.
    pub queue: VecDeque<Track>,
    pub volume: u16,
    pub loop_mode: LoopMode,
    /// Suppresses auto-leave and auto-end for this chat.
    pub keep_alive: bool,
    pub muted: bool,
    /// When the current track last started or resumed; `None` while paused.
    pub track_started_at: Option<DateTime<Utc>>,
    /// Play time of the current track accumulated before `track_started_at`.
    pub played_before: Duration,
    pub updated_at: DateTime<Utc>,
    pub voice: Option<VoiceHandle>,
}

impl ChatSession {
    pub fn new(chat_id: ChatId, volume: u16) -> Self {
        Self {
            chat_id,
            status: PlaybackStatus::Idle,
            current: None,
            queue: VecDeque::new(),
            volume,
            loop_mode: LoopMode::Off,
            keep_alive: false,
            muted: false,
            track_started_at: None,
            played_before: Duration::ZERO,
            updated_at: Utc::now(),
            voice: None,
        }
    }

    /// How far into the current track playback is at `now`.
    pub fn played(&self, now: DateTime<Utc>) -> Duration {
        let running = self
            .track_started_at
            .and_then(|started| (now - started).to_std().ok())
            .unwrap_or(Duration::ZERO);
        self.played_before + running
    }

    /// Restart the play clock at `position` into the current track.
    pub fn reset_clock(&mut self, position: Duration, running: bool) {
        self.played_before = position;
        self.track_started_at = running.then(Utc::now);
    }

    /// 1-based position of the last entry over `[now playing, upcoming...]`.
    pub fn tail_position(&self) -> usize {
        self.queue.len() + usize::from(self.current.is_some())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            chat_id: self.chat_id,
            status: self.status,
            current: self.current.clone(),
            queue: self.queue.iter().cloned().collect(),
            volume: self.volume,
            loop_mode: self.loop_mode,
            keep_alive: self.keep_alive,
            muted: self.muted,
            track_started_at: self.track_started_at,
            played_before: self.played_before,
            updated_at: self.updated_at,
        }
    }
}

/// Durable form of a `ChatSession`. Voice and stream handles are not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub chat_id: ChatId,
    pub status: PlaybackStatus,
    pub current: Option<Track>,
    pub queue: Vec<Track>,
    pub volume: u16,
    #[serde(default)]
    pub loop_mode: LoopMode,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub track_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub played_before: Duration,
    pub updated_at: DateTime<Utc>,
}

impl From<SessionSnapshot> for ChatSession {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            chat_id: snapshot.chat_id,
            status: snapshot.status,
            current: snapshot.current,
            queue: snapshot.queue.into(),
            volume: snapshot.volume,
            loop_mode: snapshot.loop_mode,
            keep_alive: snapshot.keep_alive,
            muted: snapshot.muted,
            track_started_at: snapshot.track_started_at,
            played_before: snapshot.played_before,
            updated_at: snapshot.updated_at,
            voice: None,
        }
    }
}

/// Read-only view returned by `Player::queue_list`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueView {
    pub chat_id: ChatId,
    pub status: PlaybackStatus,
    pub now_playing: Option<Track>,
    pub upcoming: Vec<Track>,
    pub volume: u16,
    pub loop_mode: LoopMode,
    pub keep_alive: bool,
    pub muted: bool,
}

impl From<&ChatSession> for QueueView {
    fn from(session: &ChatSession) -> Self {
        Self {
            chat_id: session.chat_id,
            status: session.status,
            now_playing: session.current.clone(),
            upcoming: session.queue.iter().cloned().collect(),
            volume: session.volume,
            loop_mode: session.loop_mode,
            keep_alive: session.keep_alive,
            muted: session.muted,
        }
    }
}
