//! Per-chat playback control.
//!
//! Every mutating operation runs inside the chat's critical section
//! (`KeyedLocks`), reads the session out of the cache, mutates a copy and
//! commits it back. Provider lookups happen before the section is entered.

pub mod state;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::activity::ActivityTracker;
use crate::bus::{EndReason, Event, EventBus, NotificationLevel};
use crate::cache::ChatCache;
use crate::chat::{ChatSession, QueueView};
use crate::error::{PlayerError, PlayerResult, SchedulerTaskError, TransportError, SPEED_RANGE};
use crate::policy::{AutoLeavePolicy, ChatFacts, Verdict};
use crate::provider::ProviderGateway;
use crate::store::PersistentStore;
use crate::sync::KeyedLocks;
use crate::track::{ChatId, LoopMode, StreamHandle, Track, TrackRequest, VoiceHandle};
use crate::transport::{TrackEnded, VoiceTransport};
use state::{PlaybackStatus, Transition};

#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub volume_min: u16,
    pub volume_max: u16,
    pub default_volume: u16,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            volume_min: 0,
            volume_max: 200,
            default_volume: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    /// 1-based position over `[now playing, upcoming...]`.
    pub position: usize,
    pub track: Track,
    /// The requested track is now playing.
    pub started: bool,
}

/// Shortest forward seek accepted.
pub const MIN_SEEK: StdDuration = StdDuration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekOutcome {
    pub position: StdDuration,
    pub length: StdDuration,
}

/// When the auto-end job may close a session nobody is using.
#[derive(Debug, Clone, Copy)]
pub struct UnattendedRule {
    /// A playing track must have run this long before listeners are counted.
    pub min_played: Duration,
    /// An idle session with nothing queued is closed once untouched for this long.
    pub idle_grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Persist {
    WriteThrough,
    Deferred,
}

pub struct Player {
    cache: ChatCache,
    tracker: ActivityTracker,
    locks: KeyedLocks,
    gateway: Arc<ProviderGateway>,
    transport: Arc<dyn VoiceTransport>,
    store: Arc<dyn PersistentStore>,
    bus: Arc<EventBus>,
    settings: PlayerSettings,
}

impl Player {
    pub fn new(
        cache: ChatCache,
        tracker: ActivityTracker,
        gateway: Arc<ProviderGateway>,
        transport: Arc<dyn VoiceTransport>,
        store: Arc<dyn PersistentStore>,
        bus: Arc<EventBus>,
        settings: PlayerSettings,
    ) -> Self {
        Self {
            cache,
            tracker,
            locks: KeyedLocks::new(),
            gateway,
            transport,
            store,
            bus,
            settings,
        }
    }

    pub fn cache(&self) -> &ChatCache {
        &self.cache
    }

    pub fn tracker(&self) -> &ActivityTracker {
        &self.tracker
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn settings(&self) -> &PlayerSettings {
        &self.settings
    }

    /// Resolve a request and append it to the chat's queue, starting playback
    /// if nothing is playing.
    pub async fn enqueue(&self, chat: ChatId, request: TrackRequest) -> PlayerResult<EnqueueOutcome> {
        self.tracker.record_activity(chat);
        let generation = self.cache.generation(chat);

        let track = self.gateway.resolve(&request).await?;

        let _guard = self.locks.acquire(chat).await;
        if self.cache.generation(chat) != generation {
            debug!(chat_id = %chat, track = %track, "Chat ended while resolving, dropping request");
            return Err(PlayerError::Cancelled(chat));
        }

        let mut session = self
            .cache
            .get(chat)
            .unwrap_or_else(|| ChatSession::new(chat, self.settings.default_volume));
        session.queue.push_back(track.clone());

        if session.current.is_some() {
            let position = session.tail_position();
            info!(chat_id = %chat, track = %track, position, "Queued");
            self.commit(session, Persist::WriteThrough).await;
            return Ok(EnqueueOutcome {
                position,
                track,
                started: false,
            });
        }

        let result = self.advance(&mut session).await;
        // Tracks ahead of the request may have been dropped, and so may the request itself.
        let playing = session.current.as_ref();
        let started = session.queue.is_empty() && playing.is_some_and(|t| t.same_as(&track));
        let queued_at = session.queue.iter().rposition(|t| t.same_as(&track));
        let position = queued_at.map(|index| index + 1 + usize::from(playing.is_some()));
        self.commit(session, Persist::WriteThrough).await;
        result?;

        match (started, position) {
            (true, _) => Ok(EnqueueOutcome {
                position: 1,
                track,
                started: true,
            }),
            (false, Some(position)) => Ok(EnqueueOutcome {
                position,
                track,
                started: false,
            }),
            (false, None) => {
                info!(chat_id = %chat, track = %track, "Requested track could not be streamed");
                Err(PlayerError::Unplayable(track.title))
            }
        }
    }

    /// Move past the current track. Returns the new now-playing track.
    pub async fn skip(&self, chat: ChatId) -> PlayerResult<Option<Track>> {
        self.tracker.record_activity(chat);
        let _guard = self.locks.acquire(chat).await;
        let session = self.session(chat)?;
        self.step(session, false).await
    }

    /// `stream` played out. Unlike `skip`, single-track loop replays.
    /// Ignored once another stream has replaced it.
    pub async fn track_finished(&self, chat: ChatId, stream: &StreamHandle) -> PlayerResult<Option<Track>> {
        let _guard = self.locks.acquire(chat).await;
        let session = self.session(chat)?;
        let playing = session.current.as_ref().and_then(|t| t.stream.as_ref());
        if session.status != PlaybackStatus::Playing || playing != Some(stream) {
            debug!(chat_id = %chat, status = %session.status, "Ignoring stale completion");
            return Ok(session.current);
        }
        self.step(session, true).await
    }

    pub async fn pause(&self, chat: ChatId) -> PlayerResult<()> {
        self.tracker.record_activity(chat);
        let _guard = self.locks.acquire(chat).await;
        let mut session = self.session(chat)?;

        let next = session.status.apply(Transition::Pause)?;
        if let Some(handle) = &session.voice {
            self.transport.pause(handle).await?;
        }
        session.status = next;
        let played = session.played(Utc::now());
        session.reset_clock(played, false);
        self.commit(session, Persist::WriteThrough).await;
        Ok(())
    }

    pub async fn resume(&self, chat: ChatId) -> PlayerResult<()> {
        self.tracker.record_activity(chat);
        let _guard = self.locks.acquire(chat).await;
        let mut session = self.session(chat)?;

        let next = session.status.apply(Transition::Resume)?;
        if let Some(handle) = &session.voice {
            self.transport.resume(handle).await?;
            session.status = next;
            let played = session.played(Utc::now());
            session.reset_clock(played, true);
            self.commit(session, Persist::WriteThrough).await;
            return Ok(());
        }

        // No voice handle: the session came back from the store paused.
        requeue_current(&mut session);
        let result = self.advance(&mut session).await;
        self.commit(session, Persist::WriteThrough).await;
        result.map(|_| ())
    }

    /// Stop playback, leave the voice chat and drop the session.
    pub async fn stop(&self, chat: ChatId) -> PlayerResult<()> {
        self.tracker.record_activity(chat);
        let _guard = self.locks.acquire(chat).await;
        let Some(session) = self.cache.get(chat) else {
            // Still cancel a first request that is being resolved.
            self.cache.bump_generation(chat);
            return Err(PlayerError::NoSession(chat));
        };
        self.end_session(session, EndReason::Stopped).await?;
        Ok(())
    }

    /// Set the volume, clamped to the configured range. Returns the applied level.
    pub async fn set_volume(&self, chat: ChatId, level: i64) -> PlayerResult<u16> {
        self.tracker.record_activity(chat);
        let _guard = self.locks.acquire(chat).await;
        let mut session = self.session_or_new(chat);

        let min = i64::from(self.settings.volume_min);
        let max = i64::from(self.settings.volume_max);
        let level = level.clamp(min, max) as u16;

        if let Some(handle) = &session.voice {
            self.transport.set_volume(handle, level).await?;
        }
        session.volume = level;
        self.commit(session, Persist::Deferred).await;
        Ok(level)
    }

    /// Mute the bot in the voice chat. Returns false if it already was.
    pub async fn mute(&self, chat: ChatId) -> PlayerResult<bool> {
        self.set_muted(chat, true).await
    }

    /// Returns false if the bot was not muted.
    pub async fn unmute(&self, chat: ChatId) -> PlayerResult<bool> {
        self.set_muted(chat, false).await
    }

    async fn set_muted(&self, chat: ChatId, muted: bool) -> PlayerResult<bool> {
        self.tracker.record_activity(chat);
        let _guard = self.locks.acquire(chat).await;
        let mut session = self.session(chat)?;
        let handle = live_voice(&session)?;
        if session.muted == muted {
            return Ok(false);
        }

        if muted {
            self.transport.mute(&handle).await?;
        } else {
            self.transport.unmute(&handle).await?;
        }
        session.muted = muted;
        info!(chat_id = %chat, muted, "Mute changed");
        self.commit(session, Persist::WriteThrough).await;
        Ok(true)
    }

    /// Jump `forward` into the current track, which must have a known length.
    pub async fn seek(&self, chat: ChatId, forward: StdDuration) -> PlayerResult<SeekOutcome> {
        self.tracker.record_activity(chat);
        if forward < MIN_SEEK {
            return Err(PlayerError::SeekTooShort {
                min_secs: MIN_SEEK.as_secs(),
            });
        }
        let _guard = self.locks.acquire(chat).await;
        let mut session = self.session(chat)?;
        let handle = live_voice(&session)?;
        let length = session
            .current
            .as_ref()
            .and_then(|t| t.duration)
            .ok_or(PlayerError::UnknownDuration)?;

        let played = session.played(Utc::now());
        let position = played
            .checked_add(forward)
            .filter(|position| *position < length)
            .ok_or(PlayerError::SeekPastEnd {
                target_secs: played.as_secs().saturating_add(forward.as_secs()),
                duration_secs: length.as_secs(),
            })?;

        self.transport.seek(&handle, position).await?;
        let running = session.status == PlaybackStatus::Playing;
        session.reset_clock(position, running);
        debug!(chat_id = %chat, position_secs = position.as_secs(), "Seeked");
        self.commit(session, Persist::Deferred).await;
        Ok(SeekOutcome { position, length })
    }

    /// Change the playback speed of the current track. Returns the applied factor.
    pub async fn set_speed(&self, chat: ChatId, speed: f64) -> PlayerResult<f64> {
        self.tracker.record_activity(chat);
        let speed = (speed * 100.0).round() / 100.0;
        if !(SPEED_RANGE.0..=SPEED_RANGE.1).contains(&speed) {
            return Err(PlayerError::SpeedOutOfRange(speed));
        }
        let _guard = self.locks.acquire(chat).await;
        let session = self.session(chat)?;
        let handle = live_voice(&session)?;
        self.transport.set_speed(&handle, speed).await?;
        debug!(chat_id = %chat, speed, "Speed changed");
        Ok(speed)
    }

    pub async fn set_loop(&self, chat: ChatId, mode: LoopMode) -> PlayerResult<()> {
        self.tracker.record_activity(chat);
        let _guard = self.locks.acquire(chat).await;
        let mut session = self.session_or_new(chat);
        session.loop_mode = mode;
        self.commit(session, Persist::Deferred).await;
        Ok(())
    }

    pub async fn set_keep_alive(&self, chat: ChatId, keep_alive: bool) -> PlayerResult<()> {
        self.tracker.record_activity(chat);
        let _guard = self.locks.acquire(chat).await;
        let mut session = self.session_or_new(chat);
        session.keep_alive = keep_alive;
        info!(chat_id = %chat, keep_alive, "Keep-alive changed");
        self.commit(session, Persist::WriteThrough).await;
        Ok(())
    }

    /// Remove an upcoming track by its 1-based queue position.
    pub async fn remove(&self, chat: ChatId, position: usize) -> PlayerResult<Track> {
        self.tracker.record_activity(chat);
        let _guard = self.locks.acquire(chat).await;
        let mut session = self.session(chat)?;

        let len = session.queue.len();
        let removed = position
            .checked_sub(1)
            .and_then(|index| session.queue.remove(index))
            .ok_or(PlayerError::InvalidPosition { position, len })?;

        self.commit(session, Persist::WriteThrough).await;
        Ok(removed)
    }

    /// Drop every upcoming track, keeping the current one. Returns how many were dropped.
    pub async fn clear_queue(&self, chat: ChatId) -> PlayerResult<usize> {
        self.tracker.record_activity(chat);
        let _guard = self.locks.acquire(chat).await;
        let mut session = self.session(chat)?;
        let dropped = session.queue.len();
        session.queue.clear();
        self.commit(session, Persist::WriteThrough).await;
        Ok(dropped)
    }

    pub fn queue_list(&self, chat: ChatId) -> PlayerResult<QueueView> {
        self.tracker.record_activity(chat);
        self.session(chat).map(|s| QueueView::from(&s))
    }

    pub fn upcoming(&self, chat: ChatId) -> Option<Track> {
        self.cache.get(chat).and_then(|s| s.queue.front().cloned())
    }

    /// Leave the chat if the policy still condemns it once its lock is held.
    pub async fn evict_if_condemned(
        &self,
        chat: ChatId,
        policy: &AutoLeavePolicy,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerTaskError> {
        const JOB: &str = "sweep";
        let _guard = self.locks.acquire(chat).await;

        let facts = ChatFacts::gather(chat, &self.tracker, &self.cache);
        if policy.evaluate(&facts, now) == Verdict::Keep {
            return Ok(false);
        }

        match self.cache.get(chat) {
            Some(session) => self
                .end_session(session, EndReason::Evicted)
                .await
                .map_err(|e| SchedulerTaskError::new(JOB, chat, e))?,
            None => self.cache.bump_generation(chat),
        }

        self.transport
            .leave_chat(chat)
            .await
            .map_err(|e| SchedulerTaskError::new(JOB, chat, e))?;
        // Keep the in-memory record until the row is gone so a failure is retried.
        self.store
            .delete_activity(chat)
            .await
            .map_err(|e| SchedulerTaskError::new(JOB, chat, e))?;
        self.tracker.forget(chat);

        info!(chat_id = %chat, last_activity = ?facts.last_activity, "Left inactive chat");
        Ok(true)
    }

    /// Close the session if nobody is listening or it has idled too long.
    pub async fn end_if_unattended(
        &self,
        chat: ChatId,
        rule: UnattendedRule,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerTaskError> {
        const JOB: &str = "auto_end";
        let _guard = self.locks.acquire(chat).await;
        let Some(session) = self.cache.get(chat) else {
            return Ok(false);
        };
        if session.keep_alive {
            return Ok(false);
        }

        let unattended = match session.status {
            // A queue left behind by a failed start waits for the next command.
            PlaybackStatus::Idle => session.queue.is_empty() && now - session.updated_at >= rule.idle_grace,
            PlaybackStatus::Playing => {
                let played = Duration::from_std(session.played(now)).is_ok_and(|played| played >= rule.min_played);
                match (&session.voice, played) {
                    (Some(handle), true) => {
                        let listeners = self
                            .transport
                            .listener_count(handle)
                            .await
                            .map_err(|e| SchedulerTaskError::new(JOB, chat, e))?;
                        // The bot itself counts as one participant.
                        listeners.is_some_and(|n| n <= 1)
                    }
                    _ => false,
                }
            }
            PlaybackStatus::Paused | PlaybackStatus::Stopped => false,
        };
        if !unattended {
            return Ok(false);
        }

        self.end_session(session, EndReason::Unattended)
            .await
            .map_err(|e| SchedulerTaskError::new(JOB, chat, e))?;
        Ok(true)
    }

    /// Restart voice for sessions that were playing when they were persisted.
    pub async fn restore_playback(&self) -> usize {
        let mut restored = 0;
        for chat in self.cache.chat_ids() {
            let _guard = self.locks.acquire(chat).await;
            let Some(mut session) = self.cache.get(chat) else {
                continue;
            };
            if session.status != PlaybackStatus::Playing || session.voice.is_some() {
                continue;
            }

            requeue_current(&mut session);
            match self.advance(&mut session).await {
                Ok(Some(_)) => restored += 1,
                Ok(None) => {}
                Err(e) => warn!(chat_id = %chat, error = %e, "Could not restore playback"),
            }
            self.commit(session, Persist::WriteThrough).await;
        }
        restored
    }

    /// Persist one dirty session. Returns false if there was nothing to write.
    pub async fn flush_session(&self, chat: ChatId) -> Result<bool, SchedulerTaskError> {
        let _guard = self.locks.acquire(chat).await;
        let Some((snapshot, revision)) = self.cache.dirty_snapshot(chat) else {
            return Ok(false);
        };
        self.store
            .save_session(&snapshot)
            .await
            .map_err(|e| SchedulerTaskError::new("flush", chat, e))?;
        self.cache.mark_synced(chat, revision);
        Ok(true)
    }

    /// Retry deleting a stored session whose earlier deletion failed.
    pub async fn retry_delete(&self, chat: ChatId) -> Result<(), SchedulerTaskError> {
        let _guard = self.locks.acquire(chat).await;
        if !self.cache.contains(chat) {
            self.store
                .delete_session(chat)
                .await
                .map_err(|e| SchedulerTaskError::new("flush", chat, e))?;
        }
        self.cache.clear_tombstone(chat);
        Ok(())
    }

    fn session(&self, chat: ChatId) -> PlayerResult<ChatSession> {
        self.cache.get(chat).ok_or(PlayerError::NoSession(chat))
    }

    fn session_or_new(&self, chat: ChatId) -> ChatSession {
        self.cache
            .get(chat)
            .unwrap_or_else(|| ChatSession::new(chat, self.settings.default_volume))
    }

    async fn step(&self, mut session: ChatSession, completed: bool) -> PlayerResult<Option<Track>> {
        if let Some(mut finished) = session.current.take() {
            finished.stream = None;
            match session.loop_mode {
                LoopMode::Single if completed => session.queue.push_front(finished),
                LoopMode::All => session.queue.push_back(finished),
                _ => {}
            }
        }

        let result = self.advance(&mut session).await;
        self.commit(session, Persist::WriteThrough).await;
        result
    }

    /// Start the head of the queue, dropping tracks whose stream cannot be
    /// opened. The session goes idle when the queue runs dry.
    async fn advance(&self, session: &mut ChatSession) -> PlayerResult<Option<Track>> {
        let chat = session.chat_id;
        session.current = None;
        session.reset_clock(StdDuration::ZERO, false);

        while let Some(mut next) = session.queue.pop_front() {
            let stream = match self.gateway.open_stream(&next).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(chat_id = %chat, track = %next, error = %e, "Skipping unplayable track");
                    self.bus.notify(
                        chat,
                        NotificationLevel::Warning,
                        format!("Skipped {}: {}", next.title, e),
                    );
                    continue;
                }
            };

            if let Err(e) = self.start_stream(session, &stream, next.duration).await {
                warn!(chat_id = %chat, track = %next, error = %e, "Voice transport failed, track stays queued");
                session.queue.push_front(next);
                self.release_voice(session).await;
                session.status = session.status.apply(Transition::Exhaust)?;
                return Err(e.into());
            }

            session.status = session.status.apply(Transition::Start)?;
            next.stream = Some(stream);
            session.current = Some(next.clone());
            session.reset_clock(StdDuration::ZERO, true);

            info!(chat_id = %chat, track = %next, "Now playing");
            self.bus.publish(Event::TrackStarted {
                chat,
                track: next.clone(),
            });
            return Ok(Some(next));
        }

        debug!(chat_id = %chat, "Queue exhausted");
        self.release_voice(session).await;
        session.status = session.status.apply(Transition::Exhaust)?;
        Ok(None)
    }

    async fn start_stream(
        &self,
        session: &mut ChatSession,
        stream: &StreamHandle,
        length: Option<StdDuration>,
    ) -> Result<(), TransportError> {
        let handle = match &session.voice {
            Some(handle) => handle.clone(),
            None => {
                let handle = self.transport.start_session(session.chat_id).await?;
                session.voice = Some(handle.clone());
                self.transport.set_volume(&handle, session.volume).await?;
                if session.muted {
                    self.transport.mute(&handle).await?;
                }
                handle
            }
        };
        self.transport.play(&handle, stream, length).await
    }

    /// Best-effort release for sessions that stay cached.
    async fn release_voice(&self, session: &mut ChatSession) {
        if let Some(handle) = session.voice.take() {
            if let Err(e) = self.transport.stop(&handle).await {
                warn!(chat_id = %session.chat_id, handle = %handle, error = %e, "Failed to release voice handle");
            }
        }
    }

    /// Release voice, then drop the session from cache and store.
    ///
    /// If the transport refuses to let go the session stays cached.
    async fn end_session(&self, session: ChatSession, reason: EndReason) -> Result<(), TransportError> {
        let chat = session.chat_id;
        if let Some(handle) = &session.voice {
            self.transport.stop(handle).await?;
        }
        let status = session
            .status
            .apply(Transition::Stop)
            .unwrap_or(PlaybackStatus::Stopped);

        self.cache.remove(chat);
        if let Err(e) = self.store.delete_session(chat).await {
            warn!(chat_id = %chat, error = %e, "Failed to delete stored session, will retry");
            self.cache.add_tombstone(chat);
        }

        info!(chat_id = %chat, status = %status, reason = ?reason, "Session ended");
        self.bus.publish(Event::SessionEnded { chat, reason });
        Ok(())
    }

    async fn commit(&self, mut session: ChatSession, persist: Persist) {
        let chat = session.chat_id;
        session.updated_at = Utc::now();
        let snapshot = (persist == Persist::WriteThrough).then(|| session.snapshot());
        let revision = self.cache.put(session);

        if let Some(snapshot) = snapshot {
            match self.store.save_session(&snapshot).await {
                Ok(()) => self.cache.mark_synced(chat, revision),
                Err(e) => {
                    warn!(chat_id = %chat, error = %e, "Session write-through failed, left for flush")
                }
            }
        }
    }
}

/// Feed transport completions into the player until the channel closes.
pub async fn relay_completions(player: Arc<Player>, mut completions: mpsc::UnboundedReceiver<TrackEnded>) {
    while let Some(TrackEnded { chat, stream }) = completions.recv().await {
        let player = player.clone();
        tokio::spawn(async move {
            match player.track_finished(chat, &stream).await {
                Ok(next) => debug!(chat_id = %chat, next = ?next.map(|t| t.title), "Completion handled"),
                Err(PlayerError::NoSession(_)) => debug!(chat_id = %chat, "Completion for ended session"),
                Err(e) => warn!(chat_id = %chat, error = %e, "Failed to advance after completion"),
            }
        });
    }
    debug!("Completion channel closed");
}

/// Voice handle of a session with a track loaded.
fn live_voice(session: &ChatSession) -> PlayerResult<VoiceHandle> {
    match (&session.voice, &session.current) {
        (Some(handle), Some(_)) => Ok(handle.clone()),
        _ => Err(PlayerError::NothingPlaying(session.chat_id)),
    }
}

/// Put the current track back at the head so `advance` reopens it.
fn requeue_current(session: &mut ChatSession) {
    if let Some(mut current) = session.current.take() {
        current.stream = None;
        session.queue.push_front(current);
    }
}
