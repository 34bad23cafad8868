//! Fakes shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::activity::{ActivityRecord, ActivityTracker};
use crate::bus::EventBus;
use crate::cache::ChatCache;
use crate::chat::SessionSnapshot;
use crate::error::{PersistenceError, ResolutionError, StoreResult, StreamError, TransportError};
use crate::player::{Player, PlayerSettings};
use crate::provider::{Provider, ProviderGateway};
use crate::store::{PersistentStore, SqliteStore};
use crate::track::{ChatId, StreamHandle, Track, VoiceHandle};
use crate::transport::{TrackEnded, VoiceTransport};

/// Provider that knows a fixed set of queries; the query doubles as track id and title.
pub struct FakeProvider {
    tag: String,
    tracks: HashSet<String>,
    broken_streams: Mutex<HashSet<String>>,
    slow: HashMap<String, Duration>,
    lengths: HashMap<String, Duration>,
    delay: Duration,
    resolve_calls: AtomicUsize,
    stream_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            tracks: HashSet::new(),
            broken_streams: Mutex::new(HashSet::new()),
            slow: HashMap::new(),
            lengths: HashMap::new(),
            delay: Duration::ZERO,
            resolve_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_track(mut self, query: &str) -> Self {
        self.tracks.insert(query.to_string());
        self
    }

    pub fn with_tracks(self, queries: &[&str]) -> Self {
        queries.iter().fold(self, |p, q| p.with_track(q))
    }

    pub fn with_broken_stream(self, query: &str) -> Self {
        self.break_stream(query);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_slow_track(mut self, query: &str, delay: Duration) -> Self {
        self.tracks.insert(query.to_string());
        self.slow.insert(query.to_string(), delay);
        self
    }

    pub fn with_length(mut self, query: &str, length: Duration) -> Self {
        self.tracks.insert(query.to_string());
        self.lengths.insert(query.to_string(), length);
        self
    }

    pub fn break_stream(&self, query: &str) {
        self.broken_streams.lock().unwrap().insert(query.to_string());
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn resolve(&self, query: &str) -> Result<Track, ResolutionError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.slow.get(query).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.tracks.contains(query) {
            let mut track = Track::new(&self.tag, query, query);
            track.duration = self.lengths.get(query).copied();
            Ok(track)
        } else {
            Err(ResolutionError::not_found(&self.tag, query))
        }
    }

    async fn open_stream(&self, track: &Track) -> Result<StreamHandle, StreamError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken_streams.lock().unwrap().contains(&track.id) {
            Err(StreamError::unavailable(&track.title, "gone"))
        } else {
            Ok(StreamHandle(format!("stream://{}", track.id)))
        }
    }
}

/// Transport that records every call and can be told to fail.
pub struct RecordingTransport {
    calls: Mutex<Vec<String>>,
    live: Mutex<HashSet<VoiceHandle>>,
    next_id: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_leave: AtomicBool,
    listeners: Mutex<Option<usize>>,
    completions_tx: mpsc::UnboundedSender<TrackEnded>,
    completions_rx: Mutex<Option<mpsc::UnboundedReceiver<TrackEnded>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            calls: Mutex::new(Vec::new()),
            live: Mutex::new(HashSet::new()),
            next_id: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_leave: AtomicBool::new(false),
            listeners: Mutex::new(None),
            completions_tx,
            completions_rx: Mutex::new(Some(completions_rx)),
        }
    }

    /// Report that a stream played to its end.
    pub fn finish(&self, chat: ChatId, stream: &str) {
        self.completions_tx
            .send(TrackEnded {
                chat,
                stream: StreamHandle(stream.to_string()),
            })
            .unwrap();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn live_sessions(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn set_listeners(&self, listeners: Option<usize>) {
        *self.listeners.lock().unwrap() = listeners;
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl VoiceTransport for RecordingTransport {
    async fn start_session(&self, chat: ChatId) -> Result<VoiceHandle, TransportError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(TransportError::new("cannot join voice chat"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = VoiceHandle(format!("vh-{}-{}", chat, id));
        self.live.lock().unwrap().insert(handle.clone());
        self.record(format!("start {}", chat));
        Ok(handle)
    }

    async fn play(
        &self,
        _handle: &VoiceHandle,
        stream: &StreamHandle,
        _duration: Option<Duration>,
    ) -> Result<(), TransportError> {
        self.record(format!("play {}", stream.0));
        Ok(())
    }

    async fn pause(&self, _handle: &VoiceHandle) -> Result<(), TransportError> {
        self.record("pause".to_string());
        Ok(())
    }

    async fn resume(&self, _handle: &VoiceHandle) -> Result<(), TransportError> {
        self.record("resume".to_string());
        Ok(())
    }

    async fn set_volume(&self, _handle: &VoiceHandle, level: u16) -> Result<(), TransportError> {
        self.record(format!("volume {}", level));
        Ok(())
    }

    async fn mute(&self, _handle: &VoiceHandle) -> Result<(), TransportError> {
        self.record("mute".to_string());
        Ok(())
    }

    async fn unmute(&self, _handle: &VoiceHandle) -> Result<(), TransportError> {
        self.record("unmute".to_string());
        Ok(())
    }

    async fn seek(&self, _handle: &VoiceHandle, position: Duration) -> Result<(), TransportError> {
        self.record(format!("seek {}", position.as_secs()));
        Ok(())
    }

    async fn set_speed(&self, _handle: &VoiceHandle, speed: f64) -> Result<(), TransportError> {
        self.record(format!("speed {}", speed));
        Ok(())
    }

    async fn stop(&self, handle: &VoiceHandle) -> Result<(), TransportError> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(TransportError::new("stuck in call"));
        }
        self.live.lock().unwrap().remove(handle);
        self.record("stop".to_string());
        Ok(())
    }

    async fn listener_count(&self, _handle: &VoiceHandle) -> Result<Option<usize>, TransportError> {
        Ok(*self.listeners.lock().unwrap())
    }

    async fn leave_chat(&self, chat: ChatId) -> Result<(), TransportError> {
        if self.fail_leave.load(Ordering::SeqCst) {
            return Err(TransportError::new("flood wait"));
        }
        self.record(format!("leave {}", chat));
        Ok(())
    }

    fn take_completions(&self) -> Option<mpsc::UnboundedReceiver<TrackEnded>> {
        self.completions_rx.lock().unwrap().take()
    }
}

/// SQLite store that can be switched into a failing mode.
pub struct FlakyStore {
    inner: SqliteStore,
    pub failing: AtomicBool,
    saves: AtomicUsize,
}

impl FlakyStore {
    pub async fn new() -> Self {
        Self {
            inner: SqliteStore::in_memory().await.unwrap(),
            failing: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn session_saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PersistenceError::Unavailable("store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistentStore for FlakyStore {
    async fn load_session(&self, chat: ChatId) -> StoreResult<Option<SessionSnapshot>> {
        self.check()?;
        self.inner.load_session(chat).await
    }

    async fn load_sessions(&self) -> StoreResult<Vec<SessionSnapshot>> {
        self.check()?;
        self.inner.load_sessions().await
    }

    async fn save_session(&self, snapshot: &SessionSnapshot) -> StoreResult<()> {
        self.check()?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_session(snapshot).await
    }

    async fn delete_session(&self, chat: ChatId) -> StoreResult<()> {
        self.check()?;
        self.inner.delete_session(chat).await
    }

    async fn load_activity(&self) -> StoreResult<Vec<ActivityRecord>> {
        self.check()?;
        self.inner.load_activity().await
    }

    async fn save_activity(&self, records: &[ActivityRecord]) -> StoreResult<()> {
        self.check()?;
        self.inner.save_activity(records).await
    }

    async fn delete_activity(&self, chat: ChatId) -> StoreResult<()> {
        self.check()?;
        self.inner.delete_activity(chat).await
    }

    async fn last_job_run(&self, job: &str) -> StoreResult<Option<DateTime<Utc>>> {
        self.check()?;
        self.inner.last_job_run(job).await
    }

    async fn record_job_run(&self, job: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.check()?;
        self.inner.record_job_run(job, at).await
    }
}

/// A player wired to fakes, with handles on every collaborator.
pub struct Harness {
    pub player: Arc<Player>,
    pub provider: Arc<FakeProvider>,
    pub transport: Arc<RecordingTransport>,
    pub store: Arc<FlakyStore>,
    pub bus: Arc<EventBus>,
}

impl Harness {
    pub async fn new(provider: FakeProvider) -> Self {
        Self::with_store(provider, Arc::new(FlakyStore::new().await)).await
    }

    /// Build a fresh player over an existing store, as a restarted process would.
    pub async fn with_store(provider: FakeProvider, store: Arc<FlakyStore>) -> Self {
        let provider = Arc::new(provider);
        let transport = Arc::new(RecordingTransport::new());
        let bus = Arc::new(EventBus::new());
        let gateway = ProviderGateway::new(Duration::from_secs(2))
            .register(provider.clone())
            .with_default(provider.tag().to_string());

        let player = Player::new(
            ChatCache::new(),
            ActivityTracker::new(),
            Arc::new(gateway),
            transport.clone(),
            store.clone(),
            bus.clone(),
            PlayerSettings::default(),
        );

        Self {
            player: Arc::new(player),
            provider,
            transport,
            store,
            bus,
        }
    }
}
