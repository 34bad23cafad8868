//! Voice-call transport seam.
//!
//! The player owns the lifecycle calls; the media plumbing lives behind
//! `VoiceTransport`. Tracks that play out are reported back on the channel
//! returned by `take_completions`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::TransportError;
use crate::track::{ChatId, StreamHandle, VoiceHandle};

/// A stream reached its end on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackEnded {
    pub chat: ChatId,
    pub stream: StreamHandle,
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Join the chat's voice chat.
    async fn start_session(&self, chat: ChatId) -> Result<VoiceHandle, TransportError>;

    /// Start a stream from the beginning. `duration` is `None` for live or unknown-length media.
    async fn play(
        &self,
        handle: &VoiceHandle,
        stream: &StreamHandle,
        duration: Option<Duration>,
    ) -> Result<(), TransportError>;

    async fn pause(&self, handle: &VoiceHandle) -> Result<(), TransportError>;

    async fn resume(&self, handle: &VoiceHandle) -> Result<(), TransportError>;

    async fn set_volume(&self, handle: &VoiceHandle, level: u16) -> Result<(), TransportError>;

    async fn mute(&self, handle: &VoiceHandle) -> Result<(), TransportError>;

    async fn unmute(&self, handle: &VoiceHandle) -> Result<(), TransportError>;

    /// Jump to an absolute position in the current stream.
    async fn seek(&self, handle: &VoiceHandle, position: Duration) -> Result<(), TransportError>;

    async fn set_speed(&self, handle: &VoiceHandle, speed: f64) -> Result<(), TransportError>;

    /// Leave the voice chat and release the handle.
    async fn stop(&self, handle: &VoiceHandle) -> Result<(), TransportError>;

    /// Participants in the voice chat including the bot, if the backend can tell.
    async fn listener_count(&self, _handle: &VoiceHandle) -> Result<Option<usize>, TransportError> {
        Ok(None)
    }

    /// Leave the chat itself after an eviction.
    async fn leave_chat(&self, _chat: ChatId) -> Result<(), TransportError> {
        Ok(())
    }

    /// Completion signals. Handed out once; `None` if the backend never reports them.
    fn take_completions(&self) -> Option<mpsc::UnboundedReceiver<TrackEnded>> {
        None
    }
}

/// Playback clock of one detached call.
#[derive(Debug, Clone)]
struct Call {
    chat: ChatId,
    stream: Option<StreamHandle>,
    duration: Option<Duration>,
    position: Duration,
    resumed_at: Option<Instant>,
    /// Bumped on every clock change so outdated timers stay silent.
    epoch: u64,
}

impl Call {
    fn elapsed(&self) -> Duration {
        self.position + self.resumed_at.map(|at| at.elapsed()).unwrap_or(Duration::ZERO)
    }
}

/// Bookkeeping transport used when no call backend is attached.
///
/// Hands out handles and keeps a playback clock per call without producing
/// audio. Tracks of known length report completion when the clock runs out.
pub struct DetachedTransport {
    calls: Arc<DashMap<VoiceHandle, Call>>,
    completions_tx: mpsc::UnboundedSender<TrackEnded>,
    completions_rx: Mutex<Option<mpsc::UnboundedReceiver<TrackEnded>>>,
}

impl Default for DetachedTransport {
    fn default() -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            calls: Arc::new(DashMap::new()),
            completions_tx,
            completions_rx: Mutex::new(Some(completions_rx)),
        }
    }
}

impl DetachedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_sessions(&self) -> usize {
        self.calls.len()
    }

    /// Apply a clock change to a live call and re-arm its completion timer.
    fn update(&self, handle: &VoiceHandle, change: impl FnOnce(&mut Call)) -> Result<ChatId, TransportError> {
        let mut call = self
            .calls
            .get_mut(handle)
            .ok_or_else(|| TransportError::new(format!("unknown voice handle {}", handle)))?;
        change(&mut *call);
        call.epoch += 1;
        let chat = call.chat;
        let snapshot = (*call).clone();
        drop(call);

        self.arm(handle.clone(), snapshot);
        Ok(chat)
    }

    fn arm(&self, handle: VoiceHandle, call: Call) {
        let (Some(stream), Some(duration), Some(_)) = (call.stream.clone(), call.duration, call.resumed_at) else {
            return;
        };
        let remaining = duration.saturating_sub(call.elapsed());
        let calls = self.calls.clone();
        let tx = self.completions_tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let current = calls.get(&handle).is_some_and(|c| c.epoch == call.epoch);
            if current {
                debug!(chat_id = %call.chat, stream = %stream.0, "Stream ended (detached)");
                let _ = tx.send(TrackEnded {
                    chat: call.chat,
                    stream,
                });
            }
        });
    }
}

#[async_trait]
impl VoiceTransport for DetachedTransport {
    async fn start_session(&self, chat: ChatId) -> Result<VoiceHandle, TransportError> {
        let handle = VoiceHandle(format!("vc_{}", Uuid::new_v4().simple()));
        self.calls.insert(
            handle.clone(),
            Call {
                chat,
                stream: None,
                duration: None,
                position: Duration::ZERO,
                resumed_at: None,
                epoch: 0,
            },
        );
        info!(chat_id = %chat, handle = %handle, "Voice session started (detached)");
        Ok(handle)
    }

    async fn play(
        &self,
        handle: &VoiceHandle,
        stream: &StreamHandle,
        duration: Option<Duration>,
    ) -> Result<(), TransportError> {
        let chat = self.update(handle, |call| {
            call.stream = Some(stream.clone());
            call.duration = duration;
            call.position = Duration::ZERO;
            call.resumed_at = Some(Instant::now());
        })?;
        debug!(chat_id = %chat, stream = %stream.0, "Play (detached)");
        Ok(())
    }

    async fn pause(&self, handle: &VoiceHandle) -> Result<(), TransportError> {
        self.update(handle, |call| {
            call.position = call.elapsed();
            call.resumed_at = None;
        })
        .map(|_| ())
    }

    async fn resume(&self, handle: &VoiceHandle) -> Result<(), TransportError> {
        self.update(handle, |call| {
            if call.resumed_at.is_none() {
                call.resumed_at = Some(Instant::now());
            }
        })
        .map(|_| ())
    }

    async fn set_volume(&self, handle: &VoiceHandle, level: u16) -> Result<(), TransportError> {
        let chat = self.update(handle, |_| {})?;
        debug!(chat_id = %chat, level, "Volume (detached)");
        Ok(())
    }

    async fn mute(&self, handle: &VoiceHandle) -> Result<(), TransportError> {
        self.update(handle, |_| {}).map(|_| ())
    }

    async fn unmute(&self, handle: &VoiceHandle) -> Result<(), TransportError> {
        self.update(handle, |_| {}).map(|_| ())
    }

    async fn seek(&self, handle: &VoiceHandle, position: Duration) -> Result<(), TransportError> {
        self.update(handle, |call| {
            call.position = position;
            if call.resumed_at.is_some() {
                call.resumed_at = Some(Instant::now());
            }
        })
        .map(|_| ())
    }

    async fn set_speed(&self, handle: &VoiceHandle, speed: f64) -> Result<(), TransportError> {
        let chat = self.update(handle, |_| {})?;
        debug!(chat_id = %chat, speed, "Speed (detached)");
        Ok(())
    }

    async fn stop(&self, handle: &VoiceHandle) -> Result<(), TransportError> {
        if let Some((_, call)) = self.calls.remove(handle) {
            info!(chat_id = %call.chat, handle = %handle, "Voice session stopped (detached)");
        }
        Ok(())
    }

    fn take_completions(&self) -> Option<mpsc::UnboundedReceiver<TrackEnded>> {
        self.completions_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}
