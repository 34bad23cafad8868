use crate::track::{ChatId, Track};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// Something the chat should be told about (skipped track, impending leave, ...)
    Notification {
        chat: ChatId,
        level: NotificationLevel,
        message: String,
    },

    /// A track became now playing
    TrackStarted { chat: ChatId, track: Track },

    /// The chat's session ended and its cache slot was freed
    SessionEnded { chat: ChatId, reason: EndReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    Stopped,
    /// Auto-leave sweep condemned the chat.
    Evicted,
    /// Auto-end job found nobody listening.
    Unattended,
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn notify(&self, chat: ChatId, level: NotificationLevel, message: impl Into<String>) {
        self.publish(Event::Notification {
            chat,
            level,
            message: message.into(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
