//! Last-activity bookkeeping per chat, consulted by the auto-leave sweep.
//!
//! Writes are in-memory upserts that never await; the flush job persists
//! dirty records in batches.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::cache::CacheEntry;
use crate::track::ChatId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub chat_id: ChatId,
    /// `None` for a chat that has been observed but never interacted with.
    pub last_activity: Option<DateTime<Utc>>,
    /// When the chat first became known to the tracker.
    pub first_seen: DateTime<Utc>,
    /// Whether the chat has been told it is about to be left.
    pub warned: bool,
}

#[derive(Clone, Default)]
pub struct ActivityTracker {
    records: Arc<DashMap<ChatId, CacheEntry<ActivityRecord>>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the chat's last activity to now.
    pub fn record_activity(&self, chat: ChatId) {
        self.record_activity_at(chat, Utc::now());
    }

    pub fn record_activity_at(&self, chat: ChatId, at: DateTime<Utc>) {
        self.records
            .entry(chat)
            .and_modify(|entry| {
                // Out-of-order writes never move the timestamp backwards.
                if entry.value.last_activity.map_or(true, |last| last < at) {
                    entry.value.last_activity = Some(at);
                }
                entry.value.warned = false;
                entry.touch();
            })
            .or_insert_with(|| {
                CacheEntry::dirty(ActivityRecord {
                    chat_id: chat,
                    last_activity: Some(at),
                    first_seen: at,
                    warned: false,
                })
            });
    }

    pub fn last_activity(&self, chat: ChatId) -> Option<DateTime<Utc>> {
        self.records.get(&chat).and_then(|e| e.value.last_activity)
    }

    pub fn get(&self, chat: ChatId) -> Option<ActivityRecord> {
        self.records.get(&chat).map(|e| e.value.clone())
    }

    /// Register a chat seen without any activity. No-op if already tracked.
    ///
    /// Returns true when the chat was newly observed.
    pub fn observe(&self, chat: ChatId, now: DateTime<Utc>) -> bool {
        let mut inserted = false;
        self.records.entry(chat).or_insert_with(|| {
            inserted = true;
            CacheEntry::dirty(ActivityRecord {
                chat_id: chat,
                last_activity: None,
                first_seen: now,
                warned: false,
            })
        });
        inserted
    }

    pub fn mark_warned(&self, chat: ChatId) {
        if let Some(mut entry) = self.records.get_mut(&chat) {
            if !entry.value.warned {
                entry.value.warned = true;
                entry.touch();
            }
        }
    }

    /// Drop the chat entirely. Only done when the chat is evicted.
    pub fn forget(&self, chat: ChatId) -> Option<ActivityRecord> {
        self.records.remove(&chat).map(|(_, e)| e.value)
    }

    pub fn tracked_chats(&self) -> Vec<ChatId> {
        self.records.iter().map(|e| *e.key()).collect()
    }

    pub fn dirty_records(&self) -> Vec<(ActivityRecord, u64)> {
        self.records
            .iter()
            .filter(|e| e.is_dirty())
            .map(|e| (e.value.clone(), e.revision()))
            .collect()
    }

    pub fn mark_synced(&self, chat: ChatId, revision: u64) {
        if let Some(mut entry) = self.records.get_mut(&chat) {
            entry.mark_synced(revision);
        }
    }

    /// Load durable records as clean entries. Newer in-memory activity wins.
    pub fn rehydrate(&self, records: impl IntoIterator<Item = ActivityRecord>) -> usize {
        let mut loaded = 0;
        for record in records {
            let chat = record.chat_id;
            if self.records.contains_key(&chat) {
                continue;
            }
            self.records.insert(chat, CacheEntry::clean(record));
            loaded += 1;
        }
        loaded
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
