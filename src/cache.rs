//! In-memory chat cache with dirty tracking against the persistent store.
//!
//! Mutations go through the owning chat's critical section (see `KeyedLocks`),
//! so the map itself is only ever touched for short, non-async sections.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::chat::{ChatSession, SessionSnapshot};
use crate::player::state::PlaybackStatus;
use crate::track::ChatId;

/// Value plus revision counters; dirty while `revision != synced_revision`.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    revision: u64,
    synced_revision: u64,
}

impl<T> CacheEntry<T> {
    /// Entry as loaded from the store: clean.
    pub fn clean(value: T) -> Self {
        Self {
            value,
            revision: 0,
            synced_revision: 0,
        }
    }

    /// Entry created in memory: dirty until synced.
    pub fn dirty(value: T) -> Self {
        Self {
            value,
            revision: 1,
            synced_revision: 0,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.revision != self.synced_revision
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Replace the value and bump the revision. Returns the new revision.
    pub fn update(&mut self, value: T) -> u64 {
        self.value = value;
        self.touch()
    }

    pub fn touch(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Record that `revision` reached the store. Older acknowledgements are ignored.
    pub fn mark_synced(&mut self, revision: u64) {
        if revision > self.synced_revision {
            self.synced_revision = revision.min(self.revision);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub sessions: usize,
    pub active: usize,
    pub dirty: usize,
    pub queued_tracks: usize,
    pub pending_deletes: usize,
}

/// Chat id -> session state. At most one session per chat id.
#[derive(Clone, Default)]
pub struct ChatCache {
    entries: Arc<DashMap<ChatId, CacheEntry<ChatSession>>>,
    /// Bumped whenever a chat's session is destroyed, so in-flight work can
    /// tell that the session it started against is gone. Paired with the time of the last bump.
    generations: Arc<DashMap<ChatId, (u64, DateTime<Utc>)>>,
    /// Sessions removed from memory whose store deletion has not succeeded yet.
    tombstones: Arc<Mutex<HashSet<ChatId>>>,
}

impl ChatCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chat: ChatId) -> Option<ChatSession> {
        self.entries.get(&chat).map(|e| e.value.clone())
    }

    pub fn contains(&self, chat: ChatId) -> bool {
        self.entries.contains_key(&chat)
    }

    /// Insert or replace the chat's session, marking it dirty. Returns the entry revision.
    pub fn put(&self, session: ChatSession) -> u64 {
        let chat = session.chat_id;
        self.clear_tombstone(chat);
        match self.entries.entry(chat) {
            Entry::Occupied(mut occupied) => occupied.get_mut().update(session),
            Entry::Vacant(vacant) => {
                let entry = CacheEntry::dirty(session);
                let revision = entry.revision();
                vacant.insert(entry);
                revision
            }
        }
    }

    /// Acknowledge that the chat's session reached the store at `revision`.
    pub fn mark_synced(&self, chat: ChatId, revision: u64) {
        if let Some(mut entry) = self.entries.get_mut(&chat) {
            entry.mark_synced(revision);
        }
    }

    pub fn is_dirty(&self, chat: ChatId) -> bool {
        self.entries.get(&chat).is_some_and(|e| e.is_dirty())
    }

    /// Remove the chat's session and invalidate in-flight work against it.
    pub fn remove(&self, chat: ChatId) -> Option<ChatSession> {
        let removed = self.entries.remove(&chat).map(|(_, e)| e.value);
        self.bump_generation(chat);
        removed
    }

    pub fn generation(&self, chat: ChatId) -> u64 {
        self.generations.get(&chat).map(|g| g.0).unwrap_or(0)
    }

    pub fn bump_generation(&self, chat: ChatId) {
        let mut entry = self.generations.entry(chat).or_insert((0, Utc::now()));
        entry.0 += 1;
        entry.1 = Utc::now();
    }

    /// Forget counters of chats without a session whose last bump is older than
    /// `cutoff`. Requests resolving across the cutoff are long timed out.
    pub fn prune_generations(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.generations.len();
        self.generations
            .retain(|chat, (_, bumped)| *bumped >= cutoff || self.entries.contains_key(chat));
        before.saturating_sub(self.generations.len())
    }

    pub fn tracked_generations(&self) -> usize {
        self.generations.len()
    }

    /// Snapshot of the key space. Entries may change after this returns.
    pub fn chat_ids(&self) -> Vec<ChatId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn dirty_chats(&self) -> Vec<ChatId> {
        self.entries
            .iter()
            .filter(|e| e.is_dirty())
            .map(|e| *e.key())
            .collect()
    }

    /// Snapshot of a dirty session, paired with the revision it represents.
    pub fn dirty_snapshot(&self, chat: ChatId) -> Option<(SessionSnapshot, u64)> {
        self.entries
            .get(&chat)
            .filter(|e| e.is_dirty())
            .map(|e| (e.value.snapshot(), e.revision()))
    }

    /// Load sessions from the store as clean entries.
    pub fn rehydrate(&self, snapshots: impl IntoIterator<Item = SessionSnapshot>) -> usize {
        let mut loaded = 0;
        for snapshot in snapshots {
            if snapshot.status == PlaybackStatus::Stopped {
                continue;
            }
            let chat = snapshot.chat_id;
            self.entries
                .insert(chat, CacheEntry::clean(ChatSession::from(snapshot)));
            loaded += 1;
        }
        loaded
    }

    pub fn add_tombstone(&self, chat: ChatId) {
        if let Ok(mut tombstones) = self.tombstones.lock() {
            tombstones.insert(chat);
        }
    }

    pub fn clear_tombstone(&self, chat: ChatId) {
        if let Ok(mut tombstones) = self.tombstones.lock() {
            tombstones.remove(&chat);
        }
    }

    pub fn tombstones(&self) -> Vec<ChatId> {
        self.tombstones
            .lock()
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            pending_deletes: self.tombstones().len(),
            ..CacheStats::default()
        };
        for entry in self.entries.iter() {
            stats.sessions += 1;
            if entry.value.status.is_active() {
                stats.active += 1;
            }
            if entry.is_dirty() {
                stats.dirty += 1;
            }
            stats.queued_tracks += entry.value.queue.len();
        }
        stats
    }
}
