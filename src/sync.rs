//! Per-chat critical sections.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::track::ChatId;

/// Max idle age before an unused chat lock is dropped by `cleanup_stale`.
pub const DEFAULT_MAX_IDLE_AGE: Duration = Duration::from_secs(2 * 60 * 60);

type LockStorage = DashMap<ChatId, (Arc<Mutex<()>>, Instant)>;

/// One async mutex per chat id.
///
/// Commands for the same chat serialize on its lock while different chats
/// proceed in parallel. There is no global lock.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<LockStorage>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the lock for a chat, refreshing its last-access time.
    pub fn get(&self, chat: ChatId) -> Arc<Mutex<()>> {
        let now = Instant::now();
        self.locks
            .entry(chat)
            .and_modify(|(_, last_access)| *last_access = now)
            .or_insert_with(|| (Arc::new(Mutex::new(())), now))
            .0
            .clone()
    }

    /// Enter the chat's critical section.
    pub async fn acquire(&self, chat: ChatId) -> OwnedMutexGuard<()> {
        self.get(chat).lock_owned().await
    }

    /// Drop locks nobody holds and nobody touched within `max_age`.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.locks.len();
        // strong_count == 1 means only the map references the lock
        self.locks.retain(|_, (lock, last_access)| {
            Arc::strong_count(lock) > 1 || now.duration_since(*last_access) <= max_age
        });
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_chat_shares_lock() {
        let locks = KeyedLocks::new();
        assert!(Arc::ptr_eq(&locks.get(ChatId(1)), &locks.get(ChatId(1))));
        assert!(!Arc::ptr_eq(&locks.get(ChatId(1)), &locks.get(ChatId(2))));
    }

    #[tokio::test]
    async fn same_chat_serializes() {
        let locks = KeyedLocks::new();
        let _guard = locks.acquire(ChatId(1)).await;
        assert!(locks.get(ChatId(1)).try_lock().is_err());
        assert!(locks.get(ChatId(2)).try_lock().is_ok());
    }

    #[test]
    fn cleanup_removes_only_stale_unheld_locks() {
        let locks = KeyedLocks::new();
        let old = Instant::now() - Duration::from_secs(10);
        locks
            .locks
            .insert(ChatId(1), (Arc::new(Mutex::new(())), old));
        let held = Arc::new(Mutex::new(()));
        locks.locks.insert(ChatId(2), (Arc::clone(&held), old));
        locks.get(ChatId(3));

        let removed = locks.cleanup_stale(Duration::from_secs(5));

        assert_eq!(removed, 1);
        assert!(!locks.locks.contains_key(&ChatId(1)));
        assert!(locks.locks.contains_key(&ChatId(2)));
        assert!(locks.locks.contains_key(&ChatId(3)));
    }
}
