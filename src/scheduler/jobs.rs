use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::{Job, JobReport};
use crate::activity::ActivityRecord;
use crate::bus::NotificationLevel;
use crate::player::{Player, UnattendedRule};
use crate::policy::{AutoLeavePolicy, ChatFacts, Verdict};
use crate::track::ChatId;

/// Evictions running at once during a sweep.
pub const DEFAULT_SWEEP_CONCURRENCY: usize = 8;

/// Leaves chats nobody has used for the inactivity threshold.
pub struct SweepJob {
    player: Arc<Player>,
    policy: AutoLeavePolicy,
    interval: Duration,
    concurrency: usize,
}

impl SweepJob {
    pub fn new(player: Arc<Player>, policy: AutoLeavePolicy, interval: Duration) -> Self {
        Self {
            player,
            policy,
            interval,
            concurrency: DEFAULT_SWEEP_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn warn_chat(&self, chat: ChatId) {
        self.player.tracker().mark_warned(chat);
        let hours = self.policy.warning_window.num_hours().max(1);
        self.player.bus().notify(
            chat,
            NotificationLevel::Warning,
            format!(
                "This chat has been quiet for a while. I will leave within {} hours unless someone plays something.",
                hours
            ),
        );
    }
}

#[async_trait]
impl Job for SweepJob {
    fn name(&self) -> &'static str {
        "sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, now: DateTime<Utc>) -> JobReport {
        let mut report = JobReport::default();
        if !self.policy.enabled {
            return report;
        }

        let tracker = self.player.tracker();
        let cache = self.player.cache();
        let chats: BTreeSet<ChatId> = tracker
            .tracked_chats()
            .into_iter()
            .chain(cache.chat_ids())
            .collect();

        let mut condemned = Vec::new();
        for chat in chats {
            report.examined += 1;
            if tracker.observe(chat, now) {
                debug!(chat_id = %chat, "Observed chat without recorded activity");
            }

            let facts = ChatFacts::gather(chat, tracker, cache);
            match self.policy.evaluate(&facts, now) {
                Verdict::Leave => condemned.push(chat),
                Verdict::Keep if self.policy.should_warn(&facts, now) => {
                    self.warn_chat(chat);
                    report.warned += 1;
                }
                Verdict::Keep => {}
            }
        }

        let results: Vec<_> = stream::iter(condemned)
            .map(|chat| async move {
                let result = self.player.evict_if_condemned(chat, &self.policy, now).await;
                (chat, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (chat, result) in results {
            match result {
                Ok(true) => report.acted += 1,
                Ok(false) => debug!(chat_id = %chat, "Chat became active before eviction"),
                Err(e) => {
                    warn!(chat_id = %chat, error = %e, "Eviction failed, will retry next sweep");
                    report.failed += 1;
                }
            }
        }

        if report.acted > 0 {
            info!(evicted = report.acted, "Left inactive chats");
        }
        report
    }
}

/// Writes dirty cache entries and activity records to the store.
pub struct FlushJob {
    player: Arc<Player>,
    interval: Duration,
    lock_max_idle: Duration,
}

impl FlushJob {
    pub fn new(player: Arc<Player>, interval: Duration) -> Self {
        Self {
            player,
            interval,
            lock_max_idle: crate::sync::DEFAULT_MAX_IDLE_AGE,
        }
    }

    async fn flush_activity(&self, report: &mut JobReport) {
        let tracker = self.player.tracker();
        let store = self.player.store();
        let dirty = tracker.dirty_records();
        if dirty.is_empty() {
            return;
        }

        let batch: Vec<ActivityRecord> = dirty.iter().map(|(record, _)| record.clone()).collect();
        report.examined += batch.len();
        if let Err(e) = store.save_activity(&batch).await {
            warn!(count = batch.len(), error = %e, "Activity flush failed");
            report.failed += batch.len();
            return;
        }

        for (record, revision) in dirty {
            let chat = record.chat_id;
            if tracker.get(chat).is_some() {
                tracker.mark_synced(chat, revision);
                report.acted += 1;
                continue;
            }
            // Evicted while the batch was in flight; the row we just wrote is stale.
            if let Err(e) = store.delete_activity(chat).await {
                warn!(chat_id = %chat, error = %e, "Failed to drop stale activity row");
                report.failed += 1;
            }
        }
    }
}

#[async_trait]
impl Job for FlushJob {
    fn name(&self) -> &'static str {
        "flush"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, now: DateTime<Utc>) -> JobReport {
        let mut report = JobReport::default();

        for chat in self.player.cache().dirty_chats() {
            report.examined += 1;
            match self.player.flush_session(chat).await {
                Ok(true) => report.acted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(chat_id = %chat, error = %e, "Session flush failed");
                    report.failed += 1;
                }
            }
        }

        self.flush_activity(&mut report).await;

        for chat in self.player.cache().tombstones() {
            report.examined += 1;
            match self.player.retry_delete(chat).await {
                Ok(()) => report.acted += 1,
                Err(e) => {
                    warn!(chat_id = %chat, error = %e, "Session delete retry failed");
                    report.failed += 1;
                }
            }
        }

        let dropped = self.player.locks().cleanup_stale(self.lock_max_idle);
        if dropped > 0 {
            debug!(dropped, "Dropped idle chat locks");
        }

        let cutoff = chrono::Duration::from_std(self.lock_max_idle)
            .ok()
            .and_then(|age| now.checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            let pruned = self.player.cache().prune_generations(cutoff);
            if pruned > 0 {
                let remaining = self.player.cache().tracked_generations();
                debug!(pruned, remaining, "Dropped generation counters of ended chats");
            }
        }
        report
    }
}

/// Ends sessions nobody is listening to.
pub struct AutoEndJob {
    player: Arc<Player>,
    rule: UnattendedRule,
    interval: Duration,
}

impl AutoEndJob {
    pub fn new(player: Arc<Player>, rule: UnattendedRule, interval: Duration) -> Self {
        Self { player, rule, interval }
    }
}

#[async_trait]
impl Job for AutoEndJob {
    fn name(&self) -> &'static str {
        "auto_end"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, now: DateTime<Utc>) -> JobReport {
        let mut report = JobReport::default();
        for chat in self.player.cache().chat_ids() {
            report.examined += 1;
            match self.player.end_if_unattended(chat, self.rule, now).await {
                Ok(true) => {
                    info!(chat_id = %chat, "Ended unattended session");
                    report.acted += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(chat_id = %chat, error = %e, "Auto-end check failed");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
