//! Auto-leave decision function.

use chrono::{DateTime, Duration, Utc};

use crate::activity::{ActivityRecord, ActivityTracker};
use crate::cache::ChatCache;
use crate::track::ChatId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Leave,
}

/// Everything the policy looks at for one chat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatFacts {
    pub last_activity: Option<DateTime<Utc>>,
    /// When the chat was first observed; `None` if it is not tracked at all.
    pub first_seen: Option<DateTime<Utc>>,
    pub warned: bool,
    /// The chat has a session holding a keep-alive override.
    pub keep_alive: bool,
}

impl ChatFacts {
    pub fn gather(chat: ChatId, tracker: &ActivityTracker, cache: &ChatCache) -> Self {
        let record = tracker.get(chat);
        let keep_alive = cache.get(chat).is_some_and(|s| s.keep_alive);
        Self::from_record(record.as_ref(), keep_alive)
    }

    pub fn from_record(record: Option<&ActivityRecord>, keep_alive: bool) -> Self {
        Self {
            last_activity: record.and_then(|r| r.last_activity),
            first_seen: record.map(|r| r.first_seen),
            warned: record.is_some_and(|r| r.warned),
            keep_alive,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoLeavePolicy {
    pub enabled: bool,
    pub inactivity_threshold: Duration,
    /// How long an observed chat without any activity is spared.
    pub grace_period: Duration,
    /// Advance notice window for warnings (one sweep interval).
    pub warning_window: Duration,
}

impl AutoLeavePolicy {
    pub fn new(enabled: bool, inactivity_threshold: Duration, sweep_interval: Duration) -> Self {
        Self {
            enabled,
            inactivity_threshold,
            grace_period: sweep_interval,
            warning_window: sweep_interval,
        }
    }

    pub fn evaluate(&self, facts: &ChatFacts, now: DateTime<Utc>) -> Verdict {
        if !self.enabled || facts.keep_alive {
            return Verdict::Keep;
        }
        let condemned = match (facts.last_activity, facts.first_seen) {
            (Some(last), _) => now - last >= self.inactivity_threshold,
            (None, Some(first_seen)) => now - first_seen >= self.grace_period,
            // Not even observed yet: the sweep observes it first.
            (None, None) => false,
        };
        if condemned {
            Verdict::Leave
        } else {
            Verdict::Keep
        }
    }

    /// A kept chat that will be condemned before the next sweep and has not been told yet.
    pub fn should_warn(&self, facts: &ChatFacts, now: DateTime<Utc>) -> bool {
        if facts.warned || self.evaluate(facts, now) == Verdict::Leave {
            return false;
        }
        // Observed-only chats have nobody to warn.
        if facts.last_activity.is_none() {
            return false;
        }
        now.checked_add_signed(self.warning_window)
            .is_some_and(|horizon| self.evaluate(facts, horizon) == Verdict::Leave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AutoLeavePolicy {
        AutoLeavePolicy::new(true, Duration::days(7), Duration::hours(6))
    }

    fn active_at(at: DateTime<Utc>) -> ChatFacts {
        ChatFacts {
            last_activity: Some(at),
            first_seen: Some(at),
            ..ChatFacts::default()
        }
    }

    #[test]
    fn exact_threshold_is_condemned() {
        let now = Utc::now();
        let facts = active_at(now - Duration::days(7));
        assert_eq!(policy().evaluate(&facts, now), Verdict::Leave);
    }

    #[test]
    fn one_second_short_of_threshold_is_kept() {
        let now = Utc::now();
        let facts = active_at(now - Duration::days(7) + Duration::seconds(1));
        assert_eq!(policy().evaluate(&facts, now), Verdict::Keep);
    }

    #[test]
    fn disabled_policy_keeps_everything() {
        let now = Utc::now();
        let mut p = policy();
        p.enabled = false;
        let facts = active_at(now - Duration::days(30));
        assert_eq!(p.evaluate(&facts, now), Verdict::Keep);
    }

    #[test]
    fn keep_alive_suppresses_eviction_even_without_activity() {
        let now = Utc::now();
        let facts = ChatFacts {
            first_seen: Some(now - Duration::days(30)),
            keep_alive: true,
            ..ChatFacts::default()
        };
        assert_eq!(policy().evaluate(&facts, now), Verdict::Keep);
    }

    #[test]
    fn observed_chat_gets_one_sweep_of_grace() {
        let now = Utc::now();
        let mut facts = ChatFacts {
            first_seen: Some(now - Duration::hours(5)),
            ..ChatFacts::default()
        };
        assert_eq!(policy().evaluate(&facts, now), Verdict::Keep);

        facts.first_seen = Some(now - Duration::hours(6));
        assert_eq!(policy().evaluate(&facts, now), Verdict::Leave);
    }

    #[test]
    fn unobserved_chat_is_kept() {
        assert_eq!(
            policy().evaluate(&ChatFacts::default(), Utc::now()),
            Verdict::Keep
        );
    }

    #[test]
    fn warns_within_one_sweep_of_threshold() {
        let now = Utc::now();
        let p = policy();

        let soon = active_at(now - Duration::days(7) + Duration::hours(3));
        assert!(p.should_warn(&soon, now));

        let later = active_at(now - Duration::days(6));
        assert!(!p.should_warn(&later, now));

        let already = ChatFacts {
            warned: true,
            ..soon.clone()
        };
        assert!(!p.should_warn(&already, now));

        let condemned = active_at(now - Duration::days(8));
        assert!(!p.should_warn(&condemned, now));
    }

    #[test]
    fn warning_horizon_past_the_calendar_does_not_panic() {
        let now = Utc::now();
        let p = AutoLeavePolicy::new(true, Duration::days(7), Duration::days(100_000_000));
        let facts = active_at(now - Duration::days(1));
        assert!(!p.should_warn(&facts, now));
    }

    #[test]
    fn gather_reads_tracker_and_cache() {
        let tracker = ActivityTracker::new();
        let cache = ChatCache::new();
        let at = Utc::now();
        tracker.record_activity_at(ChatId(1), at);
        let mut session = crate::chat::ChatSession::new(ChatId(1), 100);
        session.keep_alive = true;
        cache.put(session);

        let facts = ChatFacts::gather(ChatId(1), &tracker, &cache);
        assert_eq!(facts.last_activity, Some(at));
        assert!(facts.keep_alive);
        assert_eq!(ChatFacts::gather(ChatId(2), &tracker, &cache), ChatFacts::default());
    }
}
