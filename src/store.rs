use crate::{
    activity::ActivityRecord,
    chat::SessionSnapshot,
    error::StoreResult,
    track::ChatId,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr};
use tracing::warn;

/// Durable backing for the chat cache, activity tracker and job clock.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn load_session(&self, chat: ChatId) -> StoreResult<Option<SessionSnapshot>>;

    async fn load_sessions(&self) -> StoreResult<Vec<SessionSnapshot>>;

    async fn save_session(&self, snapshot: &SessionSnapshot) -> StoreResult<()>;

    async fn delete_session(&self, chat: ChatId) -> StoreResult<()>;

    async fn load_activity(&self) -> StoreResult<Vec<ActivityRecord>>;

    /// Upsert a batch of activity records atomically.
    async fn save_activity(&self, records: &[ActivityRecord]) -> StoreResult<()>;

    async fn delete_activity(&self, chat: ChatId) -> StoreResult<()>;

    async fn last_job_run(&self, job: &str) -> StoreResult<Option<DateTime<Utc>>>;

    async fn record_job_run(&self, job: &str, at: DateTime<Utc>) -> StoreResult<()>;
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                chat_id INTEGER PRIMARY KEY,
                snapshot TEXT NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_activity (
                chat_id INTEGER PRIMARY KEY,
                last_activity DATETIME,
                first_seen DATETIME NOT NULL,
                warned INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_chat_activity_last ON chat_activity(last_activity);

            CREATE TABLE IF NOT EXISTS job_runs (
                job TEXT PRIMARY KEY,
                last_run_at DATETIME NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn load_session(&self, chat: ChatId) -> StoreResult<Option<SessionSnapshot>> {
        let row = sqlx::query("SELECT snapshot FROM sessions WHERE chat_id = ?")
            .bind(chat.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("snapshot")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn load_sessions(&self) -> StoreResult<Vec<SessionSnapshot>> {
        let rows = sqlx::query("SELECT chat_id, snapshot FROM sessions")
            .fetch_all(&self.pool)
            .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let chat_id: i64 = row.try_get("chat_id")?;
            let raw: String = row.try_get("snapshot")?;
            match serde_json::from_str::<SessionSnapshot>(&raw) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    warn!(chat_id, error = %e, "Skipping unreadable session snapshot");
                }
            }
        }

        Ok(snapshots)
    }

    async fn save_session(&self, snapshot: &SessionSnapshot) -> StoreResult<()> {
        let raw = serde_json::to_string(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO sessions (chat_id, snapshot, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(chat_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(snapshot.chat_id.0)
        .bind(raw)
        .bind(snapshot.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_session(&self, chat: ChatId) -> StoreResult<()> {
        sqlx::query("DELETE FROM sessions WHERE chat_id = ?")
            .bind(chat.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_activity(&self) -> StoreResult<Vec<ActivityRecord>> {
        let rows = sqlx::query(
            "SELECT chat_id, last_activity, first_seen, warned FROM chat_activity",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(ActivityRecord {
                chat_id: ChatId(row.try_get("chat_id")?),
                last_activity: row.try_get("last_activity")?,
                first_seen: row.try_get("first_seen")?,
                warned: row.try_get("warned")?,
            });
        }

        Ok(records)
    }

    async fn save_activity(&self, records: &[ActivityRecord]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            // first_seen is write-once
            sqlx::query(
                r#"
                INSERT INTO chat_activity (chat_id, last_activity, first_seen, warned)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(chat_id) DO UPDATE SET
                    last_activity = excluded.last_activity,
                    warned = excluded.warned
                "#,
            )
            .bind(record.chat_id.0)
            .bind(record.last_activity)
            .bind(record.first_seen)
            .bind(record.warned)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn delete_activity(&self, chat: ChatId) -> StoreResult<()> {
        sqlx::query("DELETE FROM chat_activity WHERE chat_id = ?")
            .bind(chat.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn last_job_run(&self, job: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_run_at FROM job_runs WHERE job = ?")
            .bind(job)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("last_run_at")?)),
            None => Ok(None),
        }
    }

    async fn record_job_run(&self, job: &str, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (job, last_run_at)
            VALUES (?, ?)
            ON CONFLICT(job) DO UPDATE SET last_run_at = excluded.last_run_at
            "#,
        )
        .bind(job)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatSession;
    use crate::player::state::PlaybackStatus;
    use crate::track::{LoopMode, Track};
    use chrono::Duration;

    #[tokio::test]
    async fn session_snapshot_survives_store() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut session = ChatSession::new(ChatId(-1001), 80);
        session.status = PlaybackStatus::Paused;
        session.current = Some(Track::new("url", "a", "A"));
        session.queue.push_back(Track::new("url", "b", "B"));
        session.loop_mode = LoopMode::All;
        let snapshot = session.snapshot();

        store.save_session(&snapshot).await.unwrap();

        assert_eq!(store.load_session(ChatId(-1001)).await.unwrap(), Some(snapshot.clone()));
        assert_eq!(store.load_sessions().await.unwrap(), vec![snapshot]);

        store.delete_session(ChatId(-1001)).await.unwrap();
        assert!(store.load_session(ChatId(-1001)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_session_overwrites() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut session = ChatSession::new(ChatId(1), 100);
        store.save_session(&session.snapshot()).await.unwrap();
        session.volume = 10;
        store.save_session(&session.snapshot()).await.unwrap();

        let sessions = store.load_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].volume, 10);
    }

    #[tokio::test]
    async fn activity_upsert_keeps_first_seen() {
        let store = SqliteStore::in_memory().await.unwrap();
        let t0 = Utc::now() - Duration::days(2);
        let observed = ActivityRecord {
            chat_id: ChatId(5),
            last_activity: None,
            first_seen: t0,
            warned: false,
        };
        store.save_activity(&[observed]).await.unwrap();

        let t1 = Utc::now();
        let active = ActivityRecord {
            chat_id: ChatId(5),
            last_activity: Some(t1),
            first_seen: t1,
            warned: true,
        };
        store.save_activity(&[active]).await.unwrap();

        let records = store.load_activity().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].first_seen, t0);
        assert_eq!(records[0].last_activity, Some(t1));
        assert!(records[0].warned);

        store.delete_activity(ChatId(5)).await.unwrap();
        assert!(store.load_activity().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn job_clock_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.last_job_run("sweep").await.unwrap().is_none());

        let at = Utc::now();
        store.record_job_run("sweep", at).await.unwrap();
        store.record_job_run("sweep", at + Duration::hours(6)).await.unwrap();

        assert_eq!(
            store.last_job_run("sweep").await.unwrap(),
            Some(at + Duration::hours(6))
        );
    }
}
