//! Durable storage of moderation history.
//!
//! The engine only needs append-style writers and a few lookups, expressed by
//! the [`Store`] trait. [`SqliteStore`] is the bundled SQLite implementation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::{Result, WardenError};
use crate::models::{
    MemberProfile, ModerationStats, MuteRecord, ScopeKey, VerificationOutcome, VerificationStats,
    ViolationRecord,
};
use crate::verification::{Challenge, ChallengeId};

/// Persistence collaborator.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_user(&self, scope: ScopeKey, profile: &MemberProfile) -> Result<()>;

    /// Log a mute. An `applied` mute replaces the scope's active row; one
    /// the platform rejected is kept as an inactive entry.
    async fn save_mute(
        &self,
        record: &MuteRecord,
        reason: &str,
        applied: bool,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Mark every active mute for the scope as lifted.
    async fn remove_mute(&self, scope: ScopeKey, at: DateTime<Utc>) -> Result<()>;

    async fn save_warning(
        &self,
        scope: ScopeKey,
        reason: &str,
        count: u32,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn clear_warnings(&self, scope: ScopeKey) -> Result<()>;

    async fn log_violation(&self, record: &ViolationRecord) -> Result<()>;

    async fn save_challenge(&self, challenge: &Challenge) -> Result<()>;

    async fn complete_verification(
        &self,
        challenge_id: ChallengeId,
        scope: ScopeKey,
        outcome: VerificationOutcome,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn log_message(&self, scope: ScopeKey, text: &str, at: DateTime<Utc>) -> Result<()>;

    async fn is_user_verified(&self, scope: ScopeKey) -> Result<bool>;

    /// Counts across all chats when `chat_id` is `None`.
    async fn moderation_stats(&self, chat_id: Option<i64>) -> Result<ModerationStats>;

    /// Counts across all chats when `chat_id` is `None`.
    async fn verification_stats(&self, chat_id: Option<i64>) -> Result<VerificationStats>;
}

/// Fixed-width UTC timestamps so stored values compare correctly as text.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn db_err(context: &str) -> impl FnOnce(sqlx::Error) -> WardenError + '_ {
    move |e| WardenError::Persistence(format!("{}: {}", context, e))
}

/// SQLite-backed [`Store`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) a database file.
    pub async fn new(path: &str) -> Result<Self> {
        let db_path = Path::new(path);

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    WardenError::Persistence(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err("Failed to connect to database"))?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Create an in-memory database for testing.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        // One connection that never recycles, otherwise the database vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .map_err(db_err("Failed to create in-memory db"))?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err("Failed to initialize schema"))?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Health check failed"))?;
        Ok(())
    }

    async fn count(&self, sql: &str, chat_id: Option<i64>) -> Result<u64> {
        let row = sqlx::query(sql)
            .bind(chat_id)
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Failed to query stats"))?;
        Ok(row.get::<i64, _>("total").max(0) as u64)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_user(&self, scope: ScopeKey, profile: &MemberProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (chat_id, user_id, username, first_name, last_name, joined_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(chat_id, user_id) DO UPDATE SET
                username = excluded.username,
                first_name = excluded.first_name,
                last_name = excluded.last_name",
        )
        .bind(scope.chat_id)
        .bind(scope.user_id)
        .bind(&profile.username)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to save user"))?;
        Ok(())
    }

    async fn save_mute(
        &self,
        record: &MuteRecord,
        reason: &str,
        applied: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("Failed to begin mute transaction"))?;

        if applied {
            sqlx::query(
                "UPDATE mutes SET is_active = 0, removed_at = ?
                 WHERE chat_id = ? AND user_id = ? AND is_active = 1",
            )
            .bind(ts(at))
            .bind(record.scope.chat_id)
            .bind(record.scope.user_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to retire previous mute"))?;
        }

        sqlx::query(
            "INSERT INTO mutes (chat_id, user_id, duration_secs, reason, created_at, expires_at, is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.scope.chat_id)
        .bind(record.scope.user_id)
        .bind(record.duration.as_secs() as i64)
        .bind(reason)
        .bind(ts(at))
        .bind(ts(record.expires_at))
        .bind(applied)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to save mute"))?;

        tx.commit().await.map_err(db_err("Failed to commit mute"))?;
        Ok(())
    }

    async fn remove_mute(&self, scope: ScopeKey, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE mutes SET is_active = 0, removed_at = ?
             WHERE chat_id = ? AND user_id = ? AND is_active = 1",
        )
        .bind(ts(at))
        .bind(scope.chat_id)
        .bind(scope.user_id)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to remove mute"))?;
        Ok(())
    }

    async fn save_warning(
        &self,
        scope: ScopeKey,
        reason: &str,
        count: u32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO warnings (chat_id, user_id, reason, count, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(scope.chat_id)
        .bind(scope.user_id)
        .bind(reason)
        .bind(count as i64)
        .bind(ts(at))
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to save warning"))?;
        Ok(())
    }

    async fn clear_warnings(&self, scope: ScopeKey) -> Result<()> {
        sqlx::query("DELETE FROM warnings WHERE chat_id = ? AND user_id = ?")
            .bind(scope.chat_id)
            .bind(scope.user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err("Failed to clear warnings"))?;
        Ok(())
    }

    async fn log_violation(&self, record: &ViolationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO violations (id, chat_id, user_id, kind, content, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(record.scope.chat_id)
        .bind(record.scope.user_id)
        .bind(record.kind.as_str())
        .bind(&record.content)
        .bind(ts(record.timestamp))
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to log violation"))?;
        Ok(())
    }

    async fn save_challenge(&self, challenge: &Challenge) -> Result<()> {
        sqlx::query(
            "INSERT INTO verifications (id, chat_id, user_id, question, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(challenge.id.to_string())
        .bind(challenge.scope.chat_id)
        .bind(challenge.scope.user_id)
        .bind(&challenge.question)
        .bind(ts(challenge.issued_at))
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to save challenge"))?;
        Ok(())
    }

    async fn complete_verification(
        &self,
        challenge_id: ChallengeId,
        scope: ScopeKey,
        outcome: VerificationOutcome,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE verifications SET completed_at = ?, outcome = ?
             WHERE id = ? AND completed_at IS NULL",
        )
        .bind(ts(at))
        .bind(outcome.as_str())
        .bind(challenge_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to complete verification"))?;

        if outcome.is_success() {
            sqlx::query(
                "INSERT INTO users (chat_id, user_id, joined_at, is_verified)
                 VALUES (?, ?, ?, 1)
                 ON CONFLICT(chat_id, user_id) DO UPDATE SET is_verified = 1",
            )
            .bind(scope.chat_id)
            .bind(scope.user_id)
            .bind(ts(at))
            .execute(&self.pool)
            .await
            .map_err(db_err("Failed to mark user verified"))?;
        }
        Ok(())
    }

    async fn log_message(&self, scope: ScopeKey, text: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (chat_id, user_id, message_text, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(scope.chat_id)
        .bind(scope.user_id)
        .bind(text)
        .bind(ts(at))
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to log message"))?;
        Ok(())
    }

    async fn is_user_verified(&self, scope: ScopeKey) -> Result<bool> {
        let row = sqlx::query("SELECT is_verified FROM users WHERE chat_id = ? AND user_id = ?")
            .bind(scope.chat_id)
            .bind(scope.user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to check verification"))?;

        Ok(row.is_some_and(|row| row.get::<i64, _>("is_verified") != 0))
    }

    async fn moderation_stats(&self, chat_id: Option<i64>) -> Result<ModerationStats> {
        let now = ts(Utc::now());
        let active_row = sqlx::query(
            "SELECT COUNT(*) AS total FROM mutes
             WHERE (? IS NULL OR chat_id = ?) AND is_active = 1 AND expires_at > ?",
        )
        .bind(chat_id)
        .bind(chat_id)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("Failed to query stats"))?;

        Ok(ModerationStats {
            mutes: self
                .count(
                    "SELECT COUNT(*) AS total FROM mutes WHERE (? IS NULL OR chat_id = ?)",
                    chat_id,
                )
                .await?,
            active_mutes: active_row.get::<i64, _>("total").max(0) as u64,
            warnings: self
                .count(
                    "SELECT COUNT(*) AS total FROM warnings WHERE (? IS NULL OR chat_id = ?)",
                    chat_id,
                )
                .await?,
            violations: self
                .count(
                    "SELECT COUNT(*) AS total FROM violations WHERE (? IS NULL OR chat_id = ?)",
                    chat_id,
                )
                .await?,
            offensive_word_violations: self
                .count(
                    "SELECT COUNT(*) AS total FROM violations
                     WHERE (? IS NULL OR chat_id = ?) AND kind = 'offensive_word'",
                    chat_id,
                )
                .await?,
            spam_violations: self
                .count(
                    "SELECT COUNT(*) AS total FROM violations
                     WHERE (? IS NULL OR chat_id = ?) AND kind = 'spam'",
                    chat_id,
                )
                .await?,
            messages: self
                .count(
                    "SELECT COUNT(*) AS total FROM messages WHERE (? IS NULL OR chat_id = ?)",
                    chat_id,
                )
                .await?,
        })
    }

    async fn verification_stats(&self, chat_id: Option<i64>) -> Result<VerificationStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN outcome = 'verified' THEN 1 ELSE 0 END), 0) AS successful,
                COALESCE(SUM(CASE WHEN outcome = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN outcome = 'timed_out' THEN 1 ELSE 0 END), 0) AS timed_out,
                COALESCE(SUM(CASE WHEN outcome IS NULL THEN 1 ELSE 0 END), 0) AS pending
             FROM verifications WHERE (? IS NULL OR chat_id = ?)",
        )
        .bind(chat_id)
        .bind(chat_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("Failed to query verification stats"))?;

        let get = |column: &str| row.get::<i64, _>(column).max(0) as u64;
        Ok(VerificationStats {
            total: get("total"),
            successful: get("successful"),
            failed: get("failed"),
            timed_out: get("timed_out"),
            pending: get("pending"),
        })
    }
}

const SCHEMA: &str = r#"
-- Members seen in each chat
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    username TEXT,
    first_name TEXT,
    last_name TEXT,
    joined_at TEXT NOT NULL,
    is_verified INTEGER DEFAULT 0,
    UNIQUE(chat_id, user_id)
);

-- Join challenges and their outcomes
CREATE TABLE IF NOT EXISTS verifications (
    id TEXT PRIMARY KEY,
    chat_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    question TEXT NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    outcome TEXT
);

-- Mute log
CREATE TABLE IF NOT EXISTS mutes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    duration_secs INTEGER NOT NULL,
    reason TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    removed_at TEXT,
    is_active INTEGER DEFAULT 1
);

-- Warnings
CREATE TABLE IF NOT EXISTS warnings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    reason TEXT,
    count INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

-- Violation audit trail
CREATE TABLE IF NOT EXISTS violations (
    id TEXT PRIMARY KEY,
    chat_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    content TEXT,
    created_at TEXT NOT NULL
);

-- Message log for statistics
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    message_text TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mutes_scope ON mutes(chat_id, user_id);
CREATE INDEX IF NOT EXISTS idx_warnings_scope ON warnings(chat_id, user_id);
CREATE INDEX IF NOT EXISTS idx_violations_chat ON violations(chat_id);
CREATE INDEX IF NOT EXISTS idx_verifications_chat ON verifications(chat_id);
"#;
