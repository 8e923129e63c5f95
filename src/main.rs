//! Warden replay driver.
//!
//! Reads chat events as JSON lines on stdin and feeds them through the
//! moderation engine. Platform actions are logged instead of performed, so
//! a captured event stream can be replayed against a word list and policy.
//!
//! ```text
//! {"type": "join", "chat_id": -100, "user_id": 7, "username": "sam"}
//! {"type": "message", "chat_id": -100, "user_id": 7, "message_id": 1, "text": "hi"}
//! {"type": "mute", "chat_id": -100, "user_id": 7, "duration": "10m"}
//! {"type": "ban", "chat_id": -100, "user_id": 9}
//! {"type": "stats", "chat_id": -100}
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warden::config::WardenConfig;
use warden::engine::{
    spawn_dispatch_task, spawn_maintenance_task, AnswerEvent, JoinEvent, MessageEvent,
    ModerationEngine,
};
use warden::error::{ErrorContext, Result, WardenError};
use warden::filter::{ContentFilter, FileWordStore};
use warden::models::ScopeKey;
use warden::pattern::PatternCompiler;
use warden::platform::LoggingPlatform;
use warden::store::SqliteStore;

/// One line of the replay stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplayEvent {
    Message(MessageEvent),
    Join(JoinEvent),
    Answer(AnswerEvent),
    Mute {
        chat_id: i64,
        user_id: i64,
        duration: Option<String>,
    },
    Unmute {
        chat_id: i64,
        user_id: i64,
    },
    Warn {
        chat_id: i64,
        user_id: i64,
        #[serde(default)]
        reason: String,
    },
    ClearWarnings {
        chat_id: i64,
        user_id: i64,
    },
    Ban {
        chat_id: i64,
        user_id: i64,
    },
    Unban {
        chat_id: i64,
        user_id: i64,
    },
    AddWord {
        word: String,
    },
    RemoveWord {
        word: String,
    },
    Stats {
        chat_id: Option<i64>,
    },
    /// Pause so scheduled tasks can fire.
    Wait {
        millis: u64,
    },
}

/// Parse `WARDEN_ADMINS`, a comma-separated list of `chat:user` pairs.
fn parse_admins(raw: &str) -> Result<Vec<(i64, i64)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (chat, user) = pair
                .split_once(':')
                .ok_or_else(|| WardenError::Config(format!("admin entry needs chat:user: {}", pair)))?;
            let chat = chat
                .trim()
                .parse()
                .map_err(|_| WardenError::Config(format!("invalid chat id in admin entry: {}", pair)))?;
            let user = user
                .trim()
                .parse()
                .map_err(|_| WardenError::Config(format!("invalid user id in admin entry: {}", pair)))?;
            Ok((chat, user))
        })
        .collect()
}

async fn apply(engine: &ModerationEngine, event: ReplayEvent) -> Result<()> {
    let now = Utc::now();
    match event {
        ReplayEvent::Message(message) => {
            let verdict = engine.handle_message(&message, now).await;
            tracing::info!(
                chat_id = message.chat_id,
                user_id = message.user_id,
                message_id = message.message_id,
                verdict = ?verdict,
                "Message processed"
            );
        }
        ReplayEvent::Join(join) => {
            let outcome = engine.handle_join(&join, now).await;
            tracing::info!(
                chat_id = join.chat_id,
                user_id = join.user_id,
                outcome = ?outcome,
                "Join processed"
            );
        }
        ReplayEvent::Answer(answer) => {
            let outcome = engine.handle_answer(&answer, now).await;
            tracing::info!(
                chat_id = answer.chat_id,
                user_id = answer.user_id,
                outcome = ?outcome,
                "Answer processed"
            );
        }
        ReplayEvent::Mute {
            chat_id,
            user_id,
            duration,
        } => {
            let record = engine
                .mute_member(ScopeKey::new(chat_id, user_id), duration.as_deref(), now)
                .await?;
            tracing::info!(expires_at = %record.expires_at, "Mute applied");
        }
        ReplayEvent::Unmute { chat_id, user_id } => {
            engine
                .unmute_member(ScopeKey::new(chat_id, user_id), now)
                .await?;
        }
        ReplayEvent::Warn {
            chat_id,
            user_id,
            reason,
        } => {
            let outcome = engine
                .warn_member(ScopeKey::new(chat_id, user_id), &reason)
                .await;
            tracing::info!(
                count = outcome.count,
                limit = outcome.limit,
                limit_reached = outcome.limit_reached,
                "Warning recorded"
            );
        }
        ReplayEvent::ClearWarnings { chat_id, user_id } => {
            engine
                .clear_warnings(ScopeKey::new(chat_id, user_id))
                .await?;
        }
        ReplayEvent::Ban { chat_id, user_id } => {
            engine.ban_member(ScopeKey::new(chat_id, user_id)).await?;
        }
        ReplayEvent::Unban { chat_id, user_id } => {
            engine.unban_member(ScopeKey::new(chat_id, user_id)).await?;
        }
        ReplayEvent::AddWord { word } => {
            let outcome = engine.add_word(&word)?;
            tracing::info!(outcome = ?outcome, "Word list updated");
        }
        ReplayEvent::RemoveWord { word } => {
            let outcome = engine.remove_word(&word)?;
            tracing::info!(outcome = ?outcome, "Word list updated");
        }
        ReplayEvent::Stats { chat_id } => {
            let moderation = engine.moderation_stats(chat_id).await?;
            let verification = engine.verification_stats(chat_id).await?;
            println!(
                "{}",
                serde_json::json!({
                    "chat_id": chat_id,
                    "moderation": moderation,
                    "verification": verification,
                })
            );
        }
        ReplayEvent::Wait { millis } => {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // RUST_LOG controls verbosity, info by default
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Warden replay starting...");

    let config = WardenConfig::from_env()?;
    tracing::info!("Configuration loaded");

    let store = Arc::new(SqliteStore::new(&config.database_path).await?);
    tracing::info!(path = %config.database_path, "Database initialized");

    let word_store = Arc::new(FileWordStore::new(config.wordlist_path.clone()));
    let filter = ContentFilter::with_store(
        PatternCompiler::new(config.lookalike_classes()),
        word_store,
    )?;
    tracing::info!(words = filter.count(), "Content filter initialized");

    let bank = config.question_bank()?;
    tracing::info!(questions = bank.len(), "Question bank loaded");

    let admins = match std::env::var("WARDEN_ADMINS") {
        Ok(raw) => parse_admins(&raw)?,
        Err(_) => Vec::new(),
    };
    let platform = Arc::new(LoggingPlatform::with_admins(admins));

    let (engine, fired) =
        ModerationEngine::new(config.moderation.clone(), filter, bank, platform, store);
    let engine = Arc::new(engine);
    spawn_dispatch_task(engine.clone(), fired);
    spawn_maintenance_task(engine.clone(), config.moderation.spam.window);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| WardenError::Io(format!("Failed to read stdin: {}", e)))?
    {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let result = match serde_json::from_str::<ReplayEvent>(line) {
            Ok(event) => apply(&engine, event).await,
            Err(e) => Err(WardenError::from(e)),
        };
        if let Err(e) = result {
            e.log_with_context(&ErrorContext::new(format!("replay line {}", line_no)));
        }
    }

    tracing::info!(
        pending_tasks = engine.scheduler().pending_count(),
        "Replay finished"
    );
    Ok(())
}
