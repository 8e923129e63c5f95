//! Core data models for Warden.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::TaskId;

/// The (chat, user) pair that isolates all per-member moderation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub chat_id: i64,
    pub user_id: i64,
}

impl ScopeKey {
    pub fn new(chat_id: i64, user_id: i64) -> Self {
        Self { chat_id, user_id }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat_id, self.user_id)
    }
}

/// Identity of one installed mute, used to tell a mute apart from the one
/// that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MuteId(pub u64);

/// An active mute for a scope key.
#[derive(Debug, Clone, PartialEq)]
pub struct MuteRecord {
    pub id: MuteId,
    pub scope: ScopeKey,
    pub expires_at: DateTime<Utc>,
    pub duration: Duration,
    /// Reconciliation task scheduled at `expires_at`.
    pub expiry_task: Option<TaskId>,
}

impl MuteRecord {
    /// A mute is still in force at exactly `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Category of a logged violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    OffensiveWord,
    Spam,
    /// Raised by a moderator by hand, carrying their label.
    Manual(String),
}

impl ViolationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::OffensiveWord => "offensive_word",
            Self::Spam => "spam",
            Self::Manual(label) => label.as_str(),
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "offensive_word" => Self::OffensiveWord,
            "spam" => Self::Spam,
            other => Self::Manual(other.to_string()),
        }
    }
}

/// Append-only audit entry for a violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub scope: ScopeKey,
    pub kind: ViolationKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Terminal result of a verification challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationOutcome {
    Verified,
    /// Attempts exhausted.
    Failed,
    TimedOut,
}

impl VerificationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Display details of a member, stored when they join.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

/// Aggregate moderation counters, optionally scoped to one chat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationStats {
    pub mutes: u64,
    pub active_mutes: u64,
    pub warnings: u64,
    pub violations: u64,
    pub offensive_word_violations: u64,
    pub spam_violations: u64,
    pub messages: u64,
}

/// Aggregate verification counters, optionally scoped to one chat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub pending: u64,
}
