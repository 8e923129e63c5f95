//! Duplicate-message flood detection.
//!
//! Each scope key keeps a short history of what it posted. A message counts
//! as spam once the member has posted enough messages inside the window and
//! enough of the most recent ones repeat the same text.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::models::ScopeKey;

/// Spam detector configuration.
#[derive(Debug, Clone)]
pub struct SpamConfig {
    /// Trailing interval messages are remembered for (default: 60 seconds).
    pub window: Duration,
    /// Messages needed in the window before duplication is checked (default: 5).
    pub threshold: usize,
    /// Identical texts among the most recent `threshold` messages that mark spam (default: 3).
    pub duplicate_limit: usize,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            threshold: 5,
            duplicate_limit: 3,
        }
    }
}

/// Message fingerprint kept for the sliding window.
#[derive(Debug, Clone)]
struct MessageFingerprint {
    text: String,
    timestamp: DateTime<Utc>,
}

/// Per-member sliding window of recent messages.
pub struct RateWindow {
    config: SpamConfig,
    history: DashMap<ScopeKey, VecDeque<MessageFingerprint>>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self::with_config(SpamConfig::default())
    }

    pub fn with_config(config: SpamConfig) -> Self {
        Self {
            config,
            history: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SpamConfig {
        &self.config
    }

    /// Record a message and report whether it should be treated as spam.
    ///
    /// A positive result leaves the window intact, so every further
    /// identical message keeps registering as spam.
    pub fn observe(&self, scope: ScopeKey, text: &str, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.config.window).unwrap_or(chrono::Duration::MAX);

        let mut entries = self.history.entry(scope).or_default();
        while let Some(oldest) = entries.front() {
            if now.signed_duration_since(oldest.timestamp) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }

        entries.push_back(MessageFingerprint {
            text: text.to_string(),
            timestamp: now,
        });

        if entries.len() < self.config.threshold {
            return false;
        }

        let duplicates = entries
            .iter()
            .rev()
            .take(self.config.threshold)
            .filter(|entry| entry.text == text)
            .count();

        let is_spam = duplicates >= self.config.duplicate_limit;
        if is_spam {
            tracing::warn!(
                chat_id = scope.chat_id,
                user_id = scope.user_id,
                duplicates = duplicates,
                window_len = entries.len(),
                "Duplicate message flood detected"
            );
        }
        is_spam
    }

    /// Number of messages currently remembered for a scope key.
    pub fn len(&self, scope: ScopeKey) -> usize {
        self.history.get(&scope).map(|entries| entries.len()).unwrap_or(0)
    }

    /// Drop the history of a scope key.
    pub fn forget(&self, scope: ScopeKey) {
        self.history.remove(&scope);
    }

    /// Drop scope keys whose newest message has left the window.
    ///
    /// Returns how many keys were removed.
    pub fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let window = chrono::Duration::from_std(self.config.window).unwrap_or(chrono::Duration::MAX);
        let before = self.history.len();
        self.history.retain(|_, entries| {
            entries
                .back()
                .is_some_and(|newest| now.signed_duration_since(newest.timestamp) < window)
        });
        before.saturating_sub(self.history.len())
    }
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new()
    }
}
