//! Chat platform collaborator.
//!
//! The engine never talks to a chat network directly; it calls through the
//! [`Platform`] trait. Implementations map these calls onto a concrete API.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Send/modify permissions applied to a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPermissions {
    pub can_send_messages: bool,
    pub can_send_media_messages: bool,
    pub can_send_other_messages: bool,
    pub can_add_web_page_previews: bool,
    pub can_send_polls: bool,
    pub can_change_info: bool,
    pub can_invite_users: bool,
    pub can_pin_messages: bool,
}

impl ChatPermissions {
    /// Everything revoked.
    pub fn muted() -> Self {
        Self {
            can_send_messages: false,
            can_send_media_messages: false,
            can_send_other_messages: false,
            can_add_web_page_previews: false,
            can_send_polls: false,
            can_change_info: false,
            can_invite_users: false,
            can_pin_messages: false,
        }
    }

    /// What an ordinary member may do.
    pub fn member() -> Self {
        Self {
            can_send_messages: true,
            can_send_media_messages: true,
            can_send_other_messages: true,
            can_add_web_page_previews: true,
            can_send_polls: true,
            can_change_info: false,
            can_invite_users: true,
            can_pin_messages: false,
        }
    }

    pub fn can_post(&self) -> bool {
        self.can_send_messages
    }
}

/// Calls the engine makes into the chat platform.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn is_admin(&self, chat_id: i64, user_id: i64) -> Result<bool>;

    /// Apply `permissions` until `until`, or indefinitely.
    async fn restrict(
        &self,
        chat_id: i64,
        user_id: i64,
        permissions: ChatPermissions,
        until: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Restore ordinary member permissions.
    async fn unrestrict(&self, chat_id: i64, user_id: i64) -> Result<()>;

    async fn ban(&self, chat_id: i64, user_id: i64) -> Result<()>;

    async fn unban(&self, chat_id: i64, user_id: i64) -> Result<()>;

    /// Post a message and return its id.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()>;

    /// Remove a member while leaving them free to rejoin.
    async fn kick(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.ban(chat_id, user_id).await?;
        self.unban(chat_id, user_id).await
    }
}

/// Platform that performs no network calls and records each action in the log.
///
/// Used by the replay binary to dry-run an event stream.
pub struct LoggingPlatform {
    admins: HashSet<(i64, i64)>,
    next_message_id: AtomicI64,
}

impl LoggingPlatform {
    pub fn new() -> Self {
        Self::with_admins(std::iter::empty())
    }

    /// Treat the given (chat, user) pairs as administrators.
    pub fn with_admins(admins: impl IntoIterator<Item = (i64, i64)>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
            next_message_id: AtomicI64::new(1),
        }
    }
}

impl Default for LoggingPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for LoggingPlatform {
    async fn is_admin(&self, chat_id: i64, user_id: i64) -> Result<bool> {
        Ok(self.admins.contains(&(chat_id, user_id)))
    }

    async fn restrict(
        &self,
        chat_id: i64,
        user_id: i64,
        permissions: ChatPermissions,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        tracing::info!(
            chat_id = chat_id,
            user_id = user_id,
            can_post = permissions.can_post(),
            until = ?until,
            "Member restricted"
        );
        Ok(())
    }

    async fn unrestrict(&self, chat_id: i64, user_id: i64) -> Result<()> {
        tracing::info!(chat_id = chat_id, user_id = user_id, "Member restrictions lifted");
        Ok(())
    }

    async fn ban(&self, chat_id: i64, user_id: i64) -> Result<()> {
        tracing::info!(chat_id = chat_id, user_id = user_id, "Member banned");
        Ok(())
    }

    async fn unban(&self, chat_id: i64, user_id: i64) -> Result<()> {
        tracing::info!(chat_id = chat_id, user_id = user_id, "Member unbanned");
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(chat_id = chat_id, message_id = message_id, text = %text, "Message sent");
        Ok(message_id)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        tracing::info!(chat_id = chat_id, message_id = message_id, "Message deleted");
        Ok(())
    }
}
