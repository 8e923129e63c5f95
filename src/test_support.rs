//! Doubles shared by unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, WardenError};
use crate::models::{
    MemberProfile, ModerationStats, MuteRecord, ScopeKey, VerificationOutcome, VerificationStats,
    ViolationRecord,
};
use crate::platform::{ChatPermissions, Platform};
use crate::store::Store;
use crate::verification::{Challenge, ChallengeId};

/// One call made against [`RecordingPlatform`].
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformCall {
    Restrict {
        chat_id: i64,
        user_id: i64,
        until: Option<DateTime<Utc>>,
    },
    Unrestrict { chat_id: i64, user_id: i64 },
    Ban { chat_id: i64, user_id: i64 },
    Unban { chat_id: i64, user_id: i64 },
    SendMessage { chat_id: i64, text: String },
    DeleteMessage { chat_id: i64, message_id: i64 },
}

/// Platform that records calls and fails on demand.
#[derive(Default)]
pub struct RecordingPlatform {
    admins: Mutex<HashSet<(i64, i64)>>,
    calls: Mutex<Vec<PlatformCall>>,
    next_message_id: AtomicI64,
    fail_restrict: AtomicBool,
    fail_unrestrict: AtomicBool,
    fail_ban: AtomicBool,
    fail_send: AtomicBool,
    ban_attempts: AtomicUsize,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_admin(&self, chat_id: i64, user_id: i64) {
        self.admins.lock().unwrap().insert((chat_id, user_id));
    }

    pub fn fail_restrict(&self, fail: bool) {
        self.fail_restrict.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unrestrict(&self, fail: bool) {
        self.fail_unrestrict.store(fail, Ordering::SeqCst);
    }

    pub fn fail_ban(&self, fail: bool) {
        self.fail_ban.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&PlatformCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    /// Ban calls made, including rejected ones.
    pub fn ban_attempts(&self) -> usize {
        self.ban_attempts.load(Ordering::SeqCst)
    }

    /// Number of ban calls, i.e. expulsions.
    pub fn bans(&self) -> usize {
        self.count(|c| matches!(c, PlatformCall::Ban { .. }))
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                PlatformCall::SendMessage { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: PlatformCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(WardenError::PlatformUnavailable(format!("{} rejected", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl Platform for RecordingPlatform {
    async fn is_admin(&self, chat_id: i64, user_id: i64) -> Result<bool> {
        Ok(self.admins.lock().unwrap().contains(&(chat_id, user_id)))
    }

    async fn restrict(
        &self,
        chat_id: i64,
        user_id: i64,
        _permissions: ChatPermissions,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        Self::check(&self.fail_restrict, "restrict")?;
        self.record(PlatformCall::Restrict {
            chat_id,
            user_id,
            until,
        });
        Ok(())
    }

    async fn unrestrict(&self, chat_id: i64, user_id: i64) -> Result<()> {
        Self::check(&self.fail_unrestrict, "unrestrict")?;
        self.record(PlatformCall::Unrestrict { chat_id, user_id });
        Ok(())
    }

    async fn ban(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.ban_attempts.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_ban, "ban")?;
        self.record(PlatformCall::Ban { chat_id, user_id });
        Ok(())
    }

    async fn unban(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.record(PlatformCall::Unban { chat_id, user_id });
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64> {
        Self::check(&self.fail_send, "send_message")?;
        self.record(PlatformCall::SendMessage {
            chat_id,
            text: text.to_string(),
        });
        Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1000)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        self.record(PlatformCall::DeleteMessage {
            chat_id,
            message_id,
        });
        Ok(())
    }
}

/// Store whose every call fails.
pub struct FailingStore;

fn unavailable<T>() -> Result<T> {
    Err(WardenError::Persistence("store offline".to_string()))
}

#[async_trait]
impl Store for FailingStore {
    async fn save_user(&self, _scope: ScopeKey, _profile: &MemberProfile) -> Result<()> {
        unavailable()
    }

    async fn save_mute(
        &self,
        _record: &MuteRecord,
        _reason: &str,
        _applied: bool,
        _at: DateTime<Utc>,
    ) -> Result<()> {
        unavailable()
    }

    async fn remove_mute(&self, _scope: ScopeKey, _at: DateTime<Utc>) -> Result<()> {
        unavailable()
    }

    async fn save_warning(
        &self,
        _scope: ScopeKey,
        _reason: &str,
        _count: u32,
        _at: DateTime<Utc>,
    ) -> Result<()> {
        unavailable()
    }

    async fn clear_warnings(&self, _scope: ScopeKey) -> Result<()> {
        unavailable()
    }

    async fn log_violation(&self, _record: &ViolationRecord) -> Result<()> {
        unavailable()
    }

    async fn save_challenge(&self, _challenge: &Challenge) -> Result<()> {
        unavailable()
    }

    async fn complete_verification(
        &self,
        _challenge_id: ChallengeId,
        _scope: ScopeKey,
        _outcome: VerificationOutcome,
        _at: DateTime<Utc>,
    ) -> Result<()> {
        unavailable()
    }

    async fn log_message(&self, _scope: ScopeKey, _text: &str, _at: DateTime<Utc>) -> Result<()> {
        unavailable()
    }

    async fn is_user_verified(&self, _scope: ScopeKey) -> Result<bool> {
        unavailable()
    }

    async fn moderation_stats(&self, _chat_id: Option<i64>) -> Result<ModerationStats> {
        unavailable()
    }

    async fn verification_stats(&self, _chat_id: Option<i64>) -> Result<VerificationStats> {
        unavailable()
    }
}
