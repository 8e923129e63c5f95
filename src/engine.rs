//! Moderation engine orchestration.
//!
//! Routes chat events through the filter, spam window, sanction ledger and
//! verification engine, and executes scheduled tasks as they fire.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ModerationConfig;
use crate::duration::parse_duration;
use crate::error::{ErrorContext, Result, WardenError};
use crate::filter::{AddOutcome, ContentFilter, RemoveOutcome};
use crate::models::{
    MemberProfile, ModerationStats, MuteRecord, ScopeKey, VerificationStats, ViolationKind,
    ViolationRecord,
};
use crate::platform::Platform;
use crate::sanctions::SanctionLedger;
use crate::scheduler::{ScheduledTask, TaskPayload, TimerScheduler};
use crate::spam::RateWindow;
use crate::store::Store;
use crate::verification::{
    AnswerOutcome, Challenge, ExpireOutcome, QuestionBank, VerificationEngine,
};

/// A message posted in a chat. Media messages carry no text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub chat_id: i64,
    pub user_id: i64,
    pub message_id: i64,
    #[serde(default)]
    pub text: Option<String>,
}

/// A member joined a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinEvent {
    pub chat_id: i64,
    pub user_id: i64,
    #[serde(flatten)]
    pub profile: MemberProfile,
}

/// A member answered their verification question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerEvent {
    pub chat_id: i64,
    pub user_id: i64,
    pub answer: String,
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageVerdict {
    Allowed,
    /// Sent by an administrator, not inspected.
    Exempt,
    /// Sent while the author is muted; deleted.
    MutedSender,
    /// Deleted for containing `word`. `muted` tells whether the mute applied.
    OffensiveWord { word: String, muted: bool },
    /// Deleted as a duplicate flood.
    Spam { muted: bool },
}

/// What happened to a join.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Challenged(Challenge),
    IgnoredBot,
    VerificationDisabled,
}

/// Result of warning a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarnOutcome {
    pub count: u32,
    pub limit: u32,
    /// The count reached the configured limit; escalation is up to the caller.
    pub limit_reached: bool,
}

/// The moderation engine.
pub struct ModerationEngine {
    config: ModerationConfig,
    platform: Arc<dyn Platform>,
    store: Arc<dyn Store>,
    scheduler: Arc<TimerScheduler>,
    filter: Arc<ContentFilter>,
    spam: RateWindow,
    sanctions: SanctionLedger,
    verification: VerificationEngine,
}

impl ModerationEngine {
    /// Build an engine and the receiver its scheduled tasks fire on.
    ///
    /// Pass the receiver to [`spawn_dispatch_task`] so timers take effect.
    pub fn new(
        config: ModerationConfig,
        filter: ContentFilter,
        bank: QuestionBank,
        platform: Arc<dyn Platform>,
        store: Arc<dyn Store>,
    ) -> (Self, mpsc::UnboundedReceiver<ScheduledTask>) {
        let (scheduler, fired) = TimerScheduler::new();
        let scheduler = Arc::new(scheduler);

        let engine = Self {
            spam: RateWindow::with_config(config.spam.clone()),
            sanctions: SanctionLedger::new(platform.clone(), store.clone(), scheduler.clone()),
            verification: VerificationEngine::new(
                config.verification.clone(),
                bank,
                platform.clone(),
                store.clone(),
                scheduler.clone(),
            ),
            filter: Arc::new(filter),
            config,
            platform,
            store,
            scheduler,
        };
        (engine, fired)
    }

    pub fn config(&self) -> &ModerationConfig {
        &self.config
    }

    pub fn filter(&self) -> &Arc<ContentFilter> {
        &self.filter
    }

    pub fn spam(&self) -> &RateWindow {
        &self.spam
    }

    pub fn sanctions(&self) -> &SanctionLedger {
        &self.sanctions
    }

    pub fn verification(&self) -> &VerificationEngine {
        &self.verification
    }

    pub fn scheduler(&self) -> &Arc<TimerScheduler> {
        &self.scheduler
    }

    /// Process an inbound message.
    ///
    /// Admins are exempt. Otherwise the offensive-word check runs before the
    /// spam check, and the first hit decides the verdict.
    pub async fn handle_message(&self, event: &MessageEvent, now: DateTime<Utc>) -> MessageVerdict {
        let scope = ScopeKey::new(event.chat_id, event.user_id);

        if self.is_admin(scope).await {
            return MessageVerdict::Exempt;
        }

        if self.sanctions.is_muted(scope, now) {
            self.delete_message(event.chat_id, event.message_id).await;
            tracing::debug!(
                chat_id = scope.chat_id,
                user_id = scope.user_id,
                "Removed message from muted member"
            );
            return MessageVerdict::MutedSender;
        }

        let Some(text) = event.text.as_deref() else {
            return MessageVerdict::Allowed;
        };

        if self.config.enable_badwords_filter {
            if let Some(word) = self.filter.first_match(text) {
                let muted = self
                    .punish(scope, event.message_id, ViolationKind::OffensiveWord, text, now)
                    .await;
                return MessageVerdict::OffensiveWord { word, muted };
            }
        }

        if self.config.enable_spam_detection && self.spam.observe(scope, text, now) {
            let muted = self
                .punish(scope, event.message_id, ViolationKind::Spam, text, now)
                .await;
            return MessageVerdict::Spam { muted };
        }

        if let Err(e) = self.store.log_message(scope, text, now).await {
            e.log_with_context(&ErrorContext::new("log_message").with_scope(scope));
        }
        MessageVerdict::Allowed
    }

    async fn is_admin(&self, scope: ScopeKey) -> bool {
        match self.platform.is_admin(scope.chat_id, scope.user_id).await {
            Ok(is_admin) => is_admin,
            Err(e) => {
                e.log_with_context(&ErrorContext::new("is_admin").with_scope(scope));
                false
            }
        }
    }

    /// Delete, mute, notify, and record. Returns whether the mute applied.
    async fn punish(
        &self,
        scope: ScopeKey,
        message_id: i64,
        kind: ViolationKind,
        text: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.delete_message(scope.chat_id, message_id).await;

        // a lost log entry still leaves the mute in force
        let muted = matches!(
            self.sanctions
                .mute_with_reason(scope, self.config.mute_duration, kind.as_str(), now)
                .await,
            Ok(_) | Err(WardenError::Persistence(_))
        );

        let notice = match (&kind, muted) {
            (ViolationKind::Spam, true) => format!(
                "🚨 [{}] تم اكتشاف سبام! تم كتمك لمدة {} دقائق.",
                scope.user_id,
                minutes(self.config.mute_duration)
            ),
            (ViolationKind::Spam, false) => {
                format!("🚨 [{}] تم اكتشاف سبام! تم حذف الرسائل.", scope.user_id)
            }
            (_, true) => format!(
                "🚫 [{}] تم حذف رسالتك لاحتوائها على كلمات مسيئة وتم كتمك لمدة {} دقائق.",
                scope.user_id,
                minutes(self.config.mute_duration)
            ),
            (_, false) => format!(
                "🚫 [{}] تم حذف رسالتك لاحتوائها على كلمات مسيئة.",
                scope.user_id
            ),
        };
        self.send_notice(scope.chat_id, &notice).await;

        self.sanctions
            .log_violation(&ViolationRecord {
                scope,
                kind,
                content: text.to_string(),
                timestamp: now,
            })
            .await;

        muted
    }

    /// Challenge a newly joined member.
    pub async fn handle_join(&self, event: &JoinEvent, now: DateTime<Utc>) -> JoinOutcome {
        let scope = ScopeKey::new(event.chat_id, event.user_id);

        if !self.config.enable_verification {
            return JoinOutcome::VerificationDisabled;
        }
        if event.profile.is_bot {
            tracing::debug!(chat_id = scope.chat_id, user_id = scope.user_id, "Ignoring bot join");
            return JoinOutcome::IgnoredBot;
        }

        if let Err(e) = self.store.save_user(scope, &event.profile).await {
            e.log_with_context(&ErrorContext::new("save_user").with_scope(scope));
        }

        let challenge = self.verification.issue(scope, now).await;

        let options = challenge
            .options
            .iter()
            .enumerate()
            .map(|(i, option)| format!("{}. {}", i + 1, option))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "🎉 مرحباً [{}]!\nللتحقق من هويتك، يرجى حل هذا السؤال:\n❓ {}\n\n{}\n\n⏰ لديك {} دقائق للإجابة",
            scope.user_id,
            challenge.question,
            options,
            minutes(self.config.verification.timeout)
        );

        match self.platform.send_message(scope.chat_id, &prompt).await {
            Ok(message_id) => {
                self.verification
                    .attach_prompt(scope, challenge.id, message_id);
            }
            Err(e) => e.log_with_context(&ErrorContext::new("send_prompt").with_scope(scope)),
        }

        JoinOutcome::Challenged(challenge)
    }

    /// Apply a member's answer to their challenge.
    pub async fn handle_answer(&self, event: &AnswerEvent, now: DateTime<Utc>) -> AnswerOutcome {
        let scope = ScopeKey::new(event.chat_id, event.user_id);
        let outcome = self.verification.answer(scope, &event.answer, now).await;

        let notice = match outcome {
            AnswerOutcome::Correct => Some(format!(
                "✅ تم التحقق بنجاح! مرحباً بك [{}] في المجموعة!",
                scope.user_id
            )),
            AnswerOutcome::IncorrectRetry { remaining } => Some(format!(
                "❌ إجابة خاطئة! حاول مرة أخرى. المحاولات المتبقية: {}",
                remaining
            )),
            AnswerOutcome::IncorrectExpelled => {
                Some("❌ فشل في التحقق. تم طردك من المجموعة.".to_string())
            }
            AnswerOutcome::NoActiveChallenge => None,
        };
        if let Some(notice) = notice {
            self.send_notice(scope.chat_id, &notice).await;
        }
        outcome
    }

    /// Execute a task the scheduler fired.
    pub async fn dispatch(&self, task: ScheduledTask) {
        let now = Utc::now();
        match task.payload {
            TaskPayload::VerificationTimeout {
                scope,
                challenge_id,
            } => {
                let outcome = self
                    .verification
                    .expire_challenge(scope, Some(challenge_id), now)
                    .await;
                if outcome == ExpireOutcome::Expelled {
                    let notice = format!(
                        "⏰ انتهت مهلة التحقق للعضو {}. تم طرده من المجموعة.",
                        scope.user_id
                    );
                    self.send_notice(scope.chat_id, &notice).await;
                }
            }
            TaskPayload::MuteExpiry { scope, mute_id } => {
                self.sanctions
                    .reconcile_expiry(scope, mute_id, now.max(task.fire_at));
            }
            TaskPayload::DeleteMessage {
                chat_id,
                message_id,
            } => {
                self.delete_message(chat_id, message_id).await;
            }
        }
    }

    /// Post a notice and schedule its removal.
    async fn send_notice(&self, chat_id: i64, text: &str) {
        match self.platform.send_message(chat_id, text).await {
            Ok(message_id) => {
                self.scheduler.schedule_after(
                    self.config.notice_ttl,
                    TaskPayload::DeleteMessage {
                        chat_id,
                        message_id,
                    },
                );
            }
            Err(e) => e.log_with_context(&ErrorContext::new("send_notice").with_chat_id(chat_id)),
        }
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) {
        if let Err(e) = self.platform.delete_message(chat_id, message_id).await {
            e.log_with_context(&ErrorContext::new("delete_message").with_chat_id(chat_id));
        }
    }

    /// Mute on a moderator's behalf. `duration` is human input such as
    /// "10m"; without it the admin default applies.
    pub async fn mute_member(
        &self,
        scope: ScopeKey,
        duration: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MuteRecord> {
        let duration = match duration {
            Some(raw) => parse_duration(raw)?,
            None => self.config.admin_mute_duration,
        };
        self.sanctions
            .mute_with_reason(scope, duration, "admin", now)
            .await
    }

    pub async fn unmute_member(&self, scope: ScopeKey, now: DateTime<Utc>) -> Result<()> {
        self.sanctions.unmute(scope, now).await
    }

    /// Ban a member on a moderator's behalf.
    pub async fn ban_member(&self, scope: ScopeKey) -> Result<()> {
        self.platform
            .ban(scope.chat_id, scope.user_id)
            .await
            .inspect_err(|e| {
                e.log_with_context(&ErrorContext::new("ban").with_scope(scope));
            })?;
        tracing::info!(chat_id = scope.chat_id, user_id = scope.user_id, "Member banned");
        Ok(())
    }

    /// Lift a ban so the member can rejoin.
    pub async fn unban_member(&self, scope: ScopeKey) -> Result<()> {
        self.platform
            .unban(scope.chat_id, scope.user_id)
            .await
            .inspect_err(|e| {
                e.log_with_context(&ErrorContext::new("unban").with_scope(scope));
            })?;
        tracing::info!(chat_id = scope.chat_id, user_id = scope.user_id, "Member unbanned");
        Ok(())
    }

    /// Warn a member and report whether the warning limit is reached.
    pub async fn warn_member(&self, scope: ScopeKey, reason: &str) -> WarnOutcome {
        let count = self.sanctions.warn(scope, reason).await;
        WarnOutcome {
            count,
            limit: self.config.warn_limit,
            limit_reached: count >= self.config.warn_limit,
        }
    }

    pub async fn clear_warnings(&self, scope: ScopeKey) -> Result<()> {
        self.sanctions.clear_warnings(scope).await
    }

    pub fn add_word(&self, word: &str) -> Result<AddOutcome> {
        self.filter.add(word)
    }

    pub fn remove_word(&self, word: &str) -> Result<RemoveOutcome> {
        self.filter.remove(word)
    }

    pub async fn moderation_stats(&self, chat_id: Option<i64>) -> Result<ModerationStats> {
        self.store.moderation_stats(chat_id).await
    }

    pub async fn verification_stats(&self, chat_id: Option<i64>) -> Result<VerificationStats> {
        self.store.verification_stats(chat_id).await
    }
}

fn minutes(duration: Duration) -> u64 {
    duration.as_secs().div_ceil(60)
}

/// Drive fired tasks into the engine, one spawned task per firing.
pub fn spawn_dispatch_task(
    engine: Arc<ModerationEngine>,
    mut fired: mpsc::UnboundedReceiver<ScheduledTask>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(task) = fired.recv().await {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.dispatch(task).await;
            });
        }
        tracing::debug!("Dispatch loop stopped");
    })
}

/// Periodically forget members who have gone quiet.
pub fn spawn_maintenance_task(engine: Arc<ModerationEngine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let pruned = engine.spam.prune_idle(Utc::now());
            if pruned > 0 {
                tracing::debug!(pruned = pruned, "Pruned idle spam windows");
            }
        }
    })
}
