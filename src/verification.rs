//! Join-time verification challenges.
//!
//! A new member gets one question with a shuffled set of answers. A correct
//! answer verifies them; running out of attempts or time expels them. Open
//! challenges live in a map keyed by scope, and a challenge leaves the map
//! on the transition that resolves it, so only one path can ever expel.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::future::Cache;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorContext, Result, WardenError};
use crate::models::{ScopeKey, VerificationOutcome};
use crate::platform::Platform;
use crate::scheduler::{TaskId, TaskPayload, TimerScheduler};
use crate::store::Store;

/// Identity of one issued challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChallengeId(Uuid);

impl ChallengeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChallengeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChallengeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeState {
    Issued,
    Verified,
    Expelled,
}

/// A question put to a newly joined member.
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub id: ChallengeId,
    pub scope: ScopeKey,
    pub question: String,
    pub correct_answer: String,
    /// Correct answer and distractors in display order.
    pub options: Vec<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ChallengeState,
    pub timeout_task: Option<TaskId>,
    /// Chat message showing the question, removed once the challenge resolves.
    pub prompt_message_id: Option<i64>,
}

impl Challenge {
    fn is_correct(&self, given: &str) -> bool {
        given.trim() == self.correct_answer.trim()
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Result of answering a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Correct,
    IncorrectRetry { remaining: u32 },
    IncorrectExpelled,
    /// Nothing open for this member, e.g. the timeout already fired.
    NoActiveChallenge,
}

/// Result of a verification timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    Expelled,
    /// The challenge was answered, exhausted or replaced first.
    AlreadyResolved,
}

/// One question with its answer pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    pub correct: String,
    pub wrong: Vec<String>,
}

/// Questions to draw challenges from.
#[derive(Debug, Clone)]
pub struct QuestionBank {
    questions: Vec<Question>,
}

impl QuestionBank {
    /// Validate and build a bank. Every wrong-answer pool must hold at
    /// least `distractors` distinct answers other than the correct one.
    pub fn new(questions: Vec<Question>, distractors: usize) -> Result<Self> {
        if questions.is_empty() {
            return Err(WardenError::Config("question bank is empty".to_string()));
        }

        let mut cleaned = Vec::with_capacity(questions.len());
        for mut q in questions {
            q.question = q.question.trim().to_string();
            q.correct = q.correct.trim().to_string();
            if q.question.is_empty() || q.correct.is_empty() {
                return Err(WardenError::Config(
                    "question and correct answer must not be empty".to_string(),
                ));
            }
            q.wrong = dedup_answers(&q.correct, q.wrong);
            if q.wrong.len() < distractors {
                return Err(WardenError::Config(format!(
                    "question '{}' has {} wrong answers, {} required",
                    q.question,
                    q.wrong.len(),
                    distractors
                )));
            }
            cleaned.push(q);
        }

        Ok(Self { questions: cleaned })
    }

    /// Parse a JSON array of questions.
    pub fn from_json(json: &str, distractors: usize) -> Result<Self> {
        let questions: Vec<Question> = serde_json::from_str(json)?;
        Self::new(questions, distractors)
    }

    pub fn load(path: impl AsRef<Path>, distractors: usize) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            WardenError::Io(format!("Failed to read question bank {}: {}", path.display(), e))
        })?;
        Self::from_json(&json, distractors)
    }

    /// The bundled general-knowledge questions.
    pub fn builtin() -> Self {
        let question = |q: &str, correct: &str, wrong: &[&str]| Question {
            question: q.to_string(),
            correct: correct.to_string(),
            wrong: dedup_answers(correct, wrong.iter().map(|w| w.to_string()).collect()),
        };
        Self {
            questions: vec![
                question("كم عدد أيام الأسبوع؟", "7", &["5", "6", "8", "10"]),
                question("ما هو لون الشمس؟", "أصفر", &["أحمر", "أزرق", "أخضر", "أسود"]),
                question("كم عدد أصابع اليد الواحدة؟", "5", &["4", "6", "3", "7"]),
                question(
                    "ما هو الحيوان الذي يعطي الحليب؟",
                    "البقرة",
                    &["الحصان", "الكلب", "القط", "الطائر"],
                ),
                question(
                    "في أي فصل تتساقط الأوراق؟",
                    "الخريف",
                    &["الربيع", "الصيف", "الشتاء"],
                ),
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// Size of the smallest wrong-answer pool.
    pub fn min_pool(&self) -> usize {
        self.questions
            .iter()
            .map(|q| q.wrong.len())
            .min()
            .unwrap_or(0)
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }
}

impl Default for QuestionBank {
    fn default() -> Self {
        Self::builtin()
    }
}

fn dedup_answers(correct: &str, wrong: Vec<String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::with_capacity(wrong.len());
    for answer in wrong {
        let answer = answer.trim().to_string();
        if answer.is_empty() || answer == correct || seen.contains(&answer) {
            continue;
        }
        seen.push(answer);
    }
    seen
}

/// Verification engine configuration.
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Time allowed to answer (default: 5 minutes).
    pub timeout: Duration,
    /// Wrong answers allowed before expulsion (default: 3).
    pub max_attempts: u32,
    /// Wrong answers shown next to the correct one (default: 3).
    pub distractors: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_attempts: 3,
            distractors: 3,
        }
    }
}

enum Resolution {
    Verified(Challenge),
    Retry(u32),
    Expelled(Challenge),
}

/// Runs the challenge lifecycle for every scope key.
pub struct VerificationEngine {
    config: VerificationConfig,
    bank: QuestionBank,
    platform: Arc<dyn Platform>,
    store: Arc<dyn Store>,
    scheduler: Arc<TimerScheduler>,
    challenges: DashMap<ScopeKey, Challenge>,
    verified: Cache<ScopeKey, bool>,
}

impl VerificationEngine {
    pub fn new(
        config: VerificationConfig,
        bank: QuestionBank,
        platform: Arc<dyn Platform>,
        store: Arc<dyn Store>,
        scheduler: Arc<TimerScheduler>,
    ) -> Self {
        Self {
            config,
            bank,
            platform,
            store,
            scheduler,
            challenges: DashMap::new(),
            verified: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(600)) // 10 minutes
                .build(),
        }
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    fn build_challenge(&self, scope: ScopeKey, now: DateTime<Utc>) -> Challenge {
        let mut rng = rand::thread_rng();
        let (question, correct_answer, mut options) = match self.bank.questions.choose(&mut rng) {
            Some(q) => {
                let mut options: Vec<String> = q
                    .wrong
                    .choose_multiple(&mut rng, self.config.distractors)
                    .cloned()
                    .collect();
                options.push(q.correct.clone());
                (q.question.clone(), q.correct.clone(), options)
            }
            None => (String::new(), String::new(), Vec::new()),
        };
        options.shuffle(&mut rng);

        let timeout = chrono::Duration::from_std(self.config.timeout).unwrap_or(chrono::Duration::MAX);
        let expires_at = now
            .checked_add_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Challenge {
            id: ChallengeId::new(),
            scope,
            question,
            correct_answer,
            options,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            issued_at: now,
            expires_at,
            state: ChallengeState::Issued,
            timeout_task: None,
            prompt_message_id: None,
        }
    }

    /// Put a fresh challenge to a member, replacing any open one.
    ///
    /// The replaced challenge's timeout is cancelled and its prompt deleted.
    pub async fn issue(&self, scope: ScopeKey, now: DateTime<Utc>) -> Challenge {
        let mut challenge = self.build_challenge(scope, now);
        challenge.timeout_task = Some(self.scheduler.schedule(
            challenge.expires_at,
            TaskPayload::VerificationTimeout {
                scope,
                challenge_id: challenge.id,
            },
        ));

        let previous = self.challenges.insert(scope, challenge.clone());
        if let Some(previous) = &previous {
            if let Some(task) = previous.timeout_task {
                self.scheduler.cancel(task);
            }
            self.remove_prompt(previous).await;
        }
        self.verified.invalidate(&scope).await;

        tracing::info!(
            chat_id = scope.chat_id,
            user_id = scope.user_id,
            challenge_id = %challenge.id,
            replaced = previous.is_some(),
            "Verification challenge issued"
        );

        if let Err(e) = self.store.save_challenge(&challenge).await {
            e.log_with_context(&ErrorContext::new("save_challenge").with_scope(scope));
        }

        challenge
    }

    /// Remember which chat message shows the challenge.
    ///
    /// Returns false if that challenge is no longer open.
    pub fn attach_prompt(&self, scope: ScopeKey, challenge_id: ChallengeId, message_id: i64) -> bool {
        match self.challenges.get_mut(&scope) {
            Some(mut challenge) if challenge.id == challenge_id => {
                challenge.prompt_message_id = Some(message_id);
                true
            }
            _ => false,
        }
    }

    /// Check an answer from the member.
    pub async fn answer(&self, scope: ScopeKey, given: &str, now: DateTime<Utc>) -> AnswerOutcome {
        let resolution = match self.challenges.entry(scope) {
            Entry::Vacant(_) => return AnswerOutcome::NoActiveChallenge,
            Entry::Occupied(mut entry) => {
                if entry.get().is_correct(given) {
                    let mut challenge = entry.remove();
                    challenge.state = ChallengeState::Verified;
                    Resolution::Verified(challenge)
                } else {
                    let remaining = {
                        let challenge = entry.get_mut();
                        challenge.attempts = challenge.attempts.saturating_add(1);
                        challenge.remaining_attempts()
                    };
                    if remaining > 0 {
                        Resolution::Retry(remaining)
                    } else {
                        let mut challenge = entry.remove();
                        challenge.state = ChallengeState::Expelled;
                        Resolution::Expelled(challenge)
                    }
                }
            }
        };

        match resolution {
            Resolution::Retry(remaining) => {
                tracing::debug!(
                    chat_id = scope.chat_id,
                    user_id = scope.user_id,
                    remaining = remaining,
                    "Wrong verification answer"
                );
                AnswerOutcome::IncorrectRetry { remaining }
            }
            Resolution::Verified(challenge) => {
                if let Some(task) = challenge.timeout_task {
                    self.scheduler.cancel(task);
                }
                self.verified.insert(scope, true).await;
                tracing::info!(
                    chat_id = scope.chat_id,
                    user_id = scope.user_id,
                    challenge_id = %challenge.id,
                    "Member verified"
                );
                self.record_outcome(&challenge, VerificationOutcome::Verified, now)
                    .await;
                self.remove_prompt(&challenge).await;
                AnswerOutcome::Correct
            }
            Resolution::Expelled(challenge) => {
                if let Some(task) = challenge.timeout_task {
                    self.scheduler.cancel(task);
                }
                self.expel(&challenge, VerificationOutcome::Failed, now).await;
                AnswerOutcome::IncorrectExpelled
            }
        }
    }

    /// Expel the member if their current challenge is still open.
    pub async fn expire(&self, scope: ScopeKey, now: DateTime<Utc>) -> ExpireOutcome {
        self.expire_challenge(scope, None, now).await
    }

    /// Expel on timeout, acting only on `challenge_id` when given.
    ///
    /// A timeout that names a replaced challenge finds nothing to do.
    pub async fn expire_challenge(
        &self,
        scope: ScopeKey,
        challenge_id: Option<ChallengeId>,
        now: DateTime<Utc>,
    ) -> ExpireOutcome {
        let removed = self
            .challenges
            .remove_if(&scope, |_, challenge| {
                challenge_id.map_or(true, |id| challenge.id == id)
            });

        let Some((_, mut challenge)) = removed else {
            tracing::debug!(
                chat_id = scope.chat_id,
                user_id = scope.user_id,
                "Verification timeout found challenge already resolved"
            );
            return ExpireOutcome::AlreadyResolved;
        };

        challenge.state = ChallengeState::Expelled;
        if challenge_id.is_none() {
            if let Some(task) = challenge.timeout_task {
                self.scheduler.cancel(task);
            }
        }
        self.expel(&challenge, VerificationOutcome::TimedOut, now).await;
        ExpireOutcome::Expelled
    }

    async fn expel(&self, challenge: &Challenge, outcome: VerificationOutcome, now: DateTime<Utc>) {
        let scope = challenge.scope;
        self.verified.invalidate(&scope).await;
        tracing::info!(
            chat_id = scope.chat_id,
            user_id = scope.user_id,
            challenge_id = %challenge.id,
            outcome = %outcome.as_str(),
            "Member failed verification"
        );

        let (_, _, kicked) = futures::join!(
            self.record_outcome(challenge, outcome, now),
            self.remove_prompt(challenge),
            self.platform.kick(scope.chat_id, scope.user_id),
        );
        if let Err(e) = kicked {
            e.log_with_context(&ErrorContext::new("expel").with_scope(scope));
        }
    }

    async fn record_outcome(
        &self,
        challenge: &Challenge,
        outcome: VerificationOutcome,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = self
            .store
            .complete_verification(challenge.id, challenge.scope, outcome, now)
            .await
        {
            e.log_with_context(&ErrorContext::new("complete_verification").with_scope(challenge.scope));
        }
    }

    async fn remove_prompt(&self, challenge: &Challenge) {
        let Some(message_id) = challenge.prompt_message_id else {
            return;
        };
        if let Err(e) = self
            .platform
            .delete_message(challenge.scope.chat_id, message_id)
            .await
        {
            e.log_with_context(&ErrorContext::new("delete_prompt").with_scope(challenge.scope));
        }
    }

    /// Whether a member has passed verification, cached in front of the store.
    pub async fn is_verified(&self, scope: ScopeKey) -> Result<bool> {
        if let Some(verified) = self.verified.get(&scope).await {
            return Ok(verified);
        }
        let verified = self.store.is_user_verified(scope).await?;
        self.verified.insert(scope, verified).await;
        Ok(verified)
    }

    /// Snapshot of the open challenge for a member.
    pub fn active_challenge(&self, scope: ScopeKey) -> Option<Challenge> {
        self.challenges.get(&scope).map(|c| c.value().clone())
    }

    pub fn open_challenges(&self) -> usize {
        self.challenges.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use tokio::sync::mpsc;

    use crate::error::WardenError;
    use crate::models::ScopeKey;
    use crate::scheduler::{ScheduledTask, TaskPayload, TimerScheduler};
    use crate::store::{SqliteStore, Store};
    use crate::test_support::{FailingStore, PlatformCall, RecordingPlatform};
    use crate::verification::{
        AnswerOutcome, Challenge, ExpireOutcome, Question, QuestionBank, VerificationConfig,
        VerificationEngine,
    };

    struct Harness {
        engine: Arc<VerificationEngine>,
        platform: Arc<RecordingPlatform>,
        store: Arc<SqliteStore>,
        scheduler: Arc<TimerScheduler>,
        _fired: mpsc::UnboundedReceiver<ScheduledTask>,
    }

    async fn harness() -> Harness {
        let platform = Arc::new(RecordingPlatform::new());
        let store = Arc::new(SqliteStore::in_memory().await.expect("db"));
        let (scheduler, fired) = TimerScheduler::new();
        let scheduler = Arc::new(scheduler);
        let engine = Arc::new(VerificationEngine::new(
            VerificationConfig::default(),
            QuestionBank::builtin(),
            platform.clone(),
            store.clone(),
            scheduler.clone(),
        ));
        Harness {
            engine,
            platform,
            store,
            scheduler,
            _fired: fired,
        }
    }

    fn wrong_answer(challenge: &Challenge) -> String {
        challenge
            .options
            .iter()
            .find(|o| **o != challenge.correct_answer)
            .cloned()
            .unwrap_or_else(|| "definitely wrong".to_string())
    }

    #[test]
    fn builtin_bank_supports_three_distractors() {
        let bank = QuestionBank::builtin();
        assert_eq!(bank.len(), 5);
        assert!(bank.min_pool() >= 3);
        assert!(QuestionBank::new(bank.questions().to_vec(), 3).is_ok());
    }

    #[test]
    fn bank_rejects_small_pools() {
        let questions = vec![Question {
            question: "2 + 2?".to_string(),
            correct: "4".to_string(),
            wrong: vec!["3".to_string(), "3".to_string(), "4".to_string(), "5".to_string()],
        }];
        assert!(matches!(
            QuestionBank::new(questions.clone(), 3),
            Err(WardenError::Config(_))
        ));
        let bank = QuestionBank::new(questions, 2).expect("two distinct distractors");
        assert_eq!(bank.questions()[0].wrong, vec!["3", "5"]);
    }

    #[test]
    fn bank_from_json() {
        let json = r#"[{"question": "Capital of France?", "correct": "Paris", "wrong": ["Rome", "Berlin", "Madrid"]}]"#;
        let bank = QuestionBank::from_json(json, 3).expect("parse");
        assert_eq!(bank.len(), 1);
        assert!(matches!(
            QuestionBank::from_json("not json", 3),
            Err(WardenError::Json(_))
        ));
        assert!(matches!(
            QuestionBank::from_json("[]", 3),
            Err(WardenError::Config(_))
        ));
    }

    #[tokio::test]
    async fn issue_builds_shuffled_options_and_schedules_timeout() {
        let h = harness().await;
        let scope = ScopeKey::new(-1, 1);
        let now = Utc::now();

        let challenge = h.engine.issue(scope, now).await;
        assert_eq!(challenge.options.len(), 4);
        assert!(challenge.options.contains(&challenge.correct_answer));
        assert_eq!(challenge.attempts, 0);
        assert_eq!(challenge.max_attempts, 3);
        assert_eq!(challenge.expires_at, now + chrono::Duration::seconds(300));

        let task = h
            .scheduler
            .get(challenge.timeout_task.expect("timeout scheduled"))
            .expect("pending");
        assert_eq!(
            task.payload,
            TaskPayload::VerificationTimeout {
                scope,
                challenge_id: challenge.id
            }
        );

        let stats = h.store.verification_stats(Some(-1)).await.unwrap();
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn three_wrong_answers_expel_once() {
        let h = harness().await;
        let scope = ScopeKey::new(-1, 1);
        let now = Utc::now();

        let challenge = h.engine.issue(scope, now).await;
        let wrong = wrong_answer(&challenge);

        assert_eq!(
            h.engine.answer(scope, &wrong, now).await,
            AnswerOutcome::IncorrectRetry { remaining: 2 }
        );
        assert_eq!(
            h.engine.answer(scope, &wrong, now).await,
            AnswerOutcome::IncorrectRetry { remaining: 1 }
        );
        assert_eq!(
            h.engine.answer(scope, &wrong, now).await,
            AnswerOutcome::IncorrectExpelled
        );
        assert_eq!(
            h.engine.answer(scope, &challenge.correct_answer, now).await,
            AnswerOutcome::NoActiveChallenge
        );

        assert_eq!(h.platform.bans(), 1);
        assert!(h
            .platform
            .calls()
            .contains(&PlatformCall::Unban { chat_id: -1, user_id: 1 }));
        assert!(!h.scheduler.is_pending(challenge.timeout_task.unwrap()));
        assert_eq!(h.engine.expire(scope, now).await, ExpireOutcome::AlreadyResolved);
        assert_eq!(h.platform.bans(), 1);

        let stats = h.store.verification_stats(None).await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn correct_answer_verifies_and_expire_is_noop() {
        let h = harness().await;
        let scope = ScopeKey::new(-1, 1);
        let now = Utc::now();

        let challenge = h.engine.issue(scope, now).await;
        assert_eq!(
            h.engine
                .answer(scope, &format!("  {} ", challenge.correct_answer), now)
                .await,
            AnswerOutcome::Correct
        );
        assert!(!h.scheduler.is_pending(challenge.timeout_task.unwrap()));

        assert_eq!(h.engine.expire(scope, now).await, ExpireOutcome::AlreadyResolved);
        assert_eq!(h.platform.bans(), 0);
        assert!(h.engine.is_verified(scope).await.unwrap());
        assert!(h.store.is_user_verified(scope).await.unwrap());
    }

    #[tokio::test]
    async fn timeout_expels_open_challenge() {
        let h = harness().await;
        let scope = ScopeKey::new(-1, 1);
        let now = Utc::now();

        let challenge = h.engine.issue(scope, now).await;
        assert!(h.engine.attach_prompt(scope, challenge.id, 77));

        assert_eq!(
            h.engine
                .expire_challenge(scope, Some(challenge.id), now)
                .await,
            ExpireOutcome::Expelled
        );
        assert_eq!(h.platform.bans(), 1);
        assert!(h.platform.calls().contains(&PlatformCall::DeleteMessage {
            chat_id: -1,
            message_id: 77
        }));
        assert_eq!(
            h.engine.answer(scope, &challenge.correct_answer, now).await,
            AnswerOutcome::NoActiveChallenge
        );
        assert!(!h.engine.is_verified(scope).await.unwrap());

        let stats = h.store.verification_stats(Some(-1)).await.unwrap();
        assert_eq!(stats.timed_out, 1);
    }

    #[tokio::test]
    async fn reissue_replaces_and_stale_timeout_is_ignored() {
        let h = harness().await;
        let scope = ScopeKey::new(-1, 1);
        let now = Utc::now();

        let first = h.engine.issue(scope, now).await;
        let second = h.engine.issue(scope, now).await;
        assert_ne!(first.id, second.id);
        assert!(!h.scheduler.is_pending(first.timeout_task.unwrap()));
        assert!(!h.engine.attach_prompt(scope, first.id, 5));

        assert_eq!(
            h.engine.expire_challenge(scope, Some(first.id), now).await,
            ExpireOutcome::AlreadyResolved
        );
        assert_eq!(h.platform.bans(), 0);
        assert_eq!(
            h.engine.active_challenge(scope).map(|c| c.id),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn fresh_challenge_resets_attempts() {
        let h = harness().await;
        let scope = ScopeKey::new(-1, 1);
        let now = Utc::now();

        let first = h.engine.issue(scope, now).await;
        h.engine.answer(scope, &wrong_answer(&first), now).await;
        h.engine.answer(scope, &wrong_answer(&first), now).await;

        let second = h.engine.issue(scope, now).await;
        assert_eq!(
            h.engine.answer(scope, &wrong_answer(&second), now).await,
            AnswerOutcome::IncorrectRetry { remaining: 2 }
        );
    }

    #[tokio::test]
    async fn reissue_deletes_stale_prompt() {
        let h = harness().await;
        let scope = ScopeKey::new(-1, 1);
        let now = Utc::now();

        let first = h.engine.issue(scope, now).await;
        assert!(h.engine.attach_prompt(scope, first.id, 41));
        h.engine.issue(scope, now).await;

        assert_eq!(
            h.platform.calls(),
            vec![PlatformCall::DeleteMessage {
                chat_id: -1,
                message_id: 41
            }]
        );
    }

    #[tokio::test]
    async fn failed_kick_still_resolves_challenge() {
        let h = harness().await;
        let scope = ScopeKey::new(-1, 1);
        let now = Utc::now();
        h.platform.fail_ban(true);

        let challenge = h.engine.issue(scope, now).await;
        let wrong = wrong_answer(&challenge);
        h.engine.answer(scope, &wrong, now).await;
        h.engine.answer(scope, &wrong, now).await;
        assert_eq!(
            h.engine.answer(scope, &wrong, now).await,
            AnswerOutcome::IncorrectExpelled
        );
        assert!(h.engine.active_challenge(scope).is_none());

        h.platform.fail_ban(false);
        assert_eq!(
            h.engine
                .expire_challenge(scope, Some(challenge.id), now)
                .await,
            ExpireOutcome::AlreadyResolved
        );
        assert_eq!(h.platform.ban_attempts(), 1);
        assert_eq!(h.platform.bans(), 0);

        let stats = h.store.verification_stats(Some(-1)).await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn outcomes_stand_when_storage_is_offline() {
        let platform = Arc::new(RecordingPlatform::new());
        let (scheduler, _fired) = TimerScheduler::new();
        let scheduler = Arc::new(scheduler);
        let engine = VerificationEngine::new(
            VerificationConfig::default(),
            QuestionBank::builtin(),
            platform.clone(),
            Arc::new(FailingStore),
            scheduler.clone(),
        );
        let now = Utc::now();
        let passing = ScopeKey::new(-1, 1);
        let failing = ScopeKey::new(-1, 2);

        let challenge = engine.issue(passing, now).await;
        assert_eq!(
            engine.answer(passing, &challenge.correct_answer, now).await,
            AnswerOutcome::Correct
        );
        assert!(!scheduler.is_pending(challenge.timeout_task.unwrap()));
        assert!(engine.is_verified(passing).await.unwrap());

        let challenge = engine.issue(failing, now).await;
        let wrong = wrong_answer(&challenge);
        for _ in 0..2 {
            engine.answer(failing, &wrong, now).await;
        }
        assert_eq!(
            engine.answer(failing, &wrong, now).await,
            AnswerOutcome::IncorrectExpelled
        );
        assert_eq!(engine.expire(failing, now).await, ExpireOutcome::AlreadyResolved);
        assert_eq!(platform.bans(), 1);
        assert_eq!(engine.open_challenges(), 0);
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let h = harness().await;
        let a = ScopeKey::new(-1, 1);
        let b = ScopeKey::new(-2, 1);
        let now = Utc::now();

        let challenge_a = h.engine.issue(a, now).await;
        h.engine.issue(b, now).await;

        assert_eq!(
            h.engine.answer(a, &challenge_a.correct_answer, now).await,
            AnswerOutcome::Correct
        );
        assert!(h.engine.active_challenge(b).is_some());
        assert_eq!(h.engine.open_challenges(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_exhaustion_and_timeout_expel_exactly_once() {
        for _ in 0..20 {
            let h = harness().await;
            let scope = ScopeKey::new(-1, 1);
            let now = Utc::now();

            let challenge = h.engine.issue(scope, now).await;
            let wrong = wrong_answer(&challenge);
            h.engine.answer(scope, &wrong, now).await;
            h.engine.answer(scope, &wrong, now).await;

            let engine = h.engine.clone();
            let answer = tokio::spawn(async move { engine.answer(scope, &wrong, now).await });
            let engine = h.engine.clone();
            let timeout = tokio::spawn(async move {
                engine
                    .expire_challenge(scope, Some(challenge.id), now)
                    .await
            });

            let answered = answer.await.expect("answer task");
            let expired = timeout.await.expect("timeout task");
            let expelled_by_answer = answered == AnswerOutcome::IncorrectExpelled;
            let expelled_by_timeout = expired == ExpireOutcome::Expelled;

            assert!(expelled_by_answer ^ expelled_by_timeout);
            assert_eq!(h.platform.bans(), 1);
        }
    }
}
