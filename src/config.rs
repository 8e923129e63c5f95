//! Configuration loading from environment.
//!
//! Every tunable has a default; a variable that is set but does not parse
//! is a configuration error rather than a silent fallback.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, WardenError};
use crate::pattern::{LookalikeClasses, DEFAULT_LOOKALIKE_CLASSES};
use crate::spam::SpamConfig;
use crate::verification::{QuestionBank, VerificationConfig};

pub const DEFAULT_DATABASE_PATH: &str = "warden.db";
pub const DEFAULT_WORDLIST_PATH: &str = "data/badwords.txt";

/// Main configuration for Warden.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    /// SQLite database file.
    pub database_path: String,
    /// Offensive word list file.
    pub wordlist_path: PathBuf,
    /// Optional JSON question bank; the built-in bank is used when unset.
    pub questions_path: Option<PathBuf>,
    /// Look-alike character families.
    pub lookalikes: Vec<String>,
    pub moderation: ModerationConfig,
}

/// Runtime-tunable moderation policy.
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    pub spam: SpamConfig,
    pub verification: VerificationConfig,
    /// Mute applied automatically on an offensive word or spam.
    pub mute_duration: Duration,
    /// Mute applied by a moderator who gives no duration.
    pub admin_mute_duration: Duration,
    /// Warning count at which callers escalate.
    pub warn_limit: u32,
    /// How long bot notices stay in the chat.
    pub notice_ttl: Duration,
    pub enable_badwords_filter: bool,
    pub enable_spam_detection: bool,
    pub enable_verification: bool,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            spam: SpamConfig::default(),
            verification: VerificationConfig::default(),
            mute_duration: Duration::from_secs(300),
            admin_mute_duration: Duration::from_secs(3600),
            warn_limit: 3,
            notice_ttl: Duration::from_secs(15),
            enable_badwords_filter: true,
            enable_spam_detection: true,
            enable_verification: true,
        }
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            wordlist_path: PathBuf::from(DEFAULT_WORDLIST_PATH),
            questions_path: None,
            lookalikes: DEFAULT_LOOKALIKE_CLASSES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            moderation: ModerationConfig::default(),
        }
    }
}

impl WardenConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional environment variables:
    /// - `WARDEN_DATABASE_PATH`: SQLite file (default: warden.db)
    /// - `WARDEN_WORDLIST_PATH`: word list file (default: data/badwords.txt)
    /// - `WARDEN_QUESTIONS_PATH`: JSON question bank
    /// - `WARDEN_LOOKALIKES`: `|`-separated look-alike families
    /// - `SPAM_THRESHOLD` (5), `SPAM_DUPLICATE_LIMIT` (3), `SPAM_WINDOW_SECS` (60)
    /// - `MUTE_DURATION_SECS` (300), `ADMIN_MUTE_DURATION_SECS` (3600), `WARN_LIMIT` (3)
    /// - `VERIFICATION_TIMEOUT_SECS` (300), `VERIFICATION_ATTEMPTS` (3),
    ///   `VERIFICATION_DISTRACTORS` (3), `NOTICE_TTL_SECS` (15)
    /// - `ENABLE_BADWORDS_FILTER`, `ENABLE_SPAM_DETECTION`, `ENABLE_VERIFICATION` (true)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ModerationConfig::default();

        let spam = SpamConfig {
            window: secs(&lookup, "SPAM_WINDOW_SECS", defaults.spam.window)?,
            threshold: parse_or(&lookup, "SPAM_THRESHOLD", defaults.spam.threshold)?,
            duplicate_limit: parse_or(
                &lookup,
                "SPAM_DUPLICATE_LIMIT",
                defaults.spam.duplicate_limit,
            )?,
        };

        let verification = VerificationConfig {
            timeout: secs(
                &lookup,
                "VERIFICATION_TIMEOUT_SECS",
                defaults.verification.timeout,
            )?,
            max_attempts: parse_or(
                &lookup,
                "VERIFICATION_ATTEMPTS",
                defaults.verification.max_attempts,
            )?,
            distractors: parse_or(
                &lookup,
                "VERIFICATION_DISTRACTORS",
                defaults.verification.distractors,
            )?,
        };

        let moderation = ModerationConfig {
            spam,
            verification,
            mute_duration: secs(&lookup, "MUTE_DURATION_SECS", defaults.mute_duration)?,
            admin_mute_duration: secs(
                &lookup,
                "ADMIN_MUTE_DURATION_SECS",
                defaults.admin_mute_duration,
            )?,
            warn_limit: parse_or(&lookup, "WARN_LIMIT", defaults.warn_limit)?,
            notice_ttl: secs(&lookup, "NOTICE_TTL_SECS", defaults.notice_ttl)?,
            enable_badwords_filter: flag(
                &lookup,
                "ENABLE_BADWORDS_FILTER",
                defaults.enable_badwords_filter,
            )?,
            enable_spam_detection: flag(
                &lookup,
                "ENABLE_SPAM_DETECTION",
                defaults.enable_spam_detection,
            )?,
            enable_verification: flag(
                &lookup,
                "ENABLE_VERIFICATION",
                defaults.enable_verification,
            )?,
        };

        let lookalikes = match lookup("WARDEN_LOOKALIKES") {
            Some(raw) => raw
                .split('|')
                .map(|class| class.trim().to_string())
                .filter(|class| !class.is_empty())
                .collect(),
            None => WardenConfig::default().lookalikes,
        };

        let config = Self {
            database_path: lookup("WARDEN_DATABASE_PATH")
                .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
            wordlist_path: lookup("WARDEN_WORDLIST_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORDLIST_PATH)),
            questions_path: lookup("WARDEN_QUESTIONS_PATH").map(PathBuf::from),
            lookalikes,
            moderation,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations under which moderation cannot work.
    pub fn validate(&self) -> Result<()> {
        let m = &self.moderation;
        if m.spam.threshold == 0 {
            return Err(WardenError::Config("SPAM_THRESHOLD must be at least 1".to_string()));
        }
        if m.spam.duplicate_limit == 0 || m.spam.duplicate_limit > m.spam.threshold {
            return Err(WardenError::Config(format!(
                "SPAM_DUPLICATE_LIMIT must be between 1 and SPAM_THRESHOLD ({})",
                m.spam.threshold
            )));
        }
        if m.spam.window.is_zero() {
            return Err(WardenError::Config("SPAM_WINDOW_SECS must be positive".to_string()));
        }
        if m.verification.max_attempts == 0 {
            return Err(WardenError::Config(
                "VERIFICATION_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if m.warn_limit == 0 {
            return Err(WardenError::Config("WARN_LIMIT must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn lookalike_classes(&self) -> LookalikeClasses {
        LookalikeClasses::new(self.lookalikes.iter())
    }

    /// The configured question bank, or the built-in one.
    pub fn question_bank(&self) -> Result<QuestionBank> {
        let distractors = self.moderation.verification.distractors;
        match &self.questions_path {
            Some(path) => QuestionBank::load(path, distractors),
            None => {
                let bank = QuestionBank::builtin();
                if bank.min_pool() < distractors {
                    return Err(WardenError::Config(format!(
                        "built-in questions offer {} wrong answers, VERIFICATION_DISTRACTORS is {}",
                        bank.min_pool(),
                        distractors
                    )));
                }
                Ok(bank)
            }
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| WardenError::Config(format!("{} is not a valid number: {:?}", name, raw))),
        None => Ok(default),
    }
}

fn secs<F>(lookup: &F, name: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, name, default.as_secs()).map(Duration::from_secs)
}

fn flag<F>(lookup: &F, name: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(WardenError::Config(format!(
                "{} must be true or false: {:?}",
                name, raw
            ))),
        },
        None => Ok(default),
    }
}


#[cfg(test)]
mod property_tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use crate::config::WardenConfig;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any numeric value set in the environment is read back unchanged.
        #[test]
        fn prop_numeric_settings_applied(
            threshold in 1usize..50,
            window in 1u64..3600,
            mute in 0u64..86_400,
        ) {
            let vars: HashMap<&str, String> = HashMap::from([
                ("SPAM_THRESHOLD", threshold.to_string()),
                ("SPAM_DUPLICATE_LIMIT", "1".to_string()),
                ("SPAM_WINDOW_SECS", window.to_string()),
                ("MUTE_DURATION_SECS", mute.to_string()),
            ]);
            let config = WardenConfig::from_lookup(|name| vars.get(name).cloned())
                .expect("valid config");

            prop_assert_eq!(config.moderation.spam.threshold, threshold);
            prop_assert_eq!(config.moderation.spam.window.as_secs(), window);
            prop_assert_eq!(config.moderation.mute_duration.as_secs(), mute);
        }
    }
}
