//! Error types for Warden.
//!
//! Every failure is scoped to the single operation that hit it; none of these
//! kinds take the engine down.

use thiserror::Error;

use crate::models::ScopeKey;

/// Central error type for all Warden operations.
#[derive(Debug, Error)]
pub enum WardenError {
    /// Caller supplied something malformed (empty word, bad duration).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The chat platform rejected or failed a call.
    #[error("Platform unavailable: {0}")]
    PlatformUnavailable(String),

    /// Durable storage failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A tunable could not be parsed or is out of range.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A word compiled to an invalid regex.
    #[error("Regex pattern error: {0}")]
    RegexPattern(#[from] regex::Error),

    /// Malformed JSON in a question bank or replay line.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Word list or question file could not be read or written.
    #[error("IO error: {0}")]
    Io(String),
}

impl WardenError {
    /// Log error with full context using tracing.
    pub fn log_with_context(&self, context: &ErrorContext) {
        match self {
            Self::PlatformUnavailable(_) => {
                tracing::error!(
                    error = %self,
                    request_id = %context.request_id,
                    chat_id = ?context.chat_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Platform call failed"
                );
            }
            // Durability is best-effort, so storage failures degrade to a warning
            Self::Persistence(_) | Self::Io(_) | Self::Json(_) => {
                tracing::warn!(
                    error = %self,
                    request_id = %context.request_id,
                    chat_id = ?context.chat_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Persistence degraded"
                );
            }
            Self::Config(_) | Self::RegexPattern(_) => {
                tracing::error!(
                    error = %self,
                    request_id = %context.request_id,
                    operation = %context.operation,
                    "Configuration error"
                );
            }
            Self::InvalidInput(_) => {
                tracing::debug!(
                    error = %self,
                    request_id = %context.request_id,
                    operation = %context.operation,
                    "Rejected input"
                );
            }
        }
    }

    /// Whether the failure is scoped to a single operation.
    ///
    /// Configuration and pattern errors are the only kinds that indicate
    /// the engine itself was set up wrong.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::RegexPattern(_))
    }

    /// Get user-friendly error message (hides internal details).
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "Invalid input, please check the value and try again",
            Self::PlatformUnavailable(_) => "Chat service temporarily unavailable",
            Self::Persistence(_) => "Storage temporarily unavailable",
            Self::Config(_) => "Service configuration error",
            Self::RegexPattern(_) => "Invalid pattern configuration",
            Self::Json(_) => "Data format error",
            Self::Io(_) => "File system error",
        }
    }
}

/// Context information for error logging.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Unique request identifier for correlation
    pub request_id: String,
    pub chat_id: Option<i64>,
    pub user_id: Option<i64>,
    /// Operation being performed
    pub operation: String,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            chat_id: None,
            user_id: None,
            operation: operation.into(),
        }
    }

    /// Fill chat and user from a scope key.
    pub fn with_scope(mut self, scope: ScopeKey) -> Self {
        self.chat_id = Some(scope.chat_id);
        self.user_id = Some(scope.user_id);
        self
    }

    pub fn with_chat_id(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_input() {
        let err = WardenError::InvalidInput("word is empty".to_string());
        assert_eq!(err.to_string(), "Invalid input: word is empty");
    }

    #[test]
    fn platform_display_keeps_cause() {
        let err = WardenError::PlatformUnavailable("restrict rejected: 429".to_string());
        assert_eq!(err.to_string(), "Platform unavailable: restrict rejected: 429");
        assert_eq!(err.user_message(), "Chat service temporarily unavailable");
    }

    #[test]
    fn error_recoverability() {
        assert!(WardenError::PlatformUnavailable("x".to_string()).is_recoverable());
        assert!(WardenError::Persistence("x".to_string()).is_recoverable());
        assert!(WardenError::InvalidInput("x".to_string()).is_recoverable());
        assert!(!WardenError::Config("x".to_string()).is_recoverable());
    }

    #[test]
    fn user_message_never_leaks_storage_details() {
        let err = WardenError::Persistence("INSERT INTO mutes failed: disk I/O".to_string());
        assert_eq!(err.user_message(), "Storage temporarily unavailable");
        assert!(!err.user_message().contains("mutes"));

        let err = WardenError::Io("/var/lib/warden/badwords.txt: permission denied".to_string());
        assert_eq!(err.user_message(), "File system error");
    }

    #[test]
    fn context_from_scope() {
        let ctx = ErrorContext::new("mute")
            .with_scope(ScopeKey::new(-100, 42))
            .with_request_id("req-1");

        assert_eq!(ctx.operation, "mute");
        assert_eq!(ctx.chat_id, Some(-100));
        assert_eq!(ctx.user_id, Some(42));
        assert_eq!(ctx.request_id, "req-1");
    }

    #[test]
    fn each_context_gets_its_own_request_id() {
        let ctx1 = ErrorContext::new("op1");
        let ctx2 = ErrorContext::new("op2").with_chat_id(7);

        assert_ne!(ctx1.request_id, ctx2.request_id);
        assert_eq!(ctx2.chat_id, Some(7));
        assert!(ctx2.user_id.is_none());
    }
}
