//! Failure taxonomy for reasoning engine calls and user guidance for fatal errors.
//!
//! Per-turn engine failures never escape a turn: the game turns them into a single
//! narrator line picked by [`FailureKind`]. Startup failures are fatal and are rendered
//! through [`ErrorHandler`] with recovery suggestions.

use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse classification of a failed turn, used to pick the narrator message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Unreachable,
    RateLimited,
    AuthFailure,
    UpstreamError,
    RequestFailed,
    MalformedEnvelope,
    /// Anything that is not an engine-side failure.
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Unreachable => "unreachable",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::AuthFailure => "auth_failure",
            FailureKind::UpstreamError => "upstream_error",
            FailureKind::RequestFailed => "request_failed",
            FailureKind::MalformedEnvelope => "malformed_envelope",
            FailureKind::Internal => "internal",
        }
    }

    /// The line the narrator shows the player for this kind of failure.
    pub fn narrator_message(self) -> &'static str {
        match self {
            FailureKind::Timeout => {
                "The dungeon master is lost in thought... (The request timed out. Please try again.)"
            }
            FailureKind::Unreachable => {
                "The dungeon master is silent... (Network Error. Check your connection.)"
            }
            FailureKind::RateLimited => {
                "The dungeon master needs a moment to catch their breath. (Too many requests. Wait a moment, then try again.)"
            }
            FailureKind::AuthFailure => {
                "The dungeon master refuses to speak. (The AI service rejected our credentials. Please contact support.)"
            }
            FailureKind::UpstreamError => {
                "The dungeon master stumbles in the dark... (The AI service had an error. Please try again shortly.)"
            }
            FailureKind::RequestFailed => {
                "The dungeon master did not hear you clearly. (The request failed. Please try again.)"
            }
            FailureKind::MalformedEnvelope => {
                "The dungeon master mumbles something unintelligible. (Unexpected reply from the AI service. Please try again.)"
            }
            FailureKind::Internal => "An unknown error occurred.",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure of a single reasoning engine call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("reasoning engine did not respond within {seconds}s")]
    Timeout { seconds: u64 },

    #[error("reasoning engine unreachable: {detail}")]
    Unreachable { detail: String },

    #[error("reasoning engine rate limited the request (HTTP 429): {detail}")]
    RateLimited {
        retry_after_seconds: Option<u64>,
        detail: String,
    },

    #[error("reasoning engine rejected the credentials (HTTP {status}): {detail}")]
    AuthFailure { status: u16, detail: String },

    #[error("reasoning engine server error (HTTP {status}): {detail}")]
    UpstreamError { status: u16, detail: String },

    #[error("reasoning engine request failed (HTTP {status}): {detail}")]
    RequestFailed { status: u16, detail: String },

    #[error("reasoning engine returned a malformed envelope: {detail}")]
    MalformedEnvelope { detail: String },
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::Timeout { .. } => FailureKind::Timeout,
            EngineError::Unreachable { .. } => FailureKind::Unreachable,
            EngineError::RateLimited { .. } => FailureKind::RateLimited,
            EngineError::AuthFailure { .. } => FailureKind::AuthFailure,
            EngineError::UpstreamError { .. } => FailureKind::UpstreamError,
            EngineError::RequestFailed { .. } => FailureKind::RequestFailed,
            EngineError::MalformedEnvelope { .. } => FailureKind::MalformedEnvelope,
        }
    }

    pub fn narrator_message(&self) -> String {
        match self {
            EngineError::RateLimited {
                retry_after_seconds: Some(seconds),
                ..
            } if *seconds > 0 => format!(
                "The dungeon master needs a moment to catch their breath. (Too many requests. Wait {seconds} seconds, then try again.)"
            ),
            other => other.kind().narrator_message().to_string(),
        }
    }
}

/// Errors that stop the service from accepting turns at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartupError {
    #[error("no API key configured: {env_var} is not set and llm.api_key is empty")]
    ConfigurationMissing { env_var: String },
}

/// Enhanced error with user-friendly message and recovery suggestions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedError {
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub error_type: ErrorType,
    pub context: Option<String>,
}

/// Types of errors for better categorization
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ErrorType {
    /// Missing API key, unreadable catalog or template
    Configuration,
    Unknown,
}

impl EnhancedError {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        error_type: ErrorType,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            suggestions: Vec::new(),
            error_type,
            context: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions<I, S>(mut self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggestions
            .extend(suggestions.into_iter().map(Into::into));
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn into_error(self) -> Error {
        Error::new(self)
    }

    pub fn format(&self, verbose: bool) -> String {
        let mut output = String::new();
        output.push_str(&format!("{}: {}\n", self.error_type.label(), self.title));
        output.push_str(&format!("  {}\n", self.message));

        if verbose && let Some(context) = &self.context {
            output.push_str(&format!("\n  Context: {context}\n"));
        }

        if !self.suggestions.is_empty() {
            output.push_str("\n  Suggestions:\n");
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                output.push_str(&format!("    {}. {}\n", i + 1, suggestion));
            }
        }

        output
    }
}

impl ErrorType {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorType::Configuration => "config",
            ErrorType::Unknown => "error",
        }
    }
}

impl fmt::Display for EnhancedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

impl std::error::Error for EnhancedError {}

/// Renders any error reaching the top of the binary.
pub struct ErrorHandler {
    verbose: bool,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self { verbose: false }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn handle(&self, error: &Error) -> String {
        self.enhance(error).format(self.verbose)
    }

    pub fn enhance(&self, error: &Error) -> EnhancedError {
        if let Some(enhanced) = error.downcast_ref::<EnhancedError>() {
            return enhanced.clone();
        }
        if let Some(StartupError::ConfigurationMissing { env_var }) =
            error.downcast_ref::<StartupError>()
        {
            return errors::missing_api_key(env_var);
        }

        let chain = format!("{error:#}");
        let lower = chain.to_lowercase();
        if lower.contains("puzzle catalog") || lower.contains("prompt template") {
            return EnhancedError::new("Game Data Error", chain, ErrorType::Configuration)
                .with_suggestions([
                    "Check that puzzles.json and DM_prompt.md exist in the working directory",
                    "Override game.catalog_path / game.prompt_path in .tomb/settings.json",
                ]);
        }
        if lower.contains("settings") || lower.contains("config") {
            return EnhancedError::new("Configuration Error", chain, ErrorType::Configuration)
                .with_suggestion("Check .tomb/settings.json and ~/.tomb/settings.json");
        }

        EnhancedError::new("Error", chain, ErrorType::Unknown)
    }
}

/// Constructors for frequently encountered errors
pub mod errors {
    use super::*;

    pub fn missing_api_key(env_var: &str) -> EnhancedError {
        EnhancedError::new(
            "Missing API Key",
            "An OpenRouter API key is required before the dungeon can open.",
            ErrorType::Configuration,
        )
        .with_suggestions([
            format!("Set the {env_var} environment variable"),
            "Add 'llm.api_key' to .tomb/settings.json".to_string(),
        ])
    }
}
