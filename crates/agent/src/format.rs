use std::sync::LazyLock;

use opsdesk_core::errors::{ApplicationError, FailureKind};
use regex::Regex;
use thiserror::Error;
use tracing::{error, warn};

pub const REDACTION_MASK: &str = "***REDACTED***";

static BUILTIN_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)\bbearer\s+[a-z0-9._~+/=-]{20,}", "Bearer ***REDACTED***"),
        (r"\bAKIA[A-Z0-9]{16}\b", REDACTION_MASK),
        (
            r#"(?i)([a-z0-9_-]*(?:password|pass|pwd|secret|token|key|credential|api_key|apikey|auth)[a-z0-9_-]*["']?\s*[=:]\s*)["']?[^\s"',;}]{6,}["']?"#,
            "${1}***REDACTED***",
        ),
        (
            r"(?i)\b([a-z0-9_-]*(?:password|secret|token|key|credential|auth)[a-z0-9_]*\s+(?:is\s+|was\s+)?)[a-z0-9+/_=-]{20,}",
            "${1}***REDACTED***",
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|regex| (regex, replacement)))
    .collect()
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RedactionError {
    #[error("redaction pattern `{pattern}` is invalid: {message}")]
    InvalidPattern { pattern: String, message: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("unterminated code fence")]
    UnterminatedCodeFence,
    #[error("markup conversion failed: {0}")]
    Conversion(String),
}

/// Masks credential-shaped substrings.
#[derive(Clone, Debug)]
pub struct Redactor {
    extra: Vec<Regex>,
}

impl Redactor {
    pub fn builtin() -> Self {
        Self { extra: Vec::new() }
    }

    pub fn with_patterns(patterns: &[String]) -> Result<Self, RedactionError> {
        let extra = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|error| RedactionError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: error.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { extra })
    }

    pub fn redact(&self, text: &str) -> String {
        let mut redacted = text.to_string();
        for (rule, replacement) in BUILTIN_RULES.iter() {
            redacted = rule.replace_all(&redacted, *replacement).into_owned();
        }
        for rule in &self.extra {
            redacted = rule.replace_all(&redacted, REDACTION_MASK).into_owned();
        }
        redacted
    }
}

/// Converts planner markdown into a destination channel's markup.
pub trait MarkupConverter: Send + Sync {
    fn convert(&self, text: &str) -> Result<String, FormatError>;

    /// Fixed text appended to every reply.
    fn footer(&self) -> Option<&str> {
        None
    }
}

/// Passes text through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainMarkup;

impl MarkupConverter for PlainMarkup {
    fn convert(&self, text: &str) -> Result<String, FormatError> {
        Ok(text.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormattedResponse {
    pub text: String,
    pub formatter_error: Option<FormatError>,
    pub redaction_error: Option<RedactionError>,
}

impl FormattedResponse {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        if self.redaction_error.is_some() {
            Some(FailureKind::Redaction)
        } else if self.formatter_error.is_some() {
            Some(FailureKind::Formatter)
        } else {
            None
        }
    }
}

/// Markup conversion followed by redaction. Runs for every reply, degraded or not.
#[derive(Clone, Debug, Default)]
pub struct ResponseFormatter;

impl ResponseFormatter {
    pub fn format(
        &self,
        text: &str,
        converter: &dyn MarkupConverter,
        extra_patterns: &[String],
        correlation_id: &str,
    ) -> FormattedResponse {
        let redactor = match Redactor::with_patterns(extra_patterns) {
            Ok(redactor) => redactor,
            Err(redaction_error) => {
                error!(
                    event_name = "agent.format.redaction_failed",
                    correlation_id,
                    failure_kind = %FailureKind::Redaction,
                    error = %redaction_error,
                    "redaction unavailable; replacing response"
                );
                let message = ApplicationError::Redaction(redaction_error.to_string())
                    .into_interface(correlation_id)
                    .user_message()
                    .to_string();
                return FormattedResponse {
                    text: message,
                    formatter_error: None,
                    redaction_error: Some(redaction_error),
                };
            }
        };

        let (converted, formatter_error) = match converter.convert(text) {
            Ok(converted) => (converted, None),
            Err(format_error) => {
                warn!(
                    event_name = "agent.format.fallback",
                    correlation_id,
                    failure_kind = %FailureKind::Formatter,
                    error = %format_error,
                    "markup conversion failed; sending minimally formatted text"
                );
                (text.trim().to_string(), Some(format_error))
            }
        };

        let mut body = redactor.redact(&converted);
        if let Some(footer) = converter.footer() {
            body.push_str("\n\n");
            body.push_str(footer);
        }

        FormattedResponse { text: body, formatter_error, redaction_error: None }
    }
}
