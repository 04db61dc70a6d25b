//! Gatekeeping for outbound message text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

pub(crate) static URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:https?://|www\.)[^\s<>]+|\b[a-z0-9][a-z0-9-]*\.(?:com|net|org|io|co|info|biz|xyz|ru)\b(?:/[^\s<>]*)?",
    )
    .expect("url pattern is valid")
});

static SCRIPT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:script|style)\b[^>]*>.*?</(?:script|style)\s*>")
        .expect("script block pattern is valid")
});

static DANGEROUS_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(?:script|style|iframe|object|embed|link|meta)\b[^>]*>")
        .expect("dangerous tag pattern is valid")
});

static EVENT_HANDLER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#)
        .expect("event handler pattern is valid")
});

static SCRIPT_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(href|src|action)\s*=\s*(?:"\s*(?:javascript|vbscript|data):[^"]*"|'\s*(?:javascript|vbscript|data):[^']*'|(?:javascript|vbscript|data):[^\s>]*)"#)
        .expect("script url pattern is valid")
});

/// Turns untrusted HTML into markup that is safe to render.
pub trait HtmlSanitizer: Send + Sync {
    fn sanitize(&self, html: &str) -> String;
}

/// Strips script and style blocks, embedding tags, inline event handlers and
/// script URLs. Everything else is passed through.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicHtmlSanitizer;

impl HtmlSanitizer for BasicHtmlSanitizer {
    fn sanitize(&self, html: &str) -> String {
        let without_blocks = SCRIPT_BLOCK.replace_all(html, "");
        let without_tags = DANGEROUS_TAG.replace_all(&without_blocks, "");
        let without_handlers = EVENT_HANDLER.replace_all(&without_tags, "");
        SCRIPT_URL
            .replace_all(&without_handlers, r##"$1="#""##)
            .into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationOptions {
    pub max_length: usize,
    pub allow_html: bool,
    pub allow_urls: bool,
    pub block_words: Vec<String>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            max_length: 2000,
            allow_html: false,
            allow_urls: true,
            block_words: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    Empty,
    Length,
    BlockedWords,
    UrlsNotAllowed,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Length => "length",
            Self::BlockedWords => "blocked_words",
            Self::UrlsNotAllowed => "urls_not_allowed",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: ValidationCode,
    pub message: String,
}

impl ValidationIssue {
    fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub sanitized_content: String,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn has_code(&self, code: ValidationCode) -> bool {
        self.errors.iter().any(|issue| issue.code == code)
    }
}

/// Validates and sanitizes message text before it enters the send pipeline.
///
/// Every rule is evaluated even when an earlier one fails, so callers can
/// surface all problems at once.
pub struct MessageValidationService {
    sanitizer: Box<dyn HtmlSanitizer>,
}

impl MessageValidationService {
    pub fn new() -> Self {
        Self::with_sanitizer(BasicHtmlSanitizer)
    }

    pub fn with_sanitizer(sanitizer: impl HtmlSanitizer + 'static) -> Self {
        Self {
            sanitizer: Box::new(sanitizer),
        }
    }

    pub fn validate_and_sanitize(
        &self,
        message: &str,
        options: &ValidationOptions,
    ) -> ValidationResult {
        let trimmed = message.trim();
        let sanitized_content = if options.allow_html {
            self.sanitizer.sanitize(trimmed).trim().to_owned()
        } else {
            trimmed.to_owned()
        };

        let mut errors = Vec::new();

        if sanitized_content.is_empty() {
            errors.push(ValidationIssue::new(
                ValidationCode::Empty,
                "Message cannot be empty",
            ));
        }

        let length = sanitized_content.chars().count();
        if length > options.max_length {
            errors.push(ValidationIssue::new(
                ValidationCode::Length,
                format!(
                    "Message is {length} characters long; the limit is {}",
                    options.max_length
                ),
            ));
        }

        let blocked = find_blocked_words(&sanitized_content, &options.block_words);
        if !blocked.is_empty() {
            errors.push(ValidationIssue::new(
                ValidationCode::BlockedWords,
                format!("Message contains blocked words: {}", blocked.join(", ")),
            ));
        }

        if !options.allow_urls && URL_PATTERN.is_match(&sanitized_content) {
            errors.push(ValidationIssue::new(
                ValidationCode::UrlsNotAllowed,
                "Links are not allowed in messages",
            ));
        }

        if !errors.is_empty() {
            debug!(
                codes = ?errors.iter().map(|e| e.code.as_str()).collect::<Vec<_>>(),
                "message rejected by validation"
            );
        }

        ValidationResult {
            is_valid: errors.is_empty(),
            sanitized_content,
            errors,
        }
    }
}

impl Default for MessageValidationService {
    fn default() -> Self {
        Self::new()
    }
}

fn find_blocked_words<'a>(content: &str, block_words: &'a [String]) -> Vec<&'a str> {
    let lowered = content.to_lowercase();
    block_words
        .iter()
        .map(|word| word.trim())
        .filter(|word| !word.is_empty() && lowered.contains(&word.to_lowercase()))
        .collect()
}
