//! Maps backend error text onto an [`ErrorCode`].
//!
//! Providers report the same condition in many ways, including localized
//! (Chinese) messages. The fallback chain only sees the resulting code, so new
//! phrasings are added here without touching chain control flow.

use crate::errors::ErrorCode;
use regex::Regex;

/// Classifies a backend failure message.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, message: &str) -> ErrorCode;
}

/// Ordered regex table; first match wins, anything unmatched is `API_ERROR`.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    patterns: Vec<(ErrorCode, Regex)>,
}

const CONTEXT_PATTERN: &str = r"(?i)context[ _-]?length|context[ _-]?window|maximum context|too many tokens|prompt is too long|input is too long|token limit|max(?:imum)?[ _]tokens? exceeded|上下文长度|超出上下文|上下文过长|超过最大长度|输入过长|超出.{0,6}token|token.{0,6}超出";

const RATE_LIMIT_PATTERN: &str = r"(?i)rate[ _-]?limit|too many requests|\b429\b|quota|overloaded|请求过于频繁|频率限制|限流|速率限制|配额";

const TIMEOUT_PATTERN: &str = r"(?i)timed? ?out|timeout|deadline exceeded|超时";

const UNAVAILABLE_PATTERN: &str = r"(?i)unavailable|not available|not installed|command not found|econnrefused|connection refused|不可用|未安装";

impl PatternClassifier {
    /// Classifier with the built-in English and Chinese phrasings.
    pub fn new() -> Self {
        let patterns = [
            (ErrorCode::ContextExceeded, CONTEXT_PATTERN),
            (ErrorCode::RateLimit, RATE_LIMIT_PATTERN),
            (ErrorCode::Timeout, TIMEOUT_PATTERN),
            (ErrorCode::AdapterUnavailable, UNAVAILABLE_PATTERN),
        ]
        .into_iter()
        .filter_map(|(code, pattern)| match Regex::new(pattern) {
            Ok(re) => Some((code, re)),
            Err(e) => {
                tracing::error!(code = %code, error = %e, "Invalid built-in classifier pattern");
                None
            }
        })
        .collect();
        Self { patterns }
    }

    /// Add a phrasing, checked before the built-ins.
    pub fn with_pattern(mut self, code: ErrorCode, pattern: &str) -> Result<Self, regex::Error> {
        self.patterns.insert(0, (code, Regex::new(pattern)?));
        Ok(self)
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, message: &str) -> ErrorCode {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(message))
            .map(|(code, _)| *code)
            .unwrap_or(ErrorCode::ApiError)
    }
}
