//! Secret redaction for captured command output.
//!
//! Validation output and CI logs end up in status documents, oracle prompts
//! and (via follow-up issues and PR bodies) on GitHub. Everything captured
//! from a subprocess goes through [`redact`] first.

use regex::Regex;
use std::sync::LazyLock;

static SECRET_PATTERNS: LazyLock<Vec<(&str, Regex)>> = LazyLock::new(|| {
    [
        ("aws_access_key", r"AKIA[0-9A-Z]{16}"),
        (
            "aws_secret_key",
            r"(?i)aws[_\-]?secret[_\-]?access[_\-]?key\s*[=:]\s*\S+",
        ),
        ("github_token", r"gh[pousr]_[A-Za-z0-9_]{36,}"),
        ("github_pat", r"github_pat_[A-Za-z0-9_]{22,}"),
        ("anthropic_api_key", r"sk-ant-[A-Za-z0-9\-]{20,}"),
        ("openai_api_key", r"sk-[A-Za-z0-9\-]{20,}"),
        ("slack_token", r"xox[baprs]-[0-9A-Za-z\-]{10,}"),
        ("stripe_key", r"[sr]k_(live|test)_[A-Za-z0-9]{20,}"),
        (
            "private_key",
            r"-----BEGIN (RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----",
        ),
        (
            "connection_string",
            r"(?i)(postgres|postgresql|mysql|mongodb|redis|amqp)://[^\s]{10,}",
        ),
        (
            "generic_secret",
            r#"(?i)(password|passwd|secret|token|api[_\-]?key)\s*[=:]\s*["']?[A-Za-z0-9+/=_\-]{16,}["']?"#,
        ),
        ("bearer_token", r"(?i)bearer\s+[A-Za-z0-9\-._~+/]{8,}=*"),
    ]
    .into_iter()
    .map(|(rule, pattern)| (rule, Regex::new(pattern).expect("static regex")))
    .collect()
});

/// Replace every detected secret with `[REDACTED:{rule}]`.
pub fn redact(text: &str) -> String {
    let mut result = text.to_string();
    for (rule, pattern) in SECRET_PATTERNS.iter() {
        if pattern.is_match(&result) {
            result = pattern
                .replace_all(&result, format!("[REDACTED:{rule}]"))
                .into_owned();
        }
    }
    result
}

/// Names of the rules that fire on `text`.
pub fn detected_rules(text: &str) -> Vec<&'static str> {
    SECRET_PATTERNS
        .iter()
        .filter(|(_, p)| p.is_match(text))
        .map(|(rule, _)| *rule)
        .collect()
}

/// Redact and keep only the last `max_chars` characters (failures are
/// usually at the end of the output).
pub fn redact_tail(text: &str, max_chars: usize) -> String {
    let clean = redact(text);
    let count = clean.chars().count();
    if count <= max_chars {
        return clean;
    }
    let tail: String = clean.chars().skip(count - max_chars).collect();
    format!("[… {} chars truncated …]\n{tail}", count - max_chars)
}
