//! Secret detection and scrubbing.
//!
//! Two kinds of evidence mark a value as credential-shaped: the name it is
//! stored under (`API_KEY`, `password`, ...) and the value itself (long,
//! high-entropy, or a well-known token prefix). Audit details and returned
//! output pass through these helpers before they leave the gateway.

use serde_json::Value;

/// Replacement marker for scrubbed values.
pub const REDACTED: &str = "[REDACTED]";

/// Substrings that mark a key as sensitive, matched case-insensitively.
pub const SENSITIVE_KEY_PATTERNS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "auth",
    "credential",
    "private_key",
    "cookie",
    "session",
];

/// Well-known credential prefixes (OpenAI, GitHub, Slack, AWS access keys).
const KNOWN_PREFIXES: &[&str] = &["sk-", "ghp_", "gho_", "github_pat_", "xoxb-", "xoxp-", "AKIA"];

const MIN_SECRET_LEN: usize = 32;
const ENTROPY_THRESHOLD: f64 = 4.2;

/// Shannon entropy in bits per character.
pub fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut counts = std::collections::HashMap::new();
    let mut total = 0usize;
    for c in s.chars() {
        *counts.entry(c).or_insert(0usize) += 1;
        total += 1;
    }
    let total = total as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Whether a value looks like a credential regardless of the key it sits under.
pub fn looks_like_secret(value: &str) -> bool {
    if KNOWN_PREFIXES
        .iter()
        .any(|p| value.starts_with(p) && value.len() >= p.len() + 16)
    {
        return true;
    }
    value.len() >= MIN_SECRET_LEN
        && !value.chars().any(|c| c.is_whitespace() || c == '/' || c == ':')
        && shannon_entropy(value) > ENTROPY_THRESHOLD
}

/// Whether a field or variable name suggests it holds a credential.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Recursively scrub a JSON value in place.
///
/// Values under sensitive keys are replaced wholesale; other strings are
/// replaced when they look like a secret on their own.
pub fn scrub_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if is_sensitive_key(key) && !v.is_null() {
                    *v = Value::String(REDACTED.into());
                } else {
                    scrub_value(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(scrub_value),
        Value::String(s) if looks_like_secret(s) => *s = REDACTED.into(),
        _ => {}
    }
}

/// Query parameter names that carry credentials but are too short or generic
/// for [`is_sensitive_key`].
const SENSITIVE_QUERY_PARAMS: &[&str] = &["key", "sig", "signature", "code", "access_key"];

/// `raw` with its userinfo password and credential-shaped query values
/// masked. A string that does not parse as a URL loses its query instead.
pub fn redact_url(raw: &str) -> String {
    let Ok(mut url) = url::Url::parse(raw.trim()) else {
        let base = raw.split(['?', '#']).next().unwrap_or_default();
        return if base.len() < raw.len() {
            format!("{base}?{REDACTED}")
        } else {
            raw.to_string()
        };
    };
    if url.password().is_some() {
        url.set_password(Some(REDACTED)).ok();
    }
    if url.query().is_some() {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(name, value)| {
                let masked = is_sensitive_key(&name)
                    || SENSITIVE_QUERY_PARAMS.contains(&name.to_lowercase().as_str())
                    || looks_like_secret(&value);
                let value = if masked { REDACTED.to_string() } else { value.into_owned() };
                (name.into_owned(), value)
            })
            .collect();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}

/// Replace every occurrence of a known secret in `output`.
///
/// Very short values are skipped; masking `1` or `true` would mangle output
/// without protecting anything.
pub fn mask_leaks(output: &str, secrets: &[String]) -> String {
    let mut masked = output.to_string();
    for secret in secrets.iter().filter(|s| s.len() >= 6) {
        if masked.contains(secret.as_str()) {
            masked = masked.replace(secret.as_str(), REDACTED);
        }
    }
    masked
}
