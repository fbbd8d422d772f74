//! Environment filtering for spawned processes and logged payloads.
//!
//! Credential-shaped variables are omitted entirely, never redacted in place.
//! Loader and interpreter injection variables are always dropped, whatever
//! the configured patterns say.

use std::collections::BTreeMap;

use toolgate_config::EnvConfig;

use crate::secrets::looks_like_secret;

/// Variables that are always dropped, since they can inject code into a child.
pub const ALWAYS_STRIP: &[&str] = &[
    // Library injection
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "DYLD_FRAMEWORK_PATH",
    // Interpreter startup
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "PYTHONHOME",
    "RUBYOPT",
    "PERL5OPT",
    "PERL5LIB",
    "NODE_OPTIONS",
    "NODE_PATH",
    // Shell startup
    "BASH_ENV",
    "ENV",
    "SHELLOPTS",
    "PROMPT_COMMAND",
    "IFS",
    // Spawned helpers
    "EDITOR",
    "VISUAL",
    "PAGER",
    "GIT_EXEC_PATH",
    "GIT_SSH_COMMAND",
    "GIT_ASKPASS",
];

/// Why a variable was left out of the filtered environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Injection,
    SensitiveName,
    SecretValue,
}

/// Produces redacted copies of the process environment.
#[derive(Debug, Clone)]
pub struct EnvFilter {
    /// Uppercased substrings matched anywhere in the key.
    patterns: Vec<String>,
    /// Uppercased prefixes matched at the start of the key.
    prefixes: Vec<String>,
    redact_values: bool,
}

impl Default for EnvFilter {
    fn default() -> Self {
        Self::new(&EnvConfig::default())
    }
}

impl EnvFilter {
    pub fn new(config: &EnvConfig) -> Self {
        Self {
            patterns: config.sensitive_patterns.iter().map(|p| p.to_uppercase()).collect(),
            prefixes: config.service_prefixes.iter().map(|p| p.to_uppercase()).collect(),
            redact_values: config.redact_high_entropy_values,
        }
    }

    /// Decide whether `key=value` must be dropped, and why.
    pub fn classify(&self, key: &str, value: &str) -> Option<DropReason> {
        if ALWAYS_STRIP.iter().any(|k| k.eq_ignore_ascii_case(key)) {
            return Some(DropReason::Injection);
        }
        if self.is_sensitive_key(key) {
            return Some(DropReason::SensitiveName);
        }
        if self.redact_values && looks_like_secret(value) {
            return Some(DropReason::SecretValue);
        }
        None
    }

    /// Whether a variable name matches a sensitive pattern or service prefix.
    pub fn is_sensitive_key(&self, key: &str) -> bool {
        let upper = key.to_uppercase();
        self.patterns.iter().any(|p| upper.contains(p.as_str()))
            || self.prefixes.iter().any(|p| upper.starts_with(p.as_str()))
    }

    /// Filter an arbitrary set of variables.
    pub fn filter<I, K, V>(&self, vars: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        vars.into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, v)| self.classify(k, v).is_none())
            .collect()
    }

    /// The current process environment with sensitive variables removed.
    ///
    /// Variables that are not valid UTF-8 are skipped.
    pub fn filtered(&self) -> BTreeMap<String, String> {
        self.filter(utf8_vars())
    }

    /// Values of the variables `filtered()` drops for credential reasons.
    ///
    /// Used to mask leaks in child output.
    pub fn secret_values(&self) -> Vec<String> {
        self.secret_values_from(utf8_vars())
    }

    pub fn secret_values_from<I, K, V>(&self, vars: I) -> Vec<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        vars.into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, v)| {
                matches!(
                    self.classify(k, v),
                    Some(DropReason::SensitiveName | DropReason::SecretValue)
                )
            })
            .map(|(_, v)| v)
            .filter(|v| !v.is_empty())
            .collect()
    }
}

fn utf8_vars() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<(&'static str, &'static str)> {
        vec![
            ("PATH", "/usr/bin:/bin"),
            ("HOME", "/home/dev"),
            ("LANG", "en_US.UTF-8"),
            ("OPENAI_API_KEY", "sk-live-123"),
            ("GITHUB_USER", "octocat"),
            ("CLICKUP_WORKSPACE", "42"),
            ("DB_PASSWORD", "hunter2"),
            ("SESSION_TOKEN", "abc"),
            ("MY_PRIVATE_THING", "x"),
            ("LD_PRELOAD", "/tmp/evil.so"),
            ("NOTES", "aZ3kP9qL2xW7vB4nM8cR1tY6uI0oE5sD"),
        ]
    }

    #[test]
    fn sensitive_names_are_omitted() {
        let filtered = EnvFilter::default().filter(sample());
        assert_eq!(filtered.get("PATH").map(String::as_str), Some("/usr/bin:/bin"));
        assert!(filtered.contains_key("HOME"));
        assert!(filtered.contains_key("LANG"));
        for key in [
            "OPENAI_API_KEY",
            "GITHUB_USER",
            "CLICKUP_WORKSPACE",
            "DB_PASSWORD",
            "SESSION_TOKEN",
            "MY_PRIVATE_THING",
        ] {
            assert!(!filtered.contains_key(key), "{key} should be dropped");
        }
    }

    #[test]
    fn injection_variables_always_dropped() {
        let config = EnvConfig {
            sensitive_patterns: vec![],
            service_prefixes: vec![],
            redact_high_entropy_values: false,
        };
        let filter = EnvFilter::new(&config);
        assert_eq!(filter.classify("LD_PRELOAD", "/tmp/x.so"), Some(DropReason::Injection));
        assert_eq!(filter.classify("node_options", "--require x"), Some(DropReason::Injection));
        assert_eq!(filter.classify("DB_PASSWORD", "x"), None);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let filter = EnvFilter::default();
        assert!(filter.is_sensitive_key("github_token"));
        assert!(filter.is_sensitive_key("my_api_secret"));
        assert!(!filter.is_sensitive_key("TERM"));
    }

    #[test]
    fn high_entropy_values_follow_config() {
        let strict = EnvFilter::default();
        assert!(!strict.filter(sample()).contains_key("NOTES"));

        let lax = EnvFilter::new(&EnvConfig {
            redact_high_entropy_values: false,
            ..EnvConfig::default()
        });
        assert!(lax.filter(sample()).contains_key("NOTES"));
    }

    #[test]
    fn secret_values_exclude_injection_vars() {
        let values = EnvFilter::default().secret_values_from(sample());
        assert!(values.contains(&"hunter2".to_string()));
        assert!(values.contains(&"sk-live-123".to_string()));
        assert!(!values.contains(&"/tmp/evil.so".to_string()));
        assert!(!values.contains(&"/usr/bin:/bin".to_string()));
    }

    #[test]
    fn filtered_process_env_has_no_sensitive_keys() {
        let filter = EnvFilter::default();
        for key in filter.filtered().keys() {
            assert!(!filter.is_sensitive_key(key), "{key} leaked");
            assert!(!ALWAYS_STRIP.contains(&key.as_str()));
        }
    }
}
