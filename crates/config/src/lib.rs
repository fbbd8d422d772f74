//! Configuration loading, validation, and management for toolgate.
//!
//! Loads the policy snapshot from `~/.toolgate/config.toml` (or the file
//! named by `TOOLGATE_CONFIG`) with environment variable overrides, and
//! validates all settings at startup. The resulting [`SecurityConfig`] is
//! never mutated afterwards; a reload builds a fresh value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.toolgate/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Command verb allowlist
    #[serde(default)]
    pub commands: CommandConfig,

    /// Filesystem roots and forbidden prefixes
    #[serde(default)]
    pub paths: PathConfig,

    /// Environment scrubbing
    #[serde(default)]
    pub env: EnvConfig,

    /// Outbound fetch policy
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Token buckets per external resource
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Response cache TTLs
    #[serde(default)]
    pub cache: CacheConfig,

    /// Audit trail storage
    #[serde(default)]
    pub audit: AuditConfig,

    /// Size and time limits for local operations
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Verb -> permitted flag tokens. An empty list enforces no flag
    /// restriction beyond the dangerous-character check.
    #[serde(default = "default_allowed_commands")]
    pub allowed: BTreeMap<String, Vec<String>>,

    /// Cap on captured stdout and stderr, each.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
}

fn flags(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn default_allowed_commands() -> BTreeMap<String, Vec<String>> {
    let mut allowed = BTreeMap::new();
    allowed.insert("ls".into(), flags(&["-l", "-a", "-la", "-al", "-lh", "-h", "-R", "-1"]));
    allowed.insert("cat".into(), flags(&["-n"]));
    allowed.insert("head".into(), flags(&["-n", "-c"]));
    allowed.insert("tail".into(), flags(&["-n", "-c"]));
    allowed.insert("wc".into(), flags(&["-l", "-w", "-c"]));
    allowed.insert(
        "grep".into(),
        flags(&["-i", "-n", "-r", "-l", "-c", "-v", "-E", "-F", "-w"]),
    );
    allowed.insert("find".into(), flags(&["-name", "-iname", "-type", "-maxdepth"]));
    allowed.insert(
        "git".into(),
        flags(&[
            "--oneline",
            "--stat",
            "--short",
            "--porcelain",
            "--name-only",
            "--no-color",
            "--all",
            "-n",
            "-s",
            "-a",
            "-v",
        ]),
    );
    allowed.insert("echo".into(), vec![]);
    allowed.insert("pwd".into(), vec![]);
    allowed.insert("date".into(), vec![]);
    allowed.insert("whoami".into(), vec![]);
    allowed
}

fn default_max_output_bytes() -> u64 {
    1024 * 1024
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            allowed: default_allowed_commands(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Directories file operations may touch. Empty = nothing is admissible.
    #[serde(default = "default_allowed_roots")]
    pub allowed_roots: Vec<String>,

    /// Prefixes that are refused even under an allowed root.
    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,
}

fn default_allowed_roots() -> Vec<String> {
    vec![".".into()]
}

fn default_forbidden_paths() -> Vec<String> {
    [
        "/etc",
        "/root",
        "/proc",
        "/sys",
        "/dev",
        "/boot",
        "/var/run",
        "~/.ssh",
        "~/.gnupg",
        "~/.aws",
        "~/.azure",
        "~/.kube",
        "~/.docker",
        "~/.config/gcloud",
        "~/.netrc",
        "~/.git-credentials",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            allowed_roots: default_allowed_roots(),
            forbidden_paths: default_forbidden_paths(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Substrings that mark a variable name as credential-shaped.
    #[serde(default = "default_sensitive_patterns")]
    pub sensitive_patterns: Vec<String>,

    /// Service prefixes whose variables are always dropped.
    #[serde(default = "default_service_prefixes")]
    pub service_prefixes: Vec<String>,

    /// Also redact long, high-entropy values under innocuous names.
    #[serde(default = "default_true")]
    pub redact_high_entropy_values: bool,
}

fn default_sensitive_patterns() -> Vec<String> {
    [
        "_KEY",
        "_TOKEN",
        "_SECRET",
        "_PASSWORD",
        "_AUTH",
        "_PRIVATE",
        "_CREDENTIAL",
        "API_",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_service_prefixes() -> Vec<String> {
    ["GITHUB_", "CLICKUP_", "AWS_", "OPENAI_", "ANTHROPIC_"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            sensitive_patterns: default_sensitive_patterns(),
            service_prefixes: default_service_prefixes(),
            redact_high_entropy_values: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Endpoints that may be fetched, as absolute URLs. A request matches
    /// when scheme, host and port are equal and its path is under the
    /// endpoint's path. Empty or `"*"` = any public host.
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,

    /// Extra hostnames refused outright.
    #[serde(default)]
    pub blocked_hosts: Vec<String>,

    /// Resolve hostnames and refuse private addresses (DNS rebinding).
    #[serde(default = "default_true")]
    pub resolve_dns: bool,

    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_max_response_bytes() -> u64 {
    5 * 1024 * 1024
}
fn default_max_redirects() -> usize {
    5
}
fn default_user_agent() -> String {
    concat!("toolgate/", env!("CARGO_PKG_VERSION")).into()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            allowed_endpoints: vec![],
            blocked_hosts: vec![],
            resolve_dns: true,
            max_response_bytes: default_max_response_bytes(),
            max_redirects: default_max_redirects(),
            user_agent: default_user_agent(),
        }
    }
}

/// A token bucket class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_second: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_second: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket class for resources without their own entry.
    #[serde(default)]
    pub default: BucketConfig,

    /// Resource name -> bucket class.
    #[serde(default)]
    pub resources: BTreeMap<String, BucketConfig>,
}

impl RateLimitConfig {
    pub fn bucket_for(&self, resource: &str) -> BucketConfig {
        self.resources
            .get(resource)
            .copied()
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Resource name -> TTL in seconds. 0 disables caching for it.
    #[serde(default)]
    pub resources: BTreeMap<String, u64>,

    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_max_entries() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl_secs(),
            resources: BTreeMap::new(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, resource: &str) -> std::time::Duration {
        let secs = self
            .resources
            .get(resource)
            .copied()
            .unwrap_or(self.default_ttl_secs);
        std::time::Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_audit_file")]
    pub file_name: String,

    /// Rotate once the active file would grow past this size.
    #[serde(default = "default_audit_max_bytes")]
    pub max_file_bytes: u64,

    #[serde(default = "default_audit_backups")]
    pub backup_count: usize,
}

fn default_audit_dir() -> PathBuf {
    SecurityConfig::config_dir().join("audit")
}
fn default_audit_file() -> String {
    "audit.log".into()
}
fn default_audit_max_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_audit_backups() -> usize {
    5
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: default_audit_dir(),
            file_name: default_audit_file(),
            max_file_bytes: default_audit_max_bytes(),
            backup_count: default_audit_backups(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest file that may be read or written.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Timeout applied when a request does not carry one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Upper bound on any requested timeout.
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_timeout_secs() -> u64 {
    300
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
        }
    }
}

impl LimitsConfig {
    /// Clamp a requested timeout into `(0, max_timeout_secs]`.
    pub fn effective_timeout(&self, requested: std::time::Duration) -> std::time::Duration {
        let max = std::time::Duration::from_secs(self.max_timeout_secs);
        if requested.is_zero() {
            std::time::Duration::from_secs(self.default_timeout_secs).min(max)
        } else {
            requested.min(max)
        }
    }
}

impl SecurityConfig {
    /// Load configuration from `TOOLGATE_CONFIG` or the default path
    /// (`~/.toolgate/config.toml`).
    ///
    /// Environment overrides:
    /// - `TOOLGATE_ALLOWED_ROOTS`: comma-separated allowed roots
    /// - `TOOLGATE_AUDIT_DIR`: audit log directory
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("TOOLGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"));
        let mut config = Self::load_from(&path)?;

        if let Ok(roots) = std::env::var("TOOLGATE_ALLOWED_ROOTS") {
            config.paths.allowed_roots = roots
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(dir) = std::env::var("TOOLGATE_AUDIT_DIR") {
            config.audit.dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".toolgate")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for verb in self.commands.allowed.keys() {
            if verb.is_empty() || verb.contains(char::is_whitespace) || verb.contains('/') {
                return Err(ConfigError::ValidationError(format!(
                    "command verb '{verb}' must be a bare program name"
                )));
            }
        }

        if self.commands.max_output_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "commands.max_output_bytes must be > 0".into(),
            ));
        }

        let buckets = std::iter::once(("default", &self.rate_limits.default)).chain(
            self.rate_limits
                .resources
                .iter()
                .map(|(name, b)| (name.as_str(), b)),
        );
        for (name, bucket) in buckets {
            if !bucket.capacity.is_finite() || bucket.capacity <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "rate_limits.{name}.capacity must be a positive number"
                )));
            }
            if !bucket.refill_per_second.is_finite() || bucket.refill_per_second < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "rate_limits.{name}.refill_per_second must be >= 0"
                )));
            }
        }

        for endpoint in &self.fetch.allowed_endpoints {
            if endpoint.trim() == "*" {
                continue;
            }
            let valid = url::Url::parse(endpoint.trim())
                .is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some());
            if !valid {
                return Err(ConfigError::ValidationError(format!(
                    "fetch.allowed_endpoints entry '{endpoint}' must be an absolute http(s) URL or \"*\""
                )));
            }
        }

        if self.cache.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "cache.max_entries must be > 0".into(),
            ));
        }

        if self.audit.max_file_bytes == 0 || self.audit.backup_count == 0 {
            return Err(ConfigError::ValidationError(
                "audit.max_file_bytes and audit.backup_count must be > 0".into(),
            ));
        }

        if self.audit.file_name.is_empty() || self.audit.file_name.contains('/') {
            return Err(ConfigError::ValidationError(
                "audit.file_name must be a plain file name".into(),
            ));
        }

        if self.limits.max_file_bytes == 0 || self.fetch.max_response_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "size limits must be > 0".into(),
            ));
        }

        if self.limits.default_timeout_secs == 0
            || self.limits.max_timeout_secs < self.limits.default_timeout_secs
        {
            return Err(ConfigError::ValidationError(
                "limits: 0 < default_timeout_secs <= max_timeout_secs required".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
