//! Audit logging: the append-only record of every gateway decision.
//!
//! Events are scrubbed, serialized as one JSON object per line, and appended
//! to a size-rotated file under a single writer lock. Every event is also
//! forwarded to the registered [`AuditSink`]s.
//!
//! Readers take the lock only long enough to open the current files and
//! note their lengths, then stream that snapshot without it.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolgate_config::AuditConfig;

use crate::secrets::scrub_value;

/// What kind of operation an event describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    FileRead,
    FileWrite,
    FileDelete,
    CommandExec,
    ApiCall,
    ConfigChange,
    AccessDenied,
    Error,
}

impl AuditCategory {
    pub const ALL: [AuditCategory; 8] = [
        Self::FileRead,
        Self::FileWrite,
        Self::FileDelete,
        Self::CommandExec,
        Self::ApiCall,
        Self::ConfigChange,
        Self::AccessDenied,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::FileDelete => "file_delete",
            Self::CommandExec => "command_exec",
            Self::ApiCall => "api_call",
            Self::ConfigChange => "config_change",
            Self::AccessDenied => "access_denied",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown audit category '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl std::str::FromStr for AuditResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(format!("unknown audit result '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// A single audit record. Never mutated after it is written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    pub action: String,
    pub resource: String,
    pub result: AuditResult,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AuditEvent {
    /// A successful, informational event stamped with the current time.
    pub fn new(category: AuditCategory, action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            action: action.into(),
            resource: resource.into(),
            result: AuditResult::Success,
            severity: Severity::Info,
            user: None,
            details: None,
        }
    }

    pub fn failed(mut self, severity: Severity) -> Self {
        self.result = AuditResult::Failure;
        self.severity = severity;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.result == AuditResult::Failure
    }
}

/// Trait for audit sinks (where events are mirrored besides the file).
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// A tracing-based audit sink that logs events via `tracing::info!`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, event: &AuditEvent) {
        tracing::info!(
            category = %event.category,
            action = %event.action,
            resource = %event.resource,
            result = event.result.as_str(),
            severity = event.severity.as_str(),
            user = ?event.user,
            "AUDIT"
        );
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Filters for [`AuditLog::search`]. Unset fields match everything.
#[derive(Debug, Clone)]
pub struct AuditQuery {
    pub category: Option<AuditCategory>,
    pub user: Option<String>,
    pub resource_contains: Option<String>,
    pub result: Option<AuditResult>,
    pub severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            category: None,
            user: None,
            resource_contains: None,
            result: None,
            severity: None,
            since: None,
            until: None,
            limit: 100,
        }
    }
}

impl AuditQuery {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.category.is_none_or(|c| c == event.category)
            && self
                .user
                .as_deref()
                .is_none_or(|u| event.user.as_deref() == Some(u))
            && self
                .resource_contains
                .as_deref()
                .is_none_or(|s| event.resource.contains(s))
            && self.result.is_none_or(|r| r == event.result)
            && self.severity.is_none_or(|s| s == event.severity)
            && self.since.is_none_or(|t| event.timestamp >= t)
            && self.until.is_none_or(|t| event.timestamp <= t)
    }
}

/// Aggregate view over a trailing window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditSummary {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_result: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub by_user: BTreeMap<String, usize>,
    /// Most recent failures, newest first.
    pub recent_failures: Vec<AuditEvent>,
}

struct ActiveFile {
    file: File,
    size: u64,
}

/// Rotating NDJSON audit store.
pub struct AuditLog {
    dir: PathBuf,
    file_name: String,
    max_file_bytes: u64,
    backup_count: usize,
    active: Mutex<ActiveFile>,
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("path", &self.path())
            .field("max_file_bytes", &self.max_file_bytes)
            .field("backup_count", &self.backup_count)
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl AuditLog {
    /// Open (or create) the active audit file described by `config`.
    pub fn open(config: &AuditConfig) -> Result<Self, AuditError> {
        std::fs::create_dir_all(&config.dir)?;
        let path = config.dir.join(&config.file_name);
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            dir: config.dir.clone(),
            file_name: config.file_name.clone(),
            max_file_bytes: config.max_file_bytes,
            backup_count: config.backup_count,
            active: Mutex::new(ActiveFile { file, size }),
            sinks: Vec::new(),
        })
    }

    /// Mirror every logged event into `sink`.
    pub fn with_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.{index}", self.file_name))
    }

    /// Scrub and append one event. Returns the event as written.
    pub fn log(&self, mut event: AuditEvent) -> Result<AuditEvent, AuditError> {
        if let Some(details) = event.details.as_mut() {
            scrub_value(details);
        }
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let len = line.len() as u64;

        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.size > 0
                && active.size + len > self.max_file_bytes
                && let Err(e) = self.rotate(&mut active)
            {
                tracing::warn!(error = %e, path = %self.path().display(), "Audit log rotation failed, continuing in current file");
            }
            active.file.write_all(line.as_bytes())?;
            active.file.flush()?;
            active.size += len;
        }

        for sink in &self.sinks {
            sink.record(&event);
        }
        Ok(event)
    }

    /// Shift `name.N` backups up by one, move the active file to `name.1`,
    /// and start a fresh active file. Called with the writer lock held.
    fn rotate(&self, active: &mut ActiveFile) -> std::io::Result<()> {
        for index in (1..self.backup_count).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                std::fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        std::fs::rename(self.path(), self.backup_path(1))?;
        // Until the swap below the old handle keeps writing into `name.1`.
        active.file = open_append(&self.path())?;
        active.size = 0;
        tracing::debug!(path = %self.path().display(), "Rotated audit log");
        Ok(())
    }

    /// Existing audit files, oldest first.
    fn files_oldest_first(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = (1..=self.backup_count)
            .rev()
            .map(|i| self.backup_path(i))
            .filter(|p| p.exists())
            .collect();
        files.push(self.path());
        files
    }

    /// Open handles on every audit file with their current lengths, oldest
    /// first. Open handles survive a later rotation's renames.
    fn snapshot(&self) -> Result<Vec<(PathBuf, File, u64)>, AuditError> {
        let _guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let mut files = Vec::new();
        for path in self.files_oldest_first() {
            match File::open(&path) {
                Ok(file) => {
                    let len = file.metadata()?.len();
                    files.push((path, file, len));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(files)
    }

    /// Stream every stored event in write order until `visit` returns false.
    /// Events logged after the scan starts are not visited.
    fn scan(&self, mut visit: impl FnMut(AuditEvent) -> bool) -> Result<(), AuditError> {
        for (path, file, len) in self.snapshot()? {
            for (number, line) in BufReader::new(file.take(len)).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEvent>(&line) {
                    Ok(event) => {
                        if !visit(event) {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        tracing::warn!(file = %path.display(), line = number + 1, error = %e, "Skipping malformed audit line");
                    }
                }
            }
        }
        Ok(())
    }

    /// Events matching `query`, oldest first, at most `query.limit`.
    pub fn search(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        let mut found = Vec::new();
        if query.limit == 0 {
            return Ok(found);
        }
        self.scan(|event| {
            if query.matches(&event) {
                found.push(event);
            }
            found.len() < query.limit
        })?;
        Ok(found)
    }

    /// Aggregate the trailing `window` ending now.
    pub fn summarize(
        &self,
        window: chrono::Duration,
        recent_failures: usize,
    ) -> Result<AuditSummary, AuditError> {
        self.summarize_at(Utc::now(), window, recent_failures)
    }

    pub fn summarize_at(
        &self,
        now: DateTime<Utc>,
        window: chrono::Duration,
        recent_failures: usize,
    ) -> Result<AuditSummary, AuditError> {
        let start = now - window;
        let mut summary = AuditSummary {
            window_start: start,
            window_end: now,
            total: 0,
            by_category: BTreeMap::new(),
            by_result: BTreeMap::new(),
            by_severity: BTreeMap::new(),
            by_user: BTreeMap::new(),
            recent_failures: Vec::new(),
        };
        let mut failures = VecDeque::with_capacity(recent_failures);

        self.scan(|event| {
            if event.timestamp < start || event.timestamp > now {
                return true;
            }
            summary.total += 1;
            *summary.by_category.entry(event.category.as_str().into()).or_default() += 1;
            *summary.by_result.entry(event.result.as_str().into()).or_default() += 1;
            *summary.by_severity.entry(event.severity.as_str().into()).or_default() += 1;
            if let Some(user) = &event.user {
                *summary.by_user.entry(user.clone()).or_default() += 1;
            }
            if event.is_failure() && recent_failures > 0 {
                if failures.len() == recent_failures {
                    failures.pop_front();
                }
                failures.push_back(event);
            }
            true
        })?;

        summary.recent_failures = failures.into_iter().rev().collect();
        Ok(summary)
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
