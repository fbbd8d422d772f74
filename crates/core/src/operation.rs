//! Operation requests and their outcomes.
//!
//! An upstream dispatcher hands the gateway an [`OperationRequest`]; the
//! gateway answers with an [`Outcome`]. Callers pattern-match on the
//! outcome instead of probing a result map for `success`/`error` keys.

use crate::error::{ErrorKind, GateError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Privileged operations the gateway mediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Command,
    FileRead,
    FileWrite,
    Fetch,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Command,
        OperationKind::FileRead,
        OperationKind::FileWrite,
        OperationKind::Fetch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Command => "command",
            OperationKind::FileRead => "file_read",
            OperationKind::FileWrite => "file_write",
            OperationKind::Fetch => "fetch",
        }
    }

    /// Outbound calls go through the cache and the rate limiter.
    pub fn is_outbound(&self) -> bool {
        matches!(self, OperationKind::Fetch)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "command" | "exec" | "shell" => Ok(OperationKind::Command),
            "file_read" | "fileread" | "read" => Ok(OperationKind::FileRead),
            "file_write" | "filewrite" | "write" => Ok(OperationKind::FileWrite),
            "fetch" | "http" => Ok(OperationKind::Fetch),
            other => Err(GateError::InvalidInput(format!(
                "Unknown operation kind '{other}'"
            ))),
        }
    }
}

/// A single request from the tool dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub kind: OperationKind,

    /// Command line, file path, or URL depending on `kind`.
    pub target: String,

    /// Kind-specific arguments (`content`, `cwd`, `method`, `headers`, ...).
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,

    /// Hard wall-clock limit for the execution step.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Who asked, if the dispatcher knows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            args: serde_json::Map::new(),
            timeout: Duration::from_secs(30),
            user: None,
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn with_args(mut self, args: serde_json::Map<String, serde_json::Value>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// String argument lookup.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }
}

/// What a completed operation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationOutput {
    /// Text returned to the caller (stdout, file content, response body).
    pub content: String,

    /// Process exit code or HTTP status, when meaningful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,

    /// Size of the underlying payload in bytes.
    pub bytes: u64,

    /// Served from the response cache.
    #[serde(default)]
    pub cached: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl OperationOutput {
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            bytes: content.len() as u64,
            content,
            status: None,
            cached: false,
            data: None,
        }
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The structured refusal handed back across the tool boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Denial {
    pub allowed: bool,
    pub reason: String,
    pub kind: ErrorKind,
}

impl Denial {
    pub fn from_error(err: &GateError) -> Self {
        Self {
            allowed: false,
            reason: err.to_string(),
            kind: err.kind(),
        }
    }
}

/// Terminal result of one gateway request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed { output: OperationOutput },
    Rejected { denial: Denial },
    Throttled {
        resource: String,
        #[serde(with = "duration_millis")]
        retry_after: Duration,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
}

impl Outcome {
    /// Classify an error into the matching terminal outcome.
    pub fn from_error(err: GateError) -> Self {
        match err {
            GateError::RateLimited {
                resource,
                retry_after,
            } => Outcome::Throttled {
                resource,
                retry_after,
            },
            ref e if e.is_policy_violation() => Outcome::Rejected {
                denial: Denial::from_error(e),
            },
            GateError::Execution { reason, output } => Outcome::Failed {
                kind: ErrorKind::ExecutionError,
                message: reason,
                output,
            },
            other => Outcome::Failed {
                kind: other.kind(),
                message: other.to_string(),
                output: None,
            },
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }

    pub fn output(&self) -> Option<&OperationOutput> {
        match self {
            Outcome::Completed { output } => Some(output),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Completed { .. } => None,
            Outcome::Rejected { denial } => Some(denial.kind),
            Outcome::Throttled { .. } => Some(ErrorKind::RateLimited),
            Outcome::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// Serialize `Duration` as whole milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
