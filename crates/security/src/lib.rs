//! Security policies for toolgate: path containment, command allowlisting,
//! SSRF-safe URL validation, environment scrubbing and audit logging.
//!
//! Provides:
//! - **Paths**: canonicalization and root/forbidden-prefix checks
//! - **Commands**: verb allowlist with per-verb flags, metacharacter rejection
//! - **Endpoints**: scheme and private-address checks, optional DNS resolution
//! - **Environment**: filtered process environment for children and payloads
//! - **Secrets**: credential detection, scrubbing and leak masking
//! - **Audit logging**: rotating NDJSON trail with search and summaries

pub mod audit;
pub mod command;
pub mod endpoint;
pub mod env_filter;
pub mod path;
pub mod secrets;

pub use audit::{
    AuditCategory, AuditError, AuditEvent, AuditLog, AuditQuery, AuditResult, AuditSink,
    AuditSummary, Severity, TracingSink,
};
pub use command::{CommandValidationError, CommandValidator, ValidatedCommand};
pub use endpoint::{UrlGuard, UrlValidationError, check_addrs, is_private_ip};
pub use env_filter::{DropReason, EnvFilter};
pub use path::{PathAccess, PathGuard, PathValidationError};
