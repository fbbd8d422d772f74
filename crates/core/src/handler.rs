//! Operation handlers and the registry the gateway dispatches through.
//!
//! Each operation kind has exactly one handler. A handler splits its work in
//! two: `admit` runs the guards and decides, `execute` performs the side
//! effect. The gateway never calls `execute` without a prior successful
//! `admit` on the same request.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{GateError, Result};
use crate::operation::{OperationKind, OperationOutput, OperationRequest};

/// A request that passed every guard for its kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub kind: OperationKind,

    /// Canonical target: resolved path, parsed URL, or the verb.
    pub target: String,

    /// Validated argument vector (commands only).
    pub argv: Vec<String>,

    /// Rate-limit bucket key (outbound calls only).
    pub rate_key: Option<String>,

    /// Response cache fingerprint (idempotent outbound calls only).
    pub cache_key: Option<String>,

    /// Tokens consumed from the bucket.
    pub cost: f64,

    /// Extra facts worth recording in the audit trail.
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl Admission {
    pub fn new(kind: OperationKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            argv: Vec::new(),
            rate_key: None,
            cache_key: None,
            cost: 1.0,
            details: serde_json::Map::new(),
        }
    }

    pub fn with_argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    pub fn with_rate_key(mut self, key: impl Into<String>, cost: f64) -> Self {
        self.rate_key = Some(key.into());
        self.cost = cost;
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// The core handler trait.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// The kind this handler serves.
    fn kind(&self) -> OperationKind;

    /// Run the guards for this kind. Must not write, spawn, or send anything.
    async fn admit(&self, request: &OperationRequest) -> Result<Admission>;

    /// Perform the admitted operation within `timeout`.
    async fn execute(
        &self,
        request: &OperationRequest,
        admission: &Admission,
        timeout: Duration,
    ) -> Result<OperationOutput>;
}

/// A registry of handlers, keyed by operation kind.
pub struct HandlerRegistry {
    handlers: HashMap<OperationKind, Box<dyn OperationHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. Replaces any existing handler for the same kind.
    pub fn register(&mut self, handler: Box<dyn OperationHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: OperationKind) -> Option<&dyn OperationHandler> {
        self.handlers.get(&kind).map(|h| h.as_ref())
    }

    /// Look up a handler, failing with `Unsupported` when none is registered.
    pub fn require(&self, kind: OperationKind) -> Result<&dyn OperationHandler> {
        self.get(kind)
            .ok_or_else(|| GateError::Unsupported(kind.as_str().to_string()))
    }

    /// Registered kinds, in declaration order.
    pub fn kinds(&self) -> Vec<OperationKind> {
        OperationKind::ALL
            .iter()
            .copied()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
