//! The toolgate policy-enforcement gateway.
//!
//! [`Gateway`] is the single entry point for privileged operations. Every
//! request is validated by its handler, passes the response cache and rate
//! limiter when it leaves the machine, runs under a hard timeout, and ends
//! with exactly one audit event.
//!
//! The active configuration and the handlers built from it live in one
//! immutable snapshot behind an [`ArcSwap`], so a reload never changes the
//! policy under a request that is already in flight.

pub mod cache;
pub mod rate_limit;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use toolgate_config::{ConfigError, SecurityConfig};
use toolgate_core::{
    Admission, GateError, GateState, HandlerRegistry, Lifecycle, OperationHandler, OperationKind,
    OperationOutput, OperationRequest, Outcome,
};
use toolgate_handlers::{Fetcher, ReqwestFetcher, default_registry};
use toolgate_security::secrets::{redact_url, scrub_value};
use toolgate_security::{AuditCategory, AuditError, AuditEvent, AuditLog, Severity, TracingSink};

pub use cache::ResponseCache;
pub use rate_limit::RateLimiter;

/// Errors raised while building or reconfiguring a [`Gateway`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("Failed to build HTTP client: {0}")]
    Client(GateError),
}

/// Everything a caller learns about one request.
#[derive(Debug, Clone, Serialize)]
pub struct GateResponse {
    pub request_id: String,
    pub outcome: Outcome,
    /// The event as it was (or would have been) written.
    pub audit: AuditEvent,
    pub states: Vec<GateState>,
}

type OutputCache = ResponseCache<OperationOutput>;

struct Snapshot {
    config: Arc<SecurityConfig>,
    registry: HandlerRegistry,
    caches: Mutex<HashMap<String, Arc<OutputCache>>>,
}

impl Snapshot {
    fn build(config: SecurityConfig, fetcher: Option<&Arc<dyn Fetcher>>) -> Result<Self, GatewayError> {
        let fetcher: Arc<dyn Fetcher> = match fetcher {
            Some(fetcher) => fetcher.clone(),
            None => Arc::new(ReqwestFetcher::new(&config.fetch).map_err(GatewayError::Client)?),
        };
        let registry = default_registry(&config, fetcher);
        Ok(Self {
            config: Arc::new(config),
            registry,
            caches: Mutex::new(HashMap::new()),
        })
    }

    fn cache_for(&self, resource: &str) -> Arc<OutputCache> {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        caches
            .entry(resource.to_string())
            .or_insert_with(|| {
                Arc::new(ResponseCache::new(
                    self.config.cache.ttl_for(resource),
                    self.config.cache.max_entries,
                ))
            })
            .clone()
    }
}

pub struct Gateway {
    snapshot: ArcSwap<Snapshot>,
    limiter: RateLimiter,
    audit: AuditLog,
    fetcher: Option<Arc<dyn Fetcher>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("limiter", &self.limiter)
            .field("audit", &self.audit)
            .field("custom_fetcher", &self.fetcher.is_some())
            .finish()
    }
}

impl Gateway {
    /// Build a gateway that fetches over the network with `reqwest`.
    pub fn new(config: SecurityConfig) -> Result<Self, GatewayError> {
        Self::build(config, None)
    }

    /// Build a gateway whose outbound calls go through `fetcher`. The
    /// fetcher survives reloads.
    pub fn with_fetcher(config: SecurityConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self, GatewayError> {
        Self::build(config, Some(fetcher))
    }

    fn build(config: SecurityConfig, fetcher: Option<Arc<dyn Fetcher>>) -> Result<Self, GatewayError> {
        config.validate()?;
        let audit = AuditLog::open(&config.audit)?.with_sink(Box::new(TracingSink));
        let limiter = RateLimiter::new(config.rate_limits.clone());
        let snapshot = Snapshot::build(config, fetcher.as_ref())?;

        info!(
            audit_log = %audit.path().display(),
            kinds = snapshot.registry.kinds().len(),
            "Gateway ready"
        );
        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            limiter,
            audit,
            fetcher,
        })
    }

    /// The configuration new requests are evaluated against.
    pub fn config(&self) -> Arc<SecurityConfig> {
        self.snapshot.load().config.clone()
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run one privileged operation under the active policy.
    ///
    /// Never fails as a call: denials, throttling and execution errors all
    /// come back as the response's [`Outcome`].
    pub async fn execute(
        &self,
        kind: OperationKind,
        target: impl Into<String>,
        args: serde_json::Map<String, Value>,
        timeout: Duration,
    ) -> GateResponse {
        let request = OperationRequest::new(kind, target)
            .with_args(args)
            .with_timeout(timeout);
        self.submit(request).await
    }

    /// Like [`Gateway::execute`], for a fully built request.
    pub async fn submit(&self, request: OperationRequest) -> GateResponse {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("gate", request_id = %request_id, kind = %request.kind);
        self.process(request, request_id).instrument(span).await
    }

    async fn process(&self, request: OperationRequest, request_id: String) -> GateResponse {
        let started = Instant::now();
        let snapshot = self.snapshot.load_full();
        let timeout = snapshot.config.limits.effective_timeout(request.timeout);
        let mut lifecycle = Lifecycle::new();

        let (result, admission) = run(&snapshot, &self.limiter, &request, &mut lifecycle, timeout).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(output) => info!(
                bytes = output.bytes,
                cached = output.cached,
                duration_ms = millis(elapsed),
                "Operation completed"
            ),
            Err(GateError::RateLimited { resource, retry_after }) => warn!(
                resource = %resource,
                retry_after_ms = millis(*retry_after),
                "Operation throttled"
            ),
            Err(e) if e.is_policy_violation() => warn!(reason = %e, "Operation rejected"),
            Err(e) => warn!(error = %e, duration_ms = millis(elapsed), "Operation failed"),
        }

        let mut event = audit_event(&request, &request_id, admission.as_ref(), &result, elapsed);
        if let Some(details) = event.details.as_mut() {
            scrub_value(details);
        }
        match self.audit.log(event.clone()) {
            Ok(_) => advance(&mut lifecycle, GateState::Audited),
            Err(e) => warn!(error = %e, "Failed to write audit event"),
        }

        let outcome = match result {
            Ok(output) => Outcome::Completed { output },
            Err(e) => Outcome::from_error(e),
        };
        GateResponse {
            request_id,
            outcome,
            audit: event,
            states: lifecycle.states().to_vec(),
        }
    }

    /// Swap in a new policy. Requests already in flight finish under the
    /// old one. Rate-limit buckets keep their tokens; cached responses are
    /// dropped. Audit storage settings apply on the next start.
    pub fn reload(&self, config: SecurityConfig) -> Result<(), GatewayError> {
        config.validate()?;
        let previous = self.config();
        if previous.audit != config.audit {
            warn!("Audit storage settings changed; they take effect on restart");
        }

        let details = json!({
            "allowed_commands": config.commands.allowed.keys().collect::<Vec<_>>(),
            "allowed_roots": config.paths.allowed_roots,
            "forbidden_paths": config.paths.forbidden_paths.len(),
            "allowed_endpoints": config.fetch.allowed_endpoints,
        });
        let rate_limits = config.rate_limits.clone();
        let snapshot = Snapshot::build(config, self.fetcher.as_ref())?;
        self.limiter.reconfigure(rate_limits);
        self.snapshot.store(Arc::new(snapshot));

        let event = AuditEvent::new(AuditCategory::ConfigChange, "reload", "security_config")
            .with_details(details);
        if let Err(e) = self.audit.log(event) {
            warn!(error = %e, "Failed to write audit event");
        }
        info!("Security configuration reloaded");
        Ok(())
    }

    /// Load `path` and [`reload`](Gateway::reload) it.
    pub fn reload_from(&self, path: &Path) -> Result<(), GatewayError> {
        self.reload(SecurityConfig::load_from(path)?)
    }

    /// Sweep expired entries from every response cache.
    pub fn cleanup_caches(&self) -> usize {
        let snapshot = self.snapshot.load();
        let caches: Vec<Arc<OutputCache>> = snapshot
            .caches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let removed: usize = caches.iter().map(|c| c.cleanup()).sum();
        debug!(removed, "Swept response caches");
        removed
    }
}

fn advance(lifecycle: &mut Lifecycle, next: GateState) {
    if let Err(e) = lifecycle.advance(next) {
        error!(error = %e, "Lifecycle out of order");
    }
}

async fn run(
    snapshot: &Snapshot,
    limiter: &RateLimiter,
    request: &OperationRequest,
    lifecycle: &mut Lifecycle,
    timeout: Duration,
) -> (Result<OperationOutput, GateError>, Option<Admission>) {
    advance(lifecycle, GateState::Validating);
    let admitted = match snapshot.registry.require(request.kind) {
        Ok(handler) => handler.admit(request).await.map(|admission| (handler, admission)),
        Err(e) => Err(e),
    };
    let (handler, admission) = match admitted {
        Ok(pair) => pair,
        Err(e) => {
            advance(lifecycle, GateState::Rejected);
            return (Err(e), None);
        }
    };
    advance(lifecycle, GateState::Admitted);

    let result = dispatch(snapshot, limiter, handler, request, &admission, lifecycle, timeout).await;
    (result, Some(admission))
}

async fn dispatch(
    snapshot: &Snapshot,
    limiter: &RateLimiter,
    handler: &dyn OperationHandler,
    request: &OperationRequest,
    admission: &Admission,
    lifecycle: &mut Lifecycle,
    timeout: Duration,
) -> Result<OperationOutput, GateError> {
    let resource = admission.rate_key.as_deref().unwrap_or(request.kind.as_str());

    let cache = match &admission.cache_key {
        Some(key) => {
            advance(lifecycle, GateState::CacheCheck);
            let cache = snapshot.cache_for(resource);
            if let Some(mut hit) = cache.get(key) {
                advance(lifecycle, GateState::CacheHit);
                advance(lifecycle, GateState::Completed);
                debug!(resource, "Served from cache");
                hit.cached = true;
                return Ok(hit);
            }
            Some((cache, key))
        }
        None => None,
    };

    if let Some(key) = &admission.rate_key {
        advance(lifecycle, GateState::RateLimitCheck);
        if let Err(e) = limiter.try_acquire(key, admission.cost) {
            advance(lifecycle, GateState::Throttled);
            return Err(e);
        }
    }

    advance(lifecycle, GateState::Executing);
    let result = tokio::time::timeout(timeout, handler.execute(request, admission, timeout))
        .await
        .unwrap_or(Err(GateError::Timeout { after: timeout }));

    match &result {
        Ok(output) => {
            advance(lifecycle, GateState::Completed);
            if let Some((cache, key)) = cache
                && output.status.is_none_or(|status| status < 400)
            {
                cache.set(key.clone(), output.clone());
            }
        }
        Err(_) => advance(lifecycle, GateState::Failed),
    }
    result
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn category_for(kind: OperationKind) -> AuditCategory {
    match kind {
        OperationKind::Command => AuditCategory::CommandExec,
        OperationKind::FileRead => AuditCategory::FileRead,
        OperationKind::FileWrite => AuditCategory::FileWrite,
        OperationKind::Fetch => AuditCategory::ApiCall,
    }
}

fn action_for(request: &OperationRequest) -> String {
    match request.kind {
        OperationKind::Command => "exec".into(),
        OperationKind::FileRead => "read".into(),
        OperationKind::FileWrite => match request.arg_str("mode") {
            Some("append") => "append".into(),
            _ => "write".into(),
        },
        OperationKind::Fetch => request.arg_str("method").unwrap_or("GET").to_uppercase(),
    }
}

fn audit_event(
    request: &OperationRequest,
    request_id: &str,
    admission: Option<&Admission>,
    result: &Result<OperationOutput, GateError>,
    elapsed: Duration,
) -> AuditEvent {
    let target = admission.map_or(request.target.as_str(), |a| a.target.as_str());
    let resource = match request.kind {
        OperationKind::Fetch => redact_url(target),
        _ => target.to_string(),
    };
    let category = category_for(request.kind);

    let mut details = serde_json::Map::new();
    details.insert("request_id".into(), json!(request_id));
    details.insert("kind".into(), json!(request.kind.as_str()));
    details.insert("duration_ms".into(), json!(millis(elapsed)));
    if let Some(admission) = admission {
        details.extend(admission.details.clone());
        if let Some(key) = &admission.rate_key {
            details.insert("rate_key".into(), json!(key));
            details.insert("cost".into(), json!(admission.cost));
        }
    }

    let event = match result {
        Ok(output) => {
            details.insert("bytes".into(), json!(output.bytes));
            if let Some(status) = output.status {
                details.insert("status".into(), json!(status));
            }
            if output.cached {
                details.insert("cached".into(), json!(true));
            }
            AuditEvent::new(category, action_for(request), resource)
        }
        Err(err) => {
            details.insert("error_kind".into(), json!(err.kind().as_str()));
            details.insert("reason".into(), json!(err.to_string()));
            if let GateError::RateLimited { retry_after, .. } = err {
                details.insert("retry_after_ms".into(), json!(millis(*retry_after)));
            }
            let (category, severity) = match err {
                GateError::AccessDenied(_) => (AuditCategory::AccessDenied, Severity::Warning),
                GateError::InvalidInput(_) | GateError::Unsupported(_) => (AuditCategory::Error, Severity::Warning),
                GateError::RateLimited { .. } | GateError::SizeExceeded { .. } => (category, Severity::Warning),
                GateError::Timeout { .. } | GateError::Execution { .. } => (category, Severity::Error),
            };
            AuditEvent::new(category, action_for(request), resource).failed(severity)
        }
    };

    event
        .with_user(request.user.clone())
        .with_details(Value::Object(details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use toolgate_config::BucketConfig;
    use toolgate_core::ErrorKind;
    use toolgate_handlers::{FetchRequest, FetchResponse};
    use toolgate_security::{AuditQuery, AuditResult};

    struct ScriptedFetcher {
        status: u16,
        body: String,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(status: u16, body: &str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: body.into(),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                status: 200,
                body: "late".into(),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, request: &FetchRequest) -> toolgate_core::Result<FetchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(FetchResponse {
                status: self.status,
                headers: BTreeMap::new(),
                body: self.body.clone(),
                final_url: request.url.to_string(),
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
        config: SecurityConfig,
    }

    fn fixture(capacity: f64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspace");
        std::fs::create_dir_all(&root).unwrap();

        let mut config = SecurityConfig::default();
        config.paths.allowed_roots = vec![root.to_string_lossy().into_owned()];
        config.fetch.resolve_dns = false;
        config.audit.dir = dir.path().join("audit");
        config.rate_limits.default = BucketConfig {
            capacity,
            refill_per_second: 0.0,
        };
        Fixture {
            _dir: dir,
            root,
            config,
        }
    }

    fn gateway(fx: &Fixture, fetcher: Arc<ScriptedFetcher>) -> Gateway {
        Gateway::with_fetcher(fx.config.clone(), fetcher).unwrap()
    }

    fn all_events(gw: &Gateway) -> Vec<AuditEvent> {
        gw.audit_log().search(&AuditQuery::default()).unwrap()
    }

    fn args(pairs: &[(&str, &str)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn destructive_command_rejected_with_one_audit_event() {
        let fx = fixture(10.0);
        let gw = gateway(&fx, ScriptedFetcher::new(200, "ok"));

        let resp = gw
            .execute(OperationKind::Command, "rm -rf /", Default::default(), TIMEOUT)
            .await;

        assert_eq!(resp.outcome.error_kind(), Some(ErrorKind::AccessDenied));
        assert_eq!(
            resp.states,
            vec![
                GateState::Received,
                GateState::Validating,
                GateState::Rejected,
                GateState::Audited
            ]
        );
        let events = all_events(&gw);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, AuditCategory::AccessDenied);
        assert_eq!(events[0].result, AuditResult::Failure);
        assert_eq!(events[0].severity, Severity::Warning);
        assert_eq!(events[0], resp.audit);
    }

    #[tokio::test]
    async fn allowed_command_runs_in_root() {
        let fx = fixture(10.0);
        let gw = gateway(&fx, ScriptedFetcher::new(200, "ok"));
        let resp = gw
            .execute(OperationKind::Command, "echo hello", Default::default(), TIMEOUT)
            .await;
        let output = resp.outcome.output().expect("completed");
        assert_eq!(output.content.trim(), "hello");
        assert_eq!(resp.audit.category, AuditCategory::CommandExec);
        assert_eq!(resp.audit.result, AuditResult::Success);
        assert_eq!(
            resp.states,
            vec![
                GateState::Received,
                GateState::Validating,
                GateState::Admitted,
                GateState::Executing,
                GateState::Completed,
                GateState::Audited
            ]
        );
    }

    #[tokio::test]
    async fn system_file_read_rejected() {
        let fx = fixture(10.0);
        let gw = gateway(&fx, ScriptedFetcher::new(200, "ok"));
        let resp = gw
            .execute(OperationKind::FileRead, "/etc/passwd", Default::default(), TIMEOUT)
            .await;
        assert_eq!(resp.outcome.error_kind(), Some(ErrorKind::AccessDenied));
        assert_eq!(resp.audit.category, AuditCategory::AccessDenied);
        assert_eq!(resp.audit.resource, "/etc/passwd");
    }

    #[tokio::test]
    async fn write_then_read_inside_root() {
        let fx = fixture(10.0);
        let gw = gateway(&fx, ScriptedFetcher::new(200, "ok"));

        let resp = gw
            .execute(
                OperationKind::FileWrite,
                "notes/today.md",
                args(&[("content", "remember the milk")]),
                TIMEOUT,
            )
            .await;
        assert!(resp.outcome.is_completed(), "{:?}", resp.outcome);
        assert_eq!(resp.audit.category, AuditCategory::FileWrite);

        let resp = gw
            .execute(OperationKind::FileRead, "notes/today.md", Default::default(), TIMEOUT)
            .await;
        assert_eq!(resp.outcome.output().unwrap().content, "remember the milk");
        assert!(fx.root.join("notes/today.md").exists());
    }

    #[tokio::test]
    async fn loopback_fetch_rejected_without_network() {
        let fx = fixture(10.0);
        let fetcher = ScriptedFetcher::new(200, "ok");
        let gw = gateway(&fx, fetcher.clone());
        let resp = gw
            .execute(OperationKind::Fetch, "http://127.0.0.1:8080/admin", Default::default(), TIMEOUT)
            .await;
        assert_eq!(resp.outcome.error_kind(), Some(ErrorKind::AccessDenied));
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(gw.rate_limiter().tokens("127.0.0.1"), None);
    }

    #[tokio::test]
    async fn repeated_get_is_served_from_cache() {
        let fx = fixture(10.0);
        let fetcher = ScriptedFetcher::new(200, "{\"items\":[]}");
        let gw = gateway(&fx, fetcher.clone());

        let first = gw
            .execute(OperationKind::Fetch, "https://api.example.com/items", Default::default(), TIMEOUT)
            .await;
        assert!(!first.outcome.output().unwrap().cached);

        let second = gw
            .execute(OperationKind::Fetch, "https://api.example.com/items", Default::default(), TIMEOUT)
            .await;
        let output = second.outcome.output().unwrap();
        assert!(output.cached);
        assert_eq!(output.content, "{\"items\":[]}");
        assert!(second.states.contains(&GateState::CacheHit));
        assert_eq!(second.audit.details.as_ref().unwrap()["cached"], true);

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(gw.rate_limiter().tokens("api.example.com"), Some(9.0));
    }

    #[tokio::test]
    async fn error_statuses_are_not_cached() {
        let fx = fixture(10.0);
        let fetcher = ScriptedFetcher::new(503, "busy");
        let gw = gateway(&fx, fetcher.clone());
        for _ in 0..2 {
            let resp = gw
                .execute(OperationKind::Fetch, "https://api.example.com/items", Default::default(), TIMEOUT)
                .await;
            assert_eq!(resp.outcome.output().unwrap().status, Some(503));
        }
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn throttled_after_capacity() {
        let fx = fixture(3.0);
        let fetcher = ScriptedFetcher::new(200, "ok");
        let gw = gateway(&fx, fetcher.clone());
        let post = || args(&[("method", "POST"), ("body", "{}")]);

        for _ in 0..3 {
            let resp = gw
                .execute(OperationKind::Fetch, "https://api.example.com/jobs", post(), TIMEOUT)
                .await;
            assert!(resp.outcome.is_completed(), "{:?}", resp.outcome);
        }
        let resp = gw
            .execute(OperationKind::Fetch, "https://api.example.com/jobs", post(), TIMEOUT)
            .await;
        match &resp.outcome {
            Outcome::Throttled { resource, retry_after } => {
                assert_eq!(resource, "api.example.com");
                assert_eq!(*retry_after, Duration::MAX);
            }
            other => panic!("expected Throttled, got {other:?}"),
        }
        assert_eq!(resp.states.last(), Some(&GateState::Audited));
        assert!(resp.states.contains(&GateState::Throttled));
        assert_eq!(resp.audit.category, AuditCategory::ApiCall);
        assert_eq!(resp.audit.action, "POST");
        assert!(resp.audit.is_failure());
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn invented_resource_names_do_not_mint_buckets() {
        let fx = fixture(1.0);
        let fetcher = ScriptedFetcher::new(200, "ok");
        let gw = gateway(&fx, fetcher.clone());

        let mut completed = 0;
        for i in 0..5 {
            let resp = gw
                .execute(
                    OperationKind::Fetch,
                    "https://api.example.com/x",
                    args(&[("method", "POST"), ("resource", format!("r{i}").as_str())]),
                    TIMEOUT,
                )
                .await;
            assert_eq!(resp.outcome.error_kind(), Some(ErrorKind::InvalidInput), "{:?}", resp.outcome);
        }
        for _ in 0..5 {
            let resp = gw
                .execute(OperationKind::Fetch, "https://api.example.com/x", args(&[("method", "POST")]), TIMEOUT)
                .await;
            if resp.outcome.is_completed() {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(gw.rate_limiter().len(), 1);
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let fx = fixture(10.0);
        let gw = gateway(&fx, ScriptedFetcher::slow(Duration::from_secs(5)));
        let resp = gw
            .execute(
                OperationKind::Fetch,
                "https://api.example.com/slow",
                Default::default(),
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(resp.outcome.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(resp.audit.category, AuditCategory::ApiCall);
        assert_eq!(resp.audit.severity, Severity::Error);
        assert!(resp.states.contains(&GateState::Failed));
    }

    #[tokio::test]
    async fn invalid_input_is_audited_as_error() {
        let fx = fixture(10.0);
        let gw = gateway(&fx, ScriptedFetcher::new(200, "ok"));
        let resp = gw
            .execute(OperationKind::FileWrite, "x.txt", Default::default(), TIMEOUT)
            .await;
        assert_eq!(resp.outcome.error_kind(), Some(ErrorKind::InvalidInput));
        assert_eq!(resp.audit.category, AuditCategory::Error);
    }

    #[tokio::test]
    async fn secrets_in_arguments_never_reach_the_audit_log() {
        let fx = fixture(10.0);
        let gw = gateway(&fx, ScriptedFetcher::new(200, "ok"));
        let mut headers = serde_json::Map::new();
        headers.insert("Authorization".into(), json!("Bearer sk-abcdefghijklmnopqrstuvwxyz"));
        let mut request_args = serde_json::Map::new();
        request_args.insert("headers".into(), Value::Object(headers));
        gw.execute(OperationKind::Fetch, "https://api.example.com/me", request_args, TIMEOUT)
            .await;

        let raw = std::fs::read_to_string(gw.audit_log().path()).unwrap();
        assert!(!raw.contains("sk-abcdefghijklmnopqrstuvwxyz"));
    }

    #[tokio::test]
    async fn query_credentials_are_redacted_from_the_audit_resource() {
        let fx = fixture(10.0);
        let gw = gateway(&fx, ScriptedFetcher::new(200, "ok"));
        let resp = gw
            .execute(
                OperationKind::Fetch,
                "https://api.example.com/items?api_key=live-secret-123&page=2",
                Default::default(),
                TIMEOUT,
            )
            .await;
        assert!(resp.outcome.is_completed(), "{:?}", resp.outcome);
        assert!(resp.audit.resource.contains("page=2"));
        assert!(!resp.audit.resource.contains("live-secret-123"));

        let denied = gw
            .execute(
                OperationKind::Fetch,
                "http://127.0.0.1/admin?token=loopback-secret-456",
                Default::default(),
                TIMEOUT,
            )
            .await;
        assert_eq!(denied.outcome.error_kind(), Some(ErrorKind::AccessDenied));

        let raw = std::fs::read_to_string(gw.audit_log().path()).unwrap();
        assert!(!raw.contains("live-secret-123"));
        assert!(!raw.contains("loopback-secret-456"));
    }

    #[tokio::test]
    async fn user_is_recorded() {
        let fx = fixture(10.0);
        let gw = gateway(&fx, ScriptedFetcher::new(200, "ok"));
        let resp = gw
            .submit(OperationRequest::new(OperationKind::Command, "pwd").with_user("agent-7"))
            .await;
        assert_eq!(resp.audit.user.as_deref(), Some("agent-7"));
        let found = gw
            .audit_log()
            .search(&AuditQuery {
                user: Some("agent-7".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn reload_swaps_policy_and_audits_change() {
        let fx = fixture(10.0);
        let gw = gateway(&fx, ScriptedFetcher::new(200, "ok"));
        std::fs::create_dir_all(fx.root.join("private")).unwrap();
        std::fs::write(fx.root.join("private/plan.txt"), "plan").unwrap();

        let resp = gw
            .execute(OperationKind::FileRead, "private/plan.txt", Default::default(), TIMEOUT)
            .await;
        assert!(resp.outcome.is_completed());

        let mut tightened = fx.config.clone();
        tightened
            .paths
            .forbidden_paths
            .push(fx.root.join("private").to_string_lossy().into_owned());
        gw.reload(tightened).unwrap();

        let resp = gw
            .execute(OperationKind::FileRead, "private/plan.txt", Default::default(), TIMEOUT)
            .await;
        assert_eq!(resp.outcome.error_kind(), Some(ErrorKind::AccessDenied));

        let changes = gw
            .audit_log()
            .search(&AuditQuery {
                category: Some(AuditCategory::ConfigChange),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, "reload");
    }

    #[tokio::test]
    async fn invalid_reload_keeps_current_policy() {
        let fx = fixture(10.0);
        let gw = gateway(&fx, ScriptedFetcher::new(200, "ok"));
        let mut broken = fx.config.clone();
        broken.cache.max_entries = 0;
        assert!(matches!(gw.reload(broken), Err(GatewayError::Config(_))));
        assert_eq!(*gw.config(), fx.config);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_bucket() {
        let fx = fixture(5.0);
        let fetcher = ScriptedFetcher::new(200, "ok");
        let gw = Arc::new(gateway(&fx, fetcher.clone()));

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let gw = gw.clone();
                tokio::spawn(async move {
                    gw.execute(
                        OperationKind::Fetch,
                        format!("https://api.example.com/items/{i}"),
                        args(&[("method", "POST")]),
                        TIMEOUT,
                    )
                    .await
                })
            })
            .collect();

        let mut completed = 0;
        for task in tasks {
            if task.await.unwrap().outcome.is_completed() {
                completed += 1;
            }
        }
        assert_eq!(completed, 5);
        assert_eq!(fetcher.calls(), 5);
        assert_eq!(all_events(&gw).len(), 12);
    }

    #[tokio::test]
    async fn cleanup_sweeps_expired_entries() {
        let mut fx = fixture(10.0);
        fx.config.cache.default_ttl_secs = 1;
        let gw = gateway(&fx, ScriptedFetcher::new(200, "ok"));
        gw.execute(OperationKind::Fetch, "https://api.example.com/a", Default::default(), TIMEOUT)
            .await;
        assert_eq!(gw.cleanup_caches(), 0);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(gw.cleanup_caches(), 1);
    }
}
