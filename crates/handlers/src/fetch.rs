//! Fetch handler: outbound HTTP through the URL guard.
//!
//! The network call itself sits behind the [`Fetcher`] trait so the gateway
//! can be driven without a network. [`ReqwestFetcher`] is the real client:
//! it re-validates every redirect hop, checks the addresses it connects to
//! and streams the body under a cap.

use std::collections::{BTreeMap, BTreeSet};
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use toolgate_config::{FetchConfig, SecurityConfig};
use toolgate_core::{Admission, GateError, OperationHandler, OperationKind, OperationOutput, OperationRequest, Result};
use toolgate_security::secrets::{mask_leaks, redact_url};
use toolgate_security::{EnvFilter, UrlGuard, UrlValidationError, check_addrs};

const METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE"];

/// A validated outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub method: String,
    pub url: Url,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// URL after redirects.
    pub final_url: String,
}

/// Performs the network call for an admitted fetch.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

type BoxError = Box<dyn StdError + Send + Sync>;

/// Resolver for the HTTP client that refuses names with a private address.
///
/// Every connection goes through it, redirect hops included, so the
/// addresses checked are the addresses used.
#[derive(Debug, Default)]
pub struct PublicOnlyResolver;

impl reqwest::dns::Resolve for PublicOnlyResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| Box::new(e) as BoxError)?
                .collect();
            if let Err(e) = check_addrs(&host, addrs.iter().copied()) {
                warn!(host = %host, error = %e, "Refusing connection to private address");
                return Err(Box::new(e) as BoxError);
            }
            Ok::<reqwest::dns::Addrs, BoxError>(Box::new(addrs.into_iter()))
        })
    }
}

/// `reqwest`-backed fetcher.
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let guard = UrlGuard::new(
            config.allowed_endpoints.clone(),
            config.blocked_hosts.clone(),
            config.resolve_dns,
        );
        let max_redirects = config.max_redirects;
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                return attempt.error(format!("too many redirects (max {max_redirects})"));
            }
            match guard.check(attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(e) => attempt.error(e),
            }
        });

        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(policy)
            .no_proxy();
        if config.resolve_dns {
            builder = builder.dns_resolver(Arc::new(PublicOnlyResolver));
        }
        let client = builder
            .build()
            .map_err(|e| GateError::execution(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

/// The resolver's refusal, if it is somewhere in `e`'s source chain.
fn address_refusal(e: &reqwest::Error) -> Option<&UrlValidationError> {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(refusal) = err.downcast_ref::<UrlValidationError>() {
            return Some(refusal);
        }
        if let Some(refusal) = err
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io.get_ref())
            .and_then(|inner| inner.downcast_ref::<UrlValidationError>())
        {
            return Some(refusal);
        }
        source = err.source();
    }
    None
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> GateError {
    if let Some(refusal) = address_refusal(&e) {
        GateError::AccessDenied(refusal.to_string())
    } else if e.is_timeout() {
        GateError::Timeout { after: timeout }
    } else if e.is_redirect() {
        GateError::AccessDenied(format!("Redirect refused: {e}"))
    } else if e.is_builder() {
        GateError::InvalidInput(e.to_string())
    } else {
        GateError::execution(e.to_string())
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| GateError::InvalidInput(format!("Invalid HTTP method: {e}")))?;

        let mut builder = self
            .client
            .request(method, request.url.clone())
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();

        if let Some(len) = response.content_length()
            && len > request.max_bytes
        {
            return Err(GateError::SizeExceeded {
                limit: request.max_bytes,
                actual: len,
            });
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_reqwest_error(e, request.timeout))?;
            let total = (body.len() + chunk.len()) as u64;
            if total > request.max_bytes {
                return Err(GateError::SizeExceeded {
                    limit: request.max_bytes,
                    actual: total,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
            final_url,
        })
    }
}

/// Cache fingerprint: SHA-256 over method, URL and sorted headers.
pub fn cache_key(method: &str, url: &Url, headers: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_str().as_bytes());
    for (name, value) in headers {
        hasher.update(b"\n");
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

pub struct FetchHandler {
    guard: UrlGuard,
    fetcher: Arc<dyn Fetcher>,
    env: EnvFilter,
    /// Named rate-limit classes a request may charge instead of its host.
    rate_classes: BTreeSet<String>,
    max_response_bytes: u64,
}

impl FetchHandler {
    pub fn new(config: &SecurityConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            guard: UrlGuard::new(
                config.fetch.allowed_endpoints.clone(),
                config.fetch.blocked_hosts.clone(),
                config.fetch.resolve_dns,
            ),
            fetcher,
            env: EnvFilter::new(&config.env),
            rate_classes: config.rate_limits.resources.keys().cloned().collect(),
            max_response_bytes: config.fetch.max_response_bytes,
        }
    }

    /// Bucket key for `url`: a configured class named by `args.resource`,
    /// otherwise the host.
    fn rate_key(&self, request: &OperationRequest, url: &Url) -> Result<String> {
        match request.arg_str("resource") {
            Some(resource) if self.rate_classes.contains(resource) => Ok(resource.to_string()),
            Some(resource) => Err(GateError::InvalidInput(format!(
                "Unknown rate-limit resource '{resource}'"
            ))),
            None => url
                .host_str()
                .map(str::to_lowercase)
                .ok_or_else(|| GateError::InvalidInput("URL has no host".into())),
        }
    }
}

fn method_arg(request: &OperationRequest) -> Result<String> {
    let method = request.arg_str("method").unwrap_or("GET").to_uppercase();
    if !METHODS.contains(&method.as_str()) {
        return Err(GateError::InvalidInput(format!(
            "Invalid HTTP method: {method}. Must be one of {}",
            METHODS.join(", ")
        )));
    }
    Ok(method)
}

fn headers_arg(request: &OperationRequest) -> Result<BTreeMap<String, String>> {
    let Some(value) = request.args.get("headers") else {
        return Ok(BTreeMap::new());
    };
    let object = value
        .as_object()
        .ok_or_else(|| GateError::InvalidInput("'headers' must be an object".into()))?;
    object
        .iter()
        .map(|(name, value)| {
            value
                .as_str()
                .map(|v| (name.to_lowercase(), v.to_string()))
                .ok_or_else(|| GateError::InvalidInput(format!("Header '{name}' must be a string")))
        })
        .collect()
}

fn cost_arg(request: &OperationRequest) -> Result<f64> {
    match request.args.get("cost") {
        None => Ok(1.0),
        Some(value) => value
            .as_f64()
            .filter(|c| c.is_finite() && *c > 0.0)
            .ok_or_else(|| GateError::InvalidInput("'cost' must be a positive number".into())),
    }
}

#[async_trait]
impl OperationHandler for FetchHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Fetch
    }

    async fn admit(&self, request: &OperationRequest) -> Result<Admission> {
        let method = method_arg(request)?;
        let headers = headers_arg(request)?;
        let cost = cost_arg(request)?;
        let url = self.guard.validate_resolved(&request.target).await?;

        let rate_key = self.rate_key(request, &url)?;

        let mut admission = Admission::new(OperationKind::Fetch, url.as_str())
            .with_rate_key(rate_key, cost)
            .with_detail("method", method.as_str());
        if method == "GET" {
            admission = admission.with_cache_key(cache_key(&method, &url, &headers));
        }
        Ok(admission)
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        admission: &Admission,
        timeout: Duration,
    ) -> Result<OperationOutput> {
        let url = Url::parse(&admission.target)
            .map_err(|e| GateError::InvalidInput(format!("Invalid admitted URL: {e}")))?;
        let fetch = FetchRequest {
            method: method_arg(request)?,
            url,
            headers: headers_arg(request)?,
            body: request.arg_str("body").map(str::to_string),
            timeout,
            max_bytes: self.max_response_bytes,
        };

        debug!(method = %fetch.method, url = %redact_url(fetch.url.as_str()), "Fetching");
        let response = tokio::time::timeout(timeout, self.fetcher.fetch(&fetch))
            .await
            .map_err(|_| GateError::Timeout { after: timeout })??;

        if response.status >= 400 {
            warn!(url = %redact_url(fetch.url.as_str()), status = response.status, "Fetch returned error status");
        }

        let body = mask_leaks(&response.body, &self.env.secret_values());
        let mut output = OperationOutput::text(body)
            .with_status(i32::from(response.status))
            .with_data(serde_json::json!({
                "status": response.status,
                "headers": response.headers,
                "url": response.final_url,
            }));
        output.bytes = response.body.len() as u64;
        Ok(output)
    }
}
