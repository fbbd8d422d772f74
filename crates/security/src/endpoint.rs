//! Endpoint validation: SSRF prevention for outbound fetches.
//!
//! Only `http`/`https` URLs are accepted, and the host may not be loopback,
//! unspecified, private (RFC 1918), link-local (cloud metadata), or an IPv6
//! equivalent. With DNS resolution enabled every resolved address is checked
//! as well, so a public name pointing at a private address is refused.
//!
//! Allowed endpoints are matched structurally: scheme, host and port must be
//! equal and the path must sit under the endpoint's path on a segment
//! boundary.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use toolgate_core::GateError;
use url::{Host, Url};

use crate::secrets::redact_url;

/// Error returned when URL validation fails.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UrlValidationError {
    #[error("Malformed URL '{url}': {reason}")]
    Malformed { url: String, reason: String },

    #[error("Scheme '{scheme}' is not allowed (http and https only)")]
    SchemeNotAllowed { scheme: String },

    #[error("URL has no host")]
    MissingHost,

    #[error("Request to private/internal host '{host}' blocked (SSRF prevention)")]
    PrivateHost { host: String },

    #[error("Host '{host}' resolves to private address {addr} (SSRF prevention)")]
    ResolvesToPrivate { host: String, addr: IpAddr },

    #[error("Host '{host}' is blocked")]
    BlockedHost { host: String },

    #[error("URL '{url}' is not in allowed endpoints ({count} configured)")]
    NotAllowlisted { url: String, count: usize },
}

impl From<UrlValidationError> for GateError {
    fn from(err: UrlValidationError) -> Self {
        match err {
            UrlValidationError::Malformed { .. } | UrlValidationError::MissingHost => {
                GateError::InvalidInput(err.to_string())
            }
            _ => GateError::AccessDenied(err.to_string()),
        }
    }
}

/// Validates outbound URLs.
#[derive(Debug, Clone)]
pub struct UrlGuard {
    /// Endpoints that may be fetched. `None` = any public host.
    allowed_endpoints: Option<Vec<Url>>,
    configured_endpoints: usize,
    blocked_hosts: Vec<String>,
    resolve_dns: bool,
}

impl Default for UrlGuard {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new(), true)
    }
}

impl UrlGuard {
    /// An empty endpoint list or a `"*"` entry allows any public host.
    /// Entries that do not parse as URLs never match anything.
    pub fn new(allowed_endpoints: Vec<String>, blocked_hosts: Vec<String>, resolve_dns: bool) -> Self {
        let configured_endpoints = allowed_endpoints.len();
        let unrestricted = allowed_endpoints.is_empty() || allowed_endpoints.iter().any(|e| e.trim() == "*");
        let allowed_endpoints = (!unrestricted).then(|| {
            allowed_endpoints
                .iter()
                .filter_map(|endpoint| match Url::parse(endpoint.trim()) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        tracing::warn!(endpoint = %endpoint, error = %e, "Ignoring unparseable allowed endpoint");
                        None
                    }
                })
                .collect()
        });
        Self {
            allowed_endpoints,
            configured_endpoints,
            blocked_hosts: blocked_hosts.into_iter().map(|h| h.to_lowercase()).collect(),
            resolve_dns,
        }
    }

    /// Literal validation: scheme, host pattern, endpoint allowlist.
    pub fn validate(&self, url: &str) -> Result<Url, UrlValidationError> {
        let parsed = Url::parse(url.trim()).map_err(|e| UrlValidationError::Malformed {
            url: redact_url(url),
            reason: e.to_string(),
        })?;
        self.check(&parsed)?;
        Ok(parsed)
    }

    /// Literal validation followed by resolve-then-check on every address.
    pub async fn validate_resolved(&self, url: &str) -> Result<Url, UrlValidationError> {
        let parsed = self.validate(url)?;
        if self.resolve_dns
            && let Some(Host::Domain(domain)) = parsed.host()
        {
            let port = parsed.port_or_known_default().unwrap_or(443);
            match tokio::net::lookup_host((domain, port)).await {
                Ok(addrs) => check_addrs(domain, addrs)?,
                // The fetch itself will fail and report it.
                Err(e) => tracing::debug!(host = %domain, error = %e, "DNS lookup failed during validation"),
            }
        }
        Ok(parsed)
    }

    /// Check an already-parsed URL (also used for each redirect hop).
    pub fn check(&self, url: &Url) -> Result<(), UrlValidationError> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(UrlValidationError::SchemeNotAllowed {
                    scheme: other.to_string(),
                });
            }
        }

        let host = url.host().ok_or(UrlValidationError::MissingHost)?;
        match host {
            Host::Domain(domain) => {
                let domain = domain.trim_end_matches('.').to_lowercase();
                if domain.is_empty() {
                    return Err(UrlValidationError::MissingHost);
                }
                if domain == "localhost" || domain.ends_with(".localhost") {
                    return Err(UrlValidationError::PrivateHost { host: domain });
                }
                if self
                    .blocked_hosts
                    .iter()
                    .any(|b| domain == *b || domain.ends_with(&format!(".{b}")))
                {
                    return Err(UrlValidationError::BlockedHost { host: domain });
                }
            }
            Host::Ipv4(ip) => {
                if is_private_ipv4(&ip) {
                    return Err(UrlValidationError::PrivateHost { host: ip.to_string() });
                }
            }
            Host::Ipv6(ip) => {
                if is_private_ipv6(&ip) {
                    return Err(UrlValidationError::PrivateHost { host: ip.to_string() });
                }
            }
        }

        if let Some(allowed) = &self.allowed_endpoints
            && !allowed.iter().any(|endpoint| endpoint_matches(endpoint, url))
        {
            return Err(UrlValidationError::NotAllowlisted {
                url: redact_url(url.as_str()),
                count: self.configured_endpoints,
            });
        }

        Ok(())
    }
}

fn endpoint_matches(endpoint: &Url, url: &Url) -> bool {
    if endpoint.scheme() != url.scheme()
        || endpoint.host() != url.host()
        || endpoint.port_or_known_default() != url.port_or_known_default()
    {
        return false;
    }
    let prefix = endpoint.path().trim_end_matches('/');
    let path = url.path();
    prefix.is_empty()
        || path == prefix
        || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

/// Refuse `host` if any of its resolved addresses is private.
pub fn check_addrs(
    host: &str,
    addrs: impl IntoIterator<Item = SocketAddr>,
) -> Result<(), UrlValidationError> {
    match addrs.into_iter().find(|addr| is_private_ip(&addr.ip())) {
        Some(addr) => Err(UrlValidationError::ResolvesToPrivate {
            host: host.to_string(),
            addr: addr.ip(),
        }),
        None => Ok(()),
    }
}

/// Check whether an IP address is loopback, private, link-local, or unspecified.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 0.0.0.0/8 "this network"
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..128).contains(&b))
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique-local fc00::/7
        || (first & 0xffc0) == 0xfe80 // link-local fe80::/10
        || ip.to_ipv4_mapped().is_some_and(|v4| is_private_ipv4(&v4))
}
