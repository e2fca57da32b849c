//! Pre-flight validation
//!
//! Confirms the domain resolves to an IPv4 address before any issuance is
//! attempted, and compares that address with the machine's public IP. The
//! check is advisory: it exists to avoid a doomed challenge, not to enforce
//! policy.

use async_trait::async_trait;
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::OrchestratorError;

/// Resolves `A` records
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// First IPv4 address of `domain`, `None` when no record exists.
    /// Lookup failures other than "no records" are returned as text.
    async fn resolve_a(&self, domain: &str) -> Result<Option<Ipv4Addr>, String>;
}

/// Resolver using the host's `/etc/resolv.conf`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve_a(&self, domain: &str) -> Result<Option<Ipv4Addr>, String> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| format!("failed to create DNS resolver: {}", e))?;

        match resolver.ipv4_lookup(domain).await {
            Ok(lookup) => Ok(lookup.iter().next().map(|a| a.0)),
            Err(err) => {
                let ResolveErrorKind::NoRecordsFound { .. } = err.kind() else {
                    return Err(err.to_string());
                };
                Ok(None)
            }
        }
    }
}

/// Reports this machine's public IPv4 address
#[async_trait]
pub trait PublicIpSource: Send + Sync {
    async fn public_ipv4(&self) -> Result<Ipv4Addr, String>;
}

const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(10);

/// Asks an echo service such as `https://api.ipify.org` for the address
#[derive(Debug, Clone)]
pub struct HttpPublicIp {
    client: reqwest::Client,
    url: String,
}

impl HttpPublicIp {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PublicIpSource for HttpPublicIp {
    async fn public_ipv4(&self) -> Result<Ipv4Addr, String> {
        let response = self
            .client
            .get(&self.url)
            .timeout(PUBLIC_IP_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("public IP lookup via {} failed: {}", self.url, e))?;

        let body = response
            .text()
            .await
            .map_err(|e| format!("public IP lookup via {} failed: {}", self.url, e))?;

        body.trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| format!("{} returned '{}', not an IPv4 address", self.url, body.trim()))
    }
}

/// Outcome of a successful pre-flight check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightReport {
    pub domain: String,
    pub resolved: Ipv4Addr,
    /// `None` when the public IP could not be determined or was not asked for
    pub public: Option<Ipv4Addr>,
    pub warnings: Vec<String>,
}

impl PreflightReport {
    pub fn ip_matches(&self) -> Option<bool> {
        self.public.map(|public| public == self.resolved)
    }
}

/// Pre-flight validator
pub struct PreflightValidator {
    resolver: Arc<dyn DnsResolver>,
    public_ip: Option<Arc<dyn PublicIpSource>>,
    allow_ip_mismatch: bool,
}

impl PreflightValidator {
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            resolver,
            public_ip: None,
            allow_ip_mismatch: false,
        }
    }

    pub fn with_public_ip(mut self, source: Arc<dyn PublicIpSource>) -> Self {
        self.public_ip = Some(source);
        self
    }

    pub fn allow_ip_mismatch(mut self, allow: bool) -> Self {
        self.allow_ip_mismatch = allow;
        self
    }

    /// Resolve `domain` and compare it with the public IP.
    ///
    /// Touches no files. Fails with `DomainUnresolved` when there is no
    /// address, and with `DomainIpMismatch` when the addresses differ and
    /// mismatches are not allowed. A failed public IP lookup only warns.
    pub async fn validate(&self, domain: &str) -> Result<PreflightReport, OrchestratorError> {
        debug!(domain = %domain, "Resolving domain");

        let resolved = match self.resolver.resolve_a(domain).await {
            Ok(Some(ip)) => ip,
            Ok(None) => {
                return Err(OrchestratorError::DomainUnresolved {
                    domain: domain.to_string(),
                    detail: "no A record found".to_string(),
                })
            }
            Err(detail) => {
                return Err(OrchestratorError::DomainUnresolved {
                    domain: domain.to_string(),
                    detail,
                })
            }
        };
        info!(domain = %domain, ip = %resolved, "Domain resolves");

        let mut report = PreflightReport {
            domain: domain.to_string(),
            resolved,
            public: None,
            warnings: Vec::new(),
        };

        let Some(ref source) = self.public_ip else {
            return Ok(report);
        };

        match source.public_ipv4().await {
            Ok(public) => {
                report.public = Some(public);
                if public != resolved {
                    if !self.allow_ip_mismatch {
                        return Err(OrchestratorError::DomainIpMismatch {
                            domain: domain.to_string(),
                            resolved,
                            public,
                        });
                    }
                    let message = format!(
                        "{} resolves to {} but this server's public IP is {}; continuing because IP mismatches are allowed",
                        domain, resolved, public
                    );
                    warn!(domain = %domain, resolved = %resolved, public = %public, "Domain IP mismatch allowed");
                    report.warnings.push(message);
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not determine public IP, skipping IP comparison");
                report
                    .warnings
                    .push(format!("could not determine public IP: {}", e));
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticResolver(Result<Option<Ipv4Addr>, String>);

    #[async_trait]
    impl DnsResolver for StaticResolver {
        async fn resolve_a(&self, _: &str) -> Result<Option<Ipv4Addr>, String> {
            self.0.clone()
        }
    }

    struct StaticPublicIp(Result<Ipv4Addr, String>);

    #[async_trait]
    impl PublicIpSource for StaticPublicIp {
        async fn public_ipv4(&self) -> Result<Ipv4Addr, String> {
            self.0.clone()
        }
    }

    const SERVER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);
    const OTHER: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

    fn validator(
        resolved: Result<Option<Ipv4Addr>, String>,
        public: Result<Ipv4Addr, String>,
    ) -> PreflightValidator {
        PreflightValidator::new(Arc::new(StaticResolver(resolved)))
            .with_public_ip(Arc::new(StaticPublicIp(public)))
    }

    #[tokio::test]
    async fn test_matching_ip_has_no_warnings() {
        let report = validator(Ok(Some(SERVER)), Ok(SERVER))
            .validate("example.com")
            .await
            .unwrap();
        assert_eq!(report.resolved, SERVER);
        assert_eq!(report.ip_matches(), Some(true));
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_no_record_is_unresolved() {
        let err = validator(Ok(None), Ok(SERVER))
            .validate("missing.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DomainUnresolved { .. }));
        assert_eq!(err.exit_code(), 10);
    }

    #[tokio::test]
    async fn test_lookup_error_is_unresolved() {
        let err = validator(Err("SERVFAIL".to_string()), Ok(SERVER))
            .validate("example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DomainUnresolved { ref detail, .. } if detail == "SERVFAIL"));
    }

    #[tokio::test]
    async fn test_mismatch_rejected_by_default() {
        let err = validator(Ok(Some(SERVER)), Ok(OTHER))
            .validate("example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DomainIpMismatch { .. }));
        assert_eq!(err.exit_code(), 11);
    }

    #[tokio::test]
    async fn test_mismatch_allowed_warns() {
        let report = validator(Ok(Some(SERVER)), Ok(OTHER))
            .allow_ip_mismatch(true)
            .validate("example.com")
            .await
            .unwrap();
        assert_eq!(report.ip_matches(), Some(false));
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_public_ip_failure_is_non_fatal() {
        let report = validator(Ok(Some(SERVER)), Err("timeout".to_string()))
            .validate("example.com")
            .await
            .unwrap();
        assert_eq!(report.public, None);
        assert!(report.warnings[0].contains("timeout"));
    }

    #[tokio::test]
    async fn test_without_public_ip_source() {
        let report = PreflightValidator::new(Arc::new(StaticResolver(Ok(Some(SERVER)))))
            .validate("example.com")
            .await
            .unwrap();
        assert_eq!(report.ip_matches(), None);
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_http_public_ip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("203.0.113.9\n"))
            .mount(&server)
            .await;

        let source = HttpPublicIp::new(reqwest::Client::new(), server.uri());
        assert_eq!(source.public_ipv4().await.unwrap(), SERVER);
    }

    #[tokio::test]
    async fn test_http_public_ip_garbage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let source = HttpPublicIp::new(reqwest::Client::new(), server.uri());
        assert!(source.public_ipv4().await.unwrap_err().contains("not an IPv4 address"));
    }
}
