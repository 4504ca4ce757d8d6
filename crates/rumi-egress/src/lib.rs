// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-egress
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! `EgressBroker`: one Unix domain socket listener per approved Pack,
//! forwarding allowlisted HTTP requests out to the internet while enforcing
//! grant/domain/port/IP policy on every hop (§4.5).

pub mod policy;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rumi_error::{ErrorKind, RumiError};
use rumi_grant::GrantStore;
use rumi_protocol::{BrokerRequest, BrokerResponse, HttpMethod};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// Maximum request header count.
pub const MAX_HEADERS: usize = 64;
/// Maximum size of a single header value, in bytes.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;
/// Maximum request body size, in bytes.
pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
/// Maximum response body size, in bytes.
pub const MAX_RESPONSE_BODY_BYTES: usize = 4 * 1024 * 1024;
/// Maximum allowed request timeout.
pub const MAX_TIMEOUT_MS: u64 = 120_000;
/// Maximum number of redirect hops followed.
pub const MAX_REDIRECTS: u32 = 3;

/// Errors raised while standing up or running the Egress broker.
#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    /// Underlying I/O error (socket bind/accept).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// `reqwest` client construction failure.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<EgressError> for RumiError {
    fn from(err: EgressError) -> Self {
        RumiError::new(ErrorKind::PolicyDenied, err.to_string())
    }
}

/// Per-Pack Egress broker: one UDS listener, enforcing grant/domain/IP
/// policy before forwarding a request out through `reqwest`.
pub struct EgressBroker {
    grants: Arc<GrantStore>,
    audit: Arc<rumi_audit::AuditLog>,
    http: reqwest::Client,
    sock_dir: PathBuf,
}

impl EgressBroker {
    /// Build a broker over a shared `GrantStore` and `AuditLog`, listening
    /// under `sock_dir` (one `<pack_id>.sock` file per Pack).
    pub fn new(
        grants: Arc<GrantStore>,
        audit: Arc<rumi_audit::AuditLog>,
        sock_dir: impl Into<PathBuf>,
    ) -> Result<Self, EgressError> {
        let http = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none()).build()?;
        Ok(Self { grants, audit, http, sock_dir: sock_dir.into() })
    }

    /// Bind and accept connections on `<sock_dir>/<pack_id>.sock` forever.
    /// Each accepted connection is served on its own task.
    pub async fn listen(self: Arc<Self>, pack_id: String) -> Result<(), EgressError> {
        std::fs::create_dir_all(&self.sock_dir)?;
        let path = self.sock_dir.join(format!("{pack_id}.sock"));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        debug!(target: "rumi.egress.listen", pack_id = %pack_id, path = %path.display(), "egress broker listening");

        loop {
            let (stream, _addr) = listener.accept().await?;
            let broker = self.clone();
            let pack_id = pack_id.clone();
            tokio::spawn(async move { broker.serve_connection(pack_id, stream).await });
        }
    }

    async fn serve_connection(&self, pack_id: String, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        loop {
            let req: BrokerRequest = match rumi_protocol::read_framed(&mut reader).await {
                Ok(Some(req)) => req,
                Ok(None) => return,
                Err(e) => {
                    warn!(target: "rumi.egress.frame", pack_id = %pack_id, error = %e, "malformed request frame");
                    return;
                }
            };
            let response = self.handle(&pack_id, req).await;
            if rumi_protocol::write_framed(&mut write_half, &response).await.is_err() {
                return;
            }
        }
    }

    /// Effective `(allowed_domains, allowed_ports)` for `pack_id`: its own
    /// grant intersected with every ancestor's (an ancestor with no grant,
    /// or a disabled one, contributes an empty list, collapsing the
    /// effective set per `rumi_core::hierarchy::intersect_allowlist`).
    fn effective_allowlist(&self, pack_id: &str) -> Option<(Vec<String>, Vec<u16>)> {
        let own = self.grants.load_network_grant(pack_id)?;
        if !own.enabled {
            return None;
        }

        let ancestors = rumi_core::hierarchy::ancestors(pack_id);
        let ancestor_domains: Vec<Vec<String>> = ancestors
            .iter()
            .map(|a| {
                self.grants
                    .load_network_grant(a)
                    .filter(|g| g.enabled)
                    .map(|g| g.allowed_domains)
                    .unwrap_or_default()
            })
            .collect();
        let ancestor_ports: Vec<Vec<u16>> = ancestors
            .iter()
            .map(|a| {
                self.grants
                    .load_network_grant(a)
                    .filter(|g| g.enabled)
                    .map(|g| g.allowed_ports)
                    .unwrap_or_default()
            })
            .collect();

        let domains = rumi_core::hierarchy::intersect_allowlist(&own.allowed_domains, &ancestor_domains);
        let ports = rumi_core::hierarchy::intersect_allowlist(&own.allowed_ports, &ancestor_ports);
        Some((domains, ports))
    }

    async fn handle(&self, pack_id: &str, req: BrokerRequest) -> BrokerResponse {
        let method = req.method;
        let requested_url = req.url.clone();
        match self.handle_inner(pack_id, req).await {
            Ok((status, headers, body)) => {
                self.audit_attempt(pack_id, &requested_url, method, Some(status), true, None).await;
                BrokerResponse::ok(status, headers, body)
            }
            Err(reason) => {
                self.audit_attempt(pack_id, &requested_url, method, None, false, Some(reason.clone())).await;
                BrokerResponse::denied(reason)
            }
        }
    }

    async fn handle_inner(
        &self,
        pack_id: &str,
        req: BrokerRequest,
    ) -> Result<(u16, BTreeMap<String, String>, Vec<u8>), String> {
        validate_request_surface(&req)?;

        let (allowed_domains, allowed_ports) =
            self.effective_allowlist(pack_id).ok_or_else(|| "no valid network grant".to_string())?;

        let mut current_url =
            url::Url::parse(&req.url).map_err(|e| format!("invalid url: {e}"))?;
        let timeout = Duration::from_millis(req.timeout_ms);

        for hop in 0..=MAX_REDIRECTS {
            check_hop(&current_url, &allowed_domains, &allowed_ports).await?;

            let mut builder = self.http.request(to_reqwest_method(req.method), current_url.clone()).timeout(timeout);
            for (k, v) in &req.headers {
                builder = builder.header(k, v);
            }
            if let Some(body) = &req.body {
                builder = builder.body(body.clone());
            }

            let response = builder.send().await.map_err(|e| format!("request failed: {e}"))?;
            let status = response.status();

            if status.is_redirection() && hop < MAX_REDIRECTS {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| "redirect response missing Location header".to_string())?;
                current_url = current_url.join(location).map_err(|e| format!("invalid redirect target: {e}"))?;
                continue;
            }

            let mut headers = BTreeMap::new();
            for (k, v) in response.headers() {
                if let Ok(v) = v.to_str() {
                    headers.insert(k.to_string(), v.to_string());
                }
            }
            let body = read_body_capped(response).await?;
            return Ok((status.as_u16(), headers, body));
        }

        Err(format!("exceeded {MAX_REDIRECTS} redirect hops"))
    }

    async fn audit_attempt(
        &self,
        pack_id: &str,
        url: &str,
        method: HttpMethod,
        status: Option<u16>,
        allowed: bool,
        rejection_reason: Option<String>,
    ) {
        let (domain, port) = url::Url::parse(url)
            .map(|u| (u.host_str().unwrap_or("").to_string(), u.port_or_known_default().unwrap_or(0)))
            .unwrap_or_default();

        let mut entry = rumi_audit::new_entry(rumi_core::AuditCategory::Network, "egress_request");
        entry.success = allowed;
        entry.pack_id = Some(pack_id.to_string());
        entry.severity = if allowed { rumi_core::AuditSeverity::Info } else { rumi_core::AuditSeverity::Warning };
        entry.details.insert("domain".into(), serde_json::json!(domain));
        entry.details.insert("port".into(), serde_json::json!(port));
        entry.details.insert("method".into(), serde_json::json!(method.as_str()));
        entry.details.insert("allowed".into(), serde_json::json!(allowed));
        if let Some(status) = status {
            entry.details.insert("status".into(), serde_json::json!(status));
        }
        entry.rejection_reason = rejection_reason;
        let _ = self.audit.record(entry).await;
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).expect("HttpMethod variants are all valid methods")
}

fn validate_request_surface(req: &BrokerRequest) -> Result<(), String> {
    if req.timeout_ms > MAX_TIMEOUT_MS {
        return Err(format!("timeout_ms {} exceeds maximum {MAX_TIMEOUT_MS}", req.timeout_ms));
    }
    if req.headers.len() > MAX_HEADERS {
        return Err(format!("header count {} exceeds maximum {MAX_HEADERS}", req.headers.len()));
    }
    for (k, v) in &req.headers {
        if k.len() + v.len() > MAX_HEADER_BYTES {
            return Err(format!("header `{k}` exceeds maximum {MAX_HEADER_BYTES} bytes"));
        }
    }
    if let Some(body) = &req.body {
        if body.len() > MAX_REQUEST_BODY_BYTES {
            return Err(format!("request body exceeds maximum {MAX_REQUEST_BODY_BYTES} bytes"));
        }
    }
    Ok(())
}

async fn check_hop(url: &url::Url, allowed_domains: &[String], allowed_ports: &[u16]) -> Result<(), String> {
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(format!("scheme `{scheme}` is not allowed"));
    }
    let host = url.host_str().ok_or_else(|| "url has no host".to_string())?;
    if !policy::domain_allowed(allowed_domains, host) {
        return Err(format!("domain `{host}` is not in the allowlist"));
    }
    let port = url.port_or_known_default().ok_or_else(|| "url has no resolvable port".to_string())?;
    if !allowed_ports.contains(&port) {
        return Err(format!("port {port} is not in the allowlist"));
    }

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| format!("DNS resolution failed for `{host}`: {e}"))?;
    let mut resolved_any = false;
    for addr in addrs {
        resolved_any = true;
        if let Some(reason) = policy::non_global_reason(addr.ip()) {
            return Err(format!("`{host}` resolved to a non-global address ({reason})"));
        }
    }
    if !resolved_any {
        return Err(format!("`{host}` did not resolve to any address"));
    }
    Ok(())
}

async fn read_body_capped(response: reqwest::Response) -> Result<Vec<u8>, String> {
    if let Some(len) = response.content_length() {
        if len > MAX_RESPONSE_BODY_BYTES as u64 {
            return Err(format!("response body length {len} exceeds maximum {MAX_RESPONSE_BODY_BYTES} bytes"));
        }
    }

    let mut response = response;
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| format!("reading response body: {e}"))? {
        body.extend_from_slice(&chunk);
        if body.len() > MAX_RESPONSE_BODY_BYTES {
            return Err(format!("response body exceeds maximum {MAX_RESPONSE_BODY_BYTES} bytes (truncated)"));
        }
    }
    Ok(body)
}
