//! SSRF-hardened agent-card fetcher.
//!
//! Scheme and DNS are validated on every redirect hop; private address
//! space is rejected before any request leaves the process. DNS and the
//! transport are injectable so tests never touch the network.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::canonical::sha256_hex;
use crate::logging::{json_log, obj, v_str, Domain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardFetchStatus {
    Ok,
    Unreachable,
    InvalidSchema,
    Timeout,
    SsrfBlocked,
}

impl CardFetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardFetchStatus::Ok => "OK",
            CardFetchStatus::Unreachable => "UNREACHABLE",
            CardFetchStatus::InvalidSchema => "INVALID_SCHEMA",
            CardFetchStatus::Timeout => "TIMEOUT",
            CardFetchStatus::SsrfBlocked => "SSRF_BLOCKED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OK" => Some(CardFetchStatus::Ok),
            "UNREACHABLE" => Some(CardFetchStatus::Unreachable),
            "INVALID_SCHEMA" => Some(CardFetchStatus::InvalidSchema),
            "TIMEOUT" => Some(CardFetchStatus::Timeout),
            "SSRF_BLOCKED" => Some(CardFetchStatus::SsrfBlocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CardFetchResult {
    pub status: CardFetchStatus,
    pub card_hash: Option<String>,
    pub card_json: Option<Value>,
    pub http_status: Option<u16>,
    pub error: Option<String>,
}

impl CardFetchResult {
    fn status_only(status: CardFetchStatus, error: Option<String>) -> Self {
        Self { status, card_hash: None, card_json: None, http_status: None, error }
    }
}

/// Pluggable resolver so SSRF checks are testable without real DNS.
pub trait DnsResolver: Send + Sync {
    fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

pub struct SystemResolver;

impl DnsResolver for SystemResolver {
    fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        use std::net::ToSocketAddrs;
        Ok((host, 443).to_socket_addrs()?.map(|sa| sa.ip()).collect())
    }
}

/// Loopback, link-local, RFC1918, CGNAT, ULA and unspecified ranges.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // CGNAT 100.64.0.0/10
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                // ULA fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub allow_http: bool,
    pub max_redirects: u32,
    pub timeout_ms: u64,
    pub max_bytes: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self { allow_http: false, max_redirects: 3, timeout_ms: 10_000, max_bytes: 256 * 1024 }
    }
}

pub struct CardFetcher {
    config: FetcherConfig,
    resolver: Arc<dyn DnsResolver>,
    client: reqwest::Client,
}

impl CardFetcher {
    pub fn new(config: FetcherConfig, resolver: Arc<dyn DnsResolver>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { config, resolver, client })
    }

    /// Validate scheme and resolved addresses for one hop. Returns an
    /// error string on any violation.
    fn validate_url(&self, url: &Url) -> Result<(), String> {
        match url.scheme() {
            "https" => {}
            "http" if self.config.allow_http => {}
            other => return Err(format!("scheme not allowed: {}", other)),
        }
        let host = url.host_str().ok_or_else(|| "url has no host".to_string())?;
        // literal IPs skip DNS but still face the range check
        let ips = match host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self
                .resolver
                .resolve(host)
                .map_err(|e| format!("dns failure for {}: {}", host, e))?,
        };
        if ips.is_empty() {
            return Err(format!("dns returned no addresses for {}", host));
        }
        if let Some(private) = ips.iter().find(|ip| is_private_ip(ip)) {
            return Err(format!("{} resolves to private address {}", host, private));
        }
        Ok(())
    }

    /// Fetch, validate and hash an agent card. Never panics and never
    /// returns transport errors as Err: the status field carries the
    /// outcome.
    pub async fn fetch_agent_card(&self, raw_url: &str) -> CardFetchResult {
        let mut url = match Url::parse(raw_url) {
            Ok(url) => url,
            Err(err) => {
                return CardFetchResult::status_only(
                    CardFetchStatus::Unreachable,
                    Some(format!("invalid url: {}", err)),
                )
            }
        };

        let overall = std::time::Duration::from_millis(self.config.timeout_ms);
        let fetch = async {
            for _hop in 0..=self.config.max_redirects {
                if let Err(reason) = self.validate_url(&url) {
                    json_log(
                        Domain::Identity,
                        "card_fetch_blocked",
                        obj(&[("url", v_str(url.as_str())), ("reason", v_str(&reason))]),
                    );
                    return CardFetchResult::status_only(
                        CardFetchStatus::SsrfBlocked,
                        Some(reason),
                    );
                }

                let response = match self.client.get(url.clone()).send().await {
                    Ok(response) => response,
                    Err(err) if err.is_timeout() => {
                        return CardFetchResult::status_only(
                            CardFetchStatus::Timeout,
                            Some(err.to_string()),
                        )
                    }
                    Err(err) => {
                        return CardFetchResult::status_only(
                            CardFetchStatus::Unreachable,
                            Some(err.to_string()),
                        )
                    }
                };

                let status = response.status();
                if status.is_redirection() {
                    let Some(location) = response
                        .headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                    else {
                        return CardFetchResult {
                            status: CardFetchStatus::Unreachable,
                            card_hash: None,
                            card_json: None,
                            http_status: Some(status.as_u16()),
                            error: Some("redirect without location".to_string()),
                        };
                    };
                    url = match url.join(location) {
                        Ok(next) => next,
                        Err(err) => {
                            return CardFetchResult::status_only(
                                CardFetchStatus::Unreachable,
                                Some(format!("bad redirect target: {}", err)),
                            )
                        }
                    };
                    continue;
                }

                if !status.is_success() {
                    return CardFetchResult {
                        status: CardFetchStatus::Unreachable,
                        card_hash: None,
                        card_json: None,
                        http_status: Some(status.as_u16()),
                        error: Some(format!("http status {}", status.as_u16())),
                    };
                }

                // streamed read under the byte cap
                let mut body: Vec<u8> = Vec::new();
                let mut response = response;
                loop {
                    match response.chunk().await {
                        Ok(Some(chunk)) => {
                            if body.len() + chunk.len() > self.config.max_bytes {
                                return CardFetchResult {
                                    status: CardFetchStatus::Unreachable,
                                    card_hash: None,
                                    card_json: None,
                                    http_status: Some(status.as_u16()),
                                    error: Some(format!(
                                        "body exceeds {} bytes",
                                        self.config.max_bytes
                                    )),
                                };
                            }
                            body.extend_from_slice(&chunk);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            return CardFetchResult::status_only(
                                CardFetchStatus::Unreachable,
                                Some(err.to_string()),
                            )
                        }
                    }
                }

                let card_hash = sha256_hex(&body);
                let parsed: Value = match serde_json::from_slice(&body) {
                    Ok(value) => value,
                    Err(err) => {
                        return CardFetchResult {
                            status: CardFetchStatus::InvalidSchema,
                            card_hash: Some(card_hash),
                            card_json: None,
                            http_status: Some(status.as_u16()),
                            error: Some(format!("card is not json: {}", err)),
                        }
                    }
                };
                if let Err(reason) = validate_agent_card(&parsed) {
                    return CardFetchResult {
                        status: CardFetchStatus::InvalidSchema,
                        card_hash: Some(card_hash),
                        card_json: Some(parsed),
                        http_status: Some(status.as_u16()),
                        error: Some(reason),
                    };
                }
                return CardFetchResult {
                    status: CardFetchStatus::Ok,
                    card_hash: Some(card_hash),
                    card_json: Some(parsed),
                    http_status: Some(status.as_u16()),
                    error: None,
                };
            }
            CardFetchResult::status_only(
                CardFetchStatus::Unreachable,
                Some(format!("more than {} redirects", self.config.max_redirects)),
            )
        };

        match tokio::time::timeout(overall, fetch).await {
            Ok(result) => result,
            Err(_) => CardFetchResult::status_only(
                CardFetchStatus::Timeout,
                Some(format!("fetch exceeded {}ms", self.config.timeout_ms)),
            ),
        }
    }
}

/// Minimal agent-card shape: an object with a non-empty string `name`,
/// optional `services` array of objects with string `endpoint`s, and
/// optional `registrations` array.
pub fn validate_agent_card(card: &Value) -> Result<(), String> {
    let obj = card.as_object().ok_or_else(|| "card is not an object".to_string())?;
    match obj.get("name").and_then(Value::as_str) {
        Some(name) if !name.trim().is_empty() => {}
        _ => return Err("card missing non-empty name".to_string()),
    }
    if let Some(services) = obj.get("services") {
        let list = services.as_array().ok_or_else(|| "services is not an array".to_string())?;
        for (i, service) in list.iter().enumerate() {
            let endpoint = service.get("endpoint").and_then(Value::as_str);
            if endpoint.map(|e| e.trim().is_empty()).unwrap_or(true) {
                return Err(format!("services[{}] missing endpoint", i));
            }
        }
    }
    if let Some(registrations) = obj.get("registrations") {
        if !registrations.is_array() {
            return Err("registrations is not an array".to_string());
        }
    }
    Ok(())
}
