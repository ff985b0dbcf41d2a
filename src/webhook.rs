//! Signed webhook delivery and verification.
//!
//! Wire format: POST JSON `{event, deliveryId, timestamp, data}` with
//! `X-Watchtower-Signature: t=<ts>,v1=<hex>` where the signature is
//! HMAC-SHA256(secret, "<ts>.<body>"). Verification is constant-time and
//! replay-bounded.

use std::sync::Arc;

use anyhow::{bail, Result};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::clock::Clock;
use crate::config::WebhookSettings;
use crate::logging::{json_log, log_error, obj, v_str, Domain};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Watchtower-Signature";
pub const DELIVERY_ID_HEADER: &str = "X-Watchtower-Delivery-Id";
pub const EVENT_HEADER: &str = "X-Watchtower-Event";

/// Stale tolerance for inbound verification, seconds.
pub const DEFAULT_MAX_AGE_SECONDS: u64 = 300;
/// Allowed clock skew into the future, seconds.
const MAX_FUTURE_SKEW_SECONDS: u64 = 60;

pub fn sign_payload(secret: &str, timestamp: u64, body: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("hmac key error: {}", e))?;
    mac.update(format!("{}.{}", timestamp, body).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn signature_header(secret: &str, timestamp: u64, body: &str) -> Result<String> {
    Ok(format!("t={},v1={}", timestamp, sign_payload(secret, timestamp, body)?))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Debug, PartialEq, Eq)]
pub enum VerifyError {
    MalformedHeader,
    Stale,
    FutureTimestamp,
    SignatureMismatch,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            VerifyError::MalformedHeader => "malformed signature header",
            VerifyError::Stale => "timestamp outside the replay window",
            VerifyError::FutureTimestamp => "timestamp too far in the future",
            VerifyError::SignatureMismatch => "signature mismatch",
        };
        f.write_str(msg)
    }
}

/// Verify an inbound `(body, header)` pair. Stale (> max_age) and
/// far-future (> 60 s) timestamps are rejected before any HMAC work.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &str,
    max_age_seconds: u64,
    clock: &dyn Clock,
) -> std::result::Result<(), VerifyError> {
    let mut timestamp: Option<u64> = None;
    let mut signature: Option<String> = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", raw)) => timestamp = raw.parse().ok(),
            Some(("v1", raw)) => signature = Some(raw.to_string()),
            _ => {}
        }
    }
    let (timestamp, signature) = match (timestamp, signature) {
        (Some(t), Some(s)) => (t, s),
        _ => return Err(VerifyError::MalformedHeader),
    };

    let now = clock.now_seconds();
    if timestamp + max_age_seconds < now {
        return Err(VerifyError::Stale);
    }
    if timestamp > now + MAX_FUTURE_SKEW_SECONDS {
        return Err(VerifyError::FutureTimestamp);
    }

    let expected = sign_payload(secret, timestamp, body).map_err(|_| VerifyError::SignatureMismatch)?;
    if constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
        Ok(())
    } else {
        Err(VerifyError::SignatureMismatch)
    }
}

pub struct WebhookNotifier {
    settings: WebhookSettings,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl WebhookNotifier {
    pub fn new(settings: WebhookSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        if settings.enabled {
            if settings.url.is_empty() {
                bail!("WEBHOOK_URL required when webhooks are enabled");
            }
            if settings.secret.len() < 32 {
                bail!("WEBHOOK_SECRET must be at least 32 characters");
            }
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(settings.timeout_ms.max(1)))
            .build()?;
        Ok(Self { settings, client, clock })
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn heartbeat_interval_ms(&self) -> Option<u64> {
        (self.settings.enabled && self.settings.send_heartbeat)
            .then_some(self.settings.heartbeat_interval_ms)
    }

    /// Deliver one event with bounded retries. Failures are logged, never
    /// propagated to the tick that produced the event.
    pub async fn send_event(&self, event: &str, data: Value) {
        if !self.settings.enabled {
            return;
        }
        let timestamp = self.clock.now_seconds();
        let delivery_id = format!("whd-{}-{:08x}", timestamp, rand::random::<u32>());
        let body = json!({
            "event": event,
            "deliveryId": delivery_id,
            "timestamp": timestamp,
            "data": data,
        })
        .to_string();
        let header = match signature_header(&self.settings.secret, timestamp, &body) {
            Ok(header) => header,
            Err(err) => {
                log_error(Domain::Webhook, "sign_failed", &err.to_string());
                return;
            }
        };

        for attempt in 1..=self.settings.max_retries + 1 {
            let result = self
                .client
                .post(&self.settings.url)
                .header("Content-Type", "application/json")
                .header(SIGNATURE_HEADER, &header)
                .header(DELIVERY_ID_HEADER, &delivery_id)
                .header(EVENT_HEADER, event)
                .body(body.clone())
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    json_log(
                        Domain::Webhook,
                        "delivered",
                        obj(&[
                            ("event", v_str(event)),
                            ("delivery_id", v_str(&delivery_id)),
                            ("attempt", json!(attempt)),
                        ]),
                    );
                    return;
                }
                Ok(resp) => {
                    log_error(
                        Domain::Webhook,
                        "delivery_rejected",
                        &format!("{} -> http {}", delivery_id, resp.status().as_u16()),
                    );
                }
                Err(err) => {
                    log_error(
                        Domain::Webhook,
                        "delivery_failed",
                        &format!("{} -> {}", delivery_id, err),
                    );
                }
            }
            if attempt <= self.settings.max_retries {
                tokio::time::sleep(std::time::Duration::from_millis(self.settings.retry_delay_ms))
                    .await;
            }
        }
    }

    pub async fn send_heartbeat(&self) {
        self.send_event("watchtower.heartbeat", json!({ "status": "ok" })).await;
    }
}
