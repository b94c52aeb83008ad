//! Passive webhook ingestors for GitHub, Stripe, and Trello deliveries.
//!
//! Verification is skipped only when neither a signature header nor a secret
//! is configured. All HMAC comparisons go through `Mac::verify_slice`, which
//! is timing-safe.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use sha2::Sha256;

use drawlatch_config::{WebhookIngestorConfig, WebhookProvider};
use drawlatch_core::{current_unix_timestamp, decode_hex};
use drawlatch_proto::WebhookOutcome;

use crate::ingestor::{Ingestor, IngestorCore, IngestorState};

const DEFAULT_STRIPE_TOLERANCE_SECONDS: u64 = 300;

const REASON_NOT_RUNNING: &str = "Ingestor not running";
const REASON_SECRET_NOT_CONFIGURED: &str = "Signature secret not configured";
const REASON_MISSING_SIGNATURE: &str = "Missing signature header";
const REASON_SIGNATURE_FAILED: &str = "Signature verification failed";
const REASON_TIMESTAMP_WINDOW: &str = "Timestamp outside tolerance window";
const REASON_BAD_JSON: &str = "Invalid JSON payload";
const REASON_NO_CALLBACK_URL: &str = "Callback URL not configured";

pub struct WebhookIngestor {
    core: IngestorCore,
    config: WebhookIngestorConfig,
}

impl WebhookIngestor {
    pub fn new(connection_alias: &str, config: WebhookIngestorConfig, buffer_capacity: usize) -> Self {
        Self {
            core: IngestorCore::new(connection_alias, buffer_capacity),
            config,
        }
    }

    fn verification_configured(&self) -> bool {
        self.config.signature_header.is_some() || self.config.signature_secret.is_some()
    }

    fn signature_header_name(&self) -> String {
        self.config
            .signature_header
            .clone()
            .unwrap_or_else(|| default_signature_header(self.config.provider).to_string())
            .to_ascii_lowercase()
    }

    fn verify(
        &self,
        headers: &BTreeMap<String, String>,
        raw_body: &[u8],
        secret: &str,
    ) -> Result<(), &'static str> {
        let header_name = self.signature_header_name();
        let Some(signature) = headers.get(&header_name).map(|value| value.trim()) else {
            return Err(REASON_MISSING_SIGNATURE);
        };
        if signature.is_empty() {
            return Err(REASON_MISSING_SIGNATURE);
        }
        match self.config.provider {
            WebhookProvider::Github => verify_github_signature(raw_body, signature, secret),
            WebhookProvider::Stripe => {
                let tolerance = self
                    .config
                    .tolerance_seconds
                    .unwrap_or(DEFAULT_STRIPE_TOLERANCE_SECONDS);
                verify_stripe_signature(
                    raw_body,
                    signature,
                    secret,
                    current_unix_timestamp(),
                    tolerance,
                )
            }
            WebhookProvider::Trello => {
                let Some(callback_url) = self
                    .config
                    .callback_url
                    .as_deref()
                    .filter(|value| !value.trim().is_empty())
                else {
                    return Err(REASON_NO_CALLBACK_URL);
                };
                verify_trello_signature(raw_body, signature, secret, callback_url)
            }
        }
    }

    fn extract_event(&self, headers: &BTreeMap<String, String>, body: Value) -> (String, Value) {
        match self.config.provider {
            WebhookProvider::Github => {
                let event_type = headers
                    .get("x-github-event")
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .unwrap_or_else(|| "unknown".to_string());
                let delivery_id = headers.get("x-github-delivery").cloned();
                (
                    event_type,
                    serde_json::json!({ "deliveryId": delivery_id, "payload": body }),
                )
            }
            WebhookProvider::Stripe => {
                let event_type = body
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let event_id = body.get("id").cloned().unwrap_or(Value::Null);
                (
                    event_type,
                    serde_json::json!({ "eventId": event_id, "payload": body }),
                )
            }
            WebhookProvider::Trello => {
                let event_type = body
                    .get("action")
                    .and_then(|action| action.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                (event_type, serde_json::json!({ "payload": body }))
            }
        }
    }
}

#[async_trait]
impl Ingestor for WebhookIngestor {
    async fn start(&self) -> anyhow::Result<()> {
        self.core.set_state(IngestorState::Starting);
        // Passive receiver: ready as soon as the route table points at it.
        self.core.set_state(IngestorState::Connected);
        Ok(())
    }

    async fn stop(&self) {
        self.core.set_state(IngestorState::Stopped);
    }

    fn core(&self) -> &IngestorCore {
        &self.core
    }

    fn webhook_path(&self) -> Option<&str> {
        Some(&self.config.webhook_path)
    }

    fn handle_webhook(
        &self,
        headers: &BTreeMap<String, String>,
        raw_body: &[u8],
    ) -> WebhookOutcome {
        if self.core.state() == IngestorState::Stopped {
            return WebhookOutcome::rejected(REASON_NOT_RUNNING);
        }

        if self.verification_configured() {
            let Some(secret) = self
                .config
                .signature_secret
                .as_deref()
                .filter(|value| !value.trim().is_empty())
            else {
                return WebhookOutcome::rejected(REASON_SECRET_NOT_CONFIGURED);
            };
            if let Err(reason) = self.verify(headers, raw_body, secret) {
                return WebhookOutcome::rejected(reason);
            }
        }

        let body: Value = match serde_json::from_slice(raw_body) {
            Ok(parsed) => parsed,
            Err(_) => return WebhookOutcome::rejected(REASON_BAD_JSON),
        };
        let (event_type, data) = self.extract_event(headers, body);
        self.core.push_event(&event_type, data);
        WebhookOutcome::accepted()
    }
}

/// Error-taxonomy tag for a rejection reason, used by the delivery endpoint
/// when logging refused webhooks.
pub fn rejection_kind(reason: &str) -> drawlatch_proto::ErrorKind {
    match reason {
        REASON_BAD_JSON => drawlatch_proto::ErrorKind::WebhookBadJson,
        REASON_NOT_RUNNING => drawlatch_proto::ErrorKind::IngestorNotRunning,
        REASON_SECRET_NOT_CONFIGURED => drawlatch_proto::ErrorKind::MissingSecret,
        _ => drawlatch_proto::ErrorKind::WebhookSignatureInvalid,
    }
}

fn default_signature_header(provider: WebhookProvider) -> &'static str {
    match provider {
        WebhookProvider::Github => "X-Hub-Signature-256",
        WebhookProvider::Stripe => "Stripe-Signature",
        WebhookProvider::Trello => "X-Trello-Webhook",
    }
}

/// GitHub: `sha256=<hex>` over the raw body.
fn verify_github_signature(
    raw_body: &[u8],
    signature: &str,
    secret: &str,
) -> Result<(), &'static str> {
    let Some(digest_hex) = signature.strip_prefix("sha256=") else {
        return Err(REASON_SIGNATURE_FAILED);
    };
    let Ok(signature_bytes) = decode_hex(digest_hex) else {
        return Err(REASON_SIGNATURE_FAILED);
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return Err(REASON_SIGNATURE_FAILED);
    };
    mac.update(raw_body);
    mac.verify_slice(&signature_bytes)
        .map_err(|_| REASON_SIGNATURE_FAILED)
}

/// Stripe: `t=<unix>,v1=<hex>[,v1=<hex>...]`; HMAC-SHA256 of `"{t}.{body}"`
/// must match any v1 entry, and `t` must be inside the tolerance window
/// (0 disables the window check).
fn verify_stripe_signature(
    raw_body: &[u8],
    signature: &str,
    secret: &str,
    now_unix: u64,
    tolerance_seconds: u64,
) -> Result<(), &'static str> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();
    for part in signature.split(',') {
        let Some((name, value)) = part.trim().split_once('=') else {
            continue;
        };
        match name {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => {
                if let Ok(bytes) = decode_hex(value) {
                    candidates.push(bytes);
                }
            }
            _ => {}
        }
    }
    let Some(timestamp) = timestamp else {
        return Err(REASON_SIGNATURE_FAILED);
    };
    if candidates.is_empty() {
        return Err(REASON_SIGNATURE_FAILED);
    }

    if tolerance_seconds > 0 {
        let skew = (now_unix as i64 - timestamp).unsigned_abs();
        if skew > tolerance_seconds {
            return Err(REASON_TIMESTAMP_WINDOW);
        }
    }

    for candidate in &candidates {
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
            return Err(REASON_SIGNATURE_FAILED);
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(raw_body);
        if mac.verify_slice(candidate).is_ok() {
            return Ok(());
        }
    }
    Err(REASON_SIGNATURE_FAILED)
}

/// Trello: base64 HMAC-SHA1 of `rawBody + callbackURL`.
fn verify_trello_signature(
    raw_body: &[u8],
    signature: &str,
    secret: &str,
    callback_url: &str,
) -> Result<(), &'static str> {
    let Ok(signature_bytes) = BASE64.decode(signature) else {
        return Err(REASON_SIGNATURE_FAILED);
    };
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(secret.as_bytes()) else {
        return Err(REASON_SIGNATURE_FAILED);
    };
    mac.update(raw_body);
    mac.update(callback_url.as_bytes());
    mac.verify_slice(&signature_bytes)
        .map_err(|_| REASON_SIGNATURE_FAILED)
}

#[cfg(test)]
mod tests {
    use drawlatch_core::encode_hex;

    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
            .collect()
    }

    fn webhook_config(provider: WebhookProvider, secret: Option<&str>) -> WebhookIngestorConfig {
        WebhookIngestorConfig {
            provider,
            webhook_path: provider.as_str().to_string(),
            signature_header: Some(default_signature_header(provider).to_string()),
            signature_secret: secret.map(|value| value.to_string()),
            callback_url: match provider {
                WebhookProvider::Trello => {
                    Some("https://tunnel.example/webhooks/trello".to_string())
                }
                _ => None,
            },
            tolerance_seconds: None,
            buffer_size: None,
        }
    }

    async fn started(provider: WebhookProvider, secret: Option<&str>) -> WebhookIngestor {
        let ingestor = WebhookIngestor::new(
            provider.as_str(),
            webhook_config(provider, secret),
            16,
        );
        ingestor.start().await.expect("start");
        ingestor
    }

    fn github_signature(body: &[u8], secret: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("mac");
        mac.update(body);
        format!("sha256={}", encode_hex(&mac.finalize().into_bytes()))
    }

    fn stripe_signature(body: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("mac");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        format!(
            "t={},v1={}",
            timestamp,
            encode_hex(&mac.finalize().into_bytes())
        )
    }

    fn trello_signature(body: &[u8], secret: &str, callback_url: &str) -> String {
        let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).expect("mac");
        mac.update(body);
        mac.update(callback_url.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    #[tokio::test]
    async fn functional_github_delivery_is_verified_and_buffered() {
        let ingestor = started(WebhookProvider::Github, Some("gh_secret")).await;
        let body = br#"{"action":"opened","number":7}"#;
        let outcome = ingestor.handle_webhook(
            &headers(&[
                ("X-Hub-Signature-256", &github_signature(body, "gh_secret")),
                ("X-GitHub-Event", "pull_request"),
                ("X-GitHub-Delivery", "d-123"),
            ]),
            body,
        );
        assert_eq!(outcome, WebhookOutcome::accepted());

        let events = ingestor.get_events(-1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "pull_request");
        assert_eq!(events[0].data["deliveryId"], "d-123");
        assert_eq!(events[0].data["payload"]["number"], 7);
    }

    #[tokio::test]
    async fn regression_github_bad_signature_is_rejected_without_buffering() {
        let ingestor = started(WebhookProvider::Github, Some("gh_secret")).await;
        let body = br#"{"action":"opened"}"#;
        let outcome = ingestor.handle_webhook(
            &headers(&[
                ("X-Hub-Signature-256", &github_signature(body, "other_secret")),
                ("X-GitHub-Event", "push"),
            ]),
            body,
        );
        assert_eq!(outcome, WebhookOutcome::rejected(REASON_SIGNATURE_FAILED));
        assert!(ingestor.get_events(-1).is_empty());
        assert_eq!(ingestor.status().total_events_received, 0);
    }

    #[tokio::test]
    async fn functional_stripe_delivery_extracts_type_and_event_id() {
        let ingestor = started(WebhookProvider::Stripe, Some("whsec_test")).await;
        let body = br#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;
        let now = current_unix_timestamp() as i64;
        let outcome = ingestor.handle_webhook(
            &headers(&[(
                "Stripe-Signature",
                &stripe_signature(body, "whsec_test", now),
            )]),
            body,
        );
        assert_eq!(outcome, WebhookOutcome::accepted());

        let events = ingestor.get_events(-1);
        assert_eq!(events[0].event_type, "payment_intent.succeeded");
        assert_eq!(events[0].data["eventId"], "evt_1");
    }

    #[tokio::test]
    async fn regression_stripe_stale_timestamp_is_rejected() {
        let ingestor = started(WebhookProvider::Stripe, Some("whsec_test")).await;
        let body = br#"{"id":"evt_2","type":"payment_intent.succeeded"}"#;
        let stale = current_unix_timestamp() as i64 - 600;
        let outcome = ingestor.handle_webhook(
            &headers(&[(
                "Stripe-Signature",
                &stripe_signature(body, "whsec_test", stale),
            )]),
            body,
        );
        assert_eq!(outcome, WebhookOutcome::rejected(REASON_TIMESTAMP_WINDOW));
    }

    #[tokio::test]
    async fn functional_trello_delivery_uses_action_type() {
        let ingestor = started(WebhookProvider::Trello, Some("trello_secret")).await;
        let body = br#"{"action":{"type":"updateCard","data":{}}}"#;
        let signature =
            trello_signature(body, "trello_secret", "https://tunnel.example/webhooks/trello");
        let outcome =
            ingestor.handle_webhook(&headers(&[("X-Trello-Webhook", &signature)]), body);
        assert_eq!(outcome, WebhookOutcome::accepted());
        assert_eq!(ingestor.get_events(-1)[0].event_type, "updateCard");
    }

    #[tokio::test]
    async fn unit_unconfigured_verification_accepts_unsigned_payloads() {
        let ingestor = WebhookIngestor::new(
            "github",
            WebhookIngestorConfig {
                provider: WebhookProvider::Github,
                webhook_path: "github".to_string(),
                signature_header: None,
                signature_secret: None,
                callback_url: None,
                tolerance_seconds: None,
                buffer_size: None,
            },
            16,
        );
        ingestor.start().await.expect("start");
        let outcome = ingestor.handle_webhook(
            &headers(&[("X-GitHub-Event", "ping")]),
            br#"{"zen":"keep it simple"}"#,
        );
        assert_eq!(outcome, WebhookOutcome::accepted());
    }

    #[tokio::test]
    async fn regression_configured_but_unresolved_secret_rejects() {
        let ingestor = started(WebhookProvider::Stripe, Some("")).await;
        let outcome = ingestor.handle_webhook(&headers(&[]), br#"{}"#);
        assert_eq!(
            outcome,
            WebhookOutcome::rejected(REASON_SECRET_NOT_CONFIGURED)
        );
    }

    #[tokio::test]
    async fn unit_invalid_json_body_is_rejected_after_verification() {
        let ingestor = started(WebhookProvider::Github, Some("gh_secret")).await;
        let body = b"not json";
        let outcome = ingestor.handle_webhook(
            &headers(&[("X-Hub-Signature-256", &github_signature(body, "gh_secret"))]),
            body,
        );
        assert_eq!(outcome, WebhookOutcome::rejected(REASON_BAD_JSON));
    }

    #[tokio::test]
    async fn unit_stopped_ingestor_rejects_deliveries() {
        let ingestor = started(WebhookProvider::Github, None).await;
        ingestor.stop().await;
        let outcome = ingestor.handle_webhook(&headers(&[]), br#"{}"#);
        assert_eq!(outcome, WebhookOutcome::rejected(REASON_NOT_RUNNING));
    }
}
