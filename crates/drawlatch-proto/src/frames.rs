use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProxyError;

/// First handshake leg, client to server. Binary fields are base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeInit {
    pub client_signing_pub: String,
    pub client_exchange_pub: String,
    pub client_nonce: String,
    pub timestamp_ms: u64,
    /// Fingerprint of the server the client believes it is talking to.
    pub server_fingerprint: String,
    pub signature: String,
}

/// Second handshake leg, server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeReply {
    pub server_signing_pub: String,
    pub server_exchange_pub: String,
    pub server_nonce: String,
    pub session_id: String,
    pub signature: String,
}

/// Third handshake leg, client to server. Proves the client derived the same
/// session and binds it to the server nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeFinish {
    pub session_id: String,
    pub signature: String,
}

/// One sealed channel message in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub nonce: String,
    pub ciphertext: String,
}

/// Plaintext tool-call frame carried inside an [`EncryptedEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub request_id: String,
    pub tool: String,
    #[serde(default)]
    pub input: Value,
}

/// Plaintext reply frame. `ok == false` implies `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProxyError>,
}

impl ProxyResponse {
    pub fn success(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            request_id: request_id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: ProxyError) -> Self {
        Self {
            request_id: request_id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

/// Buffered external event as exposed to callers via `poll_events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedEventRecord {
    pub id: u64,
    pub received_at: String,
    pub source: String,
    pub event_type: String,
    pub data: Value,
}

/// Result of dispatching a webhook delivery to one ingestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOutcome {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookOutcome {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Encodes a binary field for transport inside a JSON body.
pub fn encode_base64_field(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decodes a base64 field, naming the field in the failure message.
pub fn decode_base64_field(label: &str, raw: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(raw.trim())
        .with_context(|| format!("failed to decode base64 {}", label))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn unit_proxy_response_failure_carries_error_kind() {
        let response = ProxyResponse::failure(
            "req-1",
            ProxyError::new(ErrorKind::EndpointDenied, "url not in allowlist"),
        );
        let encoded = serde_json::to_value(&response).expect("serialize");
        assert_eq!(encoded["ok"], false);
        assert_eq!(encoded["error"]["kind"], "EndpointDenied");
        assert!(encoded.get("result").is_none());
    }

    #[test]
    fn unit_proxy_request_defaults_missing_input_to_null() {
        let decoded: ProxyRequest =
            serde_json::from_value(json!({"requestId": "r", "tool": "list_routes"}))
                .expect("deserialize");
        assert_eq!(decoded.input, Value::Null);
    }

    #[test]
    fn unit_base64_field_round_trip() {
        let bytes = [0u8, 1, 2, 254, 255];
        let encoded = encode_base64_field(&bytes);
        assert_eq!(
            decode_base64_field("nonce", &encoded).expect("decode"),
            bytes
        );
        assert!(decode_base64_field("nonce", "!!").is_err());
    }
}
