//! Client-side channel adapter.
//!
//! Runs the three-leg handshake against a remote server, then issues
//! `ProxyRequest` frames over the encrypted channel and correlates responses
//! by request id. The channel is held behind an async mutex, so calls are
//! single-in-flight; a caller that gives up simply releases the lock and the
//! late response is dropped.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tokio::sync::Mutex;

use drawlatch_core::current_unix_timestamp_ms;
use drawlatch_crypto::{ClientHandshake, EncryptedChannel, KeyBundle};
use drawlatch_proto::{
    decode_base64_field, encode_base64_field, EncryptedEnvelope, ErrorKind, HandshakeReply,
    ProxyError, ProxyRequest, ProxyResponse,
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone)]
pub struct ProxyClientConfig {
    pub base_url: String,
    /// Fingerprint of the server this client intends to reach.
    pub server_fingerprint: String,
    /// Fingerprints loaded from the client's peers directory.
    pub known_server_fingerprints: BTreeSet<String>,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl ProxyClientConfig {
    pub fn new(base_url: impl Into<String>, server_fingerprint: impl Into<String>) -> Self {
        let server_fingerprint = server_fingerprint.into();
        Self {
            base_url: base_url.into(),
            known_server_fingerprints: BTreeSet::from([server_fingerprint.clone()]),
            server_fingerprint,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

pub struct ProxyClient {
    http: reqwest::Client,
    base_url: String,
    session_id: String,
    channel: Mutex<EncryptedChannel>,
    next_request_id: AtomicU64,
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("base_url", &self.base_url)
            .field("session_id", &self.session_id)
            .field(
                "next_request_id",
                &self.next_request_id.load(std::sync::atomic::Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl ProxyClient {
    /// Completes the handshake and returns a connected client. Each leg is
    /// bounded by the configured handshake timeout.
    pub async fn connect(bundle: &KeyBundle, config: ProxyClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to create proxy http client")?;
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let (state, init) = ClientHandshake::initiate(
            bundle,
            &config.server_fingerprint,
            current_unix_timestamp_ms(),
        );

        let reply: HandshakeReply = handshake_leg(config.handshake_timeout, async {
            let response = http
                .post(format!("{}/handshake/init", base_url))
                .json(&init)
                .send()
                .await
                .context("handshake init request failed")?;
            if !response.status().is_success() {
                bail!(
                    "handshake init rejected: {}",
                    response.text().await.unwrap_or_default()
                );
            }
            response
                .json()
                .await
                .context("handshake reply was not valid JSON")
        })
        .await?;

        let (keys, finish) = state
            .complete(
                &reply,
                &config.known_server_fingerprints,
                current_unix_timestamp_ms(),
            )
            .map_err(|error| anyhow!("handshake failed: {}", error))?;

        handshake_leg(config.handshake_timeout, async {
            let response = http
                .post(format!("{}/handshake/finish", base_url))
                .json(&finish)
                .send()
                .await
                .context("handshake finish request failed")?;
            if !response.status().is_success() {
                bail!(
                    "handshake finish rejected: {}",
                    response.text().await.unwrap_or_default()
                );
            }
            Ok(())
        })
        .await?;

        Ok(Self {
            http,
            base_url,
            session_id: keys.session_id.clone(),
            channel: Mutex::new(EncryptedChannel::new(&keys)),
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Seals one tool call, posts it, and opens the correlated response.
    /// A failed tool call comes back as `ok == false`, not as `Err`; `Err`
    /// means the transport or the session itself broke.
    pub async fn call(&self, tool: &str, input: Value) -> Result<ProxyResponse> {
        let request_id = format!(
            "req-{}",
            self.next_request_id.fetch_add(1, Ordering::Relaxed)
        );
        let frame = ProxyRequest {
            request_id: request_id.clone(),
            tool: tool.to_string(),
            input,
        };
        let plaintext =
            serde_json::to_vec(&frame).context("failed to encode proxy request frame")?;

        let mut channel = self.channel.lock().await;
        let (nonce, ciphertext) = channel
            .seal(&plaintext)
            .map_err(|error| anyhow!("channel seal failed: {}", error))?;
        let envelope = EncryptedEnvelope {
            nonce: encode_base64_field(&nonce),
            ciphertext: encode_base64_field(&ciphertext),
        };

        let response = self
            .http
            .post(format!(
                "{}/session/{}/request",
                self.base_url, self.session_id
            ))
            .json(&envelope)
            .send()
            .await
            .context("session request failed")?;
        if !response.status().is_success() {
            bail!(
                "session request rejected ({}): {}; re-handshake required",
                response.status().as_u16(),
                response.text().await.unwrap_or_default()
            );
        }
        let reply_envelope: EncryptedEnvelope = response
            .json()
            .await
            .context("session response was not valid JSON")?;

        let nonce = decode_base64_field("nonce", &reply_envelope.nonce)?;
        let ciphertext = decode_base64_field("ciphertext", &reply_envelope.ciphertext)?;
        let plaintext = channel
            .open(&nonce, &ciphertext)
            .map_err(|error| anyhow!("channel open failed: {}; re-handshake required", error))?;
        drop(channel);

        let reply: ProxyResponse =
            serde_json::from_slice(&plaintext).context("proxy response frame was malformed")?;
        if reply.request_id != request_id {
            // Cooperative cancellation elsewhere may leave a stale reply; a
            // mismatched id is never delivered to the caller.
            bail!(
                "response correlation mismatch: sent {} received {}",
                request_id,
                reply.request_id
            );
        }
        Ok(reply)
    }
}

/// Kind tag carried by a failed `ProxyResponse`, if any.
pub fn response_error_kind(response: &ProxyResponse) -> Option<ErrorKind> {
    response.error.as_ref().map(|error| error.kind)
}

async fn handshake_leg<T>(
    timeout: Duration,
    leg: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, leg).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::new(
            ErrorKind::HandshakeTimeout,
            format!("handshake leg timed out after {:?}", timeout),
        )
        .into()),
    }
}
