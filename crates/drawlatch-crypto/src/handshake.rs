//! Three-leg mutually authenticated handshake.
//!
//! Init and Reply carry the static public bundles, fresh 32-byte nonces, and
//! signatures over the running transcript; Finish proves the client derived
//! the same session. Directional keys come from an X25519 exchange expanded
//! with HKDF-SHA256 over both nonces and both fingerprints. Every failure is
//! fatal to the attempt; there are no retries within a handshake.

use std::collections::BTreeSet;

use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use x25519_dalek::PublicKey as ExchangePublicKey;

use drawlatch_proto::{
    decode_base64_field, encode_base64_field, ErrorKind, HandshakeFinish, HandshakeInit,
    HandshakeReply,
};

use crate::channel::{
    SessionKeys, NONCE_PREFIX_CLIENT_TO_SERVER, NONCE_PREFIX_SERVER_TO_CLIENT,
};
use crate::keys::{fingerprint, KeyBundle, PublicKeyBundle};

/// Maximum tolerated clock skew for the Init timestamp.
pub const HANDSHAKE_MAX_SKEW_MS: u64 = 60_000;

const TRANSCRIPT_LABEL_INIT: &[u8] = b"drawlatch hs1";
const TRANSCRIPT_LABEL_REPLY: &[u8] = b"drawlatch hs2";
const TRANSCRIPT_LABEL_FINISH: &[u8] = b"drawlatch hs3";
const KEY_LABEL_CLIENT_TO_SERVER: &[u8] = b"drawlatch c2s";
const KEY_LABEL_SERVER_TO_CLIENT: &[u8] = b"drawlatch s2c";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("peer fingerprint is not registered: {0}")]
    UnknownPeer(String),
    #[error("handshake signature verification failed")]
    InvalidSignature,
    #[error("handshake timestamp outside tolerance window")]
    TimestampSkew,
    #[error("malformed handshake message: {0}")]
    MalformedMessage(String),
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownPeer(_) => ErrorKind::UnknownPeer,
            Self::InvalidSignature => ErrorKind::InvalidSignature,
            Self::TimestampSkew => ErrorKind::TimestampSkew,
            Self::MalformedMessage(_) => ErrorKind::MalformedMessage,
        }
    }
}

/// Client-side state between Init and Reply.
pub struct ClientHandshake {
    bundle: KeyBundle,
    client_nonce: [u8; 32],
    server_fingerprint_hint: String,
}

impl ClientHandshake {
    /// Builds the Init message addressed to a server known by fingerprint.
    pub fn initiate(
        bundle: &KeyBundle,
        server_fingerprint: &str,
        now_unix_ms: u64,
    ) -> (Self, HandshakeInit) {
        let client_nonce = random_nonce();
        let public = bundle.public();
        let message = init_transcript(&client_nonce, now_unix_ms, server_fingerprint);
        let signature = bundle.signing.sign(&message);

        let init = HandshakeInit {
            client_signing_pub: encode_base64_field(public.signing.as_bytes()),
            client_exchange_pub: encode_base64_field(public.exchange.as_bytes()),
            client_nonce: encode_base64_field(&client_nonce),
            timestamp_ms: now_unix_ms,
            server_fingerprint: server_fingerprint.to_string(),
            signature: encode_base64_field(&signature.to_bytes()),
        };
        (
            Self {
                bundle: bundle.clone(),
                client_nonce,
                server_fingerprint_hint: server_fingerprint.to_string(),
            },
            init,
        )
    }

    /// Verifies the server's Reply, derives session keys, and produces the
    /// Finish message. Consumes the handshake: a failed Reply cannot be
    /// retried.
    pub fn complete(
        self,
        reply: &HandshakeReply,
        known_server_fingerprints: &BTreeSet<String>,
        now_unix_ms: u64,
    ) -> Result<(SessionKeys, HandshakeFinish), HandshakeError> {
        let server_public = decode_public_bundle(&reply.server_signing_pub, &reply.server_exchange_pub)?;
        let server_fingerprint = fingerprint(&server_public);
        if server_fingerprint != self.server_fingerprint_hint
            || !known_server_fingerprints.contains(&server_fingerprint)
        {
            return Err(HandshakeError::UnknownPeer(server_fingerprint));
        }

        let server_nonce = decode_nonce("server_nonce", &reply.server_nonce)?;
        let client_fingerprint = self.bundle.fingerprint();
        let reply_message = reply_transcript(&self.client_nonce, &server_nonce, &client_fingerprint);
        verify_signature(&server_public.signing, &reply_message, &reply.signature)?;

        let session_id = derive_session_id(&self.client_nonce, &server_nonce);
        if reply.session_id != session_id {
            return Err(HandshakeError::MalformedMessage(
                "reply session id does not match nonce digest".to_string(),
            ));
        }

        let (c2s_key, s2c_key) = derive_directional_keys(
            &self.bundle,
            &server_public.exchange,
            &self.client_nonce,
            &server_nonce,
            &client_fingerprint,
            &server_fingerprint,
        );

        let finish_message = finish_transcript(&server_nonce, &session_id);
        let finish = HandshakeFinish {
            session_id: session_id.clone(),
            signature: encode_base64_field(&self.bundle.signing.sign(&finish_message).to_bytes()),
        };

        let keys = SessionKeys {
            session_id,
            peer_fingerprint: server_fingerprint,
            created_unix_ms: now_unix_ms,
            send_key: c2s_key,
            recv_key: s2c_key,
            send_prefix: NONCE_PREFIX_CLIENT_TO_SERVER,
            recv_prefix: NONCE_PREFIX_SERVER_TO_CLIENT,
        };
        Ok((keys, finish))
    }
}

/// Server-side state between Reply and Finish. Held in a pending table until
/// the client's Finish verifies.
#[derive(Debug)]
pub struct ServerPendingSession {
    session_id: String,
    server_nonce: [u8; 32],
    client_signing: VerifyingKey,
    client_fingerprint: String,
    keys: SessionKeys,
}

impl ServerPendingSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client_fingerprint(&self) -> &str {
        &self.client_fingerprint
    }

    /// Verifies the client's Finish and releases the session keys.
    pub fn finish(self, finish: &HandshakeFinish) -> Result<SessionKeys, HandshakeError> {
        if finish.session_id != self.session_id {
            return Err(HandshakeError::MalformedMessage(
                "finish session id does not match pending session".to_string(),
            ));
        }
        let message = finish_transcript(&self.server_nonce, &self.session_id);
        verify_signature(&self.client_signing, &message, &finish.signature)?;
        Ok(self.keys)
    }
}

/// Validates an Init and produces the Reply plus the pending session state.
pub fn respond_to_init(
    bundle: &KeyBundle,
    init: &HandshakeInit,
    known_caller_fingerprints: &BTreeSet<String>,
    now_unix_ms: u64,
) -> Result<(ServerPendingSession, HandshakeReply), HandshakeError> {
    let server_fingerprint = bundle.fingerprint();
    if init.server_fingerprint != server_fingerprint {
        return Err(HandshakeError::UnknownPeer(init.server_fingerprint.clone()));
    }
    if now_unix_ms.abs_diff(init.timestamp_ms) > HANDSHAKE_MAX_SKEW_MS {
        return Err(HandshakeError::TimestampSkew);
    }

    let client_public = decode_public_bundle(&init.client_signing_pub, &init.client_exchange_pub)?;
    let client_fingerprint = fingerprint(&client_public);
    if !known_caller_fingerprints.contains(&client_fingerprint) {
        return Err(HandshakeError::UnknownPeer(client_fingerprint));
    }

    let client_nonce = decode_nonce("client_nonce", &init.client_nonce)?;
    let init_message = init_transcript(&client_nonce, init.timestamp_ms, &init.server_fingerprint);
    verify_signature(&client_public.signing, &init_message, &init.signature)?;

    let server_nonce = random_nonce();
    let session_id = derive_session_id(&client_nonce, &server_nonce);
    let (c2s_key, s2c_key) = derive_directional_keys(
        bundle,
        &client_public.exchange,
        &client_nonce,
        &server_nonce,
        &client_fingerprint,
        &server_fingerprint,
    );

    let reply_message = reply_transcript(&client_nonce, &server_nonce, &client_fingerprint);
    let public = bundle.public();
    let reply = HandshakeReply {
        server_signing_pub: encode_base64_field(public.signing.as_bytes()),
        server_exchange_pub: encode_base64_field(public.exchange.as_bytes()),
        server_nonce: encode_base64_field(&server_nonce),
        session_id: session_id.clone(),
        signature: encode_base64_field(&bundle.signing.sign(&reply_message).to_bytes()),
    };

    let keys = SessionKeys {
        session_id: session_id.clone(),
        peer_fingerprint: client_fingerprint.clone(),
        created_unix_ms: now_unix_ms,
        send_key: s2c_key,
        recv_key: c2s_key,
        send_prefix: NONCE_PREFIX_SERVER_TO_CLIENT,
        recv_prefix: NONCE_PREFIX_CLIENT_TO_SERVER,
    };
    Ok((
        ServerPendingSession {
            session_id,
            server_nonce,
            client_signing: client_public.signing,
            client_fingerprint,
            keys,
        },
        reply,
    ))
}

fn random_nonce() -> [u8; 32] {
    use rand::RngCore;
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

fn init_transcript(client_nonce: &[u8; 32], timestamp_ms: u64, server_fingerprint: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(64);
    message.extend_from_slice(TRANSCRIPT_LABEL_INIT);
    message.extend_from_slice(client_nonce);
    message.extend_from_slice(&timestamp_ms.to_be_bytes());
    message.extend_from_slice(server_fingerprint.as_bytes());
    message
}

fn reply_transcript(
    client_nonce: &[u8; 32],
    server_nonce: &[u8; 32],
    client_fingerprint: &str,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(96);
    message.extend_from_slice(TRANSCRIPT_LABEL_REPLY);
    message.extend_from_slice(client_nonce);
    message.extend_from_slice(server_nonce);
    message.extend_from_slice(client_fingerprint.as_bytes());
    message
}

fn finish_transcript(server_nonce: &[u8; 32], session_id: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(64);
    message.extend_from_slice(TRANSCRIPT_LABEL_FINISH);
    message.extend_from_slice(server_nonce);
    message.extend_from_slice(session_id.as_bytes());
    message
}

/// Session id: UUID-formatted first half of SHA-256 over both nonces.
fn derive_session_id(client_nonce: &[u8; 32], server_nonce: &[u8; 32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_nonce);
    hasher.update(server_nonce);
    let digest = hasher.finalize();
    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(id_bytes).to_string()
}

fn derive_directional_keys(
    bundle: &KeyBundle,
    peer_exchange: &ExchangePublicKey,
    client_nonce: &[u8; 32],
    server_nonce: &[u8; 32],
    client_fingerprint: &str,
    server_fingerprint: &str,
) -> ([u8; 32], [u8; 32]) {
    let shared = bundle.exchange.diffie_hellman(peer_exchange);
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(client_nonce);
    salt.extend_from_slice(server_nonce);
    let kdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());

    let expand = |label: &[u8]| -> [u8; 32] {
        let mut info = Vec::with_capacity(64);
        info.extend_from_slice(label);
        info.extend_from_slice(client_fingerprint.as_bytes());
        info.extend_from_slice(server_fingerprint.as_bytes());
        let mut key = [0u8; 32];
        // 32-byte output always fits the HKDF-SHA256 expansion bound.
        kdf.expand(&info, &mut key)
            .expect("hkdf expand of 32 bytes cannot fail");
        key
    };
    (
        expand(KEY_LABEL_CLIENT_TO_SERVER),
        expand(KEY_LABEL_SERVER_TO_CLIENT),
    )
}

fn decode_public_bundle(
    signing_b64: &str,
    exchange_b64: &str,
) -> Result<PublicKeyBundle, HandshakeError> {
    let signing_bytes = decode_fixed::<32>("signing public key", signing_b64)?;
    let exchange_bytes = decode_fixed::<32>("exchange public key", exchange_b64)?;
    let signing = VerifyingKey::from_bytes(&signing_bytes).map_err(|_| {
        HandshakeError::MalformedMessage("invalid ed25519 public key bytes".to_string())
    })?;
    Ok(PublicKeyBundle {
        signing,
        exchange: ExchangePublicKey::from(exchange_bytes),
    })
}

fn decode_nonce(label: &str, raw: &str) -> Result<[u8; 32], HandshakeError> {
    decode_fixed::<32>(label, raw)
}

fn decode_fixed<const N: usize>(label: &str, raw: &str) -> Result<[u8; N], HandshakeError> {
    let decoded = decode_base64_field(label, raw)
        .map_err(|error| HandshakeError::MalformedMessage(error.to_string()))?;
    let decoded_len = decoded.len();
    decoded.try_into().map_err(|_| {
        HandshakeError::MalformedMessage(format!(
            "{} decoded to {} bytes (expected {})",
            label, decoded_len, N
        ))
    })
}

fn verify_signature(
    key: &VerifyingKey,
    message: &[u8],
    signature_b64: &str,
) -> Result<(), HandshakeError> {
    let signature_bytes = decode_fixed::<64>("signature", signature_b64)?;
    let signature = Signature::from_bytes(&signature_bytes);
    key.verify_strict(message, &signature)
        .map_err(|_| HandshakeError::InvalidSignature)
}
