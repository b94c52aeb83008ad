//! The per-session AEAD channel with counter-derived nonces.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};

/// Nonce prefixes keep the two directions in disjoint nonce spaces even
/// though each direction also has its own key.
pub(crate) const NONCE_PREFIX_CLIENT_TO_SERVER: [u8; 4] = [0x64, 0x6c, 0x00, 0x01];
pub(crate) const NONCE_PREFIX_SERVER_TO_CLIENT: [u8; 4] = [0x64, 0x6c, 0x00, 0x02];

const NONCE_LEN: usize = 12;

/// Channel-level failures. All of them are fatal to the session: the caller
/// must discard the channel and re-handshake.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("ciphertext failed authentication")]
    InvalidSignature,
    #[error("nonce counter replayed or out of order")]
    ReplayDetected,
    #[error("malformed channel nonce")]
    MalformedNonce,
    #[error("send nonce counter exhausted")]
    CounterExhausted,
}

/// Per-session key material derived from a completed handshake.
#[derive(Clone)]
pub struct SessionKeys {
    pub session_id: String,
    pub peer_fingerprint: String,
    pub created_unix_ms: u64,
    pub send_key: [u8; 32],
    pub recv_key: [u8; 32],
    pub send_prefix: [u8; 4],
    pub recv_prefix: [u8; 4],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SessionKeys")
            .field("session_id", &self.session_id)
            .field("peer_fingerprint", &self.peer_fingerprint)
            .field("created_unix_ms", &self.created_unix_ms)
            .finish_non_exhaustive()
    }
}

/// Authenticated encryption for one session. Each direction has its own key
/// and strictly monotonic nonce counter; the receive side rejects any nonce
/// that is not exactly the next expected value, so replays and reordering are
/// both fatal.
pub struct EncryptedChannel {
    session_id: String,
    peer_fingerprint: String,
    send_cipher: ChaCha20Poly1305,
    recv_cipher: ChaCha20Poly1305,
    send_prefix: [u8; 4],
    recv_prefix: [u8; 4],
    send_counter: u64,
    recv_counter: u64,
}

impl std::fmt::Debug for EncryptedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedChannel")
            .field("session_id", &self.session_id)
            .field("peer_fingerprint", &self.peer_fingerprint)
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish_non_exhaustive()
    }
}

impl EncryptedChannel {
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            session_id: keys.session_id.clone(),
            peer_fingerprint: keys.peer_fingerprint.clone(),
            send_cipher: ChaCha20Poly1305::new(Key::from_slice(&keys.send_key)),
            recv_cipher: ChaCha20Poly1305::new(Key::from_slice(&keys.recv_key)),
            send_prefix: keys.send_prefix,
            recv_prefix: keys.recv_prefix,
            send_counter: 0,
            recv_counter: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn peer_fingerprint(&self) -> &str {
        &self.peer_fingerprint
    }

    /// Encrypts a plaintext, returning the nonce that must travel with it.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), ChannelError> {
        if self.send_counter == u64::MAX {
            return Err(ChannelError::CounterExhausted);
        }
        let nonce_bytes = build_nonce(&self.send_prefix, self.send_counter);
        let ciphertext = self
            .send_cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| ChannelError::InvalidSignature)?;
        self.send_counter = self.send_counter.saturating_add(1);
        Ok((nonce_bytes.to_vec(), ciphertext))
    }

    /// Authenticates and decrypts one message. The counter embedded in the
    /// nonce must equal the next expected value for this direction.
    pub fn open(&mut self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if nonce.len() != NONCE_LEN {
            return Err(ChannelError::MalformedNonce);
        }
        if nonce[..4] != self.recv_prefix {
            return Err(ChannelError::MalformedNonce);
        }
        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&nonce[4..]);
        let counter = u64::from_be_bytes(counter_bytes);
        if counter != self.recv_counter {
            return Err(ChannelError::ReplayDetected);
        }
        let plaintext = self
            .recv_cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ChannelError::InvalidSignature)?;
        self.recv_counter = self.recv_counter.saturating_add(1);
        Ok(plaintext)
    }
}

fn build_nonce(prefix: &[u8; 4], counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(prefix);
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_channels() -> (EncryptedChannel, EncryptedChannel) {
        let client_keys = SessionKeys {
            session_id: "s-1".to_string(),
            peer_fingerprint: "server-fp".to_string(),
            created_unix_ms: 1,
            send_key: [7; 32],
            recv_key: [9; 32],
            send_prefix: NONCE_PREFIX_CLIENT_TO_SERVER,
            recv_prefix: NONCE_PREFIX_SERVER_TO_CLIENT,
        };
        let server_keys = SessionKeys {
            session_id: "s-1".to_string(),
            peer_fingerprint: "client-fp".to_string(),
            created_unix_ms: 1,
            send_key: [9; 32],
            recv_key: [7; 32],
            send_prefix: NONCE_PREFIX_SERVER_TO_CLIENT,
            recv_prefix: NONCE_PREFIX_CLIENT_TO_SERVER,
        };
        (
            EncryptedChannel::new(&client_keys),
            EncryptedChannel::new(&server_keys),
        )
    }

    #[test]
    fn functional_seal_open_round_trip_in_both_directions() {
        let (mut client, mut server) = paired_channels();
        for payload in [b"first".as_slice(), b"second".as_slice(), b"".as_slice()] {
            let (nonce, ciphertext) = client.seal(payload).expect("seal");
            assert_eq!(server.open(&nonce, &ciphertext).expect("open"), payload);
        }
        let (nonce, ciphertext) = server.seal(b"reply").expect("seal");
        assert_eq!(client.open(&nonce, &ciphertext).expect("open"), b"reply");
    }

    #[test]
    fn regression_tampered_ciphertext_fails_authentication() {
        let (mut client, mut server) = paired_channels();
        let (nonce, mut ciphertext) = client.seal(b"payload").expect("seal");
        ciphertext[0] ^= 0x01;
        assert_eq!(
            server.open(&nonce, &ciphertext),
            Err(ChannelError::InvalidSignature)
        );
    }

    #[test]
    fn regression_replayed_nonce_is_rejected() {
        let (mut client, mut server) = paired_channels();
        let (nonce, ciphertext) = client.seal(b"payload").expect("seal");
        assert!(server.open(&nonce, &ciphertext).is_ok());
        assert_eq!(
            server.open(&nonce, &ciphertext),
            Err(ChannelError::ReplayDetected)
        );
    }

    #[test]
    fn regression_reordered_messages_are_rejected() {
        let (mut client, mut server) = paired_channels();
        let (nonce_a, cipher_a) = client.seal(b"a").expect("seal");
        let (nonce_b, cipher_b) = client.seal(b"b").expect("seal");
        assert_eq!(
            server.open(&nonce_b, &cipher_b),
            Err(ChannelError::ReplayDetected)
        );
        assert!(server.open(&nonce_a, &cipher_a).is_ok());
        assert!(server.open(&nonce_b, &cipher_b).is_ok());
    }

    #[test]
    fn unit_wrong_direction_prefix_is_malformed() {
        let (mut client, mut server) = paired_channels();
        let (mut nonce, ciphertext) = client.seal(b"payload").expect("seal");
        nonce[..4].copy_from_slice(&NONCE_PREFIX_SERVER_TO_CLIENT);
        assert_eq!(
            server.open(&nonce, &ciphertext),
            Err(ChannelError::MalformedNonce)
        );
        assert_eq!(
            server.open(&nonce[..5], &ciphertext),
            Err(ChannelError::MalformedNonce)
        );
    }
}
