//! Session table: pending handshakes and established encrypted channels.

use std::collections::HashMap;
use std::sync::Mutex;

use drawlatch_core::current_unix_timestamp_ms;
use drawlatch_crypto::{ChannelError, EncryptedChannel, ServerPendingSession};
use drawlatch_proto::{ErrorKind, HandshakeFinish, ProxyError};

/// Sessions idle longer than this are swept.
const SESSION_INACTIVITY_TIMEOUT_MS: u64 = 30 * 60 * 1_000;
/// Pending handshakes must finish within this window.
const PENDING_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

struct PendingEntry {
    pending: ServerPendingSession,
    caller_alias: String,
    created_unix_ms: u64,
}

struct SessionEntry {
    channel: EncryptedChannel,
    caller_alias: String,
    last_active_unix_ms: u64,
}

/// Keyed by session id. Channel-level authentication failures drop the
/// session immediately; the client must re-handshake.
#[derive(Default)]
pub struct SessionTable {
    pending: Mutex<HashMap<String, PendingEntry>>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pending(&self, pending: ServerPendingSession, caller_alias: &str) {
        let session_id = pending.session_id().to_string();
        let mut table = self.lock_pending();
        table.insert(
            session_id,
            PendingEntry {
                pending,
                caller_alias: caller_alias.to_string(),
                created_unix_ms: current_unix_timestamp_ms(),
            },
        );
    }

    /// Completes the third handshake leg and promotes the pending entry to a
    /// live session.
    pub fn complete_handshake(&self, finish: &HandshakeFinish) -> Result<String, ProxyError> {
        let entry = {
            let mut table = self.lock_pending();
            table.remove(&finish.session_id)
        };
        let Some(entry) = entry else {
            return Err(ProxyError::new(
                ErrorKind::SessionNotFound,
                "no pending handshake for that session id",
            ));
        };
        let keys = entry
            .pending
            .finish(finish)
            .map_err(|error| ProxyError::new(error.kind(), error.to_string()))?;
        let session_id = keys.session_id.clone();
        let mut table = self.lock_sessions();
        table.insert(
            session_id.clone(),
            SessionEntry {
                channel: EncryptedChannel::new(&keys),
                caller_alias: entry.caller_alias,
                last_active_unix_ms: current_unix_timestamp_ms(),
            },
        );
        Ok(session_id)
    }

    /// Decrypts one inbound envelope. Authentication failures and replays
    /// drop the session before returning the error.
    pub fn open(
        &self,
        session_id: &str,
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<(String, Vec<u8>), ProxyError> {
        let mut table = self.lock_sessions();
        let Some(entry) = table.get_mut(session_id) else {
            return Err(ProxyError::new(
                ErrorKind::SessionNotFound,
                "unknown or expired session",
            ));
        };
        match entry.channel.open(nonce, ciphertext) {
            Ok(plaintext) => {
                entry.last_active_unix_ms = current_unix_timestamp_ms();
                Ok((entry.caller_alias.clone(), plaintext))
            }
            Err(error) => {
                let kind = match error {
                    ChannelError::ReplayDetected => ErrorKind::ReplayDetected,
                    ChannelError::MalformedNonce => ErrorKind::MalformedMessage,
                    _ => ErrorKind::InvalidSignature,
                };
                table.remove(session_id);
                Err(ProxyError::new(kind, error.to_string()))
            }
        }
    }

    /// Seals one outbound payload for the session.
    pub fn seal(&self, session_id: &str, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), ProxyError> {
        let mut table = self.lock_sessions();
        let Some(entry) = table.get_mut(session_id) else {
            return Err(ProxyError::new(
                ErrorKind::SessionNotFound,
                "unknown or expired session",
            ));
        };
        let sealed = entry.channel.seal(plaintext);
        match sealed {
            Ok(envelope) => Ok(envelope),
            Err(error) => {
                table.remove(session_id);
                Err(ProxyError::new(ErrorKind::InvalidSignature, error.to_string()))
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Drops idle sessions and stale pending handshakes.
    pub fn sweep(&self, now_unix_ms: u64) {
        self.lock_pending().retain(|_, entry| {
            now_unix_ms.saturating_sub(entry.created_unix_ms) < PENDING_HANDSHAKE_TIMEOUT_MS
        });
        self.lock_sessions().retain(|_, entry| {
            now_unix_ms.saturating_sub(entry.last_active_unix_ms) < SESSION_INACTIVITY_TIMEOUT_MS
        });
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use drawlatch_crypto::{
        generate_key_bundle, respond_to_init, ClientHandshake, EncryptedChannel, KeyBundle,
    };

    use super::*;

    fn fingerprints(bundle: &KeyBundle) -> BTreeSet<String> {
        BTreeSet::from([bundle.fingerprint()])
    }

    fn establish(table: &SessionTable) -> (EncryptedChannel, String) {
        let client = generate_key_bundle();
        let server = generate_key_bundle();
        let now = current_unix_timestamp_ms();
        let (state, init) = ClientHandshake::initiate(&client, &server.fingerprint(), now);
        let (pending, reply) =
            respond_to_init(&server, &init, &fingerprints(&client), now).expect("respond");
        table.insert_pending(pending, "agent-a");
        let (keys, finish) = state
            .complete(&reply, &fingerprints(&server), now)
            .expect("complete");
        let session_id = table.complete_handshake(&finish).expect("finish");
        (EncryptedChannel::new(&keys), session_id)
    }

    #[test]
    fn functional_completed_handshake_round_trips_envelopes() {
        let table = SessionTable::new();
        let (mut client_channel, session_id) = establish(&table);

        let (nonce, ciphertext) = client_channel.seal(b"tool call").expect("seal");
        let (caller, plaintext) = table.open(&session_id, &nonce, &ciphertext).expect("open");
        assert_eq!(caller, "agent-a");
        assert_eq!(plaintext, b"tool call");

        let (nonce, ciphertext) = table.seal(&session_id, b"tool reply").expect("seal");
        assert_eq!(
            client_channel.open(&nonce, &ciphertext).expect("open"),
            b"tool reply"
        );
    }

    #[test]
    fn regression_replay_drops_the_session() {
        let table = SessionTable::new();
        let (mut client_channel, session_id) = establish(&table);
        let (nonce, ciphertext) = client_channel.seal(b"once").expect("seal");
        table.open(&session_id, &nonce, &ciphertext).expect("open");

        let replay = table
            .open(&session_id, &nonce, &ciphertext)
            .expect_err("replay must fail");
        assert_eq!(replay.kind, ErrorKind::ReplayDetected);

        // The session is gone; the client must re-handshake.
        let (nonce, ciphertext) = client_channel.seal(b"again").expect("seal");
        let gone = table
            .open(&session_id, &nonce, &ciphertext)
            .expect_err("session dropped");
        assert_eq!(gone.kind, ErrorKind::SessionNotFound);
    }

    #[test]
    fn unit_sweep_expires_idle_sessions_and_stale_pending() {
        let table = SessionTable::new();
        let (_client_channel, session_id) = establish(&table);
        assert_eq!(table.session_count(), 1);

        table.sweep(current_unix_timestamp_ms() + SESSION_INACTIVITY_TIMEOUT_MS + 1);
        assert_eq!(table.session_count(), 0);

        let error = table
            .seal(&session_id, b"late")
            .expect_err("session swept");
        assert_eq!(error.kind, ErrorKind::SessionNotFound);
    }

    #[test]
    fn unit_finish_without_pending_entry_is_session_not_found() {
        let table = SessionTable::new();
        let error = table
            .complete_handshake(&HandshakeFinish {
                session_id: "missing".to_string(),
                signature: String::new(),
            })
            .expect_err("no pending");
        assert_eq!(error.kind, ErrorKind::SessionNotFound);
    }
}
