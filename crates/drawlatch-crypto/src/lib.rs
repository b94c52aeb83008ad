//! Cryptographic identity, session channel, and handshake for Drawlatch.
//!
//! Identities are static Ed25519 signing keys paired with static X25519
//! exchange keys; sessions are established by a three-leg mutually
//! authenticated handshake and carried over a ChaCha20-Poly1305 channel with
//! counter-derived nonces and strict-monotonic replay rejection.

pub mod channel;
pub mod handshake;
pub mod keys;

pub use channel::{ChannelError, EncryptedChannel, SessionKeys};
pub use handshake::{
    respond_to_init, ClientHandshake, HandshakeError, ServerPendingSession, HANDSHAKE_MAX_SKEW_MS,
};
pub use keys::{
    fingerprint, generate_key_bundle, load_key_bundle, load_peer_bundles, load_peer_fingerprints,
    save_key_bundle, save_peer_public_bundle, KeyBundle, PublicKeyBundle,
};
