//! Wire contracts shared by the Drawlatch proxy client and remote server.
//!
//! Defines the handshake message frames, the encrypted request envelope, the
//! plaintext tool-call frames carried inside it, the ingested-event record,
//! and the machine-readable error taxonomy. Binary fields travel as base64
//! strings inside JSON bodies.

mod error;
mod frames;

pub use error::{ErrorKind, ProxyError};
pub use frames::{
    decode_base64_field, encode_base64_field, EncryptedEnvelope, HandshakeFinish, HandshakeInit,
    HandshakeReply, IngestedEventRecord, ProxyRequest, ProxyResponse, WebhookOutcome,
};
