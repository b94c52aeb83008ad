//! Axum surface: handshake endpoints, the sealed request endpoint, and the
//! webhook receiver.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use drawlatch_core::current_unix_timestamp_ms;
use drawlatch_crypto::{respond_to_init, KeyBundle};
use drawlatch_proto::{
    decode_base64_field, encode_base64_field, EncryptedEnvelope, ErrorKind, HandshakeFinish,
    HandshakeInit, ProxyError, ProxyRequest, ProxyResponse,
};

use crate::session::SessionTable;
use crate::tools::{dispatch_tool, ToolContext, ToolDeps};

pub struct ServerState {
    pub deps: ToolDeps,
    pub bundle: KeyBundle,
    /// Peer fingerprint to caller alias, built from the peer key directories.
    pub caller_fingerprints: BTreeMap<String, String>,
    pub sessions: SessionTable,
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/handshake/init", post(handle_handshake_init))
        .route("/handshake/finish", post(handle_handshake_finish))
        .route("/session/:id/request", post(handle_session_request))
        .route("/webhooks/:path", post(handle_webhook_delivery))
        .with_state(state)
}

fn error_response(status: StatusCode, error: &ProxyError) -> Response {
    (status, Json(json!({ "ok": false, "error": error }))).into_response()
}

fn handshake_error_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::UnknownPeer | ErrorKind::InvalidSignature => StatusCode::UNAUTHORIZED,
        _ => StatusCode::BAD_REQUEST,
    }
}

async fn handle_handshake_init(
    State(state): State<Arc<ServerState>>,
    Json(init): Json<HandshakeInit>,
) -> Response {
    state.sessions.sweep(current_unix_timestamp_ms());
    let known: std::collections::BTreeSet<String> =
        state.caller_fingerprints.keys().cloned().collect();

    let (pending, reply) = match respond_to_init(
        &state.bundle,
        &init,
        &known,
        current_unix_timestamp_ms(),
    ) {
        Ok(accepted) => accepted,
        Err(error) => {
            tracing::warn!(error = %error, "handshake init rejected");
            let proxy_error = ProxyError::new(error.kind(), error.to_string());
            return error_response(handshake_error_status(error.kind()), &proxy_error);
        }
    };

    let Some(caller_alias) = state.caller_fingerprints.get(pending.client_fingerprint()) else {
        let proxy_error = ProxyError::new(ErrorKind::UnknownPeer, "fingerprint is not registered");
        return error_response(StatusCode::UNAUTHORIZED, &proxy_error);
    };
    tracing::info!(caller = %caller_alias, session = %pending.session_id(), "handshake initiated");
    state.sessions.insert_pending(pending, caller_alias);
    Json(reply).into_response()
}

async fn handle_handshake_finish(
    State(state): State<Arc<ServerState>>,
    Json(finish): Json<HandshakeFinish>,
) -> Response {
    match state.sessions.complete_handshake(&finish) {
        Ok(session_id) => {
            tracing::info!(session = %session_id, "session established");
            Json(json!({ "ok": true })).into_response()
        }
        Err(error) => {
            let status = match error.kind {
                ErrorKind::SessionNotFound => StatusCode::NOT_FOUND,
                kind => handshake_error_status(kind),
            };
            error_response(status, &error)
        }
    }
}

async fn handle_session_request(
    State(state): State<Arc<ServerState>>,
    AxumPath(session_id): AxumPath<String>,
    Json(envelope): Json<EncryptedEnvelope>,
) -> Response {
    state.sessions.sweep(current_unix_timestamp_ms());

    let decoded = decode_base64_field("nonce", &envelope.nonce).and_then(|nonce| {
        decode_base64_field("ciphertext", &envelope.ciphertext)
            .map(|ciphertext| (nonce, ciphertext))
    });
    let (nonce, ciphertext) = match decoded {
        Ok(fields) => fields,
        Err(error) => {
            let proxy_error = ProxyError::new(ErrorKind::MalformedMessage, error.to_string());
            return error_response(StatusCode::BAD_REQUEST, &proxy_error);
        }
    };

    let (caller_alias, plaintext) = match state.sessions.open(&session_id, &nonce, &ciphertext) {
        Ok(opened) => opened,
        Err(error) => {
            let status = match error.kind {
                ErrorKind::SessionNotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::UNAUTHORIZED,
            };
            return error_response(status, &error);
        }
    };

    let reply = match serde_json::from_slice::<ProxyRequest>(&plaintext) {
        Ok(ProxyRequest {
            request_id,
            tool,
            input,
        }) => {
            let context = ToolContext {
                caller_alias: &caller_alias,
                deps: &state.deps,
            };
            match dispatch_tool(&context, &tool, input).await {
                Ok(result) => ProxyResponse::success(request_id, result),
                Err(error) => {
                    tracing::debug!(
                        caller = %caller_alias,
                        tool = %tool,
                        kind = %error.kind,
                        "tool call failed"
                    );
                    ProxyResponse::failure(request_id, error)
                }
            }
        }
        Err(error) => ProxyResponse::failure(
            String::new(),
            ProxyError::new(
                ErrorKind::MalformedMessage,
                format!("request frame was not valid JSON: {}", error),
            ),
        ),
    };

    let reply_bytes = match serde_json::to_vec(&reply) {
        Ok(bytes) => bytes,
        Err(error) => {
            let proxy_error = ProxyError::new(ErrorKind::MalformedMessage, error.to_string());
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &proxy_error);
        }
    };
    match state.sessions.seal(&session_id, &reply_bytes) {
        Ok((nonce, ciphertext)) => Json(EncryptedEnvelope {
            nonce: encode_base64_field(&nonce),
            ciphertext: encode_base64_field(&ciphertext),
        })
        .into_response(),
        Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &error),
    }
}

async fn handle_webhook_delivery(
    State(state): State<Arc<ServerState>>,
    AxumPath(path): AxumPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ingestors = state.deps.manager.get_webhook_ingestors(&path);
    if ingestors.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "accepted": false,
                "reason": format!("no webhook ingestor serves path '{}'", path)
            })),
        )
            .into_response();
    }

    let header_map: BTreeMap<String, String> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let outcomes: Vec<_> = ingestors
        .iter()
        .map(|ingestor| ingestor.handle_webhook(&header_map, &body))
        .collect();
    for outcome in outcomes.iter().filter(|outcome| !outcome.accepted) {
        if let Some(reason) = outcome.reason.as_deref() {
            tracing::warn!(
                path = %path,
                kind = %drawlatch_ingest::rejection_kind(reason),
                reason = %reason,
                "webhook delivery rejected"
            );
        }
    }
    let accepted = outcomes.iter().any(|outcome| outcome.accepted);
    let status = if accepted {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (
        status,
        Json(json!({ "accepted": accepted, "outcomes": outcomes })),
    )
        .into_response()
}
