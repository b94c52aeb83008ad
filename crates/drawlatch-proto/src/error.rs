use serde::{Deserialize, Serialize};

/// Machine-readable failure tags surfaced to callers. Every user-visible
/// failure carries exactly one of these plus a human-readable message; secret
/// values never appear in the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    BadConfig,
    MissingSecret,
    UnknownCaller,
    UnknownConnection,
    CallerLacksConnection,
    EndpointDenied,
    RateLimited,
    NotAuthorized,
    UnknownPeer,
    InvalidSignature,
    TimestampSkew,
    MalformedMessage,
    ReplayDetected,
    HandshakeTimeout,
    SessionNotFound,
    IngestorStartFailed,
    IngestorNotRunning,
    WebhookSignatureInvalid,
    WebhookBadJson,
    UpstreamError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadConfig => "BadConfig",
            Self::MissingSecret => "MissingSecret",
            Self::UnknownCaller => "UnknownCaller",
            Self::UnknownConnection => "UnknownConnection",
            Self::CallerLacksConnection => "CallerLacksConnection",
            Self::EndpointDenied => "EndpointDenied",
            Self::RateLimited => "RateLimited",
            Self::NotAuthorized => "NotAuthorized",
            Self::UnknownPeer => "UnknownPeer",
            Self::InvalidSignature => "InvalidSignature",
            Self::TimestampSkew => "TimestampSkew",
            Self::MalformedMessage => "MalformedMessage",
            Self::ReplayDetected => "ReplayDetected",
            Self::HandshakeTimeout => "HandshakeTimeout",
            Self::SessionNotFound => "SessionNotFound",
            Self::IngestorStartFailed => "IngestorStartFailed",
            Self::IngestorNotRunning => "IngestorNotRunning",
            Self::WebhookSignatureInvalid => "WebhookSignatureInvalid",
            Self::WebhookBadJson => "WebhookBadJson",
            Self::UpstreamError => "UpstreamError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// A tagged, caller-facing failure. Returned (never raised) from tool
/// handlers and serialized into `ProxyResponse.error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProxyError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_error_kind_serializes_to_bare_tag() {
        let encoded = serde_json::to_string(&ErrorKind::EndpointDenied).expect("serialize");
        assert_eq!(encoded, "\"EndpointDenied\"");
        let decoded: ErrorKind = serde_json::from_str("\"RateLimited\"").expect("deserialize");
        assert_eq!(decoded, ErrorKind::RateLimited);
    }

    #[test]
    fn unit_proxy_error_round_trips_kind_and_message() {
        let error = ProxyError::new(ErrorKind::MissingSecret, "env ref GITHUB_TOKEN is unset");
        let encoded = serde_json::to_value(&error).expect("serialize");
        assert_eq!(encoded["kind"], "MissingSecret");
        let decoded: ProxyError = serde_json::from_value(encoded).expect("deserialize");
        assert_eq!(decoded, error);
    }
}
