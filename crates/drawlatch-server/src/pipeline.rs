//! The `http_request` pipeline: policy check, header merge, dispatch.
//!
//! Upstream status codes and bodies are returned to the caller verbatim; only
//! transport failures surface as `UpstreamError`. Endpoint whitelisting runs
//! before rate-limit admission so that denied endpoints cannot drain a
//! caller's budget.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use drawlatch_config::{is_endpoint_allowed, match_route, ResolvedRoute};
use drawlatch_core::current_unix_timestamp_ms;
use drawlatch_proto::{ErrorKind, ProxyError};

use crate::rate_limit::RateLimiter;

pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestInput {
    pub connection: String,
    pub method: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

pub struct RequestPipeline {
    client: reqwest::Client,
}

impl RequestPipeline {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create outbound http client")?;
        Ok(Self { client })
    }

    pub async fn execute(
        &self,
        caller_alias: &str,
        routes: &[ResolvedRoute],
        limiter: &RateLimiter,
        input: HttpRequestInput,
    ) -> Result<Value, ProxyError> {
        let route = match_route(&input.connection, routes)?;
        let effective_url = effective_url(route, &input)?;

        if !is_endpoint_allowed(&effective_url, &route.allowed_endpoints) {
            return Err(ProxyError::new(
                ErrorKind::EndpointDenied,
                format!("url is not in the allowlist for connection '{}'", route.alias),
            ));
        }

        let headers = merge_headers(route, &input.headers);

        if !limiter.try_admit(caller_alias, current_unix_timestamp_ms()) {
            return Err(ProxyError::new(
                ErrorKind::RateLimited,
                "rate limit exceeded for this caller",
            ));
        }

        let method = reqwest::Method::from_str(input.method.trim().to_ascii_uppercase().as_str())
            .map_err(|_| {
                ProxyError::new(
                    ErrorKind::MalformedMessage,
                    format!("invalid http method '{}'", input.method),
                )
            })?;

        let mut request = self.client.request(method, &effective_url);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        if !input.query.is_empty() {
            let pairs: Vec<(&String, &String)> = input.query.iter().collect();
            request = request.query(&pairs);
        }
        match &input.body {
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(body) => request = request.json(body),
            None => {}
        }

        let response = request.send().await.map_err(|error| {
            ProxyError::new(
                ErrorKind::UpstreamError,
                format!("request to connection '{}' failed: {}", route.alias, error),
            )
        })?;

        // Non-2xx is not a proxy error; the caller decides.
        let status = response.status().as_u16();
        let mut response_headers = Map::new();
        for (name, value) in response.headers() {
            response_headers.insert(
                name.as_str().to_string(),
                Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            );
        }
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("json"));
        let raw_body = response.bytes().await.map_err(|error| {
            ProxyError::new(
                ErrorKind::UpstreamError,
                format!("failed reading upstream response body: {}", error),
            )
        })?;
        let body = if is_json {
            serde_json::from_slice::<Value>(&raw_body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&raw_body).into_owned()))
        } else {
            Value::String(String::from_utf8_lossy(&raw_body).into_owned())
        };

        Ok(json!({
            "status": status,
            "headers": Value::Object(response_headers),
            "body": body,
        }))
    }
}

fn effective_url(route: &ResolvedRoute, input: &HttpRequestInput) -> Result<String, ProxyError> {
    if let Some(url) = input.url.as_deref().filter(|value| !value.trim().is_empty()) {
        return Ok(url.trim().to_string());
    }
    let Some(path) = input.path.as_deref().filter(|value| !value.trim().is_empty()) else {
        return Err(ProxyError::new(
            ErrorKind::MalformedMessage,
            "http_request requires either 'url' or 'path'",
        ));
    };
    let Some(base_url) = route.base_url.as_deref() else {
        return Err(ProxyError::new(
            ErrorKind::BadConfig,
            format!("connection '{}' has no baseUrl for path-form requests", route.alias),
        ));
    };
    let path = path.trim();
    Ok(format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

/// Template headers first, then caller headers. Headers built from secrets
/// are non-overridable; other collisions resolve in the caller's favor,
/// matching header names case-insensitively.
fn merge_headers(
    route: &ResolvedRoute,
    caller_headers: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = route.headers.clone();
    for (name, value) in caller_headers {
        let protected = route
            .protected_headers
            .iter()
            .any(|header| header.eq_ignore_ascii_case(name));
        if protected {
            continue;
        }
        merged.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
        merged.insert(name.clone(), value.clone());
    }
    merged
}
