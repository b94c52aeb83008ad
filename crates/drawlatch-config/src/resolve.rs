//! Placeholder substitution and caller route resolution.

use std::collections::{BTreeMap, BTreeSet};

use drawlatch_proto::{ErrorKind, ProxyError};

use crate::model::{
    merged_connector_table, CallerConfig, IngestorConfig, RemoteConfig, Route,
};

/// Placeholder lookup: caller-scoped env overlaid on the process environment.
/// The caller layer wins on collision.
pub struct EnvLookup<'a> {
    caller_env: &'a BTreeMap<String, String>,
}

impl<'a> EnvLookup<'a> {
    pub fn new(caller_env: &'a BTreeMap<String, String>) -> Self {
        Self { caller_env }
    }

    fn get(&self, name: &str) -> Option<String> {
        if let Some(value) = self.caller_env.get(name) {
            return Some(value.clone());
        }
        std::env::var(name).ok()
    }
}

/// A route with every `${VAR}` placeholder substituted. Headers that were
/// built from secret material are recorded as protected: callers may not
/// override them per request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRoute {
    pub alias: String,
    pub base_url: Option<String>,
    pub allowed_endpoints: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub protected_headers: BTreeSet<String>,
    pub secrets: BTreeMap<String, String>,
    pub ingestor: Option<IngestorConfig>,
}

impl ResolvedRoute {
    /// Redacted summary for `list_routes`; secret values never leave the
    /// server.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "alias": self.alias,
            "baseUrl": self.base_url,
            "allowedEndpoints": self.allowed_endpoints,
            "headers": self.headers.keys().collect::<Vec<_>>(),
            "secrets": self.secrets.keys().collect::<Vec<_>>(),
            "ingestor": self.ingestor.as_ref().map(ingestor_kind),
        })
    }
}

fn ingestor_kind(config: &IngestorConfig) -> &'static str {
    match config {
        IngestorConfig::Websocket(_) => "websocket",
        IngestorConfig::Webhook(_) => "webhook",
        IngestorConfig::Poll(_) => "poll",
    }
}

/// Expands `${VAR}` references in a single value. Unknown references fail
/// with the missing variable name; a literal `$` not followed by `{` passes
/// through untouched.
pub fn substitute_placeholders(input: &str, lookup: &EnvLookup<'_>) -> Result<String, ProxyError> {
    substitute_with(input, |name| lookup.get(name))
}

fn substitute_with(
    input: &str,
    get: impl Fn(&str) -> Option<String>,
) -> Result<String, ProxyError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(ProxyError::new(
                ErrorKind::BadConfig,
                format!("unterminated placeholder in '{}'", input),
            ));
        };
        let name = &after[..end];
        if name.is_empty() {
            return Err(ProxyError::new(
                ErrorKind::BadConfig,
                "empty placeholder name".to_string(),
            ));
        }
        let Some(value) = get(name) else {
            return Err(ProxyError::new(
                ErrorKind::MissingSecret,
                format!("environment reference '{}' is not set", name),
            ));
        };
        output.push_str(&value);
        rest = &after[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

/// Expands every value of a secrets map.
pub fn resolve_secrets(
    secrets: &BTreeMap<String, String>,
    lookup: &EnvLookup<'_>,
) -> Result<BTreeMap<String, String>, ProxyError> {
    let mut resolved = BTreeMap::new();
    for (name, value) in secrets {
        resolved.insert(name.clone(), substitute_placeholders(value, lookup)?);
    }
    Ok(resolved)
}

/// Raw routes a caller has enabled, in the caller's declared order.
pub fn resolve_caller_routes(
    config: &RemoteConfig,
    caller_alias: &str,
) -> Result<(CallerConfig, Vec<Route>), ProxyError> {
    let Some(caller) = config.callers.get(caller_alias) else {
        return Err(ProxyError::new(
            ErrorKind::UnknownCaller,
            format!("caller '{}' is not registered", caller_alias),
        ));
    };
    let table = merged_connector_table(config);
    let mut routes = Vec::with_capacity(caller.connections.len());
    for connection in &caller.connections {
        let Some(route) = table.get(connection) else {
            return Err(ProxyError::new(
                ErrorKind::BadConfig,
                format!(
                    "caller '{}' references unknown connection '{}'",
                    caller_alias, connection
                ),
            ));
        };
        routes.push(route.clone());
    }
    Ok((caller.clone(), routes))
}

/// Substitutes every placeholder in a set of raw routes. The inputs are not
/// mutated. Header templates resolve over the route's resolved secrets first,
/// then the environment; any header that referenced a placeholder becomes
/// protected.
pub fn resolve_routes(
    raw_routes: &[Route],
    caller_env: &BTreeMap<String, String>,
) -> Result<Vec<ResolvedRoute>, ProxyError> {
    let lookup = EnvLookup::new(caller_env);
    raw_routes
        .iter()
        .map(|route| resolve_route(route, &lookup))
        .collect()
}

fn resolve_route(route: &Route, lookup: &EnvLookup<'_>) -> Result<ResolvedRoute, ProxyError> {
    let secrets = resolve_secrets(&route.secrets, lookup)?;

    let base_url = match &route.base_url {
        Some(base_url) => Some(substitute_placeholders(base_url, lookup)?),
        None => None,
    };

    let mut allowed_endpoints = Vec::with_capacity(route.allowed_endpoints.len());
    for pattern in &route.allowed_endpoints {
        allowed_endpoints.push(substitute_placeholders(pattern, lookup)?);
    }

    let mut headers = BTreeMap::new();
    let mut protected_headers = BTreeSet::new();
    for (name, template) in &route.headers {
        let resolved = if template.contains("${") {
            protected_headers.insert(name.clone());
            substitute_header(template, &secrets, lookup)?
        } else {
            template.clone()
        };
        headers.insert(name.clone(), resolved);
    }

    let ingestor = match &route.ingestor {
        Some(config) => Some(resolve_ingestor(config, &secrets, lookup)?),
        None => None,
    };

    Ok(ResolvedRoute {
        alias: route.alias.clone(),
        base_url,
        allowed_endpoints,
        headers,
        protected_headers,
        secrets,
        ingestor,
    })
}

/// Header placeholders prefer the route's secrets, falling back to env.
fn substitute_header(
    template: &str,
    secrets: &BTreeMap<String, String>,
    lookup: &EnvLookup<'_>,
) -> Result<String, ProxyError> {
    substitute_with(template, |name| {
        secrets.get(name).cloned().or_else(|| lookup.get(name))
    })
}

fn resolve_ingestor(
    config: &IngestorConfig,
    secrets: &BTreeMap<String, String>,
    lookup: &EnvLookup<'_>,
) -> Result<IngestorConfig, ProxyError> {
    let substitute_secretish = |template: &str| -> Result<String, ProxyError> {
        substitute_header(template, secrets, lookup)
    };

    match config {
        IngestorConfig::Websocket(websocket) => {
            let mut resolved = websocket.clone();
            resolved.gateway_url = substitute_placeholders(&websocket.gateway_url, lookup)?;
            resolved.token = substitute_secretish(&websocket.token)?;
            Ok(IngestorConfig::Websocket(resolved))
        }
        IngestorConfig::Webhook(webhook) => {
            let mut resolved = webhook.clone();
            if let Some(secret) = &webhook.signature_secret {
                resolved.signature_secret = Some(substitute_secretish(secret)?);
            }
            if let Some(callback_url) = &webhook.callback_url {
                resolved.callback_url = Some(substitute_placeholders(callback_url, lookup)?);
            }
            Ok(IngestorConfig::Webhook(resolved))
        }
        IngestorConfig::Poll(poll) => {
            let mut resolved = poll.clone();
            resolved.url = substitute_placeholders(&poll.url, lookup)?;
            let mut headers = BTreeMap::new();
            for (name, template) in &poll.headers {
                headers.insert(name.clone(), substitute_secretish(template)?);
            }
            resolved.headers = headers;
            Ok(IngestorConfig::Poll(resolved))
        }
    }
}

/// Looks up a resolved route by connection alias.
pub fn match_route<'a>(
    connection_alias: &str,
    routes: &'a [ResolvedRoute],
) -> Result<&'a ResolvedRoute, ProxyError> {
    routes
        .iter()
        .find(|route| route.alias == connection_alias)
        .ok_or_else(|| {
            ProxyError::new(
                ErrorKind::UnknownConnection,
                format!("connection '{}' is not enabled for this caller", connection_alias),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{WebhookIngestorConfig, WebhookProvider};

    fn caller_env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn unit_substitute_placeholders_expands_caller_env() {
        let env = caller_env(&[("GITHUB_TOKEN", "ghp_abc")]);
        let lookup = EnvLookup::new(&env);
        let resolved =
            substitute_placeholders("Bearer ${GITHUB_TOKEN}", &lookup).expect("resolve");
        assert_eq!(resolved, "Bearer ghp_abc");
    }

    #[test]
    fn unit_missing_reference_is_missing_secret() {
        let env = caller_env(&[]);
        let lookup = EnvLookup::new(&env);
        let error = substitute_placeholders("${DRAWLATCH_TEST_UNSET_VAR}", &lookup)
            .expect_err("must fail");
        assert_eq!(error.kind, ErrorKind::MissingSecret);
        assert!(error.message.contains("DRAWLATCH_TEST_UNSET_VAR"));
    }

    #[test]
    fn unit_unterminated_placeholder_is_bad_config() {
        let env = caller_env(&[]);
        let lookup = EnvLookup::new(&env);
        let error = substitute_placeholders("${OOPS", &lookup).expect_err("must fail");
        assert_eq!(error.kind, ErrorKind::BadConfig);
    }

    #[test]
    fn functional_resolve_routes_substitutes_headers_and_marks_protected() {
        let route = Route {
            alias: "github".to_string(),
            base_url: Some("https://api.github.com".to_string()),
            allowed_endpoints: vec!["https://api.github.com/**".to_string()],
            secrets: caller_env(&[("GITHUB_TOKEN", "${GITHUB_TOKEN}")]),
            headers: caller_env(&[
                ("Authorization", "Bearer ${GITHUB_TOKEN}"),
                ("Accept", "application/vnd.github+json"),
            ]),
            ingestor: None,
        };
        let env = caller_env(&[("GITHUB_TOKEN", "ghp_zzz")]);

        let resolved = resolve_routes(&[route.clone()], &env).expect("resolve");
        assert_eq!(resolved.len(), 1);
        let github = &resolved[0];
        assert_eq!(github.headers["Authorization"], "Bearer ghp_zzz");
        assert!(github.protected_headers.contains("Authorization"));
        assert!(!github.protected_headers.contains("Accept"));
        assert_eq!(github.secrets["GITHUB_TOKEN"], "ghp_zzz");
        // The raw route is untouched.
        assert_eq!(route.headers["Authorization"], "Bearer ${GITHUB_TOKEN}");
    }

    #[test]
    fn functional_resolve_routes_substitutes_ingestor_secret() {
        let route = Route {
            alias: "stripe".to_string(),
            base_url: None,
            allowed_endpoints: vec![],
            secrets: caller_env(&[("STRIPE_WEBHOOK_SECRET", "${STRIPE_WEBHOOK_SECRET}")]),
            headers: BTreeMap::new(),
            ingestor: Some(IngestorConfig::Webhook(WebhookIngestorConfig {
                provider: WebhookProvider::Stripe,
                webhook_path: "stripe".to_string(),
                signature_header: Some("Stripe-Signature".to_string()),
                signature_secret: Some("${STRIPE_WEBHOOK_SECRET}".to_string()),
                callback_url: None,
                tolerance_seconds: None,
                buffer_size: None,
            })),
        };
        let env = caller_env(&[("STRIPE_WEBHOOK_SECRET", "whsec_test")]);

        let resolved = resolve_routes(&[route], &env).expect("resolve");
        let Some(IngestorConfig::Webhook(webhook)) = &resolved[0].ingestor else {
            panic!("expected webhook ingestor");
        };
        assert_eq!(webhook.signature_secret.as_deref(), Some("whsec_test"));
    }

    #[test]
    fn unit_match_route_reports_unknown_connection() {
        let error = match_route("absent", &[]).expect_err("must fail");
        assert_eq!(error.kind, ErrorKind::UnknownConnection);
    }

    #[test]
    fn unit_route_summary_redacts_secret_values() {
        let resolved = ResolvedRoute {
            alias: "github".to_string(),
            base_url: Some("https://api.github.com".to_string()),
            allowed_endpoints: vec!["https://api.github.com/**".to_string()],
            headers: caller_env(&[("Authorization", "Bearer ghp_secret")]),
            protected_headers: BTreeSet::new(),
            secrets: caller_env(&[("GITHUB_TOKEN", "ghp_secret")]),
            ingestor: None,
        };
        let summary = serde_json::to_string(&resolved.summary()).expect("serialize");
        assert!(!summary.contains("ghp_secret"));
        assert!(summary.contains("GITHUB_TOKEN"));
    }
}
