//! Typed config model and validating loader for `remote.config.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::templates::builtin_connector_templates;

pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;
pub const DEFAULT_BUFFER_SIZE: usize = 200;
pub const MAX_BUFFER_SIZE: usize = 1_000;

/// Top-level remote server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub local_keys_dir: PathBuf,
    #[serde(default)]
    pub callers: BTreeMap<String, CallerConfig>,
    #[serde(default)]
    pub connectors: Vec<Route>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

fn default_rate_limit() -> u32 {
    DEFAULT_RATE_LIMIT_PER_MINUTE
}

/// Per-caller authorization record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub peer_key_dir: PathBuf,
    #[serde(default)]
    pub connections: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub role: CallerRole,
    #[serde(default)]
    pub ingestor_overrides: BTreeMap<String, IngestorOverrides>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    Admin,
    #[default]
    User,
}

impl CallerRole {
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

/// An addressable outbound service template. Values may carry `${VAR}`
/// placeholders until resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub alias: String,
    /// Base joined with `path`-form requests; `url`-form requests bypass it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingestor: Option<IngestorConfig>,
}

/// Ingestor stanza attached to a route, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IngestorConfig {
    Websocket(WebsocketIngestorConfig),
    Webhook(WebhookIngestorConfig),
    Poll(PollIngestorConfig),
}

impl IngestorConfig {
    pub fn buffer_size(&self) -> usize {
        let requested = match self {
            Self::Websocket(config) => config.buffer_size,
            Self::Webhook(config) => config.buffer_size,
            Self::Poll(config) => config.buffer_size,
        };
        requested.unwrap_or(DEFAULT_BUFFER_SIZE).clamp(1, MAX_BUFFER_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsocketIngestorConfig {
    pub protocol: String,
    pub gateway_url: String,
    /// Placeholder-bearing bot token reference, resolved with the secrets.
    pub token: String,
    #[serde(default)]
    pub intents: Option<u64>,
    #[serde(default)]
    pub event_filter: Vec<String>,
    #[serde(default)]
    pub guild_ids: Vec<String>,
    #[serde(default)]
    pub channel_ids: Vec<String>,
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookProvider {
    Github,
    Stripe,
    Trello,
}

impl WebhookProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Stripe => "stripe",
            Self::Trello => "trello",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookIngestorConfig {
    pub provider: WebhookProvider,
    pub webhook_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_secret: Option<String>,
    /// Trello signs `rawBody + callbackURL`; unused by other providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Stripe timestamp tolerance in seconds; 0 disables the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollIngestorConfig {
    pub url: String,
    #[serde(default = "default_poll_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    pub interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplicate_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
}

fn default_poll_method() -> String {
    "GET".to_string()
}

/// Caller-scoped ingestor tuning. Only fields whose shape matches the
/// template's ingestor type are applied during the merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestorOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intents: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_filter: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
}

/// Parses and validates a `remote.config.json`.
pub fn load_remote_config(path: &Path) -> Result<RemoteConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: RemoteConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    validate_remote_config(&config)?;
    Ok(config)
}

/// Structural validation shared by the loader and the admin mutation path.
pub fn validate_remote_config(config: &RemoteConfig) -> Result<()> {
    if config.host.trim().is_empty() {
        bail!("config host must be non-empty");
    }
    if config.port == 0 {
        bail!("config port must be non-zero");
    }
    if config.rate_limit_per_minute == 0 {
        bail!("rateLimitPerMinute must be at least 1");
    }
    if config.local_keys_dir.as_os_str().is_empty() {
        bail!("localKeysDir must be non-empty");
    }

    let mut seen_aliases = std::collections::BTreeSet::new();
    for route in &config.connectors {
        if route.alias.trim().is_empty() {
            bail!("connector alias must be non-empty");
        }
        if !seen_aliases.insert(route.alias.as_str()) {
            bail!("duplicate connector alias '{}'", route.alias);
        }
    }

    let table = merged_connector_table(config);
    for (caller_alias, caller) in &config.callers {
        if caller.peer_key_dir.as_os_str().is_empty() {
            bail!("caller '{}' peerKeyDir must be non-empty", caller_alias);
        }
        for connection in &caller.connections {
            if !table.contains_key(connection) {
                bail!(
                    "caller '{}' references unknown connection '{}'",
                    caller_alias,
                    connection
                );
            }
        }
        for connection in caller.ingestor_overrides.keys() {
            if !caller.connections.contains(connection) {
                bail!(
                    "caller '{}' has ingestorOverrides for disabled connection '{}'",
                    caller_alias,
                    connection
                );
            }
        }
    }
    Ok(())
}

/// Builtin templates with user connectors layered on top; a user definition
/// wins on alias collision.
pub fn merged_connector_table(config: &RemoteConfig) -> BTreeMap<String, Route> {
    let mut table: BTreeMap<String, Route> = builtin_connector_templates()
        .into_iter()
        .map(|route| (route.alias.clone(), route))
        .collect();
    for route in &config.connectors {
        table.insert(route.alias.clone(), route.clone());
    }
    table
}

#[cfg(test)]
mod tests {
    use drawlatch_core::write_text_atomic;

    use super::*;

    fn minimal_config_json() -> serde_json::Value {
        serde_json::json!({
            "host": "127.0.0.1",
            "port": 8787,
            "localKeysDir": "keys/server",
            "rateLimitPerMinute": 30,
            "callers": {
                "agent-a": {
                    "peerKeyDir": "keys/peers/agent-a",
                    "connections": ["github"],
                    "env": {"GITHUB_TOKEN": "ghp_test"},
                    "role": "admin"
                }
            },
            "connectors": [
                {
                    "alias": "internal",
                    "allowedEndpoints": ["https://internal.example.com/**"]
                }
            ]
        })
    }

    #[test]
    fn functional_load_remote_config_round_trips_callers_and_connectors() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("remote.config.json");
        write_text_atomic(&path, &minimal_config_json().to_string()).expect("write");

        let config = load_remote_config(&path).expect("load");
        assert_eq!(config.port, 8787);
        assert_eq!(config.rate_limit_per_minute, 30);
        let caller = config.callers.get("agent-a").expect("caller");
        assert_eq!(caller.role, CallerRole::Admin);
        assert_eq!(caller.connections, vec!["github".to_string()]);
        assert!(merged_connector_table(&config).contains_key("internal"));
    }

    #[test]
    fn unit_validate_rejects_unknown_connection_reference() {
        let mut raw = minimal_config_json();
        raw["callers"]["agent-a"]["connections"] =
            serde_json::json!(["github", "not-a-connector"]);
        let config: RemoteConfig = serde_json::from_value(raw).expect("parse");
        let error = validate_remote_config(&config).expect_err("must reject");
        assert!(error.to_string().contains("unknown connection"));
    }

    #[test]
    fn unit_validate_rejects_duplicate_connector_alias() {
        let mut raw = minimal_config_json();
        raw["connectors"] = serde_json::json!([
            {"alias": "dup", "allowedEndpoints": []},
            {"alias": "dup", "allowedEndpoints": []}
        ]);
        let config: RemoteConfig = serde_json::from_value(raw).expect("parse");
        let error = validate_remote_config(&config).expect_err("must reject");
        assert!(error.to_string().contains("duplicate connector alias"));
    }

    #[test]
    fn unit_user_connector_shadows_builtin_template() {
        let mut raw = minimal_config_json();
        raw["connectors"] = serde_json::json!([
            {"alias": "github", "allowedEndpoints": ["https://github.example.com/**"]}
        ]);
        let config: RemoteConfig = serde_json::from_value(raw).expect("parse");
        let table = merged_connector_table(&config);
        assert_eq!(
            table.get("github").expect("github").allowed_endpoints,
            vec!["https://github.example.com/**".to_string()]
        );
    }

    #[test]
    fn unit_role_defaults_to_user() {
        let caller: CallerConfig = serde_json::from_value(serde_json::json!({
            "peerKeyDir": "keys/peers/x",
            "connections": []
        }))
        .expect("parse");
        assert_eq!(caller.role, CallerRole::User);
        assert!(!caller.role.is_admin());
    }

    #[test]
    fn unit_buffer_size_clamps_to_supported_range() {
        let huge = IngestorConfig::Poll(PollIngestorConfig {
            url: "https://api.example.com/items".to_string(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
            interval_ms: 1_000,
            response_path: None,
            deduplicate_by: None,
            event_type: None,
            buffer_size: Some(9_999),
        });
        assert_eq!(huge.buffer_size(), MAX_BUFFER_SIZE);

        let unset = IngestorConfig::Webhook(WebhookIngestorConfig {
            provider: WebhookProvider::Github,
            webhook_path: "github".to_string(),
            signature_header: None,
            signature_secret: None,
            callback_url: None,
            tolerance_seconds: None,
            buffer_size: None,
        });
        assert_eq!(unset.buffer_size(), DEFAULT_BUFFER_SIZE);
    }
}
