//! Admin tool handlers: caller registry and secret management.
//!
//! Mutations load the config file fresh, validate, and write via temp-file +
//! rename. They return `restartRequired: true`: the in-memory route table and
//! running ingestors pick the change up on the next start. Secrets are an
//! exception at read time only; the pipeline re-resolves placeholders per
//! request, so a secret set here applies to subsequent `http_request` calls.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Value};

use drawlatch_config::{
    load_remote_config, merged_connector_table, validate_remote_config, CallerConfig, CallerRole,
    RemoteConfig,
};
use drawlatch_core::{write_text_atomic, write_text_atomic_with_mode};
use drawlatch_crypto::load_peer_fingerprints;
use drawlatch_proto::{ErrorKind, ProxyError};

use crate::tools::{parse_input, ToolContext};

const ENV_FILE_MODE: u32 = 0o600;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterCallerInput {
    alias: String,
    #[serde(default)]
    name: Option<String>,
    peer_key_dir: String,
    #[serde(default)]
    connections: Vec<String>,
    #[serde(default)]
    role: Option<CallerRole>,
}

#[derive(Debug, Deserialize)]
struct CallerAliasInput {
    alias: String,
}

#[derive(Debug, Deserialize)]
struct UpdateConnectionsInput {
    alias: String,
    connections: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SetSecretsInput {
    secrets: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SecretStatusInput {
    names: Vec<String>,
}

pub async fn handle_admin_tool(
    context: &ToolContext<'_>,
    tool: &str,
    input: Value,
) -> Result<Value, ProxyError> {
    if !context.role().is_admin() {
        return Err(ProxyError::new(
            ErrorKind::NotAuthorized,
            "admin tools require role 'admin'",
        ));
    }

    match tool {
        "admin_list_callers" => list_callers(&context.deps.config),
        "admin_list_connection_templates" => list_connection_templates(&context.deps.config),
        "admin_register_caller" => {
            let request: RegisterCallerInput = parse_input(input)?;
            register_caller(&context.deps.config_path, request)
        }
        "admin_remove_caller" => {
            let request: CallerAliasInput = parse_input(input)?;
            remove_caller(&context.deps.config_path, &request.alias)
        }
        "admin_update_caller_connections" => {
            let request: UpdateConnectionsInput = parse_input(input)?;
            update_caller_connections(&context.deps.config_path, request)
        }
        "admin_set_secrets" => {
            let request: SetSecretsInput = parse_input(input)?;
            set_secrets(&context.deps.env_path, request.secrets)
        }
        "admin_get_secret_status" => {
            let request: SecretStatusInput = parse_input(input)?;
            Ok(secret_status(&request.names))
        }
        unknown => Err(ProxyError::new(
            ErrorKind::MalformedMessage,
            format!("unknown tool '{}'", unknown),
        )),
    }
}

/// Alias, name, connections, role, and fingerprint only; env and secrets
/// never appear.
fn list_callers(config: &RemoteConfig) -> Result<Value, ProxyError> {
    let mut callers = Vec::with_capacity(config.callers.len());
    for (alias, caller) in &config.callers {
        let fingerprint = load_peer_fingerprints(&caller.peer_key_dir)
            .ok()
            .and_then(|fingerprints| fingerprints.into_iter().next());
        callers.push(json!({
            "alias": alias,
            "name": caller.name,
            "connections": caller.connections,
            "role": caller.role.as_str(),
            "fingerprint": fingerprint,
        }));
    }
    Ok(json!({ "callers": callers }))
}

fn list_connection_templates(config: &RemoteConfig) -> Result<Value, ProxyError> {
    let templates: Vec<Value> = merged_connector_table(config)
        .values()
        .map(|route| {
            json!({
                "alias": route.alias,
                "baseUrl": route.base_url,
                "allowedEndpoints": route.allowed_endpoints,
                "secrets": route.secrets.keys().collect::<Vec<_>>(),
                "hasIngestor": route.ingestor.is_some(),
            })
        })
        .collect();
    Ok(json!({ "templates": templates }))
}

fn register_caller(config_path: &Path, request: RegisterCallerInput) -> Result<Value, ProxyError> {
    if request.peer_key_dir.trim().is_empty() {
        return Err(ProxyError::new(
            ErrorKind::BadConfig,
            "peerKeyDir must be non-empty",
        ));
    }
    mutate_config(config_path, |config| {
        if config.callers.contains_key(&request.alias) {
            return Err(ProxyError::new(
                ErrorKind::BadConfig,
                format!("caller '{}' is already registered", request.alias),
            ));
        }
        config.callers.insert(
            request.alias.clone(),
            CallerConfig {
                name: request.name.clone(),
                peer_key_dir: request.peer_key_dir.clone().into(),
                connections: request.connections.clone(),
                env: BTreeMap::new(),
                role: request.role.unwrap_or_default(),
                ingestor_overrides: BTreeMap::new(),
            },
        );
        Ok(())
    })
}

fn remove_caller(config_path: &Path, alias: &str) -> Result<Value, ProxyError> {
    mutate_config(config_path, |config| {
        if config.callers.remove(alias).is_none() {
            return Err(ProxyError::new(
                ErrorKind::UnknownCaller,
                format!("caller '{}' is not registered", alias),
            ));
        }
        Ok(())
    })
}

fn update_caller_connections(
    config_path: &Path,
    request: UpdateConnectionsInput,
) -> Result<Value, ProxyError> {
    mutate_config(config_path, |config| {
        let Some(caller) = config.callers.get_mut(&request.alias) else {
            return Err(ProxyError::new(
                ErrorKind::UnknownCaller,
                format!("caller '{}' is not registered", request.alias),
            ));
        };
        caller.connections = request.connections.clone();
        caller
            .ingestor_overrides
            .retain(|connection, _| request.connections.contains(connection));
        Ok(())
    })
}

/// Loads, mutates, validates, and atomically rewrites the config file.
fn mutate_config(
    config_path: &Path,
    mutate: impl FnOnce(&mut RemoteConfig) -> Result<(), ProxyError>,
) -> Result<Value, ProxyError> {
    let mut config = load_remote_config(config_path)
        .map_err(|error| ProxyError::new(ErrorKind::BadConfig, error.to_string()))?;
    mutate(&mut config)?;
    validate_remote_config(&config)
        .map_err(|error| ProxyError::new(ErrorKind::BadConfig, error.to_string()))?;

    let mut payload = serde_json::to_string_pretty(&config)
        .map_err(|error| ProxyError::new(ErrorKind::BadConfig, error.to_string()))?;
    payload.push('\n');
    write_text_atomic(config_path, &payload)
        .map_err(|error| ProxyError::new(ErrorKind::BadConfig, error.to_string()))?;
    Ok(json!({ "restartRequired": true }))
}

/// Applies secrets to the process environment (the pipeline hot-reads them)
/// and persists them to `.env` with mode 0600. Running ingestors keep their
/// resolved secrets until restarted.
fn set_secrets(env_path: &Path, secrets: BTreeMap<String, String>) -> Result<Value, ProxyError> {
    let mut entries = read_env_file(env_path);
    for (name, value) in &secrets {
        if name.trim().is_empty() || name.contains('=') {
            return Err(ProxyError::new(
                ErrorKind::BadConfig,
                "secret names must be non-empty and free of '='",
            ));
        }
        // Safety: no other thread mutates the environment; readers only call
        // std::env::var.
        unsafe {
            std::env::set_var(name, value);
        }
        match entries.iter_mut().find(|(existing, _)| existing == name) {
            Some(entry) => entry.1 = value.clone(),
            None => entries.push((name.clone(), value.clone())),
        }
    }

    let mut payload = String::new();
    for (name, value) in &entries {
        payload.push_str(name);
        payload.push('=');
        payload.push_str(value);
        payload.push('\n');
    }
    write_text_atomic_with_mode(env_path, &payload, ENV_FILE_MODE)
        .map_err(|error| ProxyError::new(ErrorKind::BadConfig, error.to_string()))?;
    Ok(json!({ "restartRequired": true }))
}

fn read_env_file(env_path: &Path) -> Vec<(String, String)> {
    let Ok(raw) = std::fs::read_to_string(env_path) else {
        return Vec::new();
    };
    raw.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            trimmed
                .split_once('=')
                .map(|(name, value)| (name.to_string(), value.to_string()))
        })
        .collect()
}

fn secret_status(names: &[String]) -> Value {
    let statuses: BTreeMap<&str, &str> = names
        .iter()
        .map(|name| {
            let set = std::env::var(name)
                .map(|value| !value.trim().is_empty())
                .unwrap_or(false);
            (name.as_str(), if set { "set" } else { "unset" })
        })
        .collect();
    json!({ "secrets": statuses })
}
