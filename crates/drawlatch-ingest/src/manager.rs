//! Ingestor registry, factory, override merge, and per-caller lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;

use drawlatch_config::{
    resolve_caller_routes, resolve_routes, IngestorConfig, IngestorOverrides, RemoteConfig, Route,
};
use drawlatch_proto::{ErrorKind, IngestedEventRecord, ProxyError};

use crate::discord::DiscordGatewayIngestor;
use crate::ingestor::{Ingestor, IngestorState, IngestorStatus};
use crate::poll::PollIngestor;
use crate::webhook::WebhookIngestor;

struct Registered {
    ingestor: Arc<dyn Ingestor>,
    order: u64,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, Registered>,
    next_order: u64,
}

/// Owns every ingestor instance, keyed `caller:connection`. The registry is
/// mutated only here; readers receive snapshots. Sessions of one caller share
/// the same instance.
#[derive(Default)]
pub struct IngestorManager {
    registry: Mutex<RegistryInner>,
}

impl IngestorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and starts an ingestor for every caller x connection with an
    /// ingestor stanza. Failures are logged; remaining ingestors continue.
    pub async fn start_all(&self, config: &RemoteConfig) {
        for caller_alias in config.callers.keys() {
            let (caller, raw_routes) = match resolve_caller_routes(config, caller_alias) {
                Ok(resolved) => resolved,
                Err(error) => {
                    tracing::error!(caller = %caller_alias, error = %error, "skipping caller");
                    continue;
                }
            };
            for raw_route in &raw_routes {
                if raw_route.ingestor.is_none() {
                    continue;
                }
                if let Err(error) = self
                    .start_route(caller_alias, raw_route, &caller.env, &caller.ingestor_overrides)
                    .await
                {
                    tracing::error!(
                        caller = %caller_alias,
                        connection = %raw_route.alias,
                        error = %error,
                        "ingestor failed to start"
                    );
                }
            }
        }
    }

    async fn start_route(
        &self,
        caller_alias: &str,
        raw_route: &Route,
        caller_env: &std::collections::BTreeMap<String, String>,
        overrides: &std::collections::BTreeMap<String, IngestorOverrides>,
    ) -> Result<IngestorStatus, ProxyError> {
        let resolved = resolve_routes(std::slice::from_ref(raw_route), caller_env)?;
        let Some(template) = resolved
            .first()
            .and_then(|route| route.ingestor.clone())
        else {
            return Err(ProxyError::new(
                ErrorKind::BadConfig,
                format!("connection '{}' has no ingestor configured", raw_route.alias),
            ));
        };
        let merged = match overrides.get(&raw_route.alias) {
            Some(caller_overrides) => merge_ingestor_overrides(&template, caller_overrides),
            None => template,
        };

        let key = registry_key(caller_alias, &raw_route.alias);
        let existing = {
            let registry = self.lock();
            registry
                .entries
                .get(&key)
                .map(|entry| Arc::clone(&entry.ingestor))
        };
        if let Some(ingestor) = existing {
            // One instance per (caller, connection); a live one is kept as-is.
            if ingestor.status().state != IngestorState::Stopped {
                return Ok(ingestor.status());
            }
            ingestor.start().await.map_err(|error| {
                ProxyError::new(ErrorKind::IngestorStartFailed, error.to_string())
            })?;
            return Ok(ingestor.status());
        }

        let Some(ingestor) = build_ingestor(&raw_route.alias, &merged) else {
            return Err(ProxyError::new(
                ErrorKind::IngestorStartFailed,
                format!(
                    "no ingestor implementation registered for connection '{}'",
                    raw_route.alias
                ),
            ));
        };
        {
            let mut registry = self.lock();
            let order = registry.next_order;
            registry.next_order += 1;
            registry.entries.insert(
                key,
                Registered {
                    ingestor: Arc::clone(&ingestor),
                    order,
                },
            );
        }
        ingestor
            .start()
            .await
            .map_err(|error| ProxyError::new(ErrorKind::IngestorStartFailed, error.to_string()))?;
        Ok(ingestor.status())
    }

    /// Stops everything in parallel and clears the registry.
    pub async fn stop_all(&self) {
        let drained: Vec<Arc<dyn Ingestor>> = {
            let mut registry = self.lock();
            registry
                .entries
                .drain()
                .map(|(_, entry)| entry.ingestor)
                .collect()
        };
        join_all(drained.iter().map(|ingestor| ingestor.stop())).await;
    }

    /// Targeted start. An already-running instance is success with its
    /// current state.
    pub async fn start_one(
        &self,
        config: &RemoteConfig,
        caller_alias: &str,
        connection_alias: &str,
    ) -> Result<IngestorStatus, ProxyError> {
        let (caller, raw_routes) = resolve_caller_routes(config, caller_alias)?;
        if !caller
            .connections
            .iter()
            .any(|connection| connection == connection_alias)
        {
            return Err(ProxyError::new(
                ErrorKind::CallerLacksConnection,
                format!(
                    "caller '{}' does not have connection '{}' enabled",
                    caller_alias, connection_alias
                ),
            ));
        }
        let raw_route = raw_routes
            .iter()
            .find(|route| route.alias == connection_alias)
            .ok_or_else(|| {
                ProxyError::new(
                    ErrorKind::UnknownConnection,
                    format!("connection '{}' is not configured", connection_alias),
                )
            })?;
        self.start_route(caller_alias, raw_route, &caller.env, &caller.ingestor_overrides)
            .await
    }

    pub async fn stop_one(
        &self,
        caller_alias: &str,
        connection_alias: &str,
    ) -> Result<IngestorStatus, ProxyError> {
        let ingestor = self.get_registered(caller_alias, connection_alias)?;
        ingestor.stop().await;
        Ok(ingestor.status())
    }

    pub async fn restart_one(
        &self,
        config: &RemoteConfig,
        caller_alias: &str,
        connection_alias: &str,
    ) -> Result<IngestorStatus, ProxyError> {
        let ingestor = self.get_registered(caller_alias, connection_alias)?;
        ingestor.stop().await;
        self.start_one(config, caller_alias, connection_alias).await
    }

    pub fn get_events(
        &self,
        caller_alias: &str,
        connection_alias: &str,
        after_id: i64,
    ) -> Result<Vec<IngestedEventRecord>, ProxyError> {
        Ok(self
            .get_registered(caller_alias, connection_alias)?
            .get_events(after_id))
    }

    /// Events across all of a caller's ingestors, ordered by `receivedAt`
    /// (lexicographic RFC 3339 compare); ties stay in registration order.
    pub fn get_all_events(&self, caller_alias: &str, after_id: i64) -> Vec<IngestedEventRecord> {
        let mut events: Vec<IngestedEventRecord> = self
            .caller_entries(caller_alias)
            .into_iter()
            .flat_map(|ingestor| ingestor.get_events(after_id))
            .collect();
        events.sort_by(|left, right| left.received_at.cmp(&right.received_at));
        events
    }

    pub fn get_statuses(&self, caller_alias: &str) -> Vec<IngestorStatus> {
        self.caller_entries(caller_alias)
            .into_iter()
            .map(|ingestor| ingestor.status())
            .collect()
    }

    /// Statuses across every caller, in registration order.
    pub fn all_statuses(&self) -> Vec<IngestorStatus> {
        let registry = self.lock();
        let mut entries: Vec<(u64, IngestorStatus)> = registry
            .entries
            .values()
            .map(|entry| (entry.order, entry.ingestor.status()))
            .collect();
        entries.sort_by_key(|(order, _)| *order);
        entries.into_iter().map(|(_, status)| status).collect()
    }

    /// Every webhook ingestor serving the given path, across callers.
    pub fn get_webhook_ingestors(&self, path: &str) -> Vec<Arc<dyn Ingestor>> {
        let registry = self.lock();
        let mut matches: Vec<(u64, Arc<dyn Ingestor>)> = registry
            .entries
            .values()
            .filter(|entry| entry.ingestor.webhook_path() == Some(path))
            .map(|entry| (entry.order, Arc::clone(&entry.ingestor)))
            .collect();
        matches.sort_by_key(|(order, _)| *order);
        matches.into_iter().map(|(_, ingestor)| ingestor).collect()
    }

    fn get_registered(
        &self,
        caller_alias: &str,
        connection_alias: &str,
    ) -> Result<Arc<dyn Ingestor>, ProxyError> {
        let key = registry_key(caller_alias, connection_alias);
        let registry = self.lock();
        registry
            .entries
            .get(&key)
            .map(|entry| Arc::clone(&entry.ingestor))
            .ok_or_else(|| {
                ProxyError::new(
                    ErrorKind::IngestorNotRunning,
                    format!(
                        "no ingestor running for caller '{}' connection '{}'",
                        caller_alias, connection_alias
                    ),
                )
            })
    }

    /// A caller's ingestors in registration order.
    fn caller_entries(&self, caller_alias: &str) -> Vec<Arc<dyn Ingestor>> {
        let prefix = format!("{}:", caller_alias);
        let registry = self.lock();
        let mut entries: Vec<(u64, Arc<dyn Ingestor>)> = registry
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, entry)| (entry.order, Arc::clone(&entry.ingestor)))
            .collect();
        entries.sort_by_key(|(order, _)| *order);
        entries.into_iter().map(|(_, ingestor)| ingestor).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn registry_key(caller_alias: &str, connection_alias: &str) -> String {
    format!("{}:{}", caller_alias, connection_alias)
}

/// Applies caller overrides to a template ingestor config. Only fields whose
/// shape matches the template type are applied; the template itself is never
/// mutated.
pub fn merge_ingestor_overrides(
    template: &IngestorConfig,
    overrides: &IngestorOverrides,
) -> IngestorConfig {
    let mut merged = template.clone();
    match &mut merged {
        IngestorConfig::Websocket(websocket) => {
            if let Some(intents) = overrides.intents {
                websocket.intents = Some(intents);
            }
            if let Some(event_filter) = &overrides.event_filter {
                websocket.event_filter = event_filter.clone();
            }
            if let Some(guild_ids) = &overrides.guild_ids {
                websocket.guild_ids = guild_ids.clone();
            }
            if let Some(channel_ids) = &overrides.channel_ids {
                websocket.channel_ids = channel_ids.clone();
            }
            if let Some(user_ids) = &overrides.user_ids {
                websocket.user_ids = user_ids.clone();
            }
            if let Some(buffer_size) = overrides.buffer_size {
                websocket.buffer_size = Some(buffer_size);
            }
        }
        IngestorConfig::Webhook(webhook) => {
            if let Some(buffer_size) = overrides.buffer_size {
                webhook.buffer_size = Some(buffer_size);
            }
        }
        IngestorConfig::Poll(poll) => {
            if let Some(interval_ms) = overrides.interval_ms {
                poll.interval_ms = interval_ms;
            }
            if let Some(buffer_size) = overrides.buffer_size {
                poll.buffer_size = Some(buffer_size);
            }
        }
    }
    merged
}

/// Factory keyed by ingestor type and protocol. Unknown combinations yield
/// `None`; the caller logs and continues.
pub fn build_ingestor(connection_alias: &str, config: &IngestorConfig) -> Option<Arc<dyn Ingestor>> {
    let capacity = config.buffer_size();
    match config {
        IngestorConfig::Websocket(websocket) if websocket.protocol == "discord" => Some(Arc::new(
            DiscordGatewayIngestor::new(connection_alias, websocket.clone(), capacity),
        )),
        IngestorConfig::Websocket(websocket) => {
            tracing::error!(
                connection = connection_alias,
                protocol = %websocket.protocol,
                "unsupported websocket protocol"
            );
            None
        }
        IngestorConfig::Webhook(webhook) => Some(Arc::new(WebhookIngestor::new(
            connection_alias,
            webhook.clone(),
            capacity,
        ))),
        IngestorConfig::Poll(poll) => Some(Arc::new(PollIngestor::new(
            connection_alias,
            poll.clone(),
            capacity,
        ))),
    }
}

/// Drains events for `poll_events`: either one connection or all of a
/// caller's, returning the new cursor alongside.
pub fn drain_events(
    manager: &IngestorManager,
    caller_alias: &str,
    connection_alias: Option<&str>,
    after_id: i64,
) -> Result<(Vec<IngestedEventRecord>, i64), ProxyError> {
    let events = match connection_alias {
        Some(connection) => manager.get_events(caller_alias, connection, after_id)?,
        None => manager.get_all_events(caller_alias, after_id),
    };
    let cursor = events
        .iter()
        .map(|event| event.id as i64)
        .max()
        .unwrap_or(after_id);
    Ok((events, cursor))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use drawlatch_config::{
        PollIngestorConfig, WebhookIngestorConfig, WebhookProvider, WebsocketIngestorConfig,
    };

    use super::*;

    fn webhook_template(provider: WebhookProvider) -> IngestorConfig {
        IngestorConfig::Webhook(WebhookIngestorConfig {
            provider,
            webhook_path: provider.as_str().to_string(),
            signature_header: None,
            signature_secret: None,
            callback_url: None,
            tolerance_seconds: None,
            buffer_size: None,
        })
    }

    fn websocket_template() -> IngestorConfig {
        IngestorConfig::Websocket(WebsocketIngestorConfig {
            protocol: "discord".to_string(),
            gateway_url: "wss://gateway.discord.gg".to_string(),
            token: "token".to_string(),
            intents: Some(1),
            event_filter: Vec::new(),
            guild_ids: Vec::new(),
            channel_ids: Vec::new(),
            user_ids: Vec::new(),
            shard: None,
            buffer_size: None,
        })
    }

    fn test_config() -> RemoteConfig {
        serde_json::from_value(serde_json::json!({
            "host": "127.0.0.1",
            "port": 9400,
            "localKeysDir": "keys/server",
            "callers": {
                "agent-a": {
                    "peerKeyDir": "keys/peers/agent-a",
                    "connections": ["hooks", "feed"]
                }
            },
            "connectors": [
                {
                    "alias": "hooks",
                    "allowedEndpoints": ["https://api.example.com/**"],
                    "ingestor": {
                        "type": "webhook",
                        "provider": "github",
                        "webhookPath": "github"
                    }
                },
                {
                    "alias": "feed",
                    "allowedEndpoints": ["https://feed.example.com/**"],
                    "ingestor": {
                        "type": "webhook",
                        "provider": "stripe",
                        "webhookPath": "stripe"
                    }
                }
            ]
        }))
        .expect("config")
    }

    #[test]
    fn unit_override_merge_applies_matching_fields_without_mutating_template() {
        let template = websocket_template();
        let snapshot = template.clone();
        let overrides = IngestorOverrides {
            intents: Some(1_536),
            event_filter: Some(vec!["MESSAGE_CREATE".to_string()]),
            guild_ids: Some(vec!["g1".to_string()]),
            channel_ids: None,
            user_ids: None,
            interval_ms: Some(5_000),
            buffer_size: Some(64),
        };

        let merged = merge_ingestor_overrides(&template, &overrides);
        assert_eq!(template, snapshot, "template must not be mutated");

        let IngestorConfig::Websocket(websocket) = merged else {
            panic!("merge must preserve the template type");
        };
        assert_eq!(websocket.intents, Some(1_536));
        assert_eq!(websocket.event_filter, vec!["MESSAGE_CREATE".to_string()]);
        assert_eq!(websocket.guild_ids, vec!["g1".to_string()]);
        assert_eq!(websocket.buffer_size, Some(64));
        // interval_ms has no websocket counterpart and is ignored.
    }

    #[test]
    fn unit_override_merge_on_poll_applies_only_poll_fields() {
        let template = IngestorConfig::Poll(PollIngestorConfig {
            url: "https://feed.example.com/items".to_string(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
            interval_ms: 60_000,
            response_path: None,
            deduplicate_by: None,
            event_type: None,
            buffer_size: None,
        });
        let overrides = IngestorOverrides {
            intents: Some(7),
            interval_ms: Some(1_000),
            ..IngestorOverrides::default()
        };
        let IngestorConfig::Poll(poll) = merge_ingestor_overrides(&template, &overrides) else {
            panic!("merge must preserve the template type");
        };
        assert_eq!(poll.interval_ms, 1_000);
    }

    #[test]
    fn unit_factory_rejects_unknown_websocket_protocol() {
        let IngestorConfig::Websocket(mut websocket) = websocket_template() else {
            unreachable!();
        };
        websocket.protocol = "irc".to_string();
        assert!(build_ingestor("chat", &IngestorConfig::Websocket(websocket)).is_none());
        assert!(build_ingestor("hooks", &webhook_template(WebhookProvider::Github)).is_some());
    }

    #[tokio::test]
    async fn functional_start_all_registers_and_starts_every_ingestor() {
        let manager = IngestorManager::new();
        let config = test_config();
        manager.start_all(&config).await;

        let statuses = manager.get_statuses("agent-a");
        assert_eq!(statuses.len(), 2);
        assert!(statuses
            .iter()
            .all(|status| status.state == IngestorState::Connected));

        assert_eq!(manager.get_webhook_ingestors("github").len(), 1);
        assert_eq!(manager.get_webhook_ingestors("stripe").len(), 1);
        assert!(manager.get_webhook_ingestors("absent").is_empty());

        manager.stop_all().await;
        assert!(manager.get_statuses("agent-a").is_empty());
    }

    #[tokio::test]
    async fn functional_start_one_is_idempotent_on_running_instance() {
        let manager = IngestorManager::new();
        let config = test_config();
        let first = manager
            .start_one(&config, "agent-a", "hooks")
            .await
            .expect("start");
        assert_eq!(first.state, IngestorState::Connected);

        // Second start reports the live instance instead of erroring.
        let second = manager
            .start_one(&config, "agent-a", "hooks")
            .await
            .expect("repeat start");
        assert_eq!(second.state, IngestorState::Connected);
        assert_eq!(manager.get_statuses("agent-a").len(), 1);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn unit_lifecycle_error_kinds_match_the_failure() {
        let manager = IngestorManager::new();
        let config = test_config();

        let unknown_caller = manager
            .start_one(&config, "ghost", "hooks")
            .await
            .expect_err("unknown caller");
        assert_eq!(unknown_caller.kind, ErrorKind::UnknownCaller);

        let lacks = manager
            .start_one(&config, "agent-a", "github")
            .await
            .expect_err("connection not enabled");
        assert_eq!(lacks.kind, ErrorKind::CallerLacksConnection);

        let not_running = manager
            .stop_one("agent-a", "hooks")
            .await
            .expect_err("nothing running");
        assert_eq!(not_running.kind, ErrorKind::IngestorNotRunning);

        let no_events = manager
            .get_events("agent-a", "hooks", -1)
            .expect_err("nothing running");
        assert_eq!(no_events.kind, ErrorKind::IngestorNotRunning);
    }

    #[tokio::test]
    async fn functional_stop_one_keeps_instance_and_restart_revives_it() {
        let manager = IngestorManager::new();
        let config = test_config();
        manager.start_all(&config).await;

        let stopped = manager.stop_one("agent-a", "hooks").await.expect("stop");
        assert_eq!(stopped.state, IngestorState::Stopped);
        // Buffered events stay queryable while stopped.
        assert!(manager.get_events("agent-a", "hooks", -1).expect("events").is_empty());

        let restarted = manager
            .restart_one(&config, "agent-a", "hooks")
            .await
            .expect("restart");
        assert_eq!(restarted.state, IngestorState::Connected);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn functional_get_all_events_merges_sorted_by_received_at() {
        let manager = IngestorManager::new();
        let config = test_config();
        manager.start_all(&config).await;

        let hooks = manager.get_webhook_ingestors("github")[0].clone();
        let feed = manager.get_webhook_ingestors("stripe")[0].clone();
        hooks.core().push_event("push", serde_json::json!({"n": 1}));
        feed.core().push_event("charge", serde_json::json!({"n": 2}));
        hooks.core().push_event("push", serde_json::json!({"n": 3}));

        let merged = manager.get_all_events("agent-a", -1);
        assert_eq!(merged.len(), 3);
        let mut sorted = merged.clone();
        sorted.sort_by(|left, right| left.received_at.cmp(&right.received_at));
        assert_eq!(merged, sorted);

        let (drained, cursor) =
            drain_events(&manager, "agent-a", Some("hooks"), -1).expect("drain");
        assert_eq!(drained.len(), 2);
        assert_eq!(cursor, 1);
        let (rest, cursor) = drain_events(&manager, "agent-a", Some("hooks"), cursor).expect("drain");
        assert!(rest.is_empty());
        assert_eq!(cursor, 1);

        manager.stop_all().await;
    }
}
