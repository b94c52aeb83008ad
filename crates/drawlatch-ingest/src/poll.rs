//! Periodic HTTP poll ingestor with response-path extraction and dedup.

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use drawlatch_config::PollIngestorConfig;

use crate::ingestor::{Ingestor, IngestorCore, IngestorState};

const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_EVENT_TYPE: &str = "poll";

pub struct PollIngestor {
    core: Arc<IngestorCore>,
    config: PollIngestorConfig,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollIngestor {
    pub fn new(connection_alias: &str, config: PollIngestorConfig, buffer_capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(IngestorCore::new(connection_alias, buffer_capacity)),
            config,
            shutdown,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Ingestor for PollIngestor {
    async fn start(&self) -> Result<()> {
        let mut task_slot = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if task_slot.is_some() {
            return Ok(());
        }
        self.core.set_state(IngestorState::Starting);

        let client = reqwest::Client::builder()
            .timeout(POLL_REQUEST_TIMEOUT)
            .build()
            .context("failed to create poll http client")?;
        let core = Arc::clone(&self.core);
        let config = self.config.clone();
        let shutdown = self.shutdown.subscribe();
        *task_slot = Some(tokio::spawn(run_poll_loop(core, config, client, shutdown)));
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = {
            let mut task_slot = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            task_slot.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
        let _ = self.shutdown.send(false);
        self.core.set_state(IngestorState::Stopped);
    }

    fn core(&self) -> &IngestorCore {
        &self.core
    }
}

async fn run_poll_loop(
    core: Arc<IngestorCore>,
    config: PollIngestorConfig,
    client: reqwest::Client,
    mut shutdown: watch::Receiver<bool>,
) {
    // Seen-key window sized at twice the ring so dedup outlives eviction.
    let mut seen = SeenKeys::new(core.buffer_capacity().saturating_mul(2));
    let mut ticker = tokio::time::interval(Duration::from_millis(
        config.interval_ms.max(MIN_POLL_INTERVAL_MS),
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match poll_once(&core, &config, &client, &mut seen).await {
                    Ok(_emitted) => core.set_state(IngestorState::Connected),
                    Err(error) => {
                        tracing::warn!(
                            connection = core.connection_alias(),
                            error = %error,
                            "poll cycle failed"
                        );
                        core.set_error(error.to_string());
                    }
                }
            }
        }
    }
}

async fn poll_once(
    core: &IngestorCore,
    config: &PollIngestorConfig,
    client: &reqwest::Client,
    seen: &mut SeenKeys,
) -> Result<usize> {
    let method = reqwest::Method::from_str(config.method.trim())
        .map_err(|_| anyhow!("invalid poll method '{}'", config.method))?;
    let mut request = client.request(method, &config.url);
    for (name, value) in &config.headers {
        request = request.header(name, value);
    }
    if let Some(body) = &config.body {
        request = request.json(body);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("poll request to {} failed", config.url))?;
    let status = response.status();
    if !status.is_success() {
        bail!("poll request returned status {}", status.as_u16());
    }
    let body: Value = response
        .json()
        .await
        .context("poll response was not valid JSON")?;

    let items = extract_items(&body, config.response_path.as_deref())
        .ok_or_else(|| anyhow!("poll response carried no array at the configured path"))?;

    let event_type = config
        .event_type
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(DEFAULT_EVENT_TYPE);
    let mut emitted = 0usize;
    for item in items {
        let key = dedup_key(&item, config.deduplicate_by.as_deref());
        if seen.insert(key) {
            core.push_event(event_type, item);
            emitted += 1;
        }
    }
    Ok(emitted)
}

/// Walks a dotted path into the body and returns the array found there.
/// Without a path the body itself must be the array.
fn extract_items(body: &Value, response_path: Option<&str>) -> Option<Vec<Value>> {
    let mut cursor = body;
    if let Some(path) = response_path.filter(|value| !value.trim().is_empty()) {
        for segment in path.split('.') {
            cursor = cursor.get(segment)?;
        }
    }
    cursor.as_array().map(|items| items.to_vec())
}

/// Dedup key: the configured field's value when present, the whole item
/// otherwise.
fn dedup_key(item: &Value, deduplicate_by: Option<&str>) -> String {
    if let Some(field) = deduplicate_by.filter(|value| !value.trim().is_empty()) {
        if let Some(value) = item.get(field) {
            return match value.as_str() {
                Some(text) => text.to_string(),
                None => value.to_string(),
            };
        }
    }
    item.to_string()
}

/// Bounded LRU of seen dedup keys.
struct SeenKeys {
    order: VecDeque<String>,
    known: HashSet<String>,
    capacity: usize,
}

impl SeenKeys {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            known: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns true when the key was new.
    fn insert(&mut self, key: String) -> bool {
        if self.known.contains(&key) {
            return false;
        }
        self.known.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.known.remove(&evicted);
            }
        }
        true
    }
}
