//! Discord gateway ingestor: heartbeat, identify, resume, reconnect.
//!
//! The protocol state machine ([`GatewaySession`]) is plain data in, commands
//! out; the surrounding task owns the WebSocket and the heartbeat timer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use drawlatch_config::WebsocketIngestorConfig;

use crate::ingestor::{Ingestor, IngestorCore, IngestorState};

const OP_DISPATCH: u64 = 0;
const OP_HEARTBEAT: u64 = 1;
const OP_IDENTIFY: u64 = 2;
const OP_RESUME: u64 = 6;
const OP_RECONNECT: u64 = 7;
const OP_INVALID_SESSION: u64 = 9;
const OP_HELLO: u64 = 10;
const OP_HEARTBEAT_ACK: u64 = 11;

/// Close codes that invalidate the session token or intents; resume is
/// impossible and the next attempt re-identifies.
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_DISALLOWED_INTENTS: u16 = 4014;

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Streaming this long counts as a healthy session and resets the backoff.
const STREAMING_RESET_THRESHOLD: Duration = Duration::from_secs(30);
/// Placeholder heartbeat deadline before HELLO announces the real interval.
const HEARTBEAT_NOT_CONFIGURED: Duration = Duration::from_secs(3_600);

pub struct DiscordGatewayIngestor {
    core: Arc<IngestorCore>,
    config: WebsocketIngestorConfig,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscordGatewayIngestor {
    pub fn new(
        connection_alias: &str,
        config: WebsocketIngestorConfig,
        buffer_capacity: usize,
    ) -> Self {
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
impl Ingestor for DiscordGatewayIngestor {
    async fn start(&self) -> Result<()> {
        let mut task_slot = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if task_slot.is_some() {
            return Ok(());
        }
        if self.config.token.trim().is_empty() {
            anyhow::bail!("discord gateway requires a resolved bot token");
        }
        self.core.set_state(IngestorState::Starting);
        let core = Arc::clone(&self.core);
        let config = self.config.clone();
        let shutdown = self.shutdown.subscribe();
        *task_slot = Some(tokio::spawn(run_gateway_loop(core, config, shutdown)));
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

/// Where a finished socket session leaves the reconnect loop.
#[derive(Debug)]
enum SessionOutcome {
    Shutdown,
    Retry { resume: Option<ResumeState> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResumeState {
    session_id: String,
    resume_gateway_url: String,
    last_seq: Option<u64>,
}

async fn run_gateway_loop(
    core: Arc<IngestorCore>,
    config: WebsocketIngestorConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = ReconnectBackoff::new();
    let mut resume: Option<ResumeState> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let url = resume
            .as_ref()
            .map(|state| state.resume_gateway_url.clone())
            .unwrap_or_else(|| config.gateway_url.clone());

        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                let streaming_clock = Instant::now();
                let outcome = run_gateway_session(
                    &core,
                    &config,
                    stream,
                    resume.take(),
                    &mut shutdown,
                )
                .await;
                if streaming_clock.elapsed() >= STREAMING_RESET_THRESHOLD {
                    backoff.reset();
                }
                match outcome {
                    SessionOutcome::Shutdown => break,
                    SessionOutcome::Retry { resume: next } => resume = next,
                }
            }
            Err(error) => {
                tracing::warn!(
                    connection = core.connection_alias(),
                    error = %error,
                    "discord gateway connect failed"
                );
                core.set_error(format!("gateway connect failed: {error}"));
                // A dead resume endpoint should not pin us forever.
                resume = None;
            }
        }

        core.set_state(IngestorState::Reconnecting);
        let delay = backoff.next_delay();
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
    core.set_state(IngestorState::Stopped);
}

async fn run_gateway_session(
    core: &IngestorCore,
    config: &WebsocketIngestorConfig,
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    resume: Option<ResumeState>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionOutcome {
    let (mut sink, mut source) = stream.split();
    let mut session = GatewaySession::new(config.clone(), resume);
    let mut next_heartbeat = Instant::now() + HEARTBEAT_NOT_CONFIGURED;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return SessionOutcome::Shutdown;
                }
            }
            _ = tokio::time::sleep_until(next_heartbeat) => {
                match session.on_heartbeat_due() {
                    HeartbeatDue::NotConfigured => {
                        next_heartbeat = Instant::now() + HEARTBEAT_NOT_CONFIGURED;
                    }
                    HeartbeatDue::Send(payload) => {
                        if sink.send(WsMessage::Text(payload)).await.is_err() {
                            return SessionOutcome::Retry { resume: session.resume_state() };
                        }
                        next_heartbeat = Instant::now() + session.heartbeat_interval();
                    }
                    HeartbeatDue::MissedAck => {
                        // The connection is dead; close and resume.
                        core.set_error("heartbeat ack missed".to_string());
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return SessionOutcome::Retry { resume: session.resume_state() };
                    }
                }
            }
            maybe_message = source.next() => {
                let Some(message_result) = maybe_message else {
                    return SessionOutcome::Retry { resume: session.resume_state() };
                };
                let message = match message_result {
                    Ok(message) => message,
                    Err(error) => {
                        core.set_error(format!("gateway read failed: {error}"));
                        return SessionOutcome::Retry { resume: session.resume_state() };
                    }
                };
                match message {
                    WsMessage::Text(text) => {
                        let commands = match session.on_text(&text, core) {
                            Ok(commands) => commands,
                            Err(error) => {
                                tracing::warn!(
                                    connection = core.connection_alias(),
                                    error = %error,
                                    "dropping malformed gateway payload"
                                );
                                continue;
                            }
                        };
                        for command in commands {
                            match command {
                                GatewayCommand::Send(payload) => {
                                    if sink.send(WsMessage::Text(payload)).await.is_err() {
                                        return SessionOutcome::Retry {
                                            resume: session.resume_state(),
                                        };
                                    }
                                }
                                GatewayCommand::SetHeartbeat(interval) => {
                                    next_heartbeat = Instant::now() + interval;
                                }
                                GatewayCommand::Reconnect { resumable } => {
                                    let _ = sink.send(WsMessage::Close(None)).await;
                                    let resume = if resumable {
                                        session.resume_state()
                                    } else {
                                        None
                                    };
                                    return SessionOutcome::Retry { resume };
                                }
                            }
                        }
                    }
                    WsMessage::Ping(payload) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    WsMessage::Close(frame) => {
                        let close_code = frame.map(|frame| u16::from(frame.code));
                        return SessionOutcome::Retry {
                            resume: session.close_resume_state(close_code),
                        };
                    }
                    _ => {}
                }
            }
        }
    }
}

enum GatewayCommand {
    Send(String),
    SetHeartbeat(Duration),
    Reconnect { resumable: bool },
}

enum HeartbeatDue {
    NotConfigured,
    Send(String),
    MissedAck,
}

/// Pure protocol state: payloads in, commands out.
struct GatewaySession {
    config: WebsocketIngestorConfig,
    resume: Option<ResumeState>,
    heartbeat_interval: Option<Duration>,
    awaiting_ack: bool,
    last_seq: Option<u64>,
    session_id: Option<String>,
    resume_gateway_url: Option<String>,
}

impl GatewaySession {
    fn new(config: WebsocketIngestorConfig, resume: Option<ResumeState>) -> Self {
        let (session_id, resume_gateway_url, last_seq) = match &resume {
            Some(state) => (
                Some(state.session_id.clone()),
                Some(state.resume_gateway_url.clone()),
                state.last_seq,
            ),
            None => (None, None, None),
        };
        Self {
            config,
            resume,
            heartbeat_interval: None,
            awaiting_ack: false,
            last_seq,
            session_id,
            resume_gateway_url,
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval.unwrap_or(HEARTBEAT_NOT_CONFIGURED)
    }

    fn on_text(&mut self, raw: &str, core: &IngestorCore) -> Result<Vec<GatewayCommand>> {
        let payload: Value = serde_json::from_str(raw).context("gateway payload is not JSON")?;
        let op = payload
            .get("op")
            .and_then(Value::as_u64)
            .context("gateway payload has no op code")?;

        let mut commands = Vec::new();
        match op {
            OP_HELLO => {
                let interval_ms = payload
                    .get("d")
                    .and_then(|d| d.get("heartbeat_interval"))
                    .and_then(Value::as_u64)
                    .context("HELLO payload has no heartbeat_interval")?;
                let interval = Duration::from_millis(interval_ms.max(1));
                self.heartbeat_interval = Some(interval);
                self.awaiting_ack = false;
                commands.push(GatewayCommand::SetHeartbeat(interval));
                commands.push(GatewayCommand::Send(match self.resume.take() {
                    Some(state) => self.resume_payload(&state),
                    None => self.identify_payload(),
                }));
            }
            OP_HEARTBEAT_ACK => {
                self.awaiting_ack = false;
            }
            OP_HEARTBEAT => {
                commands.push(GatewayCommand::Send(self.heartbeat_payload()));
            }
            OP_RECONNECT => {
                commands.push(GatewayCommand::Reconnect { resumable: true });
            }
            OP_INVALID_SESSION => {
                let resumable = payload.get("d").and_then(Value::as_bool).unwrap_or(false);
                commands.push(GatewayCommand::Reconnect { resumable });
            }
            OP_DISPATCH => {
                if let Some(seq) = payload.get("s").and_then(Value::as_u64) {
                    self.last_seq = Some(seq);
                }
                let event_type = payload.get("t").and_then(Value::as_str).unwrap_or_default();
                let data = payload.get("d").cloned().unwrap_or(Value::Null);
                match event_type {
                    "READY" => {
                        self.session_id = data
                            .get("session_id")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        self.resume_gateway_url = data
                            .get("resume_gateway_url")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        core.set_state(IngestorState::Connected);
                    }
                    "RESUMED" => {
                        core.set_state(IngestorState::Connected);
                    }
                    "" => {}
                    _ => {
                        if dispatch_passes_filters(&self.config, event_type, &data) {
                            core.push_event(event_type, data);
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(commands)
    }

    fn on_heartbeat_due(&mut self) -> HeartbeatDue {
        if self.heartbeat_interval.is_none() {
            return HeartbeatDue::NotConfigured;
        }
        if self.awaiting_ack {
            return HeartbeatDue::MissedAck;
        }
        self.awaiting_ack = true;
        HeartbeatDue::Send(self.heartbeat_payload())
    }

    fn heartbeat_payload(&self) -> String {
        json!({ "op": OP_HEARTBEAT, "d": self.last_seq }).to_string()
    }

    fn identify_payload(&self) -> String {
        let mut data = json!({
            "token": self.config.token,
            "intents": self.config.intents.unwrap_or(0),
            "properties": {
                "os": std::env::consts::OS,
                "browser": "drawlatch",
                "device": "drawlatch"
            }
        });
        if let Some(shard) = self.config.shard {
            data["shard"] = json!(shard);
        }
        json!({ "op": OP_IDENTIFY, "d": data }).to_string()
    }

    fn resume_payload(&self, state: &ResumeState) -> String {
        json!({
            "op": OP_RESUME,
            "d": {
                "token": self.config.token,
                "session_id": state.session_id,
                "seq": state.last_seq
            }
        })
        .to_string()
    }

    /// Resume material for the next connection, when the session got far
    /// enough to have any.
    fn resume_state(&self) -> Option<ResumeState> {
        Some(ResumeState {
            session_id: self.session_id.clone()?,
            resume_gateway_url: self.resume_gateway_url.clone()?,
            last_seq: self.last_seq,
        })
    }

    fn close_resume_state(&self, close_code: Option<u16>) -> Option<ResumeState> {
        match close_code {
            Some(CLOSE_AUTH_FAILED) | Some(CLOSE_DISALLOWED_INTENTS) => None,
            _ => self.resume_state(),
        }
    }
}

fn dispatch_passes_filters(
    config: &WebsocketIngestorConfig,
    event_type: &str,
    data: &Value,
) -> bool {
    if !config.event_filter.is_empty()
        && !config
            .event_filter
            .iter()
            .any(|allowed| allowed == event_type)
    {
        return false;
    }
    if !list_allows(&config.guild_ids, data.get("guild_id")) {
        return false;
    }
    if !list_allows(&config.channel_ids, data.get("channel_id")) {
        return false;
    }
    if !config.user_ids.is_empty() {
        let user_id = data
            .get("author")
            .and_then(|author| author.get("id"))
            .or_else(|| data.get("user").and_then(|user| user.get("id")))
            .and_then(Value::as_str);
        let Some(user_id) = user_id else {
            return false;
        };
        if !config.user_ids.iter().any(|allowed| allowed == user_id) {
            return false;
        }
    }
    true
}

/// An empty filter list allows everything; otherwise the field must be
/// present and listed.
fn list_allows(allowed: &[String], value: Option<&Value>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match value.and_then(Value::as_str) {
        Some(value) => allowed.iter().any(|entry| entry == value),
        None => false,
    }
}

/// Exponential reconnect backoff: 1 s doubling to a 60 s cap.
struct ReconnectBackoff {
    next: Duration,
}

impl ReconnectBackoff {
    fn new() -> Self {
        Self {
            next: RECONNECT_BASE_DELAY,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(RECONNECT_MAX_DELAY);
        delay
    }

    fn reset(&mut self) {
        self.next = RECONNECT_BASE_DELAY;
    }
}
