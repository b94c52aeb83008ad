//! Tool dispatch for decrypted `ProxyRequest` frames.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{json, Value};

use drawlatch_config::{resolve_caller_routes, resolve_routes, CallerRole, RemoteConfig};
use drawlatch_core::current_unix_timestamp_ms;
use drawlatch_ingest::{drain_events, IngestorManager};
use drawlatch_proto::{ErrorKind, ProxyError};

use crate::admin::handle_admin_tool;
use crate::pipeline::{HttpRequestInput, RequestPipeline};
use crate::rate_limit::RateLimiter;

/// Server-wide dependencies shared by every tool invocation.
pub struct ToolDeps {
    pub config: RemoteConfig,
    pub config_path: PathBuf,
    pub env_path: PathBuf,
    pub pipeline: RequestPipeline,
    pub limiter: RateLimiter,
    pub manager: IngestorManager,
}

/// Per-request context handed to tool handlers.
pub struct ToolContext<'a> {
    pub caller_alias: &'a str,
    pub deps: &'a ToolDeps,
}

impl ToolContext<'_> {
    pub fn role(&self) -> CallerRole {
        self.deps
            .config
            .callers
            .get(self.caller_alias)
            .map(|caller| caller.role)
            .unwrap_or(CallerRole::User)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollEventsInput {
    #[serde(default)]
    connection: Option<String>,
    #[serde(default)]
    after_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionInput {
    #[serde(default)]
    connection: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionRequiredInput {
    connection: String,
}

/// Routes a tool call to its handler. Every call admits against the caller's
/// rate window; `http_request` admits inside the pipeline instead, after the
/// endpoint whitelist check.
pub async fn dispatch_tool(
    context: &ToolContext<'_>,
    tool: &str,
    input: Value,
) -> Result<Value, ProxyError> {
    if tool != "http_request"
        && !context
            .deps
            .limiter
            .try_admit(context.caller_alias, current_unix_timestamp_ms())
    {
        return Err(ProxyError::new(
            ErrorKind::RateLimited,
            "rate limit exceeded for this caller",
        ));
    }

    match tool {
        "http_request" => {
            let request: HttpRequestInput = parse_input(input)?;
            let routes = resolved_routes(context)?;
            context
                .deps
                .pipeline
                .execute(context.caller_alias, &routes, &context.deps.limiter, request)
                .await
        }
        "list_routes" => {
            let routes = resolved_routes(context)?;
            let summaries: Vec<Value> = routes.iter().map(|route| route.summary()).collect();
            Ok(json!({ "routes": summaries }))
        }
        "poll_events" => {
            let request: PollEventsInput = parse_input(input)?;
            let after_id = request.after_id.unwrap_or(-1);
            let (events, cursor) = drain_events(
                &context.deps.manager,
                context.caller_alias,
                request.connection.as_deref(),
                after_id,
            )?;
            Ok(json!({ "events": events, "cursor": cursor }))
        }
        "ingestor_status" => {
            let request: ConnectionInput = parse_input(input)?;
            match request.connection.as_deref() {
                Some(connection) => {
                    let statuses = context.deps.manager.get_statuses(context.caller_alias);
                    let status = statuses
                        .into_iter()
                        .find(|status| status.connection == connection)
                        .ok_or_else(|| {
                            ProxyError::new(
                                ErrorKind::IngestorNotRunning,
                                format!("no ingestor running for connection '{}'", connection),
                            )
                        })?;
                    Ok(serde_json::to_value(status).unwrap_or(Value::Null))
                }
                None => {
                    let statuses = context.deps.manager.get_statuses(context.caller_alias);
                    Ok(json!({ "ingestors": statuses }))
                }
            }
        }
        "ingestor_start" => {
            let request: ConnectionRequiredInput = parse_input(input)?;
            let status = context
                .deps
                .manager
                .start_one(&context.deps.config, context.caller_alias, &request.connection)
                .await?;
            Ok(serde_json::to_value(status).unwrap_or(Value::Null))
        }
        "ingestor_stop" => {
            let request: ConnectionRequiredInput = parse_input(input)?;
            let status = context
                .deps
                .manager
                .stop_one(context.caller_alias, &request.connection)
                .await?;
            Ok(serde_json::to_value(status).unwrap_or(Value::Null))
        }
        "ingestor_restart" => {
            let request: ConnectionRequiredInput = parse_input(input)?;
            let status = context
                .deps
                .manager
                .restart_one(&context.deps.config, context.caller_alias, &request.connection)
                .await?;
            Ok(serde_json::to_value(status).unwrap_or(Value::Null))
        }
        admin if admin.starts_with("admin_") => handle_admin_tool(context, admin, input).await,
        unknown => Err(ProxyError::new(
            ErrorKind::MalformedMessage,
            format!("unknown tool '{}'", unknown),
        )),
    }
}

/// Routes are resolved per call so secret changes apply without a restart.
fn resolved_routes(
    context: &ToolContext<'_>,
) -> Result<Vec<drawlatch_config::ResolvedRoute>, ProxyError> {
    let (caller, raw_routes) = resolve_caller_routes(&context.deps.config, context.caller_alias)?;
    resolve_routes(&raw_routes, &caller.env)
}

pub(crate) fn parse_input<T: serde::de::DeserializeOwned>(input: Value) -> Result<T, ProxyError> {
    serde_json::from_value(if input.is_null() { json!({}) } else { input }).map_err(|error| {
        ProxyError::new(
            ErrorKind::MalformedMessage,
            format!("invalid tool input: {}", error),
        )
    })
}
