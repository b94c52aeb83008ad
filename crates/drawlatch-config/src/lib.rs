//! Remote configuration model and resolution for Drawlatch.
//!
//! A `remote.config.json` declares callers, the connection templates they may
//! use, and per-caller environment. Resolution substitutes `${VAR}`
//! placeholders from the caller env overlaid on the process env, producing
//! concrete routes with endpoint allowlists, headers, secrets, and ingestor
//! config.

pub mod endpoint;
pub mod model;
pub mod resolve;
pub mod templates;

pub use endpoint::is_endpoint_allowed;
pub use model::{
    load_remote_config, merged_connector_table, validate_remote_config, CallerConfig, CallerRole,
    IngestorConfig, IngestorOverrides, PollIngestorConfig, RemoteConfig, Route,
    WebhookIngestorConfig, WebhookProvider, WebsocketIngestorConfig,
};
pub use resolve::{
    match_route, resolve_caller_routes, resolve_routes, resolve_secrets, substitute_placeholders,
    EnvLookup, ResolvedRoute,
};
pub use templates::builtin_connector_templates;
