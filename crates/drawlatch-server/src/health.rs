//! Transport health snapshot persisted in the server's config directory.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use drawlatch_core::{current_unix_timestamp_ms, write_text_atomic};
use drawlatch_ingest::IngestorStatus;

pub const HEALTH_FILE_NAME: &str = "transport-health.json";
const HEALTH_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportHealthSnapshot {
    #[serde(default = "health_schema_version")]
    pub schema_version: u32,
    pub updated_unix_ms: u64,
    pub session_count: usize,
    pub ingestors: Vec<IngestorStatus>,
}

fn health_schema_version() -> u32 {
    HEALTH_SCHEMA_VERSION
}

impl TransportHealthSnapshot {
    pub fn capture(session_count: usize, ingestors: Vec<IngestorStatus>) -> Self {
        Self {
            schema_version: HEALTH_SCHEMA_VERSION,
            updated_unix_ms: current_unix_timestamp_ms(),
            session_count,
            ingestors,
        }
    }
}

pub fn save_health_snapshot(path: &Path, snapshot: &TransportHealthSnapshot) -> Result<()> {
    let mut payload =
        serde_json::to_string_pretty(snapshot).context("failed to encode health snapshot")?;
    payload.push('\n');
    write_text_atomic(path, &payload)
}

pub fn load_health_snapshot(path: &Path) -> Result<TransportHealthSnapshot> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let snapshot: TransportHealthSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if snapshot.schema_version != HEALTH_SCHEMA_VERSION {
        bail!(
            "unsupported health snapshot schema_version {} in {} (expected {})",
            snapshot.schema_version,
            path.display(),
            HEALTH_SCHEMA_VERSION
        );
    }
    Ok(snapshot)
}
