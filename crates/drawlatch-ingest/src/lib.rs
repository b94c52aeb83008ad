//! Event ingestion for Drawlatch.
//!
//! Long-lived collectors buffer external events into bounded ring buffers
//! keyed per (caller, connection). The manager owns the registry, merges
//! caller overrides into connector templates, and routes webhook deliveries
//! to the matching passive ingestors.

pub mod discord;
pub mod ingestor;
pub mod manager;
pub mod poll;
pub mod ring;
pub mod webhook;

pub use discord::DiscordGatewayIngestor;
pub use ingestor::{Ingestor, IngestorCore, IngestorState, IngestorStatus};
pub use manager::{build_ingestor, drain_events, merge_ingestor_overrides, IngestorManager};
pub use poll::PollIngestor;
pub use ring::RingBuffer;
pub use webhook::{rejection_kind, WebhookIngestor};
