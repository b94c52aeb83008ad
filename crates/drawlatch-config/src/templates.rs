//! Builtin connector templates.
//!
//! These ship with the server and can be enabled per caller without any
//! connector stanza in the config file. User-defined connectors with the same
//! alias shadow them.

use std::collections::BTreeMap;

use crate::model::{
    IngestorConfig, Route, WebhookIngestorConfig, WebhookProvider, WebsocketIngestorConfig,
};

const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// Default Discord intents: GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT.
const DISCORD_DEFAULT_INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 15);

pub fn builtin_connector_templates() -> Vec<Route> {
    vec![
        github_template(),
        stripe_template(),
        trello_template(),
        discord_template(),
    ]
}

fn pairs(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

fn github_template() -> Route {
    Route {
        alias: "github".to_string(),
        base_url: Some("https://api.github.com".to_string()),
        allowed_endpoints: vec!["https://api.github.com/**".to_string()],
        secrets: pairs(&[
            ("GITHUB_TOKEN", "${GITHUB_TOKEN}"),
            ("GITHUB_WEBHOOK_SECRET", "${GITHUB_WEBHOOK_SECRET}"),
        ]),
        headers: pairs(&[
            ("Authorization", "Bearer ${GITHUB_TOKEN}"),
            ("Accept", "application/vnd.github+json"),
            ("X-GitHub-Api-Version", "2022-11-28"),
        ]),
        ingestor: Some(IngestorConfig::Webhook(WebhookIngestorConfig {
            provider: WebhookProvider::Github,
            webhook_path: "github".to_string(),
            signature_header: Some("X-Hub-Signature-256".to_string()),
            signature_secret: Some("${GITHUB_WEBHOOK_SECRET}".to_string()),
            callback_url: None,
            tolerance_seconds: None,
            buffer_size: None,
        })),
    }
}

fn stripe_template() -> Route {
    Route {
        alias: "stripe".to_string(),
        base_url: Some("https://api.stripe.com".to_string()),
        allowed_endpoints: vec!["https://api.stripe.com/**".to_string()],
        secrets: pairs(&[
            ("STRIPE_API_KEY", "${STRIPE_API_KEY}"),
            ("STRIPE_WEBHOOK_SECRET", "${STRIPE_WEBHOOK_SECRET}"),
        ]),
        headers: pairs(&[("Authorization", "Bearer ${STRIPE_API_KEY}")]),
        ingestor: Some(IngestorConfig::Webhook(WebhookIngestorConfig {
            provider: WebhookProvider::Stripe,
            webhook_path: "stripe".to_string(),
            signature_header: Some("Stripe-Signature".to_string()),
            signature_secret: Some("${STRIPE_WEBHOOK_SECRET}".to_string()),
            callback_url: None,
            tolerance_seconds: Some(300),
            buffer_size: None,
        })),
    }
}

fn trello_template() -> Route {
    Route {
        alias: "trello".to_string(),
        base_url: Some("https://api.trello.com/1".to_string()),
        allowed_endpoints: vec!["https://api.trello.com/**".to_string()],
        secrets: pairs(&[
            ("TRELLO_API_KEY", "${TRELLO_API_KEY}"),
            ("TRELLO_API_SECRET", "${TRELLO_API_SECRET}"),
        ]),
        headers: BTreeMap::new(),
        ingestor: Some(IngestorConfig::Webhook(WebhookIngestorConfig {
            provider: WebhookProvider::Trello,
            webhook_path: "trello".to_string(),
            signature_header: Some("X-Trello-Webhook".to_string()),
            signature_secret: Some("${TRELLO_API_SECRET}".to_string()),
            callback_url: Some("${DRAWLATCH_TUNNEL_URL}/webhooks/trello".to_string()),
            tolerance_seconds: None,
            buffer_size: None,
        })),
    }
}

fn discord_template() -> Route {
    Route {
        alias: "discord".to_string(),
        base_url: Some("https://discord.com/api/v10".to_string()),
        allowed_endpoints: vec!["https://discord.com/api/**".to_string()],
        secrets: pairs(&[("DISCORD_BOT_TOKEN", "${DISCORD_BOT_TOKEN}")]),
        headers: pairs(&[("Authorization", "Bot ${DISCORD_BOT_TOKEN}")]),
        ingestor: Some(IngestorConfig::Websocket(WebsocketIngestorConfig {
            protocol: "discord".to_string(),
            gateway_url: DISCORD_GATEWAY_URL.to_string(),
            token: "${DISCORD_BOT_TOKEN}".to_string(),
            intents: Some(DISCORD_DEFAULT_INTENTS),
            event_filter: Vec::new(),
            guild_ids: Vec::new(),
            channel_ids: Vec::new(),
            user_ids: Vec::new(),
            shard: None,
            buffer_size: None,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_builtin_templates_have_unique_aliases_and_allowlists() {
        let templates = builtin_connector_templates();
        let mut aliases: Vec<&str> = templates.iter().map(|route| route.alias.as_str()).collect();
        aliases.sort_unstable();
        aliases.dedup();
        assert_eq!(aliases.len(), templates.len());
        for template in &templates {
            assert!(
                !template.allowed_endpoints.is_empty(),
                "template {} has no allowlist",
                template.alias
            );
        }
    }

    #[test]
    fn unit_webhook_templates_configure_provider_signatures() {
        let templates = builtin_connector_templates();
        let stripe = templates
            .iter()
            .find(|route| route.alias == "stripe")
            .expect("stripe template");
        let Some(IngestorConfig::Webhook(webhook)) = &stripe.ingestor else {
            panic!("stripe template must carry a webhook ingestor");
        };
        assert_eq!(webhook.signature_header.as_deref(), Some("Stripe-Signature"));
        assert_eq!(webhook.tolerance_seconds, Some(300));
    }
}
