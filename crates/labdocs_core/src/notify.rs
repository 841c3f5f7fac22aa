use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::LabDocsConfig;
use crate::sync::SyncStats;

pub const COLOR_SUCCESS: u32 = 0x00ff00;
pub const COLOR_WARNING: u32 = 0xff9900;
const EMBED_TITLE: &str = "📚 BookStack Docs Updated";
const EMBED_DESCRIPTION: &str = "Homelab documentation has been updated.";
const WEBHOOK_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WebhookPayload {
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl EmbedField {
    fn new(name: &str, value: String, inline: bool) -> Self {
        Self {
            name: name.to_string(),
            value,
            inline,
        }
    }
}

pub fn build_payload(stats: &SyncStats, docs_url: &str, timestamp: String) -> WebhookPayload {
    let color = if stats.errors == 0 {
        COLOR_SUCCESS
    } else {
        COLOR_WARNING
    };
    WebhookPayload {
        embeds: vec![Embed {
            title: EMBED_TITLE.to_string(),
            description: EMBED_DESCRIPTION.to_string(),
            color,
            fields: vec![
                EmbedField::new("Pages Created", stats.created.to_string(), true),
                EmbedField::new("Pages Updated", stats.updated.to_string(), true),
                EmbedField::new("Errors", stats.errors.to_string(), true),
                EmbedField::new("Link", format!("[View Docs]({docs_url})"), false),
            ],
            timestamp,
        }],
    }
}

/// Post the run summary. Returns `false` when notifications are disabled or no
/// webhook is configured.
pub fn send_notification(config: &LabDocsConfig, stats: &SyncStats) -> Result<bool> {
    if !config.discord.enabled {
        return Ok(false);
    }
    let Some(webhook_url) = config.discord_webhook_url() else {
        warn!("Discord webhook URL not configured");
        return Ok(false);
    };

    let docs_url = config.bookstack_url().unwrap_or_default();
    let payload = build_payload(
        stats,
        &docs_url,
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    );

    let client = Client::builder()
        .timeout(Duration::from_millis(WEBHOOK_TIMEOUT_MS))
        .build()
        .context("failed to build webhook HTTP client")?;
    let response = client
        .post(&webhook_url)
        .json(&payload)
        .send()
        .context("failed to send Discord notification")?;
    let status = response.status();
    if !status.is_success() {
        bail!("Discord webhook failed with HTTP {status}");
    }
    info!("Discord notification sent");
    Ok(true)
}
