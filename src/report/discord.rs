use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tracing::info;

use super::{PublishError, Publisher, WorkflowLinks, http_client, post_json, status_icon};
use crate::{framework::RetryPolicy, scanner::ScanResult};

const EMBED_COLOR: u32 = 0x34_98_DB;
const DESCRIPTION_LIMIT: usize = 4096;

/// Posts a summary of the scan result to a Discord webhook.
#[derive(Debug, Clone)]
pub struct DiscordWebhookPublisher {
    http: reqwest::Client,
    url: String,
    links: WorkflowLinks,
    retry: RetryPolicy,
}

impl DiscordWebhookPublisher {
    /// Creates a [`DiscordWebhookPublisher`] posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Http`] if the HTTP client cannot be built.
    pub fn new(url: String, links: WorkflowLinks) -> Result<Self, PublishError> {
        Ok(Self {
            http: http_client()?,
            url,
            links,
            retry: RetryPolicy::default(),
        })
    }

    /// Retries failed posts following `retry`.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Publisher for DiscordWebhookPublisher {
    fn name(&self) -> &'static str {
        "discord-webhook"
    }

    async fn publish(&self, result: &ScanResult) -> Result<(), PublishError> {
        info!("publishing scan results to Discord webhook…");
        let message = render_discord_message(result, &self.links, Utc::now());
        post_json(&self.http, "Discord webhook", &self.url, None, &message, self.retry).await?;
        Ok(())
    }
}

/// Renders the message of a Discord webhook: a summary embed, then an embed listing the
/// workflows for as long as its description allows.
pub fn render_discord_message(
    result: &ScanResult,
    links: &WorkflowLinks,
    generated_at: DateTime<Utc>,
) -> serde_json::Value {
    let field = |name: &str, value: usize| json!({ "name": name, "value": value.to_string(), "inline": true });
    let summary = json!({
        "title": "Scan Summary",
        "color": EMBED_COLOR,
        "fields": [
            field("Total Repositories", result.total_repos),
            field("Excluded Repositories", result.excluded_repos_count),
            field("Scheduled Workflows", result.workflows.len()),
            field("Failed Repositories", result.failed_repos_count()),
        ],
        "timestamp": generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    });

    let mut embeds = vec![summary];
    if !result.workflows.is_empty() {
        let mut description = String::new();
        for (i, workflow) in result.workflows.iter().enumerate() {
            let line = format!(
                "**[{}]({})** in `{}`: `{}` {} {}\n",
                workflow.workflow_name,
                links.workflow(workflow),
                workflow.repo_name,
                workflow.cron_schedules.join("`, `"),
                status_icon(&workflow.last_status),
                workflow.last_status,
            );
            let more = format!("…and {} more", result.workflows.len() - i);
            if description.chars().count() + line.chars().count() + more.chars().count() > DESCRIPTION_LIMIT {
                description.push_str(&more);
                break;
            }
            description.push_str(&line);
        }

        embeds.push(json!({
            "title": "Scheduled Workflows",
            "color": EMBED_COLOR,
            "description": description.trim_end(),
        }));
    }

    json!({
        "content": format!("Scheduled workflows of {}", links.organization()),
        "embeds": embeds,
    })
}
