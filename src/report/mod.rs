//! Publishes a [`ScanResult`] to the console, a JSON document, a Slack canvas, or a chat webhook.
//!
//! See: [`Publisher`], [`create_publisher`]

mod console;
mod discord;
mod json;
mod slack;

pub use console::*;
pub use discord::*;
pub use json::*;
pub use slack::*;

use std::{fmt::Display, str::FromStr, time::Duration};

use async_trait::async_trait;
use reqwest::{StatusCode, header};
use thiserror::Error;
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, warn};

use crate::{
    client::github::api_base_url,
    env::Config,
    framework::{RetryPolicy, StateError, StateResult, run_with_retries},
    scanner::{ScanResult, WorkflowInfo},
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Errors that can occur when publishing a scan result.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum PublishError {
    /// The result could not be serialized.
    #[error("failed to serialize scan result: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The report could not be written.
    #[error("failed to write report to {target}: {source}")]
    Io {
        /// Where the report was written to.
        target: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The report could not be sent.
    #[error("failed to send report to {target}: {source}")]
    Http {
        /// Where the report was sent to.
        target: String,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },
    /// The destination answered with an unsuccessful status.
    #[error("{target} answered {status}")]
    Status {
        /// Where the report was sent to.
        target: String,
        /// The status received.
        status: StatusCode,
    },
    /// The destination answered, but refused the report.
    #[error("{target} refused the report: {reason}")]
    Rejected {
        /// Where the report was sent to.
        target: String,
        /// The reason given.
        reason: String,
    },
    /// A setting the publisher needs is missing.
    #[error("{0} is not set")]
    MissingSetting(&'static str),
}

/// A destination of scan results.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// The name of this publisher, as selected by configuration.
    fn name(&self) -> &'static str;

    /// Publishes a scan result.
    ///
    /// # Errors
    ///
    /// Returns a [`PublishError`] if the result cannot be rendered or delivered.
    async fn publish(&self, result: &ScanResult) -> Result<(), PublishError>;
}

/// The kinds of [`Publisher`] that can be configured.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublisherKind {
    /// [`ConsolePublisher`].
    #[default]
    Console,
    /// [`JsonPublisher`].
    Json,
    /// [`SlackCanvasPublisher`].
    SlackCanvas,
    /// [`SlackWebhookPublisher`].
    SlackWebhook,
    /// [`DiscordWebhookPublisher`].
    DiscordWebhook,
}

impl PublisherKind {
    /// The name of this kind in `PUBLISHER`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Json => "json",
            Self::SlackCanvas => "slack-canvas",
            Self::SlackWebhook => "slack-webhook",
            Self::DiscordWebhook => "discord-webhook",
        }
    }
}

impl Display for PublisherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error of parsing an unknown [`PublisherKind`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown publisher type: {0}")]
pub struct UnknownPublisher(String);

impl FromStr for PublisherKind {
    type Err = UnknownPublisher;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "console" => Ok(Self::Console),
            "json" => Ok(Self::Json),
            "slack-canvas" => Ok(Self::SlackCanvas),
            "slack-webhook" => Ok(Self::SlackWebhook),
            "discord-webhook" => Ok(Self::DiscordWebhook),
            _ => Err(UnknownPublisher(s.to_owned())),
        }
    }
}

/// Creates the [`Publisher`] selected by `config`.
///
/// # Errors
///
/// Returns [`PublishError::MissingSetting`] if a setting of the selected publisher is missing,
/// or [`PublishError::Http`] if its HTTP client cannot be built.
pub fn create_publisher(config: &Config) -> Result<Box<dyn Publisher>, PublishError> {
    fn setting(value: Option<&String>, key: &'static str) -> Result<String, PublishError> {
        value.cloned().ok_or(PublishError::MissingSetting(key))
    }

    let links = WorkflowLinks::new(&config.github_base_url, &config.github_organization);

    let publisher: Box<dyn Publisher> = match config.publisher {
        PublisherKind::Console => Box::new(ConsolePublisher),
        PublisherKind::Json => Box::new(JsonPublisher::new(config.json_output_path.clone())),
        PublisherKind::SlackCanvas => Box::new(SlackCanvasPublisher::new(
            setting(config.slack_bot_token.as_ref(), "SLACK_BOT_TOKEN")?,
            setting(config.slack_channel_id.as_ref(), "SLACK_CHANNEL_ID")?,
            setting(config.slack_canvas_id.as_ref(), "SLACK_CANVAS_ID")?,
            links,
        )?),
        PublisherKind::SlackWebhook => Box::new(SlackWebhookPublisher::new(
            setting(config.slack_webhook_url.as_ref(), "SLACK_WEBHOOK_URL")?,
            links,
        )?),
        PublisherKind::DiscordWebhook => Box::new(DiscordWebhookPublisher::new(
            setting(config.discord_webhook_url.as_ref(), "DISCORD_WEBHOOK_URL")?,
            links,
        )?),
    };
    Ok(publisher)
}

/// Builds links to the web pages of scanned workflows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowLinks {
    web_root: String,
    organization: String,
}

impl WorkflowLinks {
    /// Creates [`WorkflowLinks`] for `organization` on the server at `base_url`, which may carry
    /// the `/api/v3` suffix.
    pub fn new(base_url: &str, organization: &str) -> Self {
        let api_root = api_base_url(base_url);
        let web_root = api_root
            .strip_suffix("/api/v3")
            .unwrap_or(&api_root)
            .replace("://api.github.com", "://github.com");

        Self {
            web_root,
            organization: organization.to_owned(),
        }
    }

    /// The organization the links point into.
    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// The Actions page of a workflow.
    pub fn workflow(&self, workflow: &WorkflowInfo) -> String {
        format!(
            "{}/{}/{}/actions/workflows/{}",
            self.web_root, self.organization, workflow.repo_name, workflow.workflow_file_name
        )
    }
}

fn http_client() -> Result<reqwest::Client, PublishError> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|source| PublishError::Http {
            target: String::from("HTTP client"),
            source,
        })
}

/// Posts `payload` as JSON, retrying failed connections, rate limits and server errors.
///
/// `target` names the destination in logs and errors, so secrets in `url` stay out of both.
async fn post_json(
    http: &reqwest::Client,
    target: &str,
    url: &str,
    bearer: Option<&str>,
    payload: &serde_json::Value,
    retry: RetryPolicy,
) -> Result<String, PublishError> {
    run_with_retries(target, retry, move || {
        attempt_post(http, target, url, bearer, payload)
    })
    .await
}

async fn attempt_post(
    http: &reqwest::Client,
    target: &str,
    url: &str,
    bearer: Option<&str>,
    payload: &serde_json::Value,
) -> StateResult<String, PublishError> {
    debug!("sending report to {target}…");

    let mut request = http.post(url).json(payload);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let http_error = |source: reqwest::Error| PublishError::Http {
        target: target.to_owned(),
        source,
    };
    let response = request
        .send()
        .await
        .map_err(|source| StateError::Retry(http_error(source)))?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let wait = retry_after(response.headers());
        warn!("{target} is rate limited, waiting {}s", wait.as_secs());
        tokio::time::sleep(wait).await;
    }
    if !status.is_success() {
        let err = PublishError::Status {
            target: target.to_owned(),
            status,
        };
        return Err(
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                StateError::Retry(err)
            } else {
                StateError::Stop(err)
            },
        );
    }

    response
        .text()
        .await
        .map_err(|source| StateError::Stop(http_error(source)))
}

/// Reads the `Retry-After` seconds of a rate-limited response, capped at a minute.
fn retry_after(headers: &header::HeaderMap) -> Duration {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map_or(Duration::from_secs(1), Duration::from_secs)
        .min(MAX_RETRY_AFTER)
}

async fn write_stdout(bytes: &[u8]) -> Result<(), PublishError> {
    let mut stdout = tokio::io::stdout();
    let written = async {
        stdout.write_all(bytes).await?;
        stdout.flush().await
    };

    written.await.map_err(|source| PublishError::Io {
        target: String::from("stdout"),
        source,
    })
}

/// A scan result shared by the tests of every publisher.
#[cfg(test)]
fn sample_result() -> ScanResult {
    use crate::scanner::{ScanFailure, ScanStage};

    ScanResult {
        workflows: vec![
            WorkflowInfo {
                repo_name: String::from("a-repository-with-a-remarkably-long-name"),
                workflow_name: String::from("Nightly"),
                workflow_id: 7,
                workflow_file_name: String::from("nightly.yml"),
                cron_schedules: vec![String::from("0 20 * * 1"), String::from("30 3 * * *")],
                last_status: String::from("success"),
                last_committer: String::from("alice"),
                is_active_user: true,
            },
            WorkflowInfo {
                repo_name: String::from("billing"),
                workflow_name: String::from("Cleanup"),
                workflow_id: 9,
                workflow_file_name: String::from("cleanup.yaml"),
                cron_schedules: vec![String::from("0 0 * * *")],
                last_status: String::from("failure"),
                last_committer: String::from("Unknown"),
                is_active_user: false,
            },
        ],
        total_repos: 12,
        excluded_repos_count: 2,
        archived_repos_count: 1,
        failures: vec![ScanFailure {
            repository: String::from("broken"),
            workflow: Some(String::from(".github/workflows/ci.yml")),
            stage: ScanStage::ParseWorkflow,
            message: String::from("invalid YAML"),
        }],
        scan_duration: Duration::from_millis(1500),
        max_concurrent_scans: 4,
    }
}
