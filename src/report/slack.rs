use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{PublishError, Publisher, WorkflowLinks, http_client, post_json, to_kst, truncate};
use crate::{
    framework::RetryPolicy,
    scanner::{ScanResult, UNKNOWN, WorkflowInfo},
};

const SLACK_API_BASE: &str = "https://slack.com/api";
const HEADER_LIMIT: usize = 150;
/// Slack allows 50 blocks per message, four of which frame the list.
const MAX_WORKFLOW_BLOCKS: usize = 46;

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Overwrites a Slack canvas with the scan result and shares it with a channel.
#[derive(Debug, Clone)]
pub struct SlackCanvasPublisher {
    http: reqwest::Client,
    token: String,
    channel_id: String,
    canvas_id: String,
    links: WorkflowLinks,
    api_base: String,
    retry: RetryPolicy,
}

impl SlackCanvasPublisher {
    /// Creates a [`SlackCanvasPublisher`] editing `canvas_id` with a bot `token`.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Http`] if the HTTP client cannot be built.
    pub fn new(
        token: String,
        channel_id: String,
        canvas_id: String,
        links: WorkflowLinks,
    ) -> Result<Self, PublishError> {
        Ok(Self {
            http: http_client()?,
            token,
            channel_id,
            canvas_id,
            links,
            api_base: SLACK_API_BASE.to_owned(),
            retry: RetryPolicy::default(),
        })
    }

    /// Sends Web API calls to `api_base` instead of `https://slack.com/api`.
    #[must_use]
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        api_base.trim_end_matches('/').clone_into(&mut self.api_base);
        self
    }

    /// Retries failed calls following `retry`.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn call(&self, method: &str, payload: &serde_json::Value) -> Result<(), PublishError> {
        let target = format!("Slack {method}");
        let url = format!("{}/{method}", self.api_base);
        let body = post_json(&self.http, &target, &url, Some(self.token.as_str()), payload, self.retry).await?;

        let response: SlackResponse =
            serde_json::from_str(&body).map_err(|err| PublishError::Rejected {
                target: target.clone(),
                reason: format!("unreadable response: {err}"),
            })?;
        if response.ok {
            Ok(())
        } else {
            Err(PublishError::Rejected {
                target,
                reason: response.error.unwrap_or_else(|| String::from("unknown_error")),
            })
        }
    }
}

#[async_trait]
impl Publisher for SlackCanvasPublisher {
    fn name(&self) -> &'static str {
        "slack-canvas"
    }

    async fn publish(&self, result: &ScanResult) -> Result<(), PublishError> {
        info!("publishing scan results to Slack canvas {}…", self.canvas_id);
        let markdown = render_canvas(result, &self.links, Utc::now());

        self.call(
            "canvases.edit",
            &json!({
                "canvas_id": self.canvas_id,
                "changes": [{
                    "operation": "replace",
                    "document_content": { "type": "markdown", "markdown": markdown },
                }],
            }),
        )
        .await?;
        self.call(
            "canvases.access.set",
            &json!({
                "canvas_id": self.canvas_id,
                "access_level": "read",
                "channel_ids": [self.channel_id],
            }),
        )
        .await?;

        info!("updated Slack canvas {}", self.canvas_id);
        Ok(())
    }
}

/// Posts a summary of the scan result to a Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct SlackWebhookPublisher {
    http: reqwest::Client,
    url: String,
    links: WorkflowLinks,
    retry: RetryPolicy,
}

impl SlackWebhookPublisher {
    /// Creates a [`SlackWebhookPublisher`] posting to `url`.
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
impl Publisher for SlackWebhookPublisher {
    fn name(&self) -> &'static str {
        "slack-webhook"
    }

    async fn publish(&self, result: &ScanResult) -> Result<(), PublishError> {
        info!("publishing scan results to Slack webhook…");
        let message = render_webhook_message(result, &self.links);
        post_json(&self.http, "Slack webhook", &self.url, None, &message, self.retry).await?;
        Ok(())
    }
}

/// An emoji for the conclusion of a workflow run.
pub fn status_icon(status: &str) -> &'static str {
    match status {
        "success" | "completed" => "✅",
        "failure" | "startup_failure" | "timed_out" => "❌",
        "cancelled" | "skipped" => "⏹️",
        "in_progress" | "queued" | "waiting" | "pending" => "⏳",
        _ => "❔",
    }
}

fn committer_label(workflow: &WorkflowInfo) -> String {
    if workflow.is_active_user || workflow.last_committer == UNKNOWN {
        workflow.last_committer.clone()
    } else {
        format!("{} (inactive)", workflow.last_committer)
    }
}

fn code_list<I>(items: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    items
        .into_iter()
        .map(|item| format!("`{}`", item.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders the markdown document of a Slack canvas.
///
/// A summary of the scan comes first, followed by one section per scheduled workflow with its
/// schedules in UTC and KST.
pub fn render_canvas(result: &ScanResult, links: &WorkflowLinks, generated_at: DateTime<Utc>) -> String {
    let unknown_committers = result
        .workflows
        .iter()
        .filter(|workflow| workflow.last_committer == UNKNOWN)
        .count();

    let mut canvas = format!(
        "# Scheduled Workflows of {}\n\n\
         ## Scan Summary\n\n\
         - Total Repositories: {}\n\
         - Excluded Repositories: {}\n\
         - Archived Repositories: {}\n\
         - Scheduled Workflows Found: {}\n\
         - Unknown Committers: {unknown_committers}\n\
         - Failed Repositories: {}\n\n\
         _Last updated {} by schedule-scanner {}_\n",
        links.organization(),
        result.total_repos,
        result.excluded_repos_count,
        result.archived_repos_count,
        result.workflows.len(),
        result.failed_repos_count(),
        generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        env!("CARGO_PKG_VERSION"),
    );

    if !result.workflows.is_empty() {
        canvas.push_str("\n## Workflows\n");
    }
    for (i, workflow) in result.workflows.iter().enumerate() {
        let kst: Vec<String> = workflow.cron_schedules.iter().map(|s| to_kst(s)).collect();
        canvas.push_str(&format!(
            "\n### {}. {}\n\n\
             - Workflow: [{}]({})\n\
             - Schedule (UTC): {}\n\
             - Schedule (KST): {}\n\
             - Last Status: {} {}\n\
             - Last Committer: {}\n",
            i + 1,
            workflow.repo_name,
            workflow.workflow_name,
            links.workflow(workflow),
            code_list(&workflow.cron_schedules),
            code_list(&kst),
            status_icon(&workflow.last_status),
            workflow.last_status,
            committer_label(workflow),
        ));
    }

    canvas
}

/// Renders the Block Kit message of a Slack webhook.
///
/// Workflows beyond what fits into one message are counted in a closing note.
pub fn render_webhook_message(result: &ScanResult, links: &WorkflowLinks) -> serde_json::Value {
    let title = truncate(
        &format!("Scheduled Workflows of {}", links.organization()),
        HEADER_LIMIT,
    );
    let summary = format!(
        "*Total Repositories:* {} | *Excluded:* {} | *Scheduled Workflows:* {} | *Failed:* {}",
        result.total_repos,
        result.excluded_repos_count,
        result.workflows.len(),
        result.failed_repos_count()
    );

    let mut blocks = vec![
        json!({ "type": "header", "text": { "type": "plain_text", "text": title } }),
        json!({ "type": "section", "text": { "type": "mrkdwn", "text": summary } }),
        json!({ "type": "divider" }),
    ];
    blocks.extend(result.workflows.iter().take(MAX_WORKFLOW_BLOCKS).map(|workflow| {
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!(
                    "*<{}|{}>* in `{}`\nUTC {} | KST {}\n{} {} | last commit by {}",
                    links.workflow(workflow),
                    workflow.workflow_name,
                    workflow.repo_name,
                    code_list(&workflow.cron_schedules),
                    code_list(workflow.cron_schedules.iter().map(|s| to_kst(s))),
                    status_icon(&workflow.last_status),
                    workflow.last_status,
                    committer_label(workflow),
                ),
            },
        })
    }));

    let hidden = result.workflows.len().saturating_sub(MAX_WORKFLOW_BLOCKS);
    if hidden > 0 {
        blocks.push(json!({
            "type": "context",
            "elements": [{ "type": "mrkdwn", "text": format!("…and {hidden} more scheduled workflows") }],
        }));
    }

    json!({ "text": title, "blocks": blocks })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::{
        report::sample_result,
        testing::{Reply, StubServer},
    };

    fn links() -> WorkflowLinks {
        WorkflowLinks::new("https://ghes.example.com", "acme")
    }

    fn generated_at() -> DateTime<Utc> {
        "2026-10-19T09:00:00Z".parse().unwrap()
    }

    fn canvas_publisher(server: &StubServer) -> SlackCanvasPublisher {
        SlackCanvasPublisher::new(
            String::from("xoxb-test"),
            String::from("C0123"),
            String::from("F0456"),
            links(),
        )
        .unwrap()
        .with_api_base(&server.url)
        .with_retry(RetryPolicy::new(2, Duration::ZERO))
    }

    #[test]
    fn renders_the_canvas_summary() {
        let canvas = render_canvas(&sample_result(), &links(), generated_at());

        assert!(canvas.starts_with("# Scheduled Workflows of acme\n\n## Scan Summary\n\n"));
        assert!(canvas.contains("- Total Repositories: 12\n"));
        assert!(canvas.contains("- Excluded Repositories: 2\n"));
        assert!(canvas.contains("- Scheduled Workflows Found: 2\n"));
        assert!(canvas.contains("- Unknown Committers: 1\n"));
        assert!(canvas.contains("- Failed Repositories: 1\n"));
        assert!(canvas.contains("_Last updated 2026-10-19 09:00:00 UTC by schedule-scanner "));
    }

    #[test]
    fn renders_one_section_per_workflow() {
        let canvas = render_canvas(&sample_result(), &links(), generated_at());

        assert!(canvas.contains(
            "\n### 1. a-repository-with-a-remarkably-long-name\n\n\
             - Workflow: [Nightly](https://ghes.example.com/acme/a-repository-with-a-remarkably-long-name/actions/workflows/nightly.yml)\n\
             - Schedule (UTC): `0 20 * * 1`, `30 3 * * *`\n\
             - Schedule (KST): `0 5 * * 2`, `30 12 * * *`\n\
             - Last Status: ✅ success\n\
             - Last Committer: alice\n"
        ));
        assert!(canvas.contains("- Last Status: ❌ failure\n- Last Committer: Unknown\n"));
    }

    #[test]
    fn marks_inactive_committers() {
        let mut result = sample_result();
        result.workflows[0].is_active_user = false;

        let canvas = render_canvas(&result, &links(), generated_at());
        assert!(canvas.contains("- Last Committer: alice (inactive)\n"));
    }

    #[test]
    fn an_empty_scan_has_only_the_summary() {
        let result = ScanResult {
            workflows: Vec::new(),
            failures: Vec::new(),
            ..sample_result()
        };

        let canvas = render_canvas(&result, &links(), generated_at());
        assert!(canvas.contains("- Scheduled Workflows Found: 0\n"));
        assert!(!canvas.contains("## Workflows"));
    }

    #[test]
    fn webhook_messages_fit_into_one_message() {
        let mut result = sample_result();
        let workflow = result.workflows[1].clone();
        result.workflows = vec![workflow; 60];

        let message = render_webhook_message(&result, &links());
        let blocks = message["blocks"].as_array().unwrap();

        assert_eq!(blocks.len(), 50);
        assert_eq!(blocks[0]["text"]["text"], "Scheduled Workflows of acme");
        assert_eq!(
            blocks[49]["elements"][0]["text"],
            "…and 14 more scheduled workflows"
        );
        assert!(
            blocks[3]["text"]["text"]
                .as_str()
                .unwrap()
                .starts_with("*<https://ghes.example.com/acme/billing/actions/workflows/cleanup.yaml|Cleanup>* in `billing`")
        );
    }

    #[tokio::test]
    async fn replaces_the_canvas_and_shares_it() {
        let server = StubServer::start(vec![
            Reply::Json(200, r#"{"ok": true}"#),
            Reply::Json(200, r#"{"ok": true}"#),
        ])
        .await;

        canvas_publisher(&server)
            .publish(&sample_result())
            .await
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests[0].path(), "/canvases.edit");
        assert!(
            requests[0]
                .head
                .to_ascii_lowercase()
                .contains("authorization: bearer xoxb-test")
        );
        let edit: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(edit["canvas_id"], "F0456");
        assert_eq!(edit["changes"][0]["operation"], "replace");
        assert!(
            edit["changes"][0]["document_content"]["markdown"]
                .as_str()
                .unwrap()
                .contains("### 2. billing")
        );

        assert_eq!(requests[1].path(), "/canvases.access.set");
        let access: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
        assert_eq!(access["channel_ids"][0], "C0123");
    }

    #[tokio::test]
    async fn refused_edits_are_not_retried() {
        let server = StubServer::start(vec![Reply::Json(
            200,
            r#"{"ok": false, "error": "canvas_not_found"}"#,
        )])
        .await;

        let err = canvas_publisher(&server)
            .publish(&sample_result())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PublishError::Rejected { ref reason, .. } if reason == "canvas_not_found"
        ));
        assert_eq!(server.connections(), 1);
    }
}
