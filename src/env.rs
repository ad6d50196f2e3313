//! Defines the environment variables to use.
//!
//! Every variable is read once into a [`Config`] before anything touches the network, so a
//! misconfiguration fails the process before scanning begins.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};

use crate::{
    framework::RetryPolicy,
    report::PublisherKind,
    scanner::{DEFAULT_CONCURRENCY, DEFAULT_REQUEST_TIMEOUT, ExclusionSet},
};

/// Parses an optional variable from a lookup function, wrapping any parse error in
/// [`anyhow::Error`].
///
/// Evaluates to `anyhow::Result<Option<T>>`, which is `Ok(None)` if the variable is unset.
macro_rules! parse_env {
    ($lookup:expr, $key:expr => |$var:ident| $expr:expr) => {
        $lookup($key)
            .map(|$var: String| {
                $expr.map_err(|e| anyhow::anyhow!("invalid value for {}: {e}", $key))
            })
            .transpose()
    };
}

/// The configuration of a scan, read from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The token to authenticate against GitHub REST API with. `GITHUB_TOKEN`, required.
    pub github_token: String,
    /// The organization to scan. `GITHUB_ORGANIZATION`, required.
    pub github_organization: String,
    /// The base URL of the GitHub Enterprise Server. `GITHUB_BASE_URL`, required.
    pub github_base_url: String,
    /// The most repositories scanned at once. `CONCURRENT_SCANS`, defaults to 10.
    pub concurrent_scans: usize,
    /// The timeout of every remote call. `REQUEST_TIMEOUT` in seconds, defaults to 60.
    pub request_timeout: Duration,
    /// The deadline of the whole scan. `SCAN_DEADLINE` in seconds, unset by default.
    pub scan_deadline: Option<Duration>,
    /// The retry budget for transient remote failures. `MAX_RETRIES`, defaults to 3.
    pub max_retries: u8,
    /// The exclusion list. `EXCLUDE_REPOS_FILE`, defaults to [`ExclusionSet::DEFAULT_PATH`].
    pub exclude_repos_file: PathBuf,
    /// Where the scan result goes. `PUBLISHER`, defaults to `console`.
    pub publisher: PublisherKind,
    /// The file the JSON publisher writes to. `JSON_OUTPUT_PATH`, stdout if unset.
    pub json_output_path: Option<PathBuf>,
    /// Attempts of the connectivity check. `CONNECTIVITY_MAX_RETRIES`, defaults to 3.
    pub connectivity_max_retries: u8,
    /// Pause between connectivity attempts. `CONNECTIVITY_RETRY_INTERVAL` in seconds, defaults
    /// to 5.
    pub connectivity_retry_interval: Duration,
    /// Timeout of each connectivity attempt. `CONNECTIVITY_TIMEOUT` in seconds, defaults to 5.
    pub connectivity_timeout: Duration,
    /// The Slack bot token, starting with `xoxb-`. `SLACK_BOT_TOKEN`, required by `slack-canvas`.
    pub slack_bot_token: Option<String>,
    /// The channel the canvas is shared with. `SLACK_CHANNEL_ID`, required by `slack-canvas`.
    pub slack_channel_id: Option<String>,
    /// The canvas to overwrite. `SLACK_CANVAS_ID`, required by `slack-canvas`.
    pub slack_canvas_id: Option<String>,
    /// `SLACK_WEBHOOK_URL`, required by `slack-webhook`.
    pub slack_webhook_url: Option<String>,
    /// `DISCORD_WEBHOOK_URL`, required by `discord-webhook`.
    pub discord_webhook_url: Option<String>,
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or any variable is malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of a variable if set.
    ///
    /// Blank values count as unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or any variable is malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required = |key: &str| match lookup(key) {
            Some(value) => Ok(value),
            None => bail!("{key} is not set"),
        };
        let seconds = |key: &str| parse_env!(lookup, key => |s| s.trim().parse::<u64>());

        let concurrent_scans =
            parse_env!(lookup, "CONCURRENT_SCANS" => |s| s.trim().parse::<usize>())?
                .unwrap_or(DEFAULT_CONCURRENCY);
        if concurrent_scans == 0 {
            bail!("CONCURRENT_SCANS must be positive");
        }

        let request_timeout = seconds("REQUEST_TIMEOUT")?
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs);
        if request_timeout.is_zero() {
            bail!("REQUEST_TIMEOUT must be positive");
        }

        let publisher = parse_env!(lookup, "PUBLISHER" => |s| s.trim().parse::<PublisherKind>())?
            .unwrap_or_default();
        let for_publisher = |key: &str, needed_by: PublisherKind| match lookup(key) {
            None if publisher == needed_by => bail!("{key} is required by PUBLISHER={publisher}"),
            value => Ok(value.map(|value| value.trim().to_owned())),
        };

        let slack_bot_token = for_publisher("SLACK_BOT_TOKEN", PublisherKind::SlackCanvas)?;
        if slack_bot_token
            .as_deref()
            .is_some_and(|token| !token.starts_with("xoxb-"))
        {
            bail!("SLACK_BOT_TOKEN must be a bot token starting with xoxb-");
        }

        Ok(Self {
            github_token: required("GITHUB_TOKEN")?,
            github_organization: required("GITHUB_ORGANIZATION")?,
            github_base_url: required("GITHUB_BASE_URL")?,
            concurrent_scans,
            request_timeout,
            scan_deadline: seconds("SCAN_DEADLINE")?
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs),
            max_retries: parse_env!(lookup, "MAX_RETRIES" => |s| s.trim().parse::<u8>())?
                .unwrap_or(RetryPolicy::default().max_retries),
            exclude_repos_file: lookup("EXCLUDE_REPOS_FILE")
                .map_or_else(|| PathBuf::from(ExclusionSet::DEFAULT_PATH), PathBuf::from),
            publisher,
            json_output_path: lookup("JSON_OUTPUT_PATH").map(PathBuf::from),
            connectivity_max_retries:
                parse_env!(lookup, "CONNECTIVITY_MAX_RETRIES" => |s| s.trim().parse::<u8>())?
                    .unwrap_or(3)
                    .max(1),
            connectivity_retry_interval: Duration::from_secs(
                seconds("CONNECTIVITY_RETRY_INTERVAL")?.unwrap_or(5),
            ),
            connectivity_timeout: Duration::from_secs(
                seconds("CONNECTIVITY_TIMEOUT")?.unwrap_or(5).max(1),
            ),
            slack_bot_token,
            slack_channel_id: for_publisher("SLACK_CHANNEL_ID", PublisherKind::SlackCanvas)?,
            slack_canvas_id: for_publisher("SLACK_CANVAS_ID", PublisherKind::SlackCanvas)?,
            slack_webhook_url: for_publisher("SLACK_WEBHOOK_URL", PublisherKind::SlackWebhook)?,
            discord_webhook_url: for_publisher("DISCORD_WEBHOOK_URL", PublisherKind::DiscordWebhook)?,
        })
    }

    /// The retry policy of remote calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }
}
