//! Verifies that the GitHub Enterprise Server answers before a scan begins.

use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::framework::retry_if_possible;

/// What the server tells about itself on `/api/v3/meta`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    /// The version of GitHub Enterprise Server, absent on github.com.
    #[serde(default)]
    pub installed_version: Option<String>,
}

/// Errors that can occur when checking connectivity.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConnectivityError {
    /// The base URL has no scheme or host.
    #[error("invalid GitHub Enterprise Server URL {0}")]
    InvalidUrl(String),
    /// The HTTP client could not be built.
    #[error("failed to initialize HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    /// Every attempt failed.
    #[error("failed to connect to {url} after {attempts} attempts")]
    Unreachable {
        /// The URL checked.
        url: String,
        /// The attempts made.
        attempts: u8,
    },
}

/// Checks the `meta` endpoint of a server, a fixed number of times at a fixed interval.
#[derive(Debug, Clone)]
pub struct ConnectivityChecker {
    http: reqwest::Client,
    meta_url: String,
    max_attempts: u8,
    retry_interval: Duration,
}

impl ConnectivityChecker {
    /// Creates a [`ConnectivityChecker`] for the server at `base_url`.
    ///
    /// `max_attempts` is raised to at least one.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectivityError`] if `base_url` is not an absolute URL or the HTTP client
    /// cannot be built.
    pub fn new(
        base_url: &str,
        max_attempts: u8,
        retry_interval: Duration,
        timeout: Duration,
    ) -> Result<Self, ConnectivityError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ConnectivityError::Client)?;

        Ok(Self {
            http,
            meta_url: meta_url(base_url)?,
            max_attempts: max_attempts.max(1),
            retry_interval,
        })
    }

    /// Requests the `meta` endpoint until the server answers with a success status.
    ///
    /// An unparsable body still counts as connected, with an empty [`ServerInfo`].
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::Unreachable`] if no attempt succeeds.
    pub async fn verify(&self) -> Result<ServerInfo, ConnectivityError> {
        info!("checking connectivity to {}…", self.meta_url);
        let mut retry: u8 = 0;

        loop {
            debug!("attempt {} to reach {}", retry + 1, self.meta_url);

            match self.http.get(&self.meta_url).send().await {
                Ok(response) if response.status().is_success() => {
                    let server_info = response.json::<ServerInfo>().await.unwrap_or_else(|err| {
                        warn!("failed to parse server information: {err}");
                        ServerInfo::default()
                    });
                    match &server_info.installed_version {
                        Some(version) => info!(installed_version = %version, "connected to GitHub Enterprise Server"),
                        None => info!("connected to GitHub Enterprise Server"),
                    }
                    return Ok(server_info);
                }
                Ok(response) => warn!("received {} from {}", response.status(), self.meta_url),
                Err(err) => warn!("connection attempt failed: {err}"),
            }

            if !retry_if_possible(&mut retry, self.max_attempts - 1) {
                return Err(ConnectivityError::Unreachable {
                    url: self.meta_url.clone(),
                    attempts: self.max_attempts,
                });
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

/// Builds `{scheme}://{host}/api/v3/meta` out of a server URL, ignoring its path.
///
/// # Errors
///
/// Returns [`ConnectivityError::InvalidUrl`] if `base_url` has no scheme or host.
pub fn meta_url(base_url: &str) -> Result<String, ConnectivityError> {
    let url = Url::parse(base_url.trim())
        .map_err(|_| ConnectivityError::InvalidUrl(base_url.to_owned()))?;
    let host = url
        .host_str()
        .ok_or_else(|| ConnectivityError::InvalidUrl(base_url.to_owned()))?;

    Ok(match url.port() {
        Some(port) => format!("{}://{host}:{port}/api/v3/meta", url.scheme()),
        None => format!("{}://{host}/api/v3/meta", url.scheme()),
    })
}
