use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::info;

use super::{PublishError, Publisher, write_stdout};
use crate::scanner::ScanResult;

/// Writes the scan result as pretty-printed JSON to a file, or stdout if no path is given.
#[derive(Debug, Clone, Default)]
pub struct JsonPublisher {
    output_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: String,
    failed_repos_count: usize,
    #[serde(flatten)]
    result: &'a ScanResult,
}

impl JsonPublisher {
    /// Creates a [`JsonPublisher`].
    pub const fn new(output_path: Option<PathBuf>) -> Self {
        Self { output_path }
    }

    /// Renders the JSON document of a scan result.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the result cannot be serialized.
    pub fn render(result: &ScanResult) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&JsonReport {
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            failed_repos_count: result.failed_repos_count(),
            result,
        })
    }
}

#[async_trait]
impl Publisher for JsonPublisher {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn publish(&self, result: &ScanResult) -> Result<(), PublishError> {
        let mut json = Self::render(result)?;
        json.push('\n');

        match &self.output_path {
            Some(path) => {
                tokio::fs::write(path, json)
                    .await
                    .map_err(|source| PublishError::Io {
                        target: path.display().to_string(),
                        source,
                    })?;
                info!("wrote scan results to {}", path.display());
                Ok(())
            }
            None => write_stdout(json.as_bytes()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::report::sample_result;

    #[test]
    fn renders_json_with_totals() {
        let json: serde_json::Value =
            serde_json::from_str(&JsonPublisher::render(&sample_result()).unwrap()).unwrap();

        assert_eq!(json["total_repos"], 12);
        assert_eq!(json["failed_repos_count"], 1);
        assert_eq!(json["workflows"][0]["cron_schedules"][1], "30 3 * * *");
        assert_eq!(json["failures"][0]["stage"], "parse_workflow");
        assert!(json["generated_at"].is_string());
    }

    #[tokio::test]
    async fn writes_json_to_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.json");

        JsonPublisher::new(Some(path.clone()))
            .publish(&sample_result())
            .await
            .unwrap();

        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.contains("\"workflow_file_name\": \"nightly.yml\""));
    }
}
