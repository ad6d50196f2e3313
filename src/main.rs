//! Scans the configured organization once and publishes the scheduled workflows found.

use std::{process::ExitCode, sync::Arc};

use anyhow::{Context as _, Result};
use schedule_scanner::{
    client::github::GitHubClient,
    connectivity::ConnectivityChecker,
    env::Config,
    logging,
    report::create_publisher,
    scanner::{ExclusionSet, Scanner},
    shutdown,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        organization = %config.github_organization,
        base_url = %config.github_base_url,
        concurrent_scans = config.concurrent_scans,
        publisher = ?config.publisher,
        "starting scheduled workflow scan"
    );

    ConnectivityChecker::new(
        &config.github_base_url,
        config.connectivity_max_retries,
        config.connectivity_retry_interval,
        config.connectivity_timeout,
    )?
    .verify()
    .await
    .context("GitHub Enterprise Server is unreachable")?;

    let retry = config.retry_policy();
    let client = GitHubClient::new(
        &config.github_base_url,
        &config.github_token,
        config.request_timeout,
        retry,
    )?;
    let publisher = create_publisher(&config).context("failed to set up the publisher")?;
    let exclusions = ExclusionSet::load(&config.exclude_repos_file).await;
    let scanner = Scanner::new(Arc::new(client), config.concurrent_scans)?
        .with_exclusions(exclusions)
        .with_call_timeout(retry.budget(config.request_timeout));

    tokio::spawn(shutdown::signal());
    let cancel = shutdown::scan_token(config.scan_deadline);
    let result = scanner
        .scan_scheduled_workflows(&config.github_organization, &cancel)
        .await
        .with_context(|| format!("failed to scan {}", config.github_organization))?;
    cancel.cancel();

    publisher
        .publish(&result)
        .await
        .with_context(|| format!("failed to publish scan results with {}", publisher.name()))?;

    info!(
        workflows = result.workflows.len(),
        failed_repos = result.failed_repos_count(),
        "scan complete"
    );
    Ok(())
}
