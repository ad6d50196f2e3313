//! The concurrent repository scanning engine.
//!
//! A scan lists every repository of an organization, then fans out one task per eligible
//! repository. At most [`Scanner::concurrency`] tasks are in flight at any time: a task is only
//! spawned once it holds a semaphore permit, and the permit is released whenever the task ends,
//! including when it panics or is aborted.
//!
//! Failures of a single repository or workflow never abort the scan. They are collected into
//! [`ScanResult::failures`] and summarized in the logs, and the scan returns whatever was found
//! elsewhere. Only a failure to list the repositories, or a cancellation, fails the whole scan.

mod exclusion;

pub use exclusion::ExclusionSet;

use std::{
    collections::{BTreeSet, HashMap},
    fmt::{Debug, Display},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{ClientError, SourceControl},
    framework::RetryPolicy,
    workflow::{
        Repository, Workflow,
        schedule::{extract_schedules, parse_workflow},
    },
};

/// The concurrency limit used unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// The per-call timeout used unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Placeholder for a run status or committer that cannot be determined.
pub const UNKNOWN: &str = "Unknown";

/// A workflow that runs on at least one cron schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowInfo {
    /// The repository defining the workflow.
    pub repo_name: String,
    /// The display name of the workflow.
    pub workflow_name: String,
    /// The identifier of the workflow.
    pub workflow_id: u64,
    /// The file name of the workflow definition.
    pub workflow_file_name: String,
    /// The cron expressions triggering the workflow, in document order. Never empty.
    pub cron_schedules: Vec<String>,
    /// The status of the latest run, or [`UNKNOWN`].
    pub last_status: String,
    /// The author of the latest commit touching the workflow file, or [`UNKNOWN`].
    pub last_committer: String,
    /// Whether [`Self::last_committer`] resolves to an account that can still be used.
    pub is_active_user: bool,
}

/// The step of a repository scan that failed.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStage {
    /// Listing the workflow definitions of the repository.
    ListWorkflows,
    /// Fetching the content of a workflow definition.
    FetchContent,
    /// Decoding the transported content of a workflow definition.
    DecodeContent,
    /// Parsing a workflow definition.
    ParseWorkflow,
    /// The repository task ended without reporting back.
    Task,
}

impl Display for ScanStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ListWorkflows => "list workflows",
            Self::FetchContent => "fetch workflow content",
            Self::DecodeContent => "decode workflow content",
            Self::ParseWorkflow => "parse workflow",
            Self::Task => "complete repository scan",
        })
    }
}

/// A repository or workflow that could not be scanned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanFailure {
    /// The repository being scanned.
    pub repository: String,
    /// The path of the workflow being scanned, if the failure is limited to one workflow.
    pub workflow: Option<String>,
    /// The step that failed.
    pub stage: ScanStage,
    /// What went wrong.
    pub message: String,
}

impl ScanFailure {
    fn new<E>(repository: &str, workflow: Option<&str>, stage: ScanStage, err: E) -> Self
    where
        E: Display,
    {
        Self {
            repository: repository.to_owned(),
            workflow: workflow.map(str::to_owned),
            stage,
            message: err.to_string(),
        }
    }
}

impl Display for ScanFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.workflow {
            Some(workflow) => write!(
                f,
                "{}: failed to {} {workflow}: {}",
                self.repository, self.stage, self.message
            ),
            None => write!(
                f,
                "{}: failed to {}: {}",
                self.repository, self.stage, self.message
            ),
        }
    }
}

/// The outcome of [`Scanner::scan_scheduled_workflows`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    /// Every scheduled workflow found, in discovery order.
    pub workflows: Vec<WorkflowInfo>,
    /// Every repository returned by the listing, including archived and excluded ones.
    pub total_repos: usize,
    /// Repositories skipped because they are in the [`ExclusionSet`].
    pub excluded_repos_count: usize,
    /// Repositories skipped because they are archived.
    pub archived_repos_count: usize,
    /// Repositories and workflows that could not be scanned.
    pub failures: Vec<ScanFailure>,
    /// Wall-clock time from the first listing call until every task finished.
    pub scan_duration: Duration,
    /// The most repository tasks observed in flight at once.
    pub max_concurrent_scans: usize,
}

impl ScanResult {
    /// The number of distinct repositories with at least one failure.
    pub fn failed_repos_count(&self) -> usize {
        self.failures
            .iter()
            .map(|failure| failure.repository.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Errors that fail a whole scan.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ScanError {
    /// The concurrency limit is not positive.
    #[error("concurrency limit must be positive, got {0}")]
    InvalidConcurrency(usize),
    /// The repositories of the organization could not be listed.
    #[error("failed to list repositories of {org}: {source}")]
    Discovery {
        /// The organization being scanned.
        org: String,
        /// The underlying client error.
        #[source]
        source: ClientError,
    },
    /// The scan was cancelled before it completed.
    #[error("scan of {0} was cancelled")]
    Cancelled(String),
}

struct Committer {
    name: String,
    active: bool,
}

impl Committer {
    fn unknown() -> Self {
        Self {
            name: UNKNOWN.to_owned(),
            active: false,
        }
    }
}

#[derive(Default)]
struct Progress {
    workflows: Mutex<Vec<WorkflowInfo>>,
    failures: Mutex<Vec<ScanFailure>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Counts a repository task as in flight for as long as it lives.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(progress: &'a Progress) -> (Self, usize) {
        let active = progress.active.fetch_add(1, Ordering::SeqCst) + 1;
        progress.peak.fetch_max(active, Ordering::SeqCst);
        (Self(&progress.active), active)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scans the repositories of an organization for scheduled workflows.
#[derive(Clone)]
pub struct Scanner {
    client: Arc<dyn SourceControl>,
    concurrency: usize,
    call_timeout: Duration,
    exclusions: Arc<ExclusionSet>,
}

impl Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("concurrency", &self.concurrency)
            .field("call_timeout", &self.call_timeout)
            .field("exclusions", &self.exclusions.len())
            .finish_non_exhaustive()
    }
}

impl Scanner {
    /// Creates a [`Scanner`] scanning at most `concurrency` repositories at once.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::InvalidConcurrency`] if `concurrency` is zero.
    pub fn new(client: Arc<dyn SourceControl>, concurrency: usize) -> Result<Self, ScanError> {
        if concurrency == 0 {
            return Err(ScanError::InvalidConcurrency(concurrency));
        }

        Ok(Self {
            client,
            concurrency,
            call_timeout: RetryPolicy::default().budget(DEFAULT_REQUEST_TIMEOUT),
            exclusions: Arc::default(),
        })
    }

    /// Skips the repositories in `exclusions`.
    #[must_use]
    pub fn with_exclusions(mut self, exclusions: ExclusionSet) -> Self {
        self.exclusions = Arc::new(exclusions);
        self
    }

    /// Bounds every call to the [`SourceControl`] by `timeout`.
    ///
    /// A client that retries internally needs its whole retry loop to fit, i.e. the
    /// [`RetryPolicy::budget`] of its per-request timeout. Defaults to the budget of the default
    /// policy over [`DEFAULT_REQUEST_TIMEOUT`].
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Scans every repository of `org` for workflows triggered on a cron schedule.
    ///
    /// Archived repositories and those in the [`ExclusionSet`] are counted but not scanned.
    /// Cancelling `cancel` aborts all outstanding remote calls.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::Discovery`] if the repositories cannot be listed, or
    /// [`ScanError::Cancelled`] if `cancel` is cancelled before the scan completes.
    pub async fn scan_scheduled_workflows(
        &self,
        org: &str,
        cancel: &CancellationToken,
    ) -> Result<ScanResult, ScanError> {
        let start = Instant::now();
        info!(
            organization = org,
            max_concurrent = self.concurrency,
            "starting workflow scan…"
        );

        let repositories = self.discover(org, cancel).await?;
        let total_repos = repositories.len();
        let mut excluded_repos_count = 0;
        let mut archived_repos_count = 0;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let progress = Arc::new(Progress::default());
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();

        for repository in repositories {
            if repository.archived {
                info!(repository = %repository.name, "skipping archived repository");
                archived_repos_count += 1;
                continue;
            }
            if self.exclusions.contains(&repository.name) {
                info!(repository = %repository.name, "skipping excluded repository");
                excluded_repos_count += 1;
                continue;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                () = cancel.cancelled() => break,
            };

            let name = repository.name.clone();
            let scanner = self.clone();
            let progress = Arc::clone(&progress);
            let cancel = cancel.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                scanner.run_task(repository, &progress, &cancel).await;
            });
            names.insert(handle.id(), name);
        }

        loop {
            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                () = cancel.cancelled() => {
                    tasks.shutdown().await;
                    break;
                }
            };
            let Some(joined) = joined else { break };

            if let Err(err) = joined {
                let repository = names.get(&err.id()).map_or("<unknown>", String::as_str);
                error!(repository, "repository scan task failed: {err}");
                progress
                    .failures
                    .lock()
                    .push(ScanFailure::new(repository, None, ScanStage::Task, &err));
            }
        }

        if cancel.is_cancelled() {
            warn!(organization = org, "workflow scan cancelled");
            return Err(ScanError::Cancelled(org.to_owned()));
        }

        let result = ScanResult {
            workflows: std::mem::take(&mut *progress.workflows.lock()),
            total_repos,
            excluded_repos_count,
            archived_repos_count,
            failures: std::mem::take(&mut *progress.failures.lock()),
            scan_duration: start.elapsed(),
            max_concurrent_scans: progress.peak.load(Ordering::SeqCst),
        };

        info!(
            duration = ?result.scan_duration,
            max_concurrent = result.max_concurrent_scans,
            total_repos = result.total_repos,
            total_workflows = result.workflows.len(),
            error_count = result.failures.len(),
            "scan completed"
        );
        if !result.failures.is_empty() {
            let causes: Vec<String> = result.failures.iter().map(ToString::to_string).collect();
            warn!(
                failed_repos = result.failed_repos_count(),
                errors = ?causes,
                "some repositories failed to scan"
            );
        }

        Ok(result)
    }

    /// Lists every source repository of `org`, following pagination.
    async fn discover(
        &self,
        org: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Repository>, ScanError> {
        let mut repositories = Vec::new();
        let mut page = 1;

        loop {
            let batch = match self.call(cancel, self.client.list_repositories(org, page)).await {
                Ok(batch) => batch,
                Err(ClientError::Cancelled) => return Err(ScanError::Cancelled(org.to_owned())),
                Err(source) => {
                    error!(organization = org, page, "failed to list repositories: {source}");
                    return Err(ScanError::Discovery {
                        org: org.to_owned(),
                        source,
                    });
                }
            };

            debug!(page, repo_count = batch.repositories.len(), "processing repositories batch");
            repositories.extend(batch.repositories);

            match batch.next_page {
                Some(next_page) if next_page > page => page = next_page,
                _ => break,
            }
        }

        repositories.retain(|repository| !repository.fork);
        repositories.sort_by(|a, b| {
            (&a.owner.login, &a.name).cmp(&(&b.owner.login, &b.name))
        });
        Ok(repositories)
    }

    async fn run_task(&self, repository: Repository, progress: &Progress, cancel: &CancellationToken) {
        let (_in_flight, active) = InFlight::enter(progress);
        debug!(repository = %repository.name, active, "scanning repository");

        let (workflows, failures) = self.scan_repository(&repository, cancel).await;

        if !workflows.is_empty() {
            info!(
                repository = %repository.name,
                workflow_count = workflows.len(),
                "found scheduled workflows"
            );
            progress.workflows.lock().extend(workflows);
        }
        if !failures.is_empty() {
            for failure in &failures {
                error!(repository = %repository.name, "{failure}");
            }
            progress.failures.lock().extend(failures);
        }
    }

    async fn scan_repository(
        &self,
        repository: &Repository,
        cancel: &CancellationToken,
    ) -> (Vec<WorkflowInfo>, Vec<ScanFailure>) {
        let (owner, name) = (repository.owner.login.as_str(), repository.name.as_str());
        let mut found = Vec::new();
        let mut failures = Vec::new();

        let workflows = match self.call(cancel, self.client.list_workflows(owner, name)).await {
            Ok(workflows) => workflows,
            Err(err) => {
                failures.push(ScanFailure::new(name, None, ScanStage::ListWorkflows, err));
                return (found, failures);
            }
        };

        for workflow in &workflows {
            if cancel.is_cancelled() {
                break;
            }
            debug!(repository = name, workflow = %workflow.name, "checking workflow");

            let cron_schedules = match self.schedules_of(repository, workflow, cancel).await {
                Ok(cron_schedules) => cron_schedules,
                Err(failure) => {
                    failures.push(failure);
                    continue;
                }
            };
            if cron_schedules.is_empty() {
                debug!(repository = name, path = %workflow.path, "no schedules found");
                continue;
            }
            info!(
                repository = name,
                workflow = %workflow.name,
                schedules = ?cron_schedules,
                "found scheduled workflow"
            );

            let (last_status, committer) = futures::join!(
                self.last_status(repository, workflow, cancel),
                self.last_committer(repository, workflow, cancel),
            );

            found.push(WorkflowInfo {
                repo_name: name.to_owned(),
                workflow_name: workflow.name.clone(),
                workflow_id: workflow.id,
                workflow_file_name: workflow.file_name().to_owned(),
                cron_schedules,
                last_status,
                last_committer: committer.name,
                is_active_user: committer.active,
            });
        }

        (found, failures)
    }

    async fn schedules_of(
        &self,
        repository: &Repository,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ScanFailure> {
        let (owner, name) = (repository.owner.login.as_str(), repository.name.as_str());
        let failure = |stage, err: &dyn Display| {
            ScanFailure::new(name, Some(workflow.path.as_str()), stage, err)
        };

        let content = self
            .call(cancel, self.client.get_file_content(owner, name, &workflow.path))
            .await
            .map_err(|err| failure(ScanStage::FetchContent, &err))?;
        let text = content
            .decode()
            .map_err(|err| failure(ScanStage::DecodeContent, &err))?;
        let document =
            parse_workflow(&text).map_err(|err| failure(ScanStage::ParseWorkflow, &err))?;

        Ok(extract_schedules(&document))
    }

    async fn last_status(
        &self,
        repository: &Repository,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> String {
        let (owner, name) = (repository.owner.login.as_str(), repository.name.as_str());

        match self
            .call(cancel, self.client.list_recent_runs(owner, name, workflow.id, 1))
            .await
        {
            Ok(runs) => runs
                .into_iter()
                .next()
                .and_then(|run| run.status)
                .unwrap_or_else(|| UNKNOWN.to_owned()),
            Err(err) => {
                warn!(repository = name, workflow = %workflow.name, "failed to get workflow runs: {err}");
                UNKNOWN.to_owned()
            }
        }
    }

    async fn last_committer(
        &self,
        repository: &Repository,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> Committer {
        let (owner, name) = (repository.owner.login.as_str(), repository.name.as_str());

        let commit = match self
            .call(cancel, self.client.list_recent_commits(owner, name, &workflow.path, 1))
            .await
        {
            Ok(commits) => commits.into_iter().next(),
            Err(err) => {
                warn!(repository = name, workflow = %workflow.name, "failed to get commits: {err}");
                None
            }
        };

        let Some(commit) = commit else {
            return Committer::unknown();
        };
        let Some(login) = commit.author_login() else {
            return Committer {
                name: commit.author_name().unwrap_or(UNKNOWN).to_owned(),
                active: false,
            };
        };

        let active = match self.call(cancel, self.client.lookup_user(login)).await {
            Ok(Some(user)) => user.is_active(),
            Ok(None) => {
                debug!(login, "committer account no longer exists");
                false
            }
            Err(err) => {
                warn!(login, "failed to look up committer: {err}");
                false
            }
        };

        Committer {
            name: commit.author_name().unwrap_or(login).to_owned(),
            active,
        }
    }

    /// Runs a remote call, bounded by the call timeout and aborted on cancellation.
    async fn call<T, F>(&self, cancel: &CancellationToken, call: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        tokio::select! {
            () = cancel.cancelled() => Err(ClientError::Cancelled),
            result = tokio::time::timeout(self.call_timeout, call) => {
                result.unwrap_or(Err(ClientError::Timeout(self.call_timeout)))
            }
        }
    }
}
