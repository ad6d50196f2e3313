//! The capability the scanner needs from a source-control server.
//!
//! [`SourceControl`] is implemented by [`github::GitHubClient`] in production and by in-memory
//! doubles in tests.

pub mod github;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::workflow::{Commit, FileContent, Repository, User, Workflow, WorkflowRun};

/// Repositories requested per page when listing an organization.
pub const REPOSITORY_PAGE_SIZE: u8 = 100;

/// A page of repositories of an organization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryPage {
    /// The repositories on this page.
    pub repositories: Vec<Repository>,
    /// The page to request next, or [`None`] if this is the last page.
    pub next_page: Option<u32>,
}

/// Read-only access to repositories, workflows and their history on a source-control server.
///
/// Implementations must be shareable across the concurrent tasks of a scan.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Lists one page of the source (non-fork) repositories of an organization. Pages start at 1.
    async fn list_repositories(&self, org: &str, page: u32) -> Result<RepositoryPage, ClientError>;

    /// Lists all workflow definitions of a repository.
    async fn list_workflows(&self, owner: &str, repo: &str) -> Result<Vec<Workflow>, ClientError>;

    /// Fetches a file of a repository, as transported by the server.
    async fn get_file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<FileContent, ClientError>;

    /// Lists the most recent runs of a workflow, newest first.
    async fn list_recent_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: u64,
        limit: u8,
    ) -> Result<Vec<WorkflowRun>, ClientError>;

    /// Lists the most recent commits touching a path, newest first.
    async fn list_recent_commits(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        limit: u8,
    ) -> Result<Vec<Commit>, ClientError>;

    /// Looks up an account. Returns [`None`] if the account does not exist.
    async fn lookup_user(&self, login: &str) -> Result<Option<User>, ClientError>;
}

/// Errors that can occur when calling a [`SourceControl`].
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request could not be sent or its response could not be received.
    #[error("failed to request {url}: {source}")]
    Request {
        /// The requested URL.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },
    /// The server responded with a non-success status.
    #[error("{url} responded with {status}")]
    Status {
        /// The requested URL.
        url: String,
        /// The response status.
        status: reqwest::StatusCode,
    },
    /// The response body does not have the expected shape.
    #[error("failed to parse data from {url}: {source}")]
    Decode {
        /// The requested URL.
        url: String,
        /// The underlying decoding error.
        #[source]
        source: reqwest::Error,
    },
    /// Any other failure reported by an implementation.
    #[error("{0}")]
    Api(String),
    /// The call did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The call was abandoned because the scan was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request { source, .. } => source.is_connect() || source.is_timeout(),
            Self::Status { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            Self::Timeout(_) => true,
            Self::Decode { .. } | Self::Api(_) | Self::Cancelled => false,
        }
    }

    /// Whether the server reported that the requested resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == reqwest::StatusCode::NOT_FOUND)
    }
}
