//! [`SourceControl`] over GitHub Enterprise Server REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url, header};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::{debug, error};

use super::{ClientError, REPOSITORY_PAGE_SIZE, RepositoryPage, SourceControl};
use crate::{
    framework::{RetryPolicy, StateError, StateResult, run_with_retries},
    workflow::{Commit, FileContent, Repository, User, Workflow, WorkflowRun},
};

const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("schedule-scanner/", env!("CARGO_PKG_VERSION"));
const WORKFLOW_PAGE_SIZE: u8 = 100;

#[derive(Debug, Deserialize)]
struct Workflows {
    workflows: Vec<Workflow>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRuns {
    workflow_runs: Vec<WorkflowRun>,
}

struct Page<T> {
    body: T,
    next_page: Option<u32>,
}

/// A client of GitHub REST API, as served by GitHub Enterprise Server or github.com.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_root: Url,
    token: String,
    retry: RetryPolicy,
}

impl GitHubClient {
    /// Creates a [`GitHubClient`].
    ///
    /// `base_url` may be given with or without the `/api/v3` suffix of GitHub Enterprise Server.
    /// Every request is bounded by `timeout`, and transient failures are retried following
    /// `retry`.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if `base_url` is not an absolute URL or the HTTP client cannot be
    /// initialized.
    pub fn new(
        base_url: &str,
        token: &str,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| ClientError::Request {
                url: base_url.to_owned(),
                source,
            })?;

        let api_root = Url::parse(&api_base_url(base_url))
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| ClientError::Api(format!("invalid GitHub base URL {base_url}")))?;

        Ok(Self {
            http,
            api_root,
            token: token.to_owned(),
            retry,
        })
    }

    /// Builds the URL of an endpoint, percent-encoding every path segment.
    ///
    /// Segments containing `/` are split, so a file path can be passed as one segment.
    fn endpoint<'a, I>(&self, segments: I) -> Url
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = self.api_root.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(
                segments
                    .into_iter()
                    .flat_map(|segment| segment.split('/'))
                    .filter(|segment| !segment.is_empty()),
            );
        }
        url
    }

    /// Builds a request for GitHub REST API.
    fn github_api_request_builder(&self, url: &str) -> RequestBuilder {
        self.http
            .get(url)
            .header(header::ACCEPT, "application/vnd.github+json")
            .bearer_auth(&self.token)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn get<T>(&self, url: Url, query: &[(&str, String)]) -> Result<Page<T>, ClientError>
    where
        T: DeserializeOwned,
    {
        let url = url.as_str();
        run_with_retries(url, self.retry, move || self.attempt(url, query)).await
    }

    async fn attempt<T>(&self, url: &str, query: &[(&str, String)]) -> StateResult<Page<T>, ClientError>
    where
        T: DeserializeOwned,
    {
        debug!("fetching {url}…");

        let response = match self.github_api_request_builder(url).query(query).send().await {
            Ok(response) => response,
            Err(source) => {
                error!("failed to fetch {url}: {source}");
                return Err(classify(ClientError::Request {
                    url: url.to_owned(),
                    source,
                }));
            }
        };

        let status = response.status();
        if !status.is_success() {
            if status != StatusCode::NOT_FOUND {
                error!("failed to fetch {url}: {status}");
            }
            return Err(classify(ClientError::Status {
                url: url.to_owned(),
                status,
            }));
        }

        let next_page = response
            .headers()
            .get(header::LINK)
            .and_then(|link| link.to_str().ok())
            .and_then(next_page_from_link);

        match response.json::<T>().await {
            Ok(body) => Ok(Page { body, next_page }),
            Err(source) => {
                error!("failed to parse data from {url}: {source}");
                Err(classify(ClientError::Decode {
                    url: url.to_owned(),
                    source,
                }))
            }
        }
    }
}

#[async_trait]
impl SourceControl for GitHubClient {
    async fn list_repositories(&self, org: &str, page: u32) -> Result<RepositoryPage, ClientError> {
        let query = [
            ("type", String::from("sources")),
            ("sort", String::from("full_name")),
            ("direction", String::from("asc")),
            ("per_page", REPOSITORY_PAGE_SIZE.to_string()),
            ("page", page.to_string()),
        ];
        let page = self
            .get::<Vec<Repository>>(self.endpoint(["orgs", org, "repos"]), &query)
            .await?;

        Ok(RepositoryPage {
            repositories: page.body,
            next_page: page.next_page,
        })
    }

    async fn list_workflows(&self, owner: &str, repo: &str) -> Result<Vec<Workflow>, ClientError> {
        let url = self.endpoint(["repos", owner, repo, "actions", "workflows"]);
        let mut workflows = Vec::new();
        let mut page = 1;

        loop {
            let query = [
                ("per_page", WORKFLOW_PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ];
            let response = self.get::<Workflows>(url.clone(), &query).await?;
            workflows.extend(response.body.workflows);

            match response.next_page {
                Some(next_page) if next_page > page => page = next_page,
                _ => break,
            }
        }

        Ok(workflows)
    }

    async fn get_file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<FileContent, ClientError> {
        self.get::<FileContent>(self.endpoint(["repos", owner, repo, "contents", path]), &[])
            .await
            .map(|page| page.body)
    }

    async fn list_recent_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: u64,
        limit: u8,
    ) -> Result<Vec<WorkflowRun>, ClientError> {
        let workflow_id = workflow_id.to_string();
        let url = self.endpoint([
            "repos",
            owner,
            repo,
            "actions",
            "workflows",
            workflow_id.as_str(),
            "runs",
        ]);

        self.get::<WorkflowRuns>(
            url,
            &[("per_page", limit.to_string())],
        )
        .await
        .map(|page| page.body.workflow_runs)
    }

    async fn list_recent_commits(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        limit: u8,
    ) -> Result<Vec<Commit>, ClientError> {
        self.get::<Vec<Commit>>(
            self.endpoint(["repos", owner, repo, "commits"]),
            &[("path", path.to_owned()), ("per_page", limit.to_string())],
        )
        .await
        .map(|page| page.body)
    }

    async fn lookup_user(&self, login: &str) -> Result<Option<User>, ClientError> {
        match self.get::<User>(self.endpoint(["users", login]), &[]).await {
            Ok(page) => Ok(Some(page.body)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn classify(err: ClientError) -> StateError<ClientError> {
    if err.is_transient() {
        StateError::Retry(err)
    } else {
        StateError::Stop(err)
    }
}

/// Normalizes a server URL into the root of its REST API.
///
/// GitHub Enterprise Server serves the API under `/api/v3`, while `api.github.com` serves it at
/// the root.
pub fn api_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    let is_github_com = Url::parse(trimmed)
        .ok()
        .is_some_and(|url| url.host_str() == Some("api.github.com"));

    if is_github_com || trimmed.ends_with("/api/v3") {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/api/v3")
    }
}

/// Reads the `rel="next"` page number out of a `Link` response header.
fn next_page_from_link(link: &str) -> Option<u32> {
    let target = link
        .split(',')
        .find(|part| part.contains(r#"rel="next""#))?;
    let start = target.find('<')? + 1;
    let end = target.find('>')?;
    let url = Url::parse(target.get(start..end)?).ok()?;

    url.query_pairs()
        .find(|(key, _)| key == "page")
        .and_then(|(_, value)| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{Reply, StubServer};

    #[test]
    fn appends_the_enterprise_api_prefix() {
        assert_eq!(
            api_base_url("https://ghes.example.com"),
            "https://ghes.example.com/api/v3"
        );
        assert_eq!(
            api_base_url("https://ghes.example.com/"),
            "https://ghes.example.com/api/v3"
        );
        assert_eq!(
            api_base_url("https://ghes.example.com/api/v3/"),
            "https://ghes.example.com/api/v3"
        );
        assert_eq!(api_base_url("https://api.github.com"), "https://api.github.com");
    }

    #[test]
    fn finds_the_next_page() {
        let link = r#"<https://ghes.example.com/api/v3/organizations/7/repos?per_page=100&page=3>; rel="next", <https://ghes.example.com/api/v3/organizations/7/repos?per_page=100&page=9>; rel="last""#;
        assert_eq!(next_page_from_link(link), Some(3));
    }

    #[test]
    fn last_page_has_no_next_page() {
        let link = r#"<https://ghes.example.com/api/v3/organizations/7/repos?per_page=100&page=1>; rel="first", <https://ghes.example.com/api/v3/organizations/7/repos?per_page=100&page=8>; rel="prev""#;
        assert_eq!(next_page_from_link(link), None);
        assert_eq!(next_page_from_link(""), None);
    }

    #[test]
    fn deserializes_workflow_listings() {
        let workflows: Workflows = serde_json::from_str(
            r#"{
                "total_count": 1,
                "workflows": [{
                    "id": 161335,
                    "node_id": "MDg6V29ya2Zsb3cxNjEzMzU=",
                    "name": "Nightly",
                    "path": ".github/workflows/nightly.yml",
                    "state": "active"
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(workflows.workflows[0].id, 161_335);
        assert_eq!(workflows.workflows[0].file_name(), "nightly.yml");
    }

    fn client() -> GitHubClient {
        GitHubClient::new(
            "https://ghes.example.com",
            "token",
            Duration::from_secs(60),
            RetryPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn builds_endpoints_under_the_api_root() {
        assert_eq!(
            client().endpoint(["orgs", "acme", "repos"]).as_str(),
            "https://ghes.example.com/api/v3/orgs/acme/repos"
        );
    }

    #[test]
    fn percent_encodes_file_paths() {
        assert_eq!(
            client()
                .endpoint(["repos", "acme", "api", "contents", ".github/workflows/nightly #2?.yml"])
                .as_str(),
            "https://ghes.example.com/api/v3/repos/acme/api/contents/.github/workflows/nightly%20%232%3F.yml"
        );
    }

    #[test]
    fn rejects_relative_base_urls() {
        let err = GitHubClient::new(
            "ghes.example.com",
            "token",
            Duration::from_secs(60),
            RetryPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::Api(_)));
    }

    #[tokio::test]
    async fn fetches_contents_at_the_encoded_path() {
        let server = StubServer::start(vec![Reply::Json(
            200,
            r#"{"content": "b246IHB1c2g=", "encoding": "base64"}"#,
        )])
        .await;
        let client = GitHubClient::new(
            &server.url,
            "token",
            Duration::from_secs(5),
            RetryPolicy::NONE,
        )
        .unwrap();

        let content = client
            .get_file_content("acme", "api", ".github/workflows/deploy #1.yml")
            .await
            .unwrap();

        assert_eq!(content.decode().unwrap(), "on: push");
        assert_eq!(
            server.requests()[0].path(),
            "/api/v3/repos/acme/api/contents/.github/workflows/deploy%20%231.yml"
        );
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = StubServer::start(vec![Reply::Json(404, r#"{"message": "Not Found"}"#)]).await;
        let client = GitHubClient::new(
            &server.url,
            "token",
            Duration::from_secs(5),
            RetryPolicy::new(3, Duration::ZERO),
        )
        .unwrap();

        assert_eq!(client.lookup_user("ghost").await.unwrap(), None);
        assert_eq!(server.connections(), 1);
    }
}
