//! Data models of repositories and GitHub Actions workflows from GitHub REST API.

use std::string::FromUtf8Error;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use thiserror::Error;

pub mod schedule;

/// A GitHub account, as embedded in repositories and commits.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Account {
    /// The login name of the account.
    pub login: String,
}

/// Represents a repository from GitHub REST API.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Repository {
    /// The name of the repository, without its owner.
    pub name: String,
    /// The account owning the repository.
    pub owner: Account,
    /// Whether the repository is archived.
    #[serde(default)]
    pub archived: bool,
    /// Whether the repository is a fork.
    #[serde(default)]
    pub fork: bool,
}

impl Repository {
    /// Creates an active, non-forked [`Repository`].
    pub fn new(owner: &str, name: &str) -> Self {
        Self {
            name: name.to_owned(),
            owner: Account {
                login: owner.to_owned(),
            },
            archived: false,
            fork: false,
        }
    }

    /// Marks the repository as archived.
    #[must_use]
    pub const fn archived(mut self) -> Self {
        self.archived = true;
        self
    }
}

/// Represents a GitHub Actions workflow definition from GitHub REST API.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Workflow {
    /// The identifier of the workflow.
    pub id: u64,
    /// The display name of the workflow.
    pub name: String,
    /// The path of the workflow file, usually under `.github/workflows`.
    pub path: String,
}

impl Workflow {
    /// Creates a [`Workflow`].
    pub fn new(id: u64, name: &str, path: &str) -> Self {
        Self {
            id,
            name: name.to_owned(),
            path: path.to_owned(),
        }
    }

    /// The file name of the workflow, without its directory.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Represents a GitHub Actions workflow run from GitHub REST API.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct WorkflowRun {
    /// The status of the run, e.g. `completed` or `in_progress`.
    #[serde(default)]
    pub status: Option<String>,
}

/// Represents a commit from GitHub REST API.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Commit {
    /// The account the commit author resolves to, if any.
    #[serde(default)]
    pub author: Option<Account>,
    /// The git metadata of the commit.
    pub commit: CommitDetail,
}

/// The git metadata of a [`Commit`].
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct CommitDetail {
    /// The git author, as recorded in the commit.
    #[serde(default)]
    pub author: Option<GitIdentity>,
}

/// A git author or committer.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct GitIdentity {
    /// The recorded author name.
    #[serde(default)]
    pub name: Option<String>,
}

impl Commit {
    /// The name of the git author, if recorded.
    pub fn author_name(&self) -> Option<&str> {
        self.commit
            .author
            .as_ref()
            .and_then(|author| author.name.as_deref())
            .filter(|name| !name.is_empty())
    }

    /// The login of the account the commit author resolves to, if any.
    pub fn author_login(&self) -> Option<&str> {
        self.author.as_ref().map(|account| account.login.as_str())
    }
}

/// Represents a user from GitHub REST API.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    /// The login name of the user.
    pub login: String,
    /// When the user was suspended. Only reported by GitHub Enterprise Server.
    #[serde(default)]
    pub suspended_at: Option<String>,
}

impl User {
    /// Whether the account can still be used.
    pub const fn is_active(&self) -> bool {
        self.suspended_at.is_none()
    }
}

/// Represents the content of a file from GitHub REST API.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct FileContent {
    /// The content of the file, encoded as described by [`Self::encoding`].
    #[serde(default)]
    pub content: String,
    /// The transport encoding of the content. Usually `base64`.
    #[serde(default)]
    pub encoding: Option<String>,
}

impl FileContent {
    /// Wraps plain text content.
    pub fn plain(content: &str) -> Self {
        Self {
            content: content.to_owned(),
            encoding: None,
        }
    }

    /// Encodes content the way GitHub REST API transports it.
    pub fn base64(content: &str) -> Self {
        Self {
            content: STANDARD.encode(content),
            encoding: Some(String::from("base64")),
        }
    }

    /// Decodes the transported content into text.
    ///
    /// # Errors
    ///
    /// Returns a [`ContentError`] if the encoding is unknown, the content is not inlined, or the
    /// decoded bytes are not valid base64 or UTF-8.
    pub fn decode(&self) -> Result<String, ContentError> {
        match self.encoding.as_deref() {
            Some("base64") => {
                // GitHub wraps base64 content at 60 columns
                let compact: String = self.content.split_ascii_whitespace().collect();
                Ok(String::from_utf8(STANDARD.decode(compact)?)?)
            }
            None | Some("" | "utf-8" | "utf8") => Ok(self.content.clone()),
            Some("none") => Err(ContentError::NotInlined),
            Some(other) => Err(ContentError::UnsupportedEncoding(other.to_owned())),
        }
    }
}

/// Errors that can occur when decoding a [`FileContent`].
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ContentError {
    /// The content is not valid base64.
    #[error("invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decoded content is not valid UTF-8.
    #[error("content is not valid utf-8: {0}")]
    Utf8(#[from] FromUtf8Error),
    /// The file is too large to be inlined by the API.
    #[error("content is too large to be inlined")]
    NotInlined,
    /// The content uses an encoding that cannot be decoded.
    #[error("unsupported content encoding {0:?}")]
    UnsupportedEncoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wrapped_base64() {
        let content = FileContent {
            content: String::from("b246CiAgc2NoZWR1bGU6\nCiAgICAtIGNyb246ICIw\nIDAgKiAqICoiCg==\n"),
            encoding: Some(String::from("base64")),
        };
        assert_eq!(
            content.decode().unwrap(),
            "on:\n  schedule:\n    - cron: \"0 0 * * *\"\n"
        );
    }

    #[test]
    fn plain_content_is_returned_as_is() {
        assert_eq!(FileContent::plain("name: ci").decode().unwrap(), "name: ci");
    }

    #[test]
    fn rejects_content_that_is_not_inlined() {
        let content = FileContent {
            content: String::new(),
            encoding: Some(String::from("none")),
        };
        assert!(matches!(content.decode(), Err(ContentError::NotInlined)));
    }

    #[test]
    fn rejects_broken_base64() {
        let content = FileContent {
            content: String::from("not base64!"),
            encoding: Some(String::from("base64")),
        };
        assert!(matches!(content.decode(), Err(ContentError::Base64(_))));
    }

    #[test]
    fn deserializes_commits_without_accounts() {
        let commit: Commit = serde_json::from_str(
            r#"{"sha": "abc123", "author": null, "commit": {"author": {"name": "Alice", "email": "alice@example.com"}}}"#,
        )
        .unwrap();
        assert_eq!(commit.author_login(), None);
        assert_eq!(commit.author_name(), Some("Alice"));
    }

    #[test]
    fn workflow_file_name_strips_the_directory() {
        let workflow = Workflow::new(1, "Nightly", ".github/workflows/nightly.yml");
        assert_eq!(workflow.file_name(), "nightly.yml");
    }

    #[test]
    fn suspended_users_are_inactive() {
        let user: User =
            serde_json::from_str(r#"{"login": "bob", "suspended_at": "2024-01-01T00:00:00Z"}"#)
                .unwrap();
        assert!(!user.is_active());
    }
}
