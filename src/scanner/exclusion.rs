use std::{collections::HashSet, io::ErrorKind, path::Path};

use tracing::{debug, info, warn};

/// Repository names that are never scanned.
///
/// The persisted form is plain text with one repository name per line. Surrounding whitespace
/// is trimmed and blank lines are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    names: HashSet<String>,
}

impl ExclusionSet {
    /// Where the exclusion list is read from unless configured otherwise.
    pub const DEFAULT_PATH: &'static str = "/etc/gss/exclude-repos.txt";

    /// Parses an exclusion list.
    pub fn parse(content: &str) -> Self {
        content.lines().collect()
    }

    /// Loads an exclusion list from a file.
    ///
    /// A missing or unreadable file is logged and results in an empty set.
    pub async fn load<P>(path: P) -> Self
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no exclusion list at {}, scanning every repository", path.display());
                return Self::default();
            }
            Err(err) => {
                warn!("failed to read exclusion list {}: {err}", path.display());
                return Self::default();
            }
        };

        let exclusions = Self::parse(&content);
        for name in &exclusions.names {
            info!(repository = %name, source = %path.display(), "will exclude repository from scan");
        }
        exclusions
    }

    /// Whether a repository is excluded.
    pub fn contains(&self, repository: &str) -> bool {
        self.names.contains(repository)
    }

    /// The number of excluded repository names.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no repository is excluded.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S> FromIterator<S> for ExclusionSet
where
    S: AsRef<str>,
{
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter
                .into_iter()
                .map(|name| name.as_ref().trim().to_owned())
                .filter(|name| !name.is_empty())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write as _;

    #[test]
    fn trims_names_and_skips_blank_lines() {
        let exclusions = ExclusionSet::parse("  legacy-api \n\n\t\nsandbox\r\nlegacy-api\n");
        assert_eq!(exclusions.len(), 2);
        assert!(exclusions.contains("legacy-api"));
        assert!(exclusions.contains("sandbox"));
        assert!(!exclusions.contains(""));
    }

    #[tokio::test]
    async fn loads_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "repo-b\nrepo-c").unwrap();

        let exclusions = ExclusionSet::load(file.path()).await;
        assert!(exclusions.contains("repo-b"));
        assert!(exclusions.contains("repo-c"));
    }

    #[tokio::test]
    async fn missing_file_means_no_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        let exclusions = ExclusionSet::load(dir.path().join("exclude-repos.txt")).await;
        assert!(exclusions.is_empty());
    }

    #[tokio::test]
    async fn unreadable_file_means_no_exclusions() {
        // Reading a directory fails with something other than `NotFound`
        let dir = tempfile::tempdir().unwrap();
        assert!(ExclusionSet::load(dir.path()).await.is_empty());
    }
}
