//! Fork conda-forge feedstocks to a GitHub account and clone the forks, so
//! that updated recipes can be proposed upstream.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs_err as fs;
use indexmap::IndexMap;
use miette::Diagnostic;
use reqwest::{Method, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::package::PackageDescriptor;

#[allow(missing_docs)]
#[derive(Debug, Error, Diagnostic)]
pub enum CloneError {
    #[error("the GitHub token belongs to '{actual}', not to '{expected}'")]
    #[diagnostic(help("pass the account that owns GITHUB_TOKEN with --github-user"))]
    UserMismatch { expected: String, actual: String },

    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest_middleware::Error,
    },

    #[error("{url} responded with status {status}")]
    Status { url: String, status: StatusCode },

    #[error("failed to read the response from {url}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not decode the response from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),

    #[error("`git {command}` failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fork created on the authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Fork {
    pub clone_url: String,
    pub default_branch: String,
}

/// The code host that holds the feedstocks.
#[async_trait]
pub trait FeedstockHost: Send + Sync {
    /// The login the configured token belongs to.
    async fn authenticated_user(&self) -> Result<String, CloneError>;

    async fn feedstock_exists(&self, name: &str) -> Result<bool, CloneError>;

    /// Fork the feedstock of `name`. `None` when the host refuses.
    async fn fork(&self, name: &str) -> Result<Option<Fork>, CloneError>;

    /// Where the original feedstock can be fetched from.
    fn upstream_url(&self, name: &str) -> String;
}

/// Runs git.
#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<(), CloneError>;
}

/// [`GitRunner`] that calls the `git` executable.
#[derive(Debug, Default, Clone)]
pub struct GitCli;

#[async_trait]
impl GitRunner for GitCli {
    async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<(), CloneError> {
        let mut command = tokio::process::Command::new("git");
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        tracing::debug!("Running git {}", args.join(" "));

        let output = command.output().await?;
        if !output.status.success() {
            return Err(CloneError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct User {
    login: String,
}

/// [`FeedstockHost`] backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GitHubHost {
    client: ClientWithMiddleware,
    api_url: Url,
    token: String,
    organisation: String,
}

impl GitHubHost {
    pub fn new(
        client: ClientWithMiddleware,
        api_url: Url,
        token: impl Into<String>,
        organisation: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url,
            token: token.into(),
            organisation: organisation.into(),
        }
    }

    fn repo_path(&self, name: &str) -> String {
        format!("repos/{}/{}-feedstock", self.organisation, name)
    }

    async fn send(&self, method: Method, path: &str) -> Result<(Url, reqwest::Response), CloneError> {
        let url = self.api_url.join(path)?;
        let response = self
            .client
            .request(method, url.clone())
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|source| CloneError::Request {
                url: url.to_string(),
                source,
            })?;
        Ok((url, response))
    }
}

async fn read_body(url: &Url, response: reqwest::Response) -> Result<String, CloneError> {
    response.text().await.map_err(|source| CloneError::Body {
        url: url.to_string(),
        source,
    })
}

#[async_trait]
impl FeedstockHost for GitHubHost {
    async fn authenticated_user(&self) -> Result<String, CloneError> {
        let (url, response) = self.send(Method::GET, "user").await?;
        if !response.status().is_success() {
            return Err(CloneError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        let body = read_body(&url, response).await?;
        let user: User = serde_json::from_str(&body).map_err(|source| CloneError::Decode {
            url: url.to_string(),
            source,
        })?;
        Ok(user.login)
    }

    async fn feedstock_exists(&self, name: &str) -> Result<bool, CloneError> {
        let (url, response) = self.send(Method::GET, &self.repo_path(name)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(CloneError::Status {
                url: url.to_string(),
                status,
            }),
        }
    }

    async fn fork(&self, name: &str) -> Result<Option<Fork>, CloneError> {
        let path = format!("{}/forks", self.repo_path(name));
        let (url, response) = self.send(Method::POST, &path).await?;
        match response.status() {
            StatusCode::FORBIDDEN => return Ok(None),
            status if !status.is_success() => {
                return Err(CloneError::Status {
                    url: url.to_string(),
                    status,
                });
            }
            _ => {}
        }

        let body = read_body(&url, response).await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|source| CloneError::Decode {
                url: url.to_string(),
                source,
            })
    }

    fn upstream_url(&self, name: &str) -> String {
        format!(
            "https://github.com/{}/{}-feedstock.git",
            self.organisation, name
        )
    }
}

/// Why a feedstock was not cloned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyCloned,
    NoFeedstock,
    ForkRefused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneOutcome {
    Cloned(PathBuf),
    Skipped(SkipReason),
}

#[derive(Debug, Default)]
pub struct CloneReport {
    pub outcomes: IndexMap<String, CloneOutcome>,
    pub failures: IndexMap<String, CloneError>,
}

async fn clone_one(
    host: &dyn FeedstockHost,
    git: &dyn GitRunner,
    name: &str,
    dest_dir: &Path,
) -> Result<CloneOutcome, CloneError> {
    let target = dest_dir.join(format!("{name}-feedstock"));
    if target.exists() {
        tracing::warn!("{} already exists, not cloning it again", target.display());
        return Ok(CloneOutcome::Skipped(SkipReason::AlreadyCloned));
    }
    if !host.feedstock_exists(name).await? {
        tracing::warn!("There is no feedstock for {}", name);
        return Ok(CloneOutcome::Skipped(SkipReason::NoFeedstock));
    }
    let Some(fork) = host.fork(name).await? else {
        tracing::warn!("Could not fork the feedstock of {}", name);
        return Ok(CloneOutcome::Skipped(SkipReason::ForkRefused));
    };

    let target_str = target.to_string_lossy().into_owned();
    git.git(&["clone", fork.clone_url.as_str(), target_str.as_str()], None)
        .await?;

    let upstream = host.upstream_url(name);
    let tracking = format!("--set-upstream-to=upstream/{}", fork.default_branch);
    for args in [
        vec!["remote", "add", "upstream", upstream.as_str()],
        vec!["fetch", "upstream"],
        vec!["branch", tracking.as_str()],
        vec!["pull"],
    ] {
        git.git(&args, Some(&target)).await?;
    }

    tracing::info!("Cloned the feedstock of {} to {}", name, target.display());
    Ok(CloneOutcome::Cloned(target))
}

/// Fork and clone the feedstock of every package into `dest_dir`.
///
/// The token has to belong to `github_user`. Packages without a feedstock,
/// refused forks and existing clones are skipped with a warning; a failure
/// for one package does not stop the others.
pub async fn clone_feedstocks(
    host: &dyn FeedstockHost,
    git: &dyn GitRunner,
    packages: &[PackageDescriptor],
    github_user: &str,
    dest_dir: &Path,
) -> Result<CloneReport, CloneError> {
    let actual = host.authenticated_user().await?;
    if !actual.eq_ignore_ascii_case(github_user) {
        return Err(CloneError::UserMismatch {
            expected: github_user.to_string(),
            actual,
        });
    }

    fs::create_dir_all(dest_dir)?;
    let mut report = CloneReport::default();
    for package in packages {
        let name = package.registry_name();
        match clone_one(host, git, package.name(), dest_dir).await {
            Ok(outcome) => {
                report.outcomes.insert(name, outcome);
            }
            Err(err) => {
                tracing::error!("Failed to clone the feedstock of {}: {}", name, err);
                report.failures.insert(name, err);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex};

    use super::*;
    use pretty_assertions::assert_eq;

    struct FakeHost {
        user: String,
        feedstocks: HashSet<String>,
        refused: HashSet<String>,
        lookups: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FeedstockHost for FakeHost {
        async fn authenticated_user(&self) -> Result<String, CloneError> {
            Ok(self.user.clone())
        }

        async fn feedstock_exists(&self, name: &str) -> Result<bool, CloneError> {
            self.lookups.lock().unwrap().push(name.to_string());
            Ok(self.feedstocks.contains(name))
        }

        async fn fork(&self, name: &str) -> Result<Option<Fork>, CloneError> {
            Ok((!self.refused.contains(name)).then(|| Fork {
                clone_url: format!("https://github.com/{}/{}-feedstock.git", self.user, name),
                default_branch: "main".to_string(),
            }))
        }

        fn upstream_url(&self, name: &str) -> String {
            format!("https://github.com/conda-forge/{name}-feedstock.git")
        }
    }

    #[derive(Default)]
    struct RecordingGit {
        calls: Mutex<Vec<(String, Option<PathBuf>)>>,
    }

    #[async_trait]
    impl GitRunner for RecordingGit {
        async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<(), CloneError> {
            self.calls
                .lock()
                .unwrap()
                .push((args.join(" "), cwd.map(Path::to_path_buf)));
            Ok(())
        }
    }

    fn host(user: &str) -> FakeHost {
        FakeHost {
            user: user.to_string(),
            feedstocks: HashSet::from(["sep".to_string(), "photutils".to_string()]),
            refused: HashSet::from(["photutils".to_string()]),
            lookups: Mutex::default(),
        }
    }

    #[tokio::test]
    async fn token_must_belong_to_the_user() {
        let dir = tempfile::tempdir().unwrap();
        let err = clone_feedstocks(&host("someone"), &RecordingGit::default(), &[], "me", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CloneError::UserMismatch { .. }));
    }

    #[tokio::test]
    async fn forks_are_cloned_and_tracked() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("wcsaxes-feedstock")).unwrap();
        let git = RecordingGit::default();

        let packages = ["sep", "nofeedstock", "photutils", "wcsaxes"]
            .map(|name| PackageDescriptor::new(name, None));
        let report = clone_feedstocks(&host("me"), &git, &packages, "Me", dir.path())
            .await
            .unwrap();

        let target = dir.path().join("sep-feedstock");
        assert_eq!(
            report.outcomes.values().cloned().collect::<Vec<_>>(),
            vec![
                CloneOutcome::Cloned(target.clone()),
                CloneOutcome::Skipped(SkipReason::NoFeedstock),
                CloneOutcome::Skipped(SkipReason::ForkRefused),
                CloneOutcome::Skipped(SkipReason::AlreadyCloned),
            ]
        );
        assert!(report.failures.is_empty());

        let calls = git.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                (
                    format!(
                        "clone https://github.com/me/sep-feedstock.git {}",
                        target.display()
                    ),
                    None
                ),
                (
                    "remote add upstream https://github.com/conda-forge/sep-feedstock.git"
                        .to_string(),
                    Some(target.clone())
                ),
                ("fetch upstream".to_string(), Some(target.clone())),
                (
                    "branch --set-upstream-to=upstream/main".to_string(),
                    Some(target.clone())
                ),
                ("pull".to_string(), Some(target)),
            ]
        );
    }

    #[tokio::test]
    async fn upstream_operations_keep_the_case_of_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = host("me");
        fake.feedstocks.insert("PyYAML".to_string());
        let git = RecordingGit::default();

        let packages = [PackageDescriptor::new("PyYAML", None)];
        let report = clone_feedstocks(&fake, &git, &packages, "me", dir.path())
            .await
            .unwrap();

        assert_eq!(fake.lookups.lock().unwrap().clone(), vec!["PyYAML"]);
        let target = dir.path().join("PyYAML-feedstock");
        assert_eq!(
            report.outcomes.get("pyyaml"),
            Some(&CloneOutcome::Cloned(target.clone()))
        );
        let calls = git.calls.lock().unwrap().clone();
        assert_eq!(
            calls[0].0,
            format!(
                "clone https://github.com/me/PyYAML-feedstock.git {}",
                target.display()
            )
        );
        assert_eq!(
            calls[1].0,
            "remote add upstream https://github.com/conda-forge/PyYAML-feedstock.git"
        );
    }
}
