//! Recipes maintained upstream in conda-forge feedstocks.

use std::{
    collections::BTreeMap,
    io::Read,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use miette::Diagnostic;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use thiserror::Error;
use url::Url;

lazy_static::lazy_static! {
    static ref JINJA_SET_VERSION: regex::Regex =
        regex::Regex::new(r#"\{%-?\s*set\s+version\s*=\s*["']([^"']+)["']\s*-?%\}"#)
            .expect("valid regex");
}

/// Branches tried, in order, when downloading a feedstock.
const BRANCHES: [&str; 2] = ["main", "master"];

#[allow(missing_docs)]
#[derive(Debug, Error, Diagnostic)]
pub enum FeedstockError {
    /// There is no feedstock for this package.
    #[error("no feedstock exists for '{0}'")]
    NotFound(String),

    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest_middleware::Error,
    },

    #[error("{url} responded with status {status}")]
    Status { url: String, status: StatusCode },

    #[error("failed to download {url}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to unpack the feedstock of '{name}'")]
    Archive {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("the feedstock of '{0}' has no recipe directory")]
    EmptyRecipe(String),

    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
}

impl FeedstockError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FeedstockError::NotFound(_))
    }
}

/// The `recipe/` directory of a feedstock.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedstockRecipe {
    /// File contents keyed by their path relative to `recipe/`.
    pub files: BTreeMap<PathBuf, String>,
    /// The version the recipe builds, when it can be read from the recipe.
    pub declared_version: Option<String>,
}

impl FeedstockRecipe {
    pub fn new(files: BTreeMap<PathBuf, String>) -> Self {
        let declared_version = declared_version(&files);
        Self {
            files,
            declared_version,
        }
    }
}

/// Where feedstock recipes come from.
#[async_trait]
pub trait FeedstockSource: Send + Sync {
    async fn fetch_recipe(&self, name: &str) -> Result<FeedstockRecipe, FeedstockError>;
}

/// Downloads feedstock archives from GitHub.
#[derive(Debug, Clone)]
pub struct GitHubFeedstockSource {
    client: ClientWithMiddleware,
    base_url: Url,
    organisation: String,
}

impl GitHubFeedstockSource {
    pub fn new(client: ClientWithMiddleware, base_url: Url, organisation: impl Into<String>) -> Self {
        Self {
            client,
            base_url,
            organisation: organisation.into(),
        }
    }

    fn archive_url(&self, name: &str, branch: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(&format!(
            "{}/{}-feedstock/archive/refs/heads/{}.tar.gz",
            self.organisation, name, branch
        ))
    }
}

#[async_trait]
impl FeedstockSource for GitHubFeedstockSource {
    async fn fetch_recipe(&self, name: &str) -> Result<FeedstockRecipe, FeedstockError> {
        for branch in BRANCHES {
            let url = self.archive_url(name, branch)?;
            tracing::debug!("Trying feedstock archive {}", url);

            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|source| FeedstockError::Request {
                    url: url.to_string(),
                    source,
                })?;

            if response.status() == StatusCode::NOT_FOUND {
                continue;
            }
            if !response.status().is_success() {
                return Err(FeedstockError::Status {
                    url: url.to_string(),
                    status: response.status(),
                });
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|source| FeedstockError::Body {
                    url: url.to_string(),
                    source,
                })?;
            let files = extract_recipe(&bytes).map_err(|source| FeedstockError::Archive {
                name: name.to_string(),
                source,
            })?;
            if files.is_empty() {
                return Err(FeedstockError::EmptyRecipe(name.to_string()));
            }
            return Ok(FeedstockRecipe::new(files));
        }

        Err(FeedstockError::NotFound(name.to_string()))
    }
}

/// Pull the text files under `<top-level>/recipe/` out of a `.tar.gz`
/// archive as produced by GitHub.
pub fn extract_recipe(archive: &[u8]) -> std::io::Result<BTreeMap<PathBuf, String>> {
    let mut files = BTreeMap::new();
    let mut archive = tar::Archive::new(GzDecoder::new(archive));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry.path()?.into_owned();
        let Some(relative) = recipe_relative_path(&path) else {
            continue;
        };

        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        match String::from_utf8(contents) {
            Ok(text) => {
                files.insert(relative, text);
            }
            Err(_) => tracing::warn!("Skipping binary feedstock file {}", path.display()),
        }
    }

    Ok(files)
}

/// `name-feedstock-main/recipe/meta.yaml` -> `meta.yaml`
fn recipe_relative_path(path: &Path) -> Option<PathBuf> {
    let mut components = path.components();
    components.next()?;
    match components.next()? {
        Component::Normal(dir) if dir == "recipe" => {}
        _ => return None,
    }
    let rest: PathBuf = components
        .map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect::<Option<PathBuf>>()?;
    (!rest.as_os_str().is_empty()).then_some(rest)
}

/// The version a recipe builds: `{% set version = "..." %}` in either format,
/// or a literal `context.version` / `package.version` in a `recipe.yaml`.
pub fn declared_version(files: &BTreeMap<PathBuf, String>) -> Option<String> {
    for file in ["recipe.yaml", "meta.yaml"] {
        let Some(contents) = files.get(Path::new(file)) else {
            continue;
        };

        if let Some(captures) = JINJA_SET_VERSION.captures(contents) {
            return Some(captures[1].trim().to_string());
        }

        if file == "recipe.yaml"
            && let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(contents)
        {
            for section in ["context", "package"] {
                if let Some(version) = value
                    .get(section)
                    .and_then(|s| s.get("version"))
                    .and_then(|v| match v {
                        serde_yaml::Value::String(s) => Some(s.clone()),
                        serde_yaml::Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .filter(|v| !v.contains("${{"))
                {
                    return Some(version);
                }
            }
        }
    }
    None
}
