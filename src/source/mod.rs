//! Source distributions: where they are published and how to fetch them.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use forge_mirror_recipe_generator::{PyPiClient, PyPiError};
use miette::Diagnostic;
use thiserror::Error;
use url::Url;

pub mod checksum;
pub mod download;

pub use checksum::Checksum;
pub use download::fetch_source;

#[allow(missing_docs)]
#[derive(Debug, Error, Diagnostic)]
pub enum SourceError {
    /// The release exists but has no source distribution to build from.
    #[error("no source distribution of {name} {version} is published")]
    NoSourceArtifact { name: String, version: String },

    #[error("{name}{} is unknown to the source index", .version.as_ref().map(|v| format!(" {v}")).unwrap_or_default())]
    NotFound {
        name: String,
        version: Option<String>,
    },

    #[error("the source distribution {filename} of {name} publishes no usable checksum")]
    MissingChecksum { name: String, filename: String },

    #[error("failed to query the source index")]
    Index(#[source] PyPiError),

    #[error("invalid source url '{0}'")]
    InvalidUrl(String, #[source] url::ParseError),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to download {url}")]
    Download {
        url: Url,
        #[source]
        source: reqwest_middleware::Error,
    },

    #[error("failed to read the response body of {url}")]
    Stream {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with status {status}")]
    DownloadStatus {
        url: Url,
        status: reqwest::StatusCode,
    },

    #[error("Download could not be validated with checksum! {} was removed", .filename)]
    ChecksumMismatch { filename: String },
}

impl From<PyPiError> for SourceError {
    fn from(err: PyPiError) -> Self {
        match err {
            PyPiError::NotFound { package, version } => SourceError::NotFound {
                name: package,
                version,
            },
            PyPiError::NoSourceDistribution { package, version } => SourceError::NoSourceArtifact {
                name: package,
                version,
            },
            other => SourceError::Index(other),
        }
    }
}

/// A source distribution of one release.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceArtifact {
    pub name: String,
    pub version: String,
    pub url: Url,
    pub filename: String,
    pub checksum: Checksum,
}

/// Somewhere that publishes source distributions, e.g. PyPI.
#[async_trait]
pub trait SourceIndex: Send + Sync {
    /// Locate the source distribution of `name` at `version`, or of its latest
    /// release when no version is given.
    async fn resolve(&self, name: &str, version: Option<&str>)
    -> Result<SourceArtifact, SourceError>;
}

/// [`SourceIndex`] backed by the PyPI JSON API.
pub struct PyPiSourceIndex {
    client: PyPiClient,
}

impl PyPiSourceIndex {
    pub fn new(client: PyPiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceIndex for PyPiSourceIndex {
    async fn resolve(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<SourceArtifact, SourceError> {
        let metadata = self.client.fetch_metadata(name, version).await?;
        let version = metadata.info.version.clone();

        let sdist = metadata
            .sdist()
            .ok_or_else(|| SourceError::NoSourceArtifact {
                name: name.to_string(),
                version: version.clone(),
            })?;

        let url = Url::parse(&sdist.url)
            .map_err(|e| SourceError::InvalidUrl(sdist.url.clone(), e))?;
        let checksum =
            Checksum::from_digests(&sdist.digests).ok_or_else(|| SourceError::MissingChecksum {
                name: name.to_string(),
                filename: sdist.filename.clone(),
            })?;

        Ok(SourceArtifact {
            name: name.to_string(),
            version,
            url,
            filename: sdist.filename.clone(),
            checksum,
        })
    }
}

#[derive(Debug, Clone)]
enum Resolution {
    Found(SourceArtifact),
    Missing { version: String },
}

type CacheKey = (String, Option<String>);

/// Remembers resolutions for the lifetime of one run, keyed by
/// `(name, requested version)`.
///
/// The build check and the planner both resolve every package; the cache
/// makes the second lookup free. Only successes and "no source artifact"
/// answers are kept, other errors are retried on the next call.
pub struct CachedSourceIndex<I> {
    inner: I,
    cache: Mutex<HashMap<CacheKey, Resolution>>,
}

impl<I: SourceIndex> CachedSourceIndex<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(name: &str, version: Option<&str>) -> CacheKey {
        (name.to_lowercase(), version.map(str::to_string))
    }

    fn remember(&self, key: CacheKey, resolution: Resolution) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, resolution);
    }
}

#[async_trait]
impl<I: SourceIndex> SourceIndex for CachedSourceIndex<I> {
    async fn resolve(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<SourceArtifact, SourceError> {
        let key = Self::key(name, version);
        let hit = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();

        match hit {
            Some(Resolution::Found(artifact)) => return Ok(artifact),
            Some(Resolution::Missing { version }) => {
                return Err(SourceError::NoSourceArtifact {
                    name: name.to_string(),
                    version,
                });
            }
            None => {}
        }

        let result = self.inner.resolve(name, version).await;
        match &result {
            Ok(artifact) => {
                // a "latest" lookup also answers the lookup of that exact version
                if version.is_none() {
                    self.remember(
                        Self::key(name, Some(&artifact.version)),
                        Resolution::Found(artifact.clone()),
                    );
                }
                self.remember(key, Resolution::Found(artifact.clone()));
            }
            Err(SourceError::NoSourceArtifact { version, .. }) => {
                self.remember(
                    key,
                    Resolution::Missing {
                        version: version.clone(),
                    },
                );
            }
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSourceIndex;

    #[tokio::test]
    async fn cache_answers_repeated_lookups() {
        let index = FakeSourceIndex::default()
            .with_release("sep", "1.2.1", true)
            .with_release("nosdist", "0.1", false);
        let cached = CachedSourceIndex::new(index);

        let first = cached.resolve("sep", None).await.unwrap();
        let second = cached.resolve("sep", None).await.unwrap();
        let pinned = cached.resolve("sep", Some("1.2.1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, pinned);

        assert!(matches!(
            cached.resolve("nosdist", None).await,
            Err(SourceError::NoSourceArtifact { version, .. }) if version == "0.1"
        ));
        assert!(cached.resolve("nosdist", None).await.is_err());

        assert_eq!(cached.inner.calls("sep"), 1);
        assert_eq!(cached.inner.calls("nosdist"), 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cached = CachedSourceIndex::new(FakeSourceIndex::default());
        assert!(matches!(
            cached.resolve("missing", None).await,
            Err(SourceError::NotFound { .. })
        ));
        assert!(cached.resolve("missing", None).await.is_err());
        assert_eq!(cached.inner.calls("missing"), 2);
    }

    #[test]
    fn pypi_errors_map_onto_source_errors() {
        let err: SourceError = PyPiError::NoSourceDistribution {
            package: "sep".to_string(),
            version: "1.0".to_string(),
        }
        .into();
        assert!(matches!(err, SourceError::NoSourceArtifact { .. }));

        let err: SourceError = PyPiError::AllIndexesFailed(vec![]).into();
        assert!(matches!(err, SourceError::Index(_)));
    }
}
