//! Read and copy packages on conda channels hosted by a package registry.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use miette::Diagnostic;
use rattler_conda_types::{ParseVersionError, Platform, Version};
use thiserror::Error;

use crate::package::InterpreterTag;

pub mod anaconda;

pub use anaconda::AnacondaRegistry;

#[allow(missing_docs)]
#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    /// The channel has never seen this package.
    #[error("package '{name}' does not exist on channel '{channel}'")]
    NotFound { channel: String, name: String },

    #[error("the registry refused the request to {url}: {reason}")]
    #[diagnostic(help("set ANACONDA_API_TOKEN (or BINSTAR_TOKEN) to a token with write access"))]
    Unauthorized { url: String, reason: String },

    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest_middleware::Error,
    },

    #[error("{url} responded with status {status}: {body}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("could not decode the response from {url}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("package '{name}' reports an invalid version '{version}'")]
    InvalidVersion {
        name: String,
        version: String,
        #[source]
        source: ParseVersionError,
    },

    #[error("invalid registry url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }
}

/// One file published for a package version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// The subdir the file lives in (`linux-64`, `noarch`, ...).
    pub platform: String,
    /// The interpreter the file was built for, `None` for builds that do not
    /// depend on a specific python.
    pub interpreter_tag: Option<InterpreterTag>,
    /// The basename as the registry knows it, e.g. `linux-64/sep-1.2.1-py312h1_0.conda`.
    pub filename: String,
}

impl Artifact {
    /// Whether this file is usable on `platform` with `interpreter`.
    /// `noarch` files are usable everywhere.
    pub fn serves(&self, platform: Platform, interpreter: InterpreterTag) -> bool {
        if self.platform == Platform::NoArch.as_str() {
            return true;
        }
        self.platform == platform.as_str()
            && self
                .interpreter_tag
                .is_none_or(|tag| tag == interpreter)
    }
}

/// The state of one package on one channel.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub latest_version: Version,
    /// Versions exactly as the registry spells them.
    pub known_versions: BTreeSet<String>,
    pub artifacts_by_version: BTreeMap<Version, Vec<Artifact>>,
}

impl RegistrySnapshot {
    pub fn knows_version(&self, version: &str) -> bool {
        self.known_versions.contains(version)
    }

    /// Files published for `version`, compared by conda version ordering.
    pub fn artifacts_for(&self, version: &Version) -> &[Artifact] {
        self.artifacts_by_version
            .get(version)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether a usable build of `version` exists for this platform and interpreter.
    pub fn has_build_for(
        &self,
        version: &Version,
        platform: Platform,
        interpreter: InterpreterTag,
    ) -> bool {
        self.artifacts_for(version)
            .iter()
            .any(|artifact| artifact.serves(platform, interpreter))
    }
}

/// Copy a version (or a single file of it) from one channel to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub source_channel: String,
    pub dest_channel: String,
    pub name: String,
    pub version: String,
    /// Only copy this file. `None` copies every file of the version.
    pub filename: Option<String>,
}

/// A registry hosting conda channels.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch the current state of `name` on `channel`.
    async fn package_info(&self, channel: &str, name: &str)
    -> Result<RegistrySnapshot, RegistryError>;

    /// Copy files between channels.
    async fn copy(&self, request: &CopyRequest) -> Result<(), RegistryError>;
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn artifact(platform: &str, tag: Option<InterpreterTag>) -> Artifact {
        Artifact {
            platform: platform.to_string(),
            interpreter_tag: tag,
            filename: format!("{platform}/pkg-1.0-0.conda"),
        }
    }

    #[test]
    fn artifact_matching() {
        let py312 = InterpreterTag::new(3, 12);
        let py313 = InterpreterTag::new(3, 13);

        assert!(artifact("noarch", None).serves(Platform::Win64, py312));
        assert!(artifact("linux-64", Some(py312)).serves(Platform::Linux64, py312));
        assert!(!artifact("linux-64", Some(py312)).serves(Platform::Linux64, py313));
        assert!(!artifact("osx-64", Some(py312)).serves(Platform::Linux64, py312));
        assert!(artifact("linux-64", None).serves(Platform::Linux64, py313));
    }

    #[test]
    fn artifacts_are_found_by_version_ordering() {
        let version = Version::from_str("0.9").unwrap();
        let snapshot = RegistrySnapshot {
            latest_version: version.clone(),
            known_versions: BTreeSet::from(["0.9".to_string()]),
            artifacts_by_version: BTreeMap::from([(
                version,
                vec![artifact("linux-64", Some(InterpreterTag::new(3, 12)))],
            )]),
        };

        let lookup = Version::from_str("0.9").unwrap();
        assert_eq!(snapshot.artifacts_for(&lookup).len(), 1);
        assert!(snapshot.has_build_for(&lookup, Platform::Linux64, InterpreterTag::new(3, 12)));
        assert!(snapshot.artifacts_for(&Version::from_str("1.0").unwrap()).is_empty());
        assert!(snapshot.knows_version("0.9"));
        assert!(!snapshot.knows_version("0.9.1"));
    }
}
