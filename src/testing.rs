//! In-memory stand-ins for the registry, source index, feedstocks and recipe
//! generator.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::PathBuf,
    str::FromStr,
    sync::Mutex,
};

use async_trait::async_trait;
use rattler_conda_types::Version;
use rattler_digest::{Sha256, compute_bytes_digest};
use url::Url;

use crate::{
    feedstock::{FeedstockError, FeedstockRecipe, FeedstockSource},
    generate::{GenerateError, RecipeGenerator},
    package::{InterpreterTag, PackageDescriptor},
    registry::{Artifact, CopyRequest, Registry, RegistryError, RegistrySnapshot},
    source::{Checksum, SourceArtifact, SourceError, SourceIndex},
};

/// `linux-64/sep-1.2.1-py312h1_0.conda` -> an artifact on linux-64 for 3.12.
pub fn artifact(filename: &str) -> Artifact {
    let (platform, basename) = filename.split_once('/').unwrap_or(("noarch", filename));
    Artifact {
        platform: platform.to_string(),
        interpreter_tag: InterpreterTag::from_build_string(basename),
        filename: filename.to_string(),
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    packages: HashMap<(String, String), RegistrySnapshot>,
    broken: HashSet<(String, String)>,
    copies: Mutex<Vec<CopyRequest>>,
    lookups: Mutex<Vec<(String, String)>>,
}

impl FakeRegistry {
    /// Publish `name` on `channel` with the given files per version. The last
    /// version listed is the latest.
    pub fn with_package(mut self, channel: &str, name: &str, versions: &[(&str, &[&str])]) -> Self {
        let mut known_versions = BTreeSet::new();
        let mut artifacts_by_version = BTreeMap::new();
        let mut latest_version = None;
        for (version, files) in versions {
            let parsed = Version::from_str(version).unwrap();
            known_versions.insert(version.to_string());
            artifacts_by_version.insert(
                parsed.clone(),
                files.iter().map(|f| artifact(f)).collect::<Vec<_>>(),
            );
            latest_version = Some(parsed);
        }

        self.packages.insert(
            (channel.to_string(), name.to_string()),
            RegistrySnapshot {
                latest_version: latest_version.expect("at least one version"),
                known_versions,
                artifacts_by_version,
            },
        );
        self
    }

    /// Make every lookup of `name` on `channel` fail with a server error.
    pub fn with_outage(mut self, channel: &str, name: &str) -> Self {
        self.broken.insert((channel.to_string(), name.to_string()));
        self
    }

    pub fn copies(&self) -> Vec<CopyRequest> {
        self.copies.lock().unwrap().clone()
    }

    pub fn lookups_on(&self, channel: &str) -> Vec<String> {
        self.lookups
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn package_info(
        &self,
        channel: &str,
        name: &str,
    ) -> Result<RegistrySnapshot, RegistryError> {
        let key = (channel.to_string(), name.to_string());
        self.lookups.lock().unwrap().push(key.clone());

        if self.broken.contains(&key) {
            return Err(RegistryError::Status {
                url: format!("https://api.example.org/package/{channel}/{name}"),
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                body: "try again later".to_string(),
            });
        }
        self.packages
            .get(&key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                channel: channel.to_string(),
                name: name.to_string(),
            })
    }

    async fn copy(&self, request: &CopyRequest) -> Result<(), RegistryError> {
        self.copies.lock().unwrap().push(request.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSourceIndex {
    // lowercase name -> (version, publishes an sdist), oldest first
    releases: HashMap<String, Vec<(String, bool)>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeSourceIndex {
    pub fn with_release(mut self, name: &str, version: &str, has_sdist: bool) -> Self {
        self.releases
            .entry(name.to_lowercase())
            .or_default()
            .push((version.to_string(), has_sdist));
        self
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SourceIndex for FakeSourceIndex {
    async fn resolve(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<SourceArtifact, SourceError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(name.to_lowercase())
            .or_default() += 1;

        let not_found = || SourceError::NotFound {
            name: name.to_string(),
            version: version.map(str::to_string),
        };
        let releases = self.releases.get(&name.to_lowercase()).ok_or_else(not_found)?;
        let (found, has_sdist) = match version {
            Some(version) => releases.iter().find(|(v, _)| v == version),
            None => releases.last(),
        }
        .ok_or_else(not_found)?;

        if !has_sdist {
            return Err(SourceError::NoSourceArtifact {
                name: name.to_string(),
                version: found.clone(),
            });
        }

        let filename = format!("{name}-{found}.tar.gz");
        Ok(SourceArtifact {
            name: name.to_string(),
            version: found.clone(),
            url: Url::parse(&format!("https://files.example.org/{filename}")).unwrap(),
            checksum: Checksum::Sha256(compute_bytes_digest::<Sha256>(filename.as_bytes())),
            filename,
        })
    }
}

#[derive(Default)]
pub struct FakeFeedstockSource {
    recipes: HashMap<String, FeedstockRecipe>,
    calls: Mutex<Vec<String>>,
}

impl FakeFeedstockSource {
    /// A feedstock whose `meta.yaml` sets `version`.
    pub fn with_recipe(mut self, name: &str, version: &str) -> Self {
        let meta = format!(
            "{{% set version = \"{version}\" %}}\n\npackage:\n  name: {name}\n  version: {{{{ version }}}}\n\nrequirements:\n  host:\n    - pip\n  run:\n    - python\n"
        );
        self.recipes.insert(
            name.to_lowercase(),
            FeedstockRecipe::new(BTreeMap::from([
                (PathBuf::from("meta.yaml"), meta),
                (PathBuf::from("build.sh"), "pip install .\n".to_string()),
            ])),
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedstockSource for FakeFeedstockSource {
    async fn fetch_recipe(&self, name: &str) -> Result<FeedstockRecipe, FeedstockError> {
        self.calls.lock().unwrap().push(name.to_string());
        self.recipes
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| FeedstockError::NotFound(name.to_string()))
    }
}

/// Generates a one-file recipe naming the package and version.
#[derive(Default)]
pub struct FakeRecipeGenerator;

#[async_trait]
impl RecipeGenerator for FakeRecipeGenerator {
    async fn generate(
        &self,
        package: &PackageDescriptor,
        version: &str,
    ) -> Result<BTreeMap<PathBuf, String>, GenerateError> {
        Ok(BTreeMap::from([(
            PathBuf::from("recipe.yaml"),
            format!(
                "package:\n  name: {}\n  version: \"{}\"\n",
                package.registry_name(),
                version
            ),
        )]))
    }
}
