//! Decide what has to happen for every requested package: copy it between
//! channels, build it, or leave it alone.
//!
//! Nothing in here changes a channel except [`execute_copies`]. Planning only
//! reads registry state, so running [`plan_copies`] twice without copying in
//! between yields the same plan.

use std::{collections::HashSet, str::FromStr};

use indexmap::IndexMap;
use miette::Diagnostic;
use rattler_conda_types::{Platform, Version};
use thiserror::Error;

use crate::{
    package::{InterpreterTag, PackageDescriptor},
    registry::{CopyRequest, Registry, RegistryError, RegistrySnapshot},
    source::{SourceError, SourceIndex},
};

#[allow(missing_docs)]
#[derive(Debug, Error, Diagnostic)]
pub enum ReconcileError {
    #[error("package '{package}' does not exist on the source channel '{channel}'")]
    #[diagnostic(help("remove it from the package list or publish it to '{channel}' first"))]
    SourcePackageNotFound { package: String, channel: String },

    #[error("version {version} of '{package}' is not available on channel '{channel}'")]
    #[diagnostic(help("check the version pinned in the package list"))]
    PinnedVersionNotFound {
        package: String,
        version: String,
        channel: String,
    },

    #[error("copying packages requires an API token")]
    #[diagnostic(help("set ANACONDA_API_TOKEN (or BINSTAR_TOKEN), or pass --dry-run"))]
    MissingToken,

    #[error("failed to copy {package} {version}")]
    Copy {
        package: String,
        version: String,
        #[source]
        source: RegistryError,
    },

    #[error("failed to look up '{package}'")]
    Registry {
        package: String,
        #[source]
        source: RegistryError,
    },

    #[error("failed to resolve the source of '{package}'")]
    Source {
        package: String,
        #[source]
        source: SourceError,
    },
}

/// What to copy for one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyDecision {
    /// Copy every file of `version`.
    FullCopy { version: String },
    /// The destination has `version`, but not all of its files.
    PartialCopy {
        version: String,
        filenames: Vec<String>,
    },
    NoAction,
}

/// Copy decisions keyed by registry name, in the order the packages were
/// requested.
#[derive(Debug, Default)]
pub struct CopyPlan {
    pub decisions: IndexMap<String, CopyDecision>,
    /// Packages that could not be looked up.
    pub failures: IndexMap<String, RegistryError>,
}

impl CopyPlan {
    /// The number of copy calls [`execute_copies`] would make.
    pub fn copy_count(&self) -> usize {
        self.decisions
            .values()
            .map(|decision| match decision {
                CopyDecision::FullCopy { .. } => 1,
                CopyDecision::PartialCopy { filenames, .. } => filenames.len(),
                CopyDecision::NoAction => 0,
            })
            .sum()
    }
}

fn registry_failure(package: &str) -> impl FnOnce(RegistryError) -> ReconcileError + '_ {
    move |source| ReconcileError::Registry {
        package: package.to_string(),
        source,
    }
}

fn parse_version(package: &str, version: &str) -> Result<Version, ReconcileError> {
    Version::from_str(version).map_err(|source| ReconcileError::Registry {
        package: package.to_string(),
        source: RegistryError::InvalidVersion {
            name: package.to_string(),
            version: version.to_string(),
            source,
        },
    })
}

/// Files of `version` on the source channel that the destination lacks, in
/// source order.
fn missing_files(source: &RegistrySnapshot, dest: &RegistrySnapshot, version: &Version) -> Vec<String> {
    let present: HashSet<&str> = dest
        .artifacts_for(version)
        .iter()
        .map(|artifact| artifact.filename.as_str())
        .collect();
    source
        .artifacts_for(version)
        .iter()
        .filter(|artifact| !present.contains(artifact.filename.as_str()))
        .map(|artifact| artifact.filename.clone())
        .collect()
}

async fn decide_copy(
    registry: &dyn Registry,
    package: &PackageDescriptor,
    source_channel: &str,
    dest_channel: &str,
) -> Result<CopyDecision, ReconcileError> {
    let name = package.registry_name();

    let source = match registry.package_info(source_channel, &name).await {
        Ok(snapshot) => snapshot,
        Err(err) if err.is_not_found() => {
            return Err(ReconcileError::SourcePackageNotFound {
                package: name,
                channel: source_channel.to_string(),
            });
        }
        Err(err) => return Err(registry_failure(&name)(err)),
    };

    let (target, target_version) = match package.pinned_version() {
        Some(pinned) => {
            if !source.knows_version(pinned) {
                return Err(ReconcileError::PinnedVersionNotFound {
                    package: name,
                    version: pinned.to_string(),
                    channel: source_channel.to_string(),
                });
            }
            (pinned.to_string(), parse_version(&name, pinned)?)
        }
        None => (
            source.latest_version.to_string(),
            source.latest_version.clone(),
        ),
    };

    let dest = match registry.package_info(dest_channel, &name).await {
        Ok(snapshot) => snapshot,
        Err(err) if err.is_not_found() => {
            tracing::info!("{} is not on {} yet, copying {}", name, dest_channel, target);
            return Ok(CopyDecision::FullCopy { version: target });
        }
        Err(err) => return Err(registry_failure(&name)(err)),
    };

    match package.pinned_version() {
        None => match source.latest_version.cmp(&dest.latest_version) {
            std::cmp::Ordering::Greater => {
                tracing::info!(
                    "{} is outdated on {} ({} < {}), copying",
                    name,
                    dest_channel,
                    dest.latest_version,
                    source.latest_version
                );
                return Ok(CopyDecision::FullCopy { version: target });
            }
            std::cmp::Ordering::Less => {
                tracing::info!(
                    "{} on {} ({}) is newer than on {} ({}), nothing to do",
                    name,
                    dest_channel,
                    dest.latest_version,
                    source_channel,
                    source.latest_version
                );
                return Ok(CopyDecision::NoAction);
            }
            std::cmp::Ordering::Equal => {}
        },
        Some(pinned) => {
            if !dest.knows_version(pinned) {
                tracing::info!("{} {} is missing on {}, copying", name, pinned, dest_channel);
                return Ok(CopyDecision::FullCopy { version: target });
            }
        }
    }

    let filenames = missing_files(&source, &dest, &target_version);
    if filenames.is_empty() {
        tracing::info!("{} {} is up to date on {}", name, target, dest_channel);
        Ok(CopyDecision::NoAction)
    } else {
        tracing::info!(
            "{} {} is missing {} file(s) on {}",
            name,
            target,
            filenames.len(),
            dest_channel
        );
        Ok(CopyDecision::PartialCopy {
            version: target,
            filenames,
        })
    }
}

/// Compare every requested package between `source_channel` and
/// `dest_channel`.
///
/// A package unknown on the source channel, or a pinned version the source
/// channel does not list, aborts planning. Failed lookups are recorded in
/// [`CopyPlan::failures`] and the remaining packages are still planned.
pub async fn plan_copies(
    registry: &dyn Registry,
    desired: &[PackageDescriptor],
    source_channel: &str,
    dest_channel: &str,
) -> Result<CopyPlan, ReconcileError> {
    let mut plan = CopyPlan::default();

    for package in desired {
        match decide_copy(registry, package, source_channel, dest_channel).await {
            Ok(decision) => {
                plan.decisions.insert(package.registry_name(), decision);
            }
            Err(ReconcileError::Registry { package, source }) => {
                tracing::error!("Skipping {}: {}", package, source);
                plan.failures.insert(package, source);
            }
            Err(err) => return Err(err),
        }
    }

    Ok(plan)
}

/// Carry out `plan`: one copy per full copy and one per file for partial
/// copies, in plan order. Returns the packages whose copies failed.
///
/// An authorization failure stops everything, since every following copy
/// would be refused as well.
pub async fn execute_copies(
    registry: &dyn Registry,
    plan: &CopyPlan,
    source_channel: &str,
    dest_channel: &str,
) -> Result<IndexMap<String, ReconcileError>, ReconcileError> {
    let mut failures = IndexMap::new();

    for (name, decision) in &plan.decisions {
        let (version, filenames): (&str, Vec<Option<String>>) = match decision {
            CopyDecision::FullCopy { version } => (version.as_str(), vec![None]),
            CopyDecision::PartialCopy { version, filenames } => (
                version.as_str(),
                filenames.iter().cloned().map(Some).collect(),
            ),
            CopyDecision::NoAction => continue,
        };

        for filename in filenames {
            let request = CopyRequest {
                source_channel: source_channel.to_string(),
                dest_channel: dest_channel.to_string(),
                name: name.clone(),
                version: version.to_string(),
                filename,
            };
            match &request.filename {
                Some(filename) => tracing::info!("Copying {} to {}", filename, dest_channel),
                None => tracing::info!("Copying {} {} to {}", name, version, dest_channel),
            }

            if let Err(source) = registry.copy(&request).await {
                let err = ReconcileError::Copy {
                    package: name.clone(),
                    version: version.to_string(),
                    source,
                };
                if matches!(
                    err,
                    ReconcileError::Copy {
                        source: RegistryError::Unauthorized { .. },
                        ..
                    }
                ) {
                    return Err(err);
                }
                tracing::error!("{}", err);
                failures.insert(name.clone(), err);
                break;
            }
        }
    }

    Ok(failures)
}

/// Why a package does or does not need a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildReason {
    NotOnChannel,
    VersionMissing,
    NoMatchingBuild,
    UpToDate,
}

impl BuildReason {
    pub fn needs_build(&self) -> bool {
        !matches!(self, BuildReason::UpToDate)
    }
}

/// The outcome of checking one package against the destination channel.
#[derive(Debug, Clone)]
pub struct BuildCheck {
    pub package: PackageDescriptor,
    /// The version that should exist: the pinned one, or the latest upstream.
    pub version: String,
    pub reason: BuildReason,
}

impl BuildCheck {
    pub fn needs_build(&self) -> bool {
        self.reason.needs_build()
    }
}

/// All build checks of a run, plus the packages that could not be checked.
#[derive(Debug, Default)]
pub struct BuildCheckReport {
    pub checks: Vec<BuildCheck>,
    pub failures: IndexMap<String, ReconcileError>,
}

impl BuildCheckReport {
    /// The packages that need a build, in input order.
    pub fn candidates(&self) -> Vec<PackageDescriptor> {
        self.checks
            .iter()
            .filter(|check| check.needs_build())
            .map(|check| check.package.clone())
            .collect()
    }
}

async fn target_version(
    package: &PackageDescriptor,
    sources: &dyn SourceIndex,
) -> Result<String, ReconcileError> {
    if let Some(pinned) = package.pinned_version() {
        return Ok(pinned.to_string());
    }
    match sources.resolve(package.name(), None).await {
        Ok(artifact) => Ok(artifact.version),
        // the version is known even if it cannot be built from source; the
        // planner drops it later with a proper explanation
        Err(SourceError::NoSourceArtifact { version, .. }) => Ok(version),
        Err(source) => Err(ReconcileError::Source {
            package: package.registry_name(),
            source,
        }),
    }
}

async fn check_build(
    registry: &dyn Registry,
    package: &PackageDescriptor,
    dest_channel: &str,
    platform: Platform,
    interpreter: InterpreterTag,
    sources: &dyn SourceIndex,
) -> Result<BuildCheck, ReconcileError> {
    let name = package.registry_name();
    let version = target_version(package, sources).await?;

    let reason = match registry.package_info(dest_channel, &name).await {
        Err(err) if err.is_not_found() => BuildReason::NotOnChannel,
        Err(err) => return Err(registry_failure(&name)(err)),
        Ok(dest) => match Version::from_str(&version) {
            Ok(parsed) if dest.knows_version(&version) || !dest.artifacts_for(&parsed).is_empty() => {
                if dest.has_build_for(&parsed, platform, interpreter) {
                    BuildReason::UpToDate
                } else {
                    BuildReason::NoMatchingBuild
                }
            }
            _ => BuildReason::VersionMissing,
        },
    };

    match reason {
        BuildReason::NotOnChannel => {
            tracing::info!("{} {}: not on {}, building", name, version, dest_channel)
        }
        BuildReason::VersionMissing => {
            tracing::info!("{} {}: version missing on {}, building", name, version, dest_channel)
        }
        BuildReason::NoMatchingBuild => tracing::info!(
            "{} {}: no build for {} / python {} on {}, building",
            name,
            version,
            platform,
            interpreter,
            dest_channel
        ),
        BuildReason::UpToDate => {
            tracing::info!("{} {}: already built for {} / python {}", name, version, platform, interpreter)
        }
    }

    Ok(BuildCheck {
        package: package.clone(),
        version,
        reason,
    })
}

/// Find out which packages have to be built for `platform` and `interpreter`
/// because the destination channel has no usable build of the wanted version.
pub async fn check_builds(
    registry: &dyn Registry,
    desired: &[PackageDescriptor],
    dest_channel: &str,
    platform: Platform,
    interpreter: InterpreterTag,
    sources: &dyn SourceIndex,
) -> BuildCheckReport {
    let mut report = BuildCheckReport::default();

    for package in desired {
        match check_build(registry, package, dest_channel, platform, interpreter, sources).await {
            Ok(check) => report.checks.push(check),
            Err(err) => {
                tracing::error!("Could not check {}: {}", package.registry_name(), err);
                report.failures.insert(package.registry_name(), err);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRegistry, FakeSourceIndex};
    use pretty_assertions::assert_eq;

    const SOURCE: &str = "conda-forge";
    const DEST: &str = "astropy";

    fn unpinned(name: &str) -> PackageDescriptor {
        PackageDescriptor::new(name, None)
    }

    fn pinned(name: &str, version: &str) -> PackageDescriptor {
        PackageDescriptor::new(name, Some(version.to_string()))
    }

    async fn decision(registry: &FakeRegistry, package: PackageDescriptor) -> CopyDecision {
        let name = package.registry_name();
        let mut plan = plan_copies(registry, &[package], SOURCE, DEST).await.unwrap();
        plan.decisions.swap_remove(&name).unwrap()
    }

    #[tokio::test]
    async fn outdated_destination_gets_a_full_copy() {
        let registry = FakeRegistry::default()
            .with_package(SOURCE, "wcsaxes", &[("0.7", &[]), ("0.8", &[]), ("0.9", &[])])
            .with_package(DEST, "wcsaxes", &[("0.7", &[]), ("0.8", &[])]);

        assert_eq!(
            decision(&registry, unpinned("wcsaxes")).await,
            CopyDecision::FullCopy {
                version: "0.9".to_string()
            }
        );
    }

    #[tokio::test]
    async fn absent_destination_gets_a_full_copy() {
        let registry = FakeRegistry::default().with_package(SOURCE, "sep", &[("1.2.1", &[])]);
        assert_eq!(
            decision(&registry, pinned("sep", "1.2.1")).await,
            CopyDecision::FullCopy {
                version: "1.2.1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn identical_artifacts_need_nothing() {
        let files: &[&str] = &[
            "linux-64/photutils-0.5.2-py312h1_0.conda",
            "osx-64/photutils-0.5.2-py312h1_0.conda",
        ];
        let registry = FakeRegistry::default()
            .with_package(SOURCE, "photutils", &[("0.5.2", files)])
            .with_package(DEST, "photutils", &[("0.5.2", files)]);

        assert_eq!(decision(&registry, unpinned("photutils")).await, CopyDecision::NoAction);
        assert_eq!(
            decision(&registry, pinned("photutils", "0.5.2")).await,
            CopyDecision::NoAction
        );
    }

    #[tokio::test]
    async fn equal_versions_copy_only_missing_files() {
        let registry = FakeRegistry::default()
            .with_package(
                SOURCE,
                "photutils",
                &[(
                    "0.5.2",
                    &[
                        "linux-64/photutils-0.5.2-py312h1_0.conda",
                        "osx-arm64/photutils-0.5.2-py312h1_0.conda",
                        "win-64/photutils-0.5.2-py312h1_0.conda",
                    ],
                )],
            )
            .with_package(
                DEST,
                "photutils",
                &[("0.5.2", &["linux-64/photutils-0.5.2-py312h1_0.conda"])],
            );

        assert_eq!(
            decision(&registry, unpinned("photutils")).await,
            CopyDecision::PartialCopy {
                version: "0.5.2".to_string(),
                filenames: vec![
                    "osx-arm64/photutils-0.5.2-py312h1_0.conda".to_string(),
                    "win-64/photutils-0.5.2-py312h1_0.conda".to_string(),
                ],
            }
        );
    }

    #[tokio::test]
    async fn newer_destination_is_left_alone() {
        let registry = FakeRegistry::default()
            .with_package(SOURCE, "sep", &[("1.2.0", &[])])
            .with_package(DEST, "sep", &[("1.2.0", &[]), ("1.3.0", &[])]);
        assert_eq!(decision(&registry, unpinned("sep")).await, CopyDecision::NoAction);
    }

    #[tokio::test]
    async fn pinned_version_missing_on_destination_is_copied() {
        let registry = FakeRegistry::default()
            .with_package(SOURCE, "sep", &[("1.1.0", &[]), ("1.2.0", &[])])
            .with_package(DEST, "sep", &[("1.2.0", &[])]);
        assert_eq!(
            decision(&registry, pinned("sep", "1.1.0")).await,
            CopyDecision::FullCopy {
                version: "1.1.0".to_string()
            }
        );
    }

    #[tokio::test]
    async fn pinned_version_missing_on_source_is_fatal() {
        let registry = FakeRegistry::default().with_package(SOURCE, "wcsaxes", &[("0.9", &[])]);
        let err = plan_copies(&registry, &[pinned("wcsaxes", "0.0.0")], SOURCE, DEST)
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::PinnedVersionNotFound { .. }));
        let message = err.to_string();
        assert!(message.contains("0.0.0"));
        assert!(message.contains("wcsaxes"));
    }

    #[tokio::test]
    async fn unknown_source_package_is_fatal() {
        let registry = FakeRegistry::default();
        let err = plan_copies(&registry, &[unpinned("nope")], SOURCE, DEST)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::SourcePackageNotFound { .. }));
    }

    #[tokio::test]
    async fn lookups_use_the_registry_name() {
        let registry = FakeRegistry::default().with_package(SOURCE, "pyyaml", &[("6.0", &[])]);
        let plan = plan_copies(&registry, &[unpinned("PyYAML")], SOURCE, DEST)
            .await
            .unwrap();
        assert!(plan.decisions.contains_key("pyyaml"));
        assert_eq!(registry.lookups_on(SOURCE), vec!["pyyaml"]);
        assert_eq!(registry.lookups_on(DEST), vec!["pyyaml"]);
    }

    #[tokio::test]
    async fn failed_lookups_do_not_stop_the_run() {
        let registry = FakeRegistry::default()
            .with_package(SOURCE, "sep", &[("1.2.1", &[])])
            .with_outage(DEST, "sep")
            .with_package(SOURCE, "wcsaxes", &[("0.9", &[])]);

        let plan = plan_copies(&registry, &[unpinned("sep"), unpinned("wcsaxes")], SOURCE, DEST)
            .await
            .unwrap();
        assert!(plan.failures.contains_key("sep"));
        assert_eq!(
            plan.decisions.get("wcsaxes"),
            Some(&CopyDecision::FullCopy {
                version: "0.9".to_string()
            })
        );
    }

    #[tokio::test]
    async fn decisions_keep_input_order() {
        let registry = FakeRegistry::default()
            .with_package(SOURCE, "zeta", &[("1.0", &[])])
            .with_package(SOURCE, "alpha", &[("1.0", &[])]);
        let plan = plan_copies(&registry, &[unpinned("zeta"), unpinned("alpha")], SOURCE, DEST)
            .await
            .unwrap();
        assert_eq!(plan.decisions.keys().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
    }

    #[tokio::test]
    async fn planning_is_idempotent() {
        let registry = FakeRegistry::default()
            .with_package(SOURCE, "wcsaxes", &[("0.8", &[]), ("0.9", &[])])
            .with_package(DEST, "wcsaxes", &[("0.8", &[])]);
        let desired = [unpinned("wcsaxes")];

        let first = plan_copies(&registry, &desired, SOURCE, DEST).await.unwrap();
        let second = plan_copies(&registry, &desired, SOURCE, DEST).await.unwrap();
        assert_eq!(first.decisions, second.decisions);
        assert!(registry.copies().is_empty());
    }

    #[tokio::test]
    async fn copies_follow_the_plan() {
        let registry = FakeRegistry::default();
        let plan = CopyPlan {
            decisions: IndexMap::from([
                (
                    "wcsaxes".to_string(),
                    CopyDecision::FullCopy {
                        version: "0.9".to_string(),
                    },
                ),
                ("sep".to_string(), CopyDecision::NoAction),
                (
                    "photutils".to_string(),
                    CopyDecision::PartialCopy {
                        version: "0.5.2".to_string(),
                        filenames: vec!["a.conda".to_string(), "b.conda".to_string()],
                    },
                ),
            ]),
            failures: IndexMap::new(),
        };
        assert_eq!(plan.copy_count(), 3);

        let failures = execute_copies(&registry, &plan, SOURCE, DEST).await.unwrap();
        assert!(failures.is_empty());

        let copies = registry.copies();
        assert_eq!(
            copies
                .iter()
                .map(|c| (c.name.as_str(), c.version.as_str(), c.filename.as_deref()))
                .collect::<Vec<_>>(),
            vec![
                ("wcsaxes", "0.9", None),
                ("photutils", "0.5.2", Some("a.conda")),
                ("photutils", "0.5.2", Some("b.conda")),
            ]
        );
        assert!(copies.iter().all(|c| c.source_channel == SOURCE && c.dest_channel == DEST));
    }

    #[tokio::test]
    async fn build_needed_when_platform_build_is_missing() {
        let py312 = InterpreterTag::new(3, 12);
        let registry = FakeRegistry::default()
            .with_package(DEST, "sep", &[("1.2.1", &["osx-64/sep-1.2.1-py312h1_0.conda"])])
            .with_package(DEST, "wcsaxes", &[("0.9", &["noarch/wcsaxes-0.9-py_0.conda"])]);
        let sources = FakeSourceIndex::default()
            .with_release("sep", "1.2.1", true)
            .with_release("wcsaxes", "0.9", true)
            .with_release("photutils", "0.5.2", false);

        let report = check_builds(
            &registry,
            &[unpinned("sep"), unpinned("wcsaxes"), unpinned("photutils"), pinned("sep2", "1.0")],
            DEST,
            Platform::Linux64,
            py312,
            &sources,
        )
        .await;

        assert!(report.failures.is_empty());
        assert_eq!(
            report
                .checks
                .iter()
                .map(|c| (c.package.name(), c.version.as_str(), c.reason.clone()))
                .collect::<Vec<_>>(),
            vec![
                ("sep", "1.2.1", BuildReason::NoMatchingBuild),
                ("wcsaxes", "0.9", BuildReason::UpToDate),
                ("photutils", "0.5.2", BuildReason::NotOnChannel),
                ("sep2", "1.0", BuildReason::NotOnChannel),
            ]
        );
        assert_eq!(
            report
                .candidates()
                .iter()
                .map(|p| p.name().to_string())
                .collect::<Vec<_>>(),
            vec!["sep", "photutils", "sep2"]
        );
    }

    #[tokio::test]
    async fn build_needed_when_version_is_missing() {
        let registry =
            FakeRegistry::default().with_package(DEST, "sep", &[("1.2.0", &["linux-64/sep-1.2.0-py312h1_0.conda"])]);
        let sources = FakeSourceIndex::default().with_release("sep", "1.2.1", true);

        let report = check_builds(
            &registry,
            &[unpinned("sep")],
            DEST,
            Platform::Linux64,
            InterpreterTag::new(3, 12),
            &sources,
        )
        .await;
        assert_eq!(report.checks[0].reason, BuildReason::VersionMissing);
    }

    #[tokio::test]
    async fn unknown_upstream_is_a_per_package_failure() {
        let registry = FakeRegistry::default();
        let sources = FakeSourceIndex::default().with_release("sep", "1.2.1", true);

        let report = check_builds(
            &registry,
            &[unpinned("ghost"), unpinned("sep")],
            DEST,
            Platform::Linux64,
            InterpreterTag::new(3, 12),
            &sources,
        )
        .await;
        assert!(matches!(
            report.failures.get("ghost"),
            Some(ReconcileError::Source { .. })
        ));
        assert_eq!(report.checks.len(), 1);
    }
}
