//! Turn the packages that need a build into recipes.
//!
//! Every candidate is first filtered (pre-releases, platforms, interpreters,
//! packages without a source distribution) and then classified by where its
//! recipe comes from, first match wins:
//!
//! 1. a hand-maintained template in the template directory,
//! 2. the upstream conda-forge feedstock,
//! 3. a skeleton generated from PyPI metadata.
//!
//! Template and feedstock recipes additionally get the package's python and
//! numpy constraints appended to their requirements.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use fs_err as fs;
use indexmap::IndexMap;
use miette::Diagnostic;
use rattler_conda_types::Platform;
use thiserror::Error;

use crate::{
    build_order::{BUILD_ORDER_FILE, COPY_FROM_FILE, write_build_order, write_copy_list},
    feedstock::{FeedstockError, FeedstockRecipe, FeedstockSource},
    generate::{GenerateError, RecipeGenerator},
    inject::inject_into_files,
    package::{InterpreterTag, PackageDescriptor, is_prerelease},
    registry::{Registry, RegistryError},
    source::{SourceArtifact, SourceError, SourceIndex},
    template::{TemplateError, TemplateRenderer, TemplateVariables, template_extra},
};

/// Directory below the output directory that receives the recipes.
pub const RECIPES_DIR: &str = "recipes";

#[allow(missing_docs)]
#[derive(Debug, Error, Diagnostic)]
pub enum PlanError {
    #[error(
        "the feedstock recipe of '{package}' builds version {found}, but version {requested} was requested"
    )]
    #[diagnostic(help("pin '{package}' to {found}, or build it without the feedstock"))]
    FeedstockVersionMismatch {
        package: String,
        requested: String,
        found: String,
    },

    #[error("failed to resolve the source of '{package}'")]
    Source {
        package: String,
        #[source]
        source: SourceError,
    },

    #[error("failed to render the template of '{package}'")]
    Template {
        package: String,
        #[source]
        source: TemplateError,
    },

    #[error("failed to look up '{package}' on the upstream channel")]
    Registry {
        package: String,
        #[source]
        source: RegistryError,
    },

    #[error("failed to fetch the feedstock of '{package}'")]
    Feedstock {
        package: String,
        #[source]
        source: FeedstockError,
    },

    #[error("failed to generate a recipe for '{package}'")]
    Generate {
        package: String,
        #[source]
        source: GenerateError,
    },

    #[error("failed to download the source of '{package}'")]
    Download {
        package: String,
        #[source]
        source: SourceError,
    },

    #[error("failed to write the recipe of '{package}'")]
    Write {
        package: String,
        #[source]
        source: std::io::Error,
    },
}

impl PlanError {
    /// Errors that invalidate the whole run rather than one package.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlanError::FeedstockVersionMismatch { .. })
    }
}

/// Why a package was left out of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Prerelease(String),
    ExcludedPlatform(Platform),
    IneligiblePlatform(Platform),
    IneligibleInterpreter(InterpreterTag),
    NoSourceArtifact(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Prerelease(version) => write!(f, "{version} is a pre-release"),
            DropReason::ExcludedPlatform(platform) => write!(f, "{platform} is excluded"),
            DropReason::IneligiblePlatform(platform) => write!(f, "not built on {platform}"),
            DropReason::IneligibleInterpreter(tag) => write!(f, "not built for python {tag}"),
            DropReason::NoSourceArtifact(version) => {
                write!(f, "no source distribution is published for {version}")
            }
        }
    }
}

/// Where a recipe came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeOrigin {
    Template,
    UpstreamFeedstock,
    AutoGeneration,
}

/// A package that is ready to be written and built.
#[derive(Debug, Clone)]
pub struct PlannedRecipe {
    pub package: PackageDescriptor,
    pub source: SourceArtifact,
    pub origin: RecipeOrigin,
    /// Recipe files keyed by their path inside the recipe directory.
    pub files: BTreeMap<PathBuf, String>,
}

impl PlannedRecipe {
    pub fn registry_name(&self) -> String {
        self.package.registry_name()
    }

    pub fn version(&self) -> &str {
        &self.source.version
    }
}

/// The outcome of planning, every list in input order.
#[derive(Debug, Default)]
pub struct BuildPlan {
    pub by_template: Vec<PlannedRecipe>,
    pub by_upstream_feedstock: Vec<PlannedRecipe>,
    pub by_auto_generation: Vec<PlannedRecipe>,
    /// Registry name and reason of every package that was filtered out.
    pub dropped: Vec<(String, DropReason)>,
    pub failed: IndexMap<String, PlanError>,
    /// Registry names of all ready packages, in input order.
    pub build_order: Vec<String>,
}

impl BuildPlan {
    fn push(&mut self, recipe: PlannedRecipe) {
        self.build_order.push(recipe.registry_name());
        match recipe.origin {
            RecipeOrigin::Template => self.by_template.push(recipe),
            RecipeOrigin::UpstreamFeedstock => self.by_upstream_feedstock.push(recipe),
            RecipeOrigin::AutoGeneration => self.by_auto_generation.push(recipe),
        }
    }

    /// Every ready recipe, in build order.
    pub fn ready(&self) -> Vec<&PlannedRecipe> {
        self.build_order
            .iter()
            .filter_map(|name| self.get(name))
            .collect()
    }

    pub fn get(&self, registry_name: &str) -> Option<&PlannedRecipe> {
        self.by_template
            .iter()
            .chain(&self.by_upstream_feedstock)
            .chain(&self.by_auto_generation)
            .find(|recipe| recipe.registry_name() == registry_name)
    }

    /// Move a ready package to the failed ones.
    pub fn fail(&mut self, registry_name: &str, err: PlanError) {
        for list in [
            &mut self.by_template,
            &mut self.by_upstream_feedstock,
            &mut self.by_auto_generation,
        ] {
            list.retain(|recipe| recipe.registry_name() != registry_name);
        }
        self.build_order.retain(|name| name != registry_name);
        self.failed.insert(registry_name.to_string(), err);
    }

    /// The feedstock packages, in the package-list format `copy` reads.
    pub fn copy_list(&self) -> IndexMap<String, Option<String>> {
        self.by_upstream_feedstock
            .iter()
            .map(|recipe| {
                (
                    recipe.registry_name(),
                    recipe.package.pinned_version().map(str::to_string),
                )
            })
            .collect()
    }
}

enum Outcome {
    Dropped(DropReason),
    Ready(PlannedRecipe),
}

/// Classifies candidates and produces their recipes.
pub struct BuildPlanner<'a> {
    registry: &'a dyn Registry,
    sources: &'a dyn SourceIndex,
    renderer: &'a dyn TemplateRenderer,
    generator: &'a dyn RecipeGenerator,
    feedstocks: Option<(&'a dyn FeedstockSource, String)>,
    baseline_pythons: Vec<InterpreterTag>,
}

impl<'a> BuildPlanner<'a> {
    pub fn new(
        registry: &'a dyn Registry,
        sources: &'a dyn SourceIndex,
        renderer: &'a dyn TemplateRenderer,
        generator: &'a dyn RecipeGenerator,
    ) -> Self {
        Self {
            registry,
            sources,
            renderer,
            generator,
            feedstocks: None,
            baseline_pythons: crate::consts::BASELINE_PYTHONS.to_vec(),
        }
    }

    /// Use feedstock recipes for packages that `upstream_channel` publishes.
    pub fn with_feedstocks(
        mut self,
        feedstocks: &'a dyn FeedstockSource,
        upstream_channel: impl Into<String>,
    ) -> Self {
        self.feedstocks = Some((feedstocks, upstream_channel.into()));
        self
    }

    /// The interpreters packages are built for unless they say otherwise.
    pub fn with_baseline_pythons(mut self, pythons: Vec<InterpreterTag>) -> Self {
        self.baseline_pythons = pythons;
        self
    }

    /// Plan every candidate for `platform` and `interpreter`.
    ///
    /// Per-package failures end up in [`BuildPlan::failed`]. A feedstock that
    /// builds a different version than the one pinned aborts planning.
    pub async fn plan(
        &self,
        candidates: &[PackageDescriptor],
        template_dir: &Path,
        platform: Platform,
        interpreter: InterpreterTag,
    ) -> Result<BuildPlan, PlanError> {
        let mut plan = BuildPlan::default();

        for package in candidates {
            let name = package.registry_name();
            match self
                .plan_package(package, template_dir, platform, interpreter)
                .await
            {
                Ok(Outcome::Dropped(reason)) => {
                    tracing::info!("Skipping {}: {}", name, reason);
                    plan.dropped.push((name, reason));
                }
                Ok(Outcome::Ready(recipe)) => {
                    tracing::info!(
                        "{} {}: recipe from {}",
                        name,
                        recipe.version(),
                        match recipe.origin {
                            RecipeOrigin::Template => "template",
                            RecipeOrigin::UpstreamFeedstock => "upstream feedstock",
                            RecipeOrigin::AutoGeneration => "PyPI metadata",
                        }
                    );
                    plan.push(recipe);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::error!("{}: {}", name, err);
                    plan.failed.insert(name, err);
                }
            }
        }

        Ok(plan)
    }

    async fn plan_package(
        &self,
        package: &PackageDescriptor,
        template_dir: &Path,
        platform: Platform,
        interpreter: InterpreterTag,
    ) -> Result<Outcome, PlanError> {
        let name = package.registry_name();
        let flags = package.build_flags();

        if let Some(version) = package.pinned_version().filter(|v| is_prerelease(v)) {
            return Ok(Outcome::Dropped(DropReason::Prerelease(version.to_string())));
        }
        if flags.excluded_platforms.contains(&platform) {
            return Ok(Outcome::Dropped(DropReason::ExcludedPlatform(platform)));
        }
        // the package's own sets are known up front, the template's only
        // after rendering
        if !flags.platform_allowed(platform, None) {
            return Ok(Outcome::Dropped(DropReason::IneligiblePlatform(platform)));
        }
        if flags
            .pythons
            .as_ref()
            .is_some_and(|pythons| !pythons.contains(&interpreter))
        {
            return Ok(Outcome::Dropped(DropReason::IneligibleInterpreter(interpreter)));
        }

        let source = match self
            .sources
            .resolve(package.name(), package.pinned_version())
            .await
        {
            Ok(source) => source,
            Err(SourceError::NoSourceArtifact { version, .. }) => {
                tracing::warn!("{} {} publishes no source distribution", name, version);
                return Ok(Outcome::Dropped(DropReason::NoSourceArtifact(version)));
            }
            Err(source) => return Err(PlanError::Source { package: name, source }),
        };
        if is_prerelease(&source.version) {
            return Ok(Outcome::Dropped(DropReason::Prerelease(source.version)));
        }

        let variables = TemplateVariables::from_artifact(&source);
        let template_err = |source| PlanError::Template {
            package: name.clone(),
            source,
        };
        let extra = template_extra(self.renderer, template_dir, &name, &variables)
            .map_err(template_err)?;
        if !flags.platform_allowed(platform, extra.platforms.as_ref()) {
            return Ok(Outcome::Dropped(DropReason::IneligiblePlatform(platform)));
        }
        if !flags.interpreter_allowed(interpreter, extra.pythons.as_ref(), &self.baseline_pythons) {
            return Ok(Outcome::Dropped(DropReason::IneligibleInterpreter(interpreter)));
        }

        let (origin, mut files) =
            if let Some(files) = self.render_template(template_dir, &name, &variables).map_err(template_err)? {
                (RecipeOrigin::Template, files)
            } else if let Some(recipe) = self.upstream_feedstock(package).await? {
                (RecipeOrigin::UpstreamFeedstock, recipe.files)
            } else {
                let files = self
                    .generator
                    .generate(package, &source.version)
                    .await
                    .map_err(|source| PlanError::Generate {
                        package: name.clone(),
                        source,
                    })?;
                (RecipeOrigin::AutoGeneration, files)
            };

        // generated recipes already carry the constraints
        if origin != RecipeOrigin::AutoGeneration
            && let Some(changed) = inject_into_files(&mut files, &flags.injected_requirements())
        {
            tracing::debug!("Added requirements to {}/{}", name, changed.display());
        }

        Ok(Outcome::Ready(PlannedRecipe {
            package: package.clone(),
            source,
            origin,
            files,
        }))
    }

    /// Render every file of the package's template, `None` when there is no
    /// template.
    fn render_template(
        &self,
        template_dir: &Path,
        name: &str,
        variables: &TemplateVariables,
    ) -> Result<Option<BTreeMap<PathBuf, String>>, TemplateError> {
        let files = match self.renderer.template_files(template_dir, name) {
            Ok(files) => files,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        let mut rendered = BTreeMap::new();
        for file in files {
            let contents = self.renderer.render(template_dir, name, &file, variables)?;
            rendered.insert(file, contents);
        }
        Ok(Some(rendered))
    }

    /// The feedstock recipe of a package that the upstream channel publishes
    /// (in the pinned version, if any). `None` falls through to generation.
    async fn upstream_feedstock(
        &self,
        package: &PackageDescriptor,
    ) -> Result<Option<FeedstockRecipe>, PlanError> {
        let Some((feedstocks, upstream_channel)) = &self.feedstocks else {
            return Ok(None);
        };
        let name = package.registry_name();

        match self.registry.package_info(upstream_channel, &name).await {
            Ok(snapshot) => {
                if let Some(pinned) = package.pinned_version()
                    && !snapshot.knows_version(pinned)
                {
                    tracing::debug!("{} does not publish {} {}", upstream_channel, name, pinned);
                    return Ok(None);
                }
            }
            Err(err) if err.is_not_found() => {
                tracing::debug!("{} is not on {}", name, upstream_channel);
                return Ok(None);
            }
            Err(source) => return Err(PlanError::Registry { package: name, source }),
        }

        let recipe = match feedstocks.fetch_recipe(package.name()).await {
            Ok(recipe) => recipe,
            Err(err) if err.is_not_found() => {
                tracing::debug!("{}", err);
                return Ok(None);
            }
            Err(source) => return Err(PlanError::Feedstock { package: name, source }),
        };

        if let Some(requested) = package.pinned_version() {
            match &recipe.declared_version {
                Some(found) if found != requested => {
                    return Err(PlanError::FeedstockVersionMismatch {
                        package: name,
                        requested: requested.to_string(),
                        found: found.clone(),
                    });
                }
                Some(_) => {}
                None => tracing::warn!(
                    "Could not read the version of the {} feedstock, assuming it builds {}",
                    name,
                    requested
                ),
            }
        }

        Ok(Some(recipe))
    }
}

/// Write `files` to `recipes_dir/name`, replacing what was there.
///
/// The files go to a hidden staging directory first, which is renamed into
/// place once everything is written.
pub fn write_recipe_dir(
    recipes_dir: &Path,
    name: &str,
    files: &BTreeMap<PathBuf, String>,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(recipes_dir)?;
    let staging = tempfile::Builder::new()
        .prefix(&format!(".{name}-"))
        .tempdir_in(recipes_dir)?;

    for (relative, contents) in files {
        let path = staging.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
    }

    let target = recipes_dir.join(name);
    if target.exists() {
        fs::remove_dir_all(&target)?;
    }
    fs::rename(staging.path(), &target)?;
    Ok(target)
}

/// Write the recipes of all ready packages below `output_dir`, followed by
/// the build order and the feedstock copy list.
///
/// A recipe that cannot be written is reported and left out of the build
/// order; the other packages are still written.
pub fn write_plan(
    plan: &BuildPlan,
    output_dir: &Path,
) -> std::io::Result<IndexMap<String, PlanError>> {
    let recipes_dir = output_dir.join(RECIPES_DIR);
    let mut failures = IndexMap::new();
    let mut written = Vec::new();

    for recipe in plan.ready() {
        let name = recipe.registry_name();
        match write_recipe_dir(&recipes_dir, &name, &recipe.files) {
            Ok(path) => {
                tracing::info!("Wrote recipe for {} to {}", name, path.display());
                written.push(name);
            }
            Err(source) => {
                let err = PlanError::Write {
                    package: name.clone(),
                    source,
                };
                tracing::error!("{}", err);
                failures.insert(name, err);
            }
        }
    }

    write_build_order(&output_dir.join(BUILD_ORDER_FILE), &written)?;

    let copy_list: IndexMap<_, _> = plan
        .copy_list()
        .into_iter()
        .filter(|(name, _)| written.contains(name))
        .collect();
    write_copy_list(&output_dir.join(COPY_FROM_FILE), &copy_list)?;

    Ok(failures)
}
