//! Recipes generated from PyPI metadata, for packages that have neither a
//! template nor an upstream feedstock.

use std::{collections::BTreeMap, path::PathBuf};

use async_trait::async_trait;
use forge_mirror_recipe_generator::{
    PyPiClient, PyPiError, SkeletonOptions, create_recipe, format_recipe,
};
use miette::Diagnostic;
use thiserror::Error;

use crate::package::{BuildFlags, PackageDescriptor};

#[derive(Debug, Error, Diagnostic)]
#[error("failed to generate a recipe for {name} {version}")]
pub struct GenerateError {
    pub name: String,
    pub version: String,
    #[source]
    pub source: PyPiError,
}

/// Produces the files of a recipe for one release of a package.
#[async_trait]
pub trait RecipeGenerator: Send + Sync {
    async fn generate(
        &self,
        package: &PackageDescriptor,
        version: &str,
    ) -> Result<BTreeMap<PathBuf, String>, GenerateError>;
}

/// The generator options that follow from a package's build flags.
pub fn skeleton_options(flags: &BuildFlags) -> SkeletonOptions {
    SkeletonOptions {
        python_requirement: flags.python_requirement.clone(),
        numpy_compiled_extensions: flags.numpy_compiled_extensions,
        numpy_requirement: flags.numpy_requirement.clone(),
        include_extras: flags.include_extras,
        setup_options: flags.setup_options.clone(),
    }
}

/// [`RecipeGenerator`] that writes a `recipe.yaml` skeleton from PyPI metadata.
pub struct PyPiRecipeGenerator {
    client: PyPiClient,
}

impl PyPiRecipeGenerator {
    pub fn new(client: PyPiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RecipeGenerator for PyPiRecipeGenerator {
    async fn generate(
        &self,
        package: &PackageDescriptor,
        version: &str,
    ) -> Result<BTreeMap<PathBuf, String>, GenerateError> {
        let err = |source| GenerateError {
            name: package.name().to_string(),
            version: version.to_string(),
            source,
        };

        let metadata = self
            .client
            .fetch_metadata(package.name(), Some(version))
            .await
            .map_err(err)?;
        let recipe =
            create_recipe(&metadata, &skeleton_options(package.build_flags())).map_err(err)?;

        Ok(BTreeMap::from([(
            PathBuf::from("recipe.yaml"),
            format_recipe(&recipe),
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_build_flags() {
        let flags = BuildFlags {
            python_requirement: Some(">=3.10".to_string()),
            numpy_requirement: Some(">=1.26".to_string()),
            numpy_compiled_extensions: true,
            include_extras: true,
            setup_options: Some("--no-build-isolation".to_string()),
            ..BuildFlags::default()
        };

        let options = skeleton_options(&flags);
        assert_eq!(options.python_requirement.as_deref(), Some(">=3.10"));
        assert_eq!(options.numpy_requirement.as_deref(), Some(">=1.26"));
        assert!(options.numpy_compiled_extensions);
        assert!(options.include_extras);
        assert_eq!(options.setup_options.as_deref(), Some("--no-build-isolation"));
    }
}
