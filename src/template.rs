//! Recipe templates: hand-maintained recipes kept under
//! `<template_dir>/<registry_name>/`, rendered with minijinja.
//!
//! Templates use plain jinja delimiters (`{{ version }}`). The variables
//! available are `name`, `version` and `checksum`, plus `sha256` or `md5`
//! depending on what the source index publishes. Referencing anything else is
//! an error.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::{Path, PathBuf},
    str::FromStr,
};

use minijinja::{Environment, UndefinedBehavior};
use miette::Diagnostic;
use rattler_conda_types::Platform;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    package::InterpreterTag,
    source::{Checksum, SourceArtifact},
};

#[allow(missing_docs)]
#[derive(Debug, Error, Diagnostic)]
pub enum TemplateError {
    /// There is no template directory for this package.
    #[error("no recipe template for '{0}'")]
    NotFound(String),

    #[error("template {} uses an undefined variable: {detail}", .template.display())]
    #[diagnostic(help("only `name`, `version`, `checksum` and `sha256` or `md5` are available"))]
    UndefinedVariable { template: PathBuf, detail: String },

    #[error("failed to render template {}", .template.display())]
    Render {
        template: PathBuf,
        #[source]
        source: minijinja::Error,
    },

    #[error("failed to read template {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to list templates in {}", .path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

impl TemplateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TemplateError::NotFound(_))
    }
}

/// The values a template is rendered with.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateVariables {
    pub name: String,
    pub version: String,
    pub checksum: Checksum,
}

impl TemplateVariables {
    pub fn from_artifact(artifact: &SourceArtifact) -> Self {
        Self {
            name: artifact.name.clone(),
            version: artifact.version.clone(),
            checksum: artifact.checksum.clone(),
        }
    }

    fn context(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("name", self.name.clone()),
            ("version", self.version.clone()),
            ("checksum", self.checksum.to_hex()),
            (self.checksum.kind(), self.checksum.to_hex()),
        ])
    }
}

/// Renders the files of a package's recipe template.
pub trait TemplateRenderer: Send + Sync {
    /// The files of the template for `registry_name`, relative to its
    /// directory. Hidden files are skipped.
    fn template_files(
        &self,
        template_dir: &Path,
        registry_name: &str,
    ) -> Result<Vec<PathBuf>, TemplateError>;

    /// Render one file of the template.
    fn render(
        &self,
        template_dir: &Path,
        registry_name: &str,
        file_name: &Path,
        variables: &TemplateVariables,
    ) -> Result<String, TemplateError>;
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// [`TemplateRenderer`] over files on disk.
#[derive(Debug, Default, Clone)]
pub struct MinijinjaRenderer;

impl TemplateRenderer for MinijinjaRenderer {
    fn template_files(
        &self,
        template_dir: &Path,
        registry_name: &str,
    ) -> Result<Vec<PathBuf>, TemplateError> {
        let root = template_dir.join(registry_name);
        if !root.is_dir() {
            return Err(TemplateError::NotFound(registry_name.to_string()));
        }

        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e))
        {
            let entry = entry.map_err(|source| TemplateError::Walk {
                path: root.clone(),
                source,
            })?;
            if entry.file_type().is_file()
                && let Ok(relative) = entry.path().strip_prefix(&root)
            {
                files.push(relative.to_path_buf());
            }
        }
        Ok(files)
    }

    fn render(
        &self,
        template_dir: &Path,
        registry_name: &str,
        file_name: &Path,
        variables: &TemplateVariables,
    ) -> Result<String, TemplateError> {
        let path = template_dir.join(registry_name).join(file_name);
        let source = match fs_err::read_to_string(&path) {
            Ok(source) => source,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TemplateError::NotFound(registry_name.to_string()));
            }
            Err(source) => return Err(TemplateError::Io { path, source }),
        };

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        // recipes end in a newline and should keep it
        env.set_keep_trailing_newline(true);

        let template_name = Path::new(registry_name).join(file_name);
        env.render_named_str(
            &template_name.to_string_lossy(),
            &source,
            variables.context(),
        )
        .map_err(|source| match source.kind() {
            minijinja::ErrorKind::UndefinedError => TemplateError::UndefinedVariable {
                template: template_name.clone(),
                detail: source.to_string(),
            },
            _ => TemplateError::Render {
                template: template_name.clone(),
                source,
            },
        })
    }
}

/// The `extra:` section of a template's recipe, which may restrict where the
/// package is built.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TemplateExtra {
    pub platforms: Option<HashSet<Platform>>,
    pub pythons: Option<BTreeSet<InterpreterTag>>,
}

#[derive(Deserialize, Default)]
struct RawRecipe {
    #[serde(default)]
    extra: RawExtra,
}

#[derive(Deserialize, Default)]
struct RawExtra {
    platforms: Option<Vec<String>>,
    pythons: Option<Vec<serde_yaml::Value>>,
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse the `extra.platforms` and `extra.pythons` of a rendered recipe.
/// Anything that cannot be understood is logged and ignored.
pub fn parse_template_extra(rendered: &str) -> TemplateExtra {
    let raw: RawRecipe = match serde_yaml::from_str(rendered) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::debug!("Could not read extra metadata from template: {}", err);
            return TemplateExtra::default();
        }
    };

    let platforms = raw.extra.platforms.map(|platforms| {
        platforms
            .iter()
            .filter_map(|p| match Platform::from_str(p) {
                Ok(platform) => Some(platform),
                Err(err) => {
                    tracing::warn!("Ignoring template platform '{}': {}", p, err);
                    None
                }
            })
            .collect()
    });

    let pythons = raw.extra.pythons.map(|pythons| {
        pythons
            .iter()
            .filter_map(yaml_scalar)
            .filter_map(|p| match InterpreterTag::from_str(&p) {
                Ok(tag) => Some(tag),
                Err(err) => {
                    tracing::warn!("Ignoring template python: {}", err);
                    None
                }
            })
            .collect()
    });

    TemplateExtra { platforms, pythons }
}

/// Render the template's recipe file (`recipe.yaml` or `meta.yaml`) and read
/// its extra metadata. No template means no restrictions.
pub fn template_extra(
    renderer: &dyn TemplateRenderer,
    template_dir: &Path,
    registry_name: &str,
    variables: &TemplateVariables,
) -> Result<TemplateExtra, TemplateError> {
    let files = match renderer.template_files(template_dir, registry_name) {
        Ok(files) => files,
        Err(err) if err.is_not_found() => return Ok(TemplateExtra::default()),
        Err(err) => return Err(err),
    };

    let Some(recipe_file) = ["recipe.yaml", "meta.yaml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|candidate| files.contains(candidate))
    else {
        return Ok(TemplateExtra::default());
    };

    let rendered = renderer.render(template_dir, registry_name, &recipe_file, variables)?;
    Ok(parse_template_extra(&rendered))
}
