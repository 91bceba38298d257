//! Verify that every recipe of a plan produced a package.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use fs_err as fs;
use miette::Diagnostic;
use rattler_conda_types::package::CondaArchiveIdentifier;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CheckBuiltError {
    #[error("no package was built for: {}", .0.join(", "))]
    Unbuilt(Vec<String>),

    #[error("failed to list {}", .path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Names of all conda packages anywhere below `output_dir`.
fn built_packages(output_dir: &Path) -> Result<HashSet<String>, CheckBuiltError> {
    let mut packages = HashSet::new();
    if !output_dir.exists() {
        return Ok(packages);
    }
    for entry in walkdir::WalkDir::new(output_dir) {
        let entry = entry.map_err(|source| CheckBuiltError::Walk {
            path: output_dir.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        // `<name>-<version>-<build>.conda`, the name may contain dashes itself
        if let Some(package) =
            CondaArchiveIdentifier::try_from_filename(&entry.file_name().to_string_lossy())
        {
            packages.insert(package.identifier.name);
        }
    }
    Ok(packages)
}

/// The recipe directories below `recipes_dir` that have no package in
/// `output_dir`, sorted by name.
///
/// A recipe counts as built when some package is named exactly like its
/// directory.
pub fn find_unbuilt(recipes_dir: &Path, output_dir: &Path) -> Result<Vec<String>, CheckBuiltError> {
    let packages = built_packages(output_dir)?;
    let io_err = |source| CheckBuiltError::Io {
        path: recipes_dir.to_path_buf(),
        source,
    };

    let mut unbuilt = Vec::new();
    for entry in fs::read_dir(recipes_dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // staging directories of an interrupted run
        if name.starts_with('.') || !entry.file_type().map_err(io_err)?.is_dir() {
            continue;
        }
        if !packages.contains(&name) {
            unbuilt.push(name);
        }
    }
    unbuilt.sort();
    Ok(unbuilt)
}

/// Fail with the list of recipes that were not built.
pub fn check_built(recipes_dir: &Path, output_dir: &Path) -> Result<(), CheckBuiltError> {
    let unbuilt = find_unbuilt(recipes_dir, output_dir)?;
    if unbuilt.is_empty() {
        tracing::info!("Every recipe in {} was built", recipes_dir.display());
        Ok(())
    } else {
        Err(CheckBuiltError::Unbuilt(unbuilt))
    }
}
