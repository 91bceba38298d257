//! The plain-text artifacts a `plan` run leaves behind for the build jobs.

use std::path::Path;

use indexmap::IndexMap;

/// Name of the file listing recipe directories in build order.
pub const BUILD_ORDER_FILE: &str = "build_order.txt";

/// Name of the package list of feedstock packages, in the format `copy` reads.
pub const COPY_FROM_FILE: &str = "copy_from.yaml";

/// One registry name per line, in the order given.
pub fn format_build_order<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|name| format!("{}\n", name.as_ref()))
        .collect()
}

pub fn write_build_order<S: AsRef<str>>(path: &Path, names: &[S]) -> std::io::Result<()> {
    tracing::debug!("Writing build order to {}", path.display());
    fs_err::write(path, format_build_order(names))
}

/// `name: version` for pinned packages and `name: null` for the ones that
/// follow the latest release.
pub fn format_copy_list(entries: &IndexMap<String, Option<String>>) -> Result<String, serde_yaml::Error> {
    if entries.is_empty() {
        return Ok(String::new());
    }
    serde_yaml::to_string(entries)
}

pub fn write_copy_list(path: &Path, entries: &IndexMap<String, Option<String>>) -> std::io::Result<()> {
    let contents = format_copy_list(entries).map_err(std::io::Error::other)?;
    tracing::debug!("Writing copy list to {}", path.display());
    fs_err::write(path, contents)
}
