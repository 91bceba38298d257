//! The packages a user asks for, as read from the desired-state file.
//!
//! Two shapes are accepted. The full form is a sequence of entries:
//!
//! ```yaml
//! - name: wcsaxes
//!   version: "0.9"
//!   python: ">=3.10"
//!   numpy_compiled_extensions: true
//!   excluded_platforms: [win-32]
//! - name: sep
//! ```
//!
//! The short form is a mapping from name to version (or `null` for "latest"),
//! which is also what `copy_from.yaml` contains.

use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use indexmap::IndexMap;
use miette::Diagnostic;
use rattler_conda_types::Platform;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

lazy_static::lazy_static! {
    static ref BUILD_STRING_PYTHON: regex::Regex =
        regex::Regex::new(r"py(\d)(\d{1,2})").expect("valid regex");
    static ref ALPHA_SEGMENT: regex::Regex =
        regex::Regex::new(r"[A-Za-z]+").expect("valid regex");
}

/// Errors raised while reading the desired-state file.
#[derive(Debug, Error, Diagnostic)]
pub enum DescriptorError {
    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse the package list: {0}")]
    #[diagnostic(help(
        "the file must be either a list of entries with a `name` key or a mapping of name to version"
    ))]
    Parse(#[from] serde_yaml::Error),

    #[error("the package list must be a sequence or a mapping")]
    UnexpectedShape,

    #[error("entry {0} of the package list has an empty name")]
    EmptyName(usize),

    #[error("package '{0}' is listed more than once")]
    Duplicate(String),
}

/// Could not turn a string into an [`InterpreterTag`].
#[derive(Debug, Clone, Error, Diagnostic, PartialEq, Eq)]
#[error("'{0}' is not a valid python version, expected something like 3.12, 312 or py312")]
pub struct ParseInterpreterTagError(pub String);

/// A python minor version.
///
/// `3.12`, `312` and `py312` all parse to the same tag, which displays as
/// `3.12`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterpreterTag {
    major: u8,
    minor: u8,
}

impl InterpreterTag {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// The tag as it appears inside conda build strings (`py312`).
    pub fn build_string_tag(&self) -> String {
        format!("py{}{}", self.major, self.minor)
    }

    /// Find the interpreter a build was made for by looking at its build
    /// string. `noarch: python` builds (`py_0`, `pyhd8ed1ab_0`) carry none.
    pub fn from_build_string(build: &str) -> Option<Self> {
        let captures = BUILD_STRING_PYTHON.captures(build)?;
        Some(Self {
            major: captures[1].parse().ok()?,
            minor: captures[2].parse().ok()?,
        })
    }
}

impl FromStr for InterpreterTag {
    type Err = ParseInterpreterTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseInterpreterTagError(s.to_string());
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix("py").unwrap_or(trimmed);

        let (major, minor) = match digits.split_once('.') {
            Some(parts) => parts,
            None if digits.len() >= 2 => digits.split_at(1),
            None => return Err(err()),
        };
        if minor.is_empty() || !major.chars().chain(minor.chars()).all(|c| c.is_ascii_digit()) {
            return Err(err());
        }

        Ok(Self {
            major: major.parse().map_err(|_| err())?,
            minor: minor.parse().map_err(|_| err())?,
        })
    }
}

impl fmt::Display for InterpreterTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl<'de> Deserialize<'de> for InterpreterTag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        serde_untagged::UntaggedEnumVisitor::new()
            .string(|s| InterpreterTag::from_str(s).map_err(serde::de::Error::custom))
            .u64(|n| InterpreterTag::from_str(&n.to_string()).map_err(serde::de::Error::custom))
            .f64(|f| {
                Err(serde::de::Error::custom(format!(
                    "python version {f} must be quoted, otherwise 3.10 reads as 3.1"
                )))
            })
            .deserialize(deserializer)
    }
}

/// True when `version` names a pre-release (`1.0a1`, `2.0rc1`, `1.1.dev0`).
///
/// Any alphabetic segment counts except `post`, which marks a post-release of
/// a final version.
pub fn is_prerelease(version: &str) -> bool {
    ALPHA_SEGMENT
        .find_iter(version)
        .any(|segment| !segment.as_str().eq_ignore_ascii_case("post"))
}

/// Per-package knobs that affect where and how a package is built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildFlags {
    /// Platforms this package must never be built on.
    pub excluded_platforms: HashSet<Platform>,
    /// Platforms this package may be built on. `None` defers to the recipe
    /// template, and then to "everywhere".
    pub platforms: Option<HashSet<Platform>>,
    /// Interpreters this package is built for. `None` defers to the recipe
    /// template, and then to the baseline interpreters.
    pub pythons: Option<BTreeSet<InterpreterTag>>,
    /// Extra constraint on python, e.g. `>=3.10`.
    pub python_requirement: Option<String>,
    /// Extra constraint on numpy, e.g. `>=1.26`.
    pub numpy_requirement: Option<String>,
    pub numpy_compiled_extensions: bool,
    pub setup_options: Option<String>,
    pub include_extras: bool,
}

impl BuildFlags {
    /// Whether `platform` is eligible. `fallback` is the set declared by a
    /// recipe template and only applies when no set is declared here.
    pub fn platform_allowed(
        &self,
        platform: Platform,
        fallback: Option<&HashSet<Platform>>,
    ) -> bool {
        if self.excluded_platforms.contains(&platform) {
            return false;
        }
        match self.platforms.as_ref().or(fallback) {
            Some(allowed) => allowed.contains(&platform),
            None => true,
        }
    }

    /// Whether `interpreter` is eligible, falling back to the template's set
    /// and then to `baseline`.
    pub fn interpreter_allowed(
        &self,
        interpreter: InterpreterTag,
        fallback: Option<&BTreeSet<InterpreterTag>>,
        baseline: &[InterpreterTag],
    ) -> bool {
        match self.pythons.as_ref().or(fallback) {
            Some(allowed) => allowed.contains(&interpreter),
            None => baseline.contains(&interpreter),
        }
    }

    /// The python and numpy specs that are appended to existing recipes.
    pub fn injected_requirements(&self) -> Vec<String> {
        let mut specs = Vec::new();
        if let Some(python) = non_empty(self.python_requirement.as_deref()) {
            specs.push(format!("python {python}"));
        }
        if let Some(numpy) = non_empty(self.numpy_requirement.as_deref()) {
            specs.push(format!("numpy {numpy}"));
        }
        specs
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// A package the user wants on the destination channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageDescriptor {
    name: String,
    pinned_version: Option<String>,
    build_flags: BuildFlags,
}

impl PackageDescriptor {
    pub fn new(name: impl Into<String>, pinned_version: Option<String>) -> Self {
        Self {
            name: name.into(),
            pinned_version: pinned_version
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            build_flags: BuildFlags::default(),
        }
    }

    pub fn with_build_flags(mut self, build_flags: BuildFlags) -> Self {
        self.build_flags = build_flags;
        self
    }

    /// The upstream spelling, used for PyPI and feedstock lookups.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The lowercase name used on conda channels and for recipe directories.
    pub fn registry_name(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn pinned_version(&self) -> Option<&str> {
        self.pinned_version.as_deref()
    }

    pub fn build_flags(&self) -> &BuildFlags {
        &self.build_flags
    }

    /// Only pinned versions can be judged up front; unpinned packages are
    /// checked once their upstream version is known.
    pub fn is_prerelease(&self) -> bool {
        self.pinned_version.as_deref().is_some_and(is_prerelease)
    }
}

/// A version written either as a string or as a bare YAML integer.
///
/// Bare decimals are rejected: YAML reads `0.10` as the float `0.1`.
struct LooseVersion(String);

impl<'de> Deserialize<'de> for LooseVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        serde_untagged::UntaggedEnumVisitor::new()
            .string(|s| Ok(LooseVersion(s.to_string())))
            .u64(|n| Ok(LooseVersion(n.to_string())))
            .i64(|n| Ok(LooseVersion(n.to_string())))
            .f64(|f| {
                Err(serde::de::Error::custom(format!(
                    "version {f} must be quoted, otherwise 0.10 reads as 0.1"
                )))
            })
            .deserialize(deserializer)
    }
}

#[derive(Deserialize)]
struct RawEntry {
    name: String,
    #[serde(default)]
    version: Option<LooseVersion>,
    #[serde(default)]
    python: Option<String>,
    #[serde(default)]
    numpy_build_restrictions: Option<String>,
    #[serde(default)]
    numpy_compiled_extensions: bool,
    #[serde(default)]
    setup_options: Option<String>,
    #[serde(default)]
    excluded_platforms: Vec<Platform>,
    #[serde(default)]
    platforms: Option<Vec<Platform>>,
    #[serde(default)]
    pythons: Option<Vec<InterpreterTag>>,
    #[serde(default)]
    include_extras: bool,
}

impl From<RawEntry> for PackageDescriptor {
    fn from(entry: RawEntry) -> Self {
        let flags = BuildFlags {
            excluded_platforms: entry.excluded_platforms.into_iter().collect(),
            platforms: entry.platforms.map(|p| p.into_iter().collect()),
            pythons: entry.pythons.map(|p| p.into_iter().collect()),
            python_requirement: entry.python,
            numpy_requirement: entry.numpy_build_restrictions,
            numpy_compiled_extensions: entry.numpy_compiled_extensions,
            setup_options: entry.setup_options,
            include_extras: entry.include_extras,
        };
        PackageDescriptor::new(entry.name.trim(), entry.version.map(|v| v.0)).with_build_flags(flags)
    }
}

/// Parse the desired-state document, keeping the order of the entries.
pub fn parse_desired_state(text: &str) -> Result<Vec<PackageDescriptor>, DescriptorError> {
    let value: serde_yaml::Value = serde_yaml::from_str(text)?;
    let packages: Vec<PackageDescriptor> = match value {
        serde_yaml::Value::Null => Vec::new(),
        serde_yaml::Value::Sequence(_) => serde_yaml::from_value::<Vec<RawEntry>>(value)?
            .into_iter()
            .map(PackageDescriptor::from)
            .collect(),
        serde_yaml::Value::Mapping(_) => {
            serde_yaml::from_value::<IndexMap<String, Option<LooseVersion>>>(value)?
                .into_iter()
                .map(|(name, version)| PackageDescriptor::new(name.trim(), version.map(|v| v.0)))
                .collect()
        }
        _ => return Err(DescriptorError::UnexpectedShape),
    };

    let mut seen = HashSet::new();
    for (idx, package) in packages.iter().enumerate() {
        if package.name.is_empty() {
            return Err(DescriptorError::EmptyName(idx));
        }
        if !seen.insert(package.registry_name()) {
            return Err(DescriptorError::Duplicate(package.name.clone()));
        }
    }

    Ok(packages)
}

/// Read and parse the desired-state file at `path`.
pub fn read_desired_state(path: &Path) -> Result<Vec<PackageDescriptor>, DescriptorError> {
    let text = fs_err::read_to_string(path).map_err(|source| DescriptorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_desired_state(&text)
}
