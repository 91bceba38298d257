//! Defaults shared by the commands.

use crate::package::InterpreterTag;

/// Interpreters packages are built for unless they or their template say otherwise.
pub const BASELINE_PYTHONS: [InterpreterTag; 2] =
    [InterpreterTag::new(3, 12), InterpreterTag::new(3, 13)];

/// The channel packages are mirrored to.
pub const DEFAULT_DEST_CHANNEL: &str = "astropy";

/// The channel packages are copied from and whose feedstocks are reused.
pub const UPSTREAM_CHANNEL: &str = "conda-forge";

/// The GitHub organisation holding the upstream feedstocks.
pub const FEEDSTOCK_ORGANISATION: &str = "conda-forge";

pub const DEFAULT_REGISTRY_API_URL: &str = "https://api.anaconda.org/";

pub const DEFAULT_PYPI_INDEX_URL: &str = "https://pypi.org/pypi/";

pub const GITHUB_URL: &str = "https://github.com/";

pub const GITHUB_API_URL: &str = "https://api.github.com/";
