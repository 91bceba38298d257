//! Skeleton recipe generation for Python packages published on PyPI.
//!
//! The PyPI side is split in two: [`PyPiClient`] fetches release metadata
//! (and is the place where the source distribution and its checksum are
//! located), while [`create_recipe`] turns that metadata plus a set of
//! [`SkeletonOptions`] into a [`Recipe`] without touching the network.

mod pypi;
mod serialize;

pub use self::pypi::{
    PyPiClient, PyPiError, PyPiFile, PyPiInfo, PyPiMetadata, SkeletonOptions, create_recipe,
    format_recipe,
};
pub use self::serialize::Recipe;
