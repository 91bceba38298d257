//! Checksums of source distributions and their validation.

use std::{collections::HashMap, path::Path};

use rattler_digest::{Md5, Md5Hash, Sha256, Sha256Hash, compute_file_digest, parse_digest_from_hex};

/// Checksum information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    /// A SHA256 checksum
    Sha256(Sha256Hash),
    /// A MD5 checksum
    Md5(Md5Hash),
}

impl Checksum {
    /// Pick the strongest checksum out of an index's digest map
    /// (`{"sha256": "...", "md5": "..."}`).
    pub fn from_digests(digests: &HashMap<String, String>) -> Option<Self> {
        if let Some(sha256) = digests
            .get("sha256")
            .and_then(|hex| parse_digest_from_hex::<Sha256>(hex))
        {
            return Some(Checksum::Sha256(sha256));
        }
        digests
            .get("md5")
            .and_then(|hex| parse_digest_from_hex::<Md5>(hex))
            .map(Checksum::Md5)
    }

    /// Get the checksum as a hex string.
    pub fn to_hex(&self) -> String {
        match self {
            Checksum::Sha256(sha256) => hex::encode(sha256),
            Checksum::Md5(md5) => hex::encode(md5),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Checksum::Sha256(_) => "sha256",
            Checksum::Md5(_) => "md5",
        }
    }

    /// Validate the checksum of a file.
    pub fn validate(&self, path: &Path) -> std::io::Result<bool> {
        let computed = match self {
            Checksum::Sha256(_) => hex::encode(compute_file_digest::<Sha256>(path)?),
            Checksum::Md5(_) => hex::encode(compute_file_digest::<Md5>(path)?),
        };
        let expected = self.to_hex();

        if computed != expected {
            tracing::error!(
                "{} values of downloaded file not matching!\nDownloaded = {}, should be {}",
                self.kind().to_uppercase(),
                computed,
                expected
            );
            Ok(false)
        } else {
            tracing::debug!("Validated {} of {}", self.kind(), path.display());
            Ok(true)
        }
    }
}
