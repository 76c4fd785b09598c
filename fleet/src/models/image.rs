//! Update image models

use serde::{Deserialize, Serialize};

use crate::errors::FleetError;
use crate::utils::sha256_hex;

/// Digest algorithms accepted for image verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }
}

/// An algorithm-tagged digest, e.g. `sha256:<hex>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: String,
}

impl Checksum {
    /// Compute the sha256 checksum of in-memory data
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: ChecksumAlgorithm::Sha256,
            digest: sha256_hex(data),
        }
    }

    /// Compare against a computed hex digest (case-insensitive)
    pub fn matches_hex(&self, actual_hex: &str) -> bool {
        self.digest.eq_ignore_ascii_case(actual_hex)
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.digest)
    }
}

impl std::str::FromStr for Checksum {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((algorithm, digest)) = s.split_once(':') else {
            return Err(FleetError::ValidationError(format!(
                "checksum '{}' is not of the form <algorithm>:<hex-digest>",
                s
            )));
        };

        if algorithm != "sha256" {
            return Err(FleetError::ValidationError(format!(
                "unsupported checksum algorithm: {}",
                algorithm
            )));
        }

        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FleetError::ValidationError(format!(
                "sha256 digest must be 64 hex characters, got '{}'",
                digest
            )));
        }

        Ok(Self {
            algorithm: ChecksumAlgorithm::Sha256,
            digest: digest.to_ascii_lowercase(),
        })
    }
}

impl serde::Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A published update image. Immutable once referenced by a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateImage {
    /// Target software version
    pub version: String,

    /// Download URL for the image bytes
    pub source_url: String,

    /// Declared digest the device must reproduce before staging
    pub checksum: Checksum,

    /// Expected size, when the release pipeline knows it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    /// Base64 Ed25519 signature over the image bytes, produced at release time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// The update notification payload published to a device's update address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNotice {
    pub session_id: String,
    pub version: String,
    pub url: String,
    pub checksum: Checksum,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_checksum_parse_roundtrip() {
        let checksum: Checksum = format!("sha256:{}", DIGEST).parse().unwrap();
        assert_eq!(checksum.algorithm, ChecksumAlgorithm::Sha256);
        assert_eq!(checksum.to_string(), format!("sha256:{}", DIGEST));
    }

    #[test]
    fn test_checksum_rejects_bad_input() {
        assert!("md5:abcd".parse::<Checksum>().is_err());
        assert!("sha256:tooshort".parse::<Checksum>().is_err());
        assert!(DIGEST.parse::<Checksum>().is_err());
    }

    #[test]
    fn test_checksum_of_bytes_matches() {
        let checksum = Checksum::sha256_of(b"abc");
        assert!(checksum.matches_hex(DIGEST));
        assert!(!checksum.matches_hex("00"));
    }

    #[test]
    fn test_checksum_serde_as_string() {
        let checksum = Checksum::sha256_of(b"abc");
        let json = serde_json::to_string(&checksum).unwrap();
        assert_eq!(json, format!("\"sha256:{}\"", DIGEST));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checksum);
    }
}
