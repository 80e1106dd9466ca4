//! Artifact digests

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Supported digest algorithms, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha512,
    Sha256,
    Sha1,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha512 => "sha512",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha1 => "sha1",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha512" => Some(DigestAlgorithm::Sha512),
            "sha256" => Some(DigestAlgorithm::Sha256),
            "sha1" => Some(DigestAlgorithm::Sha1),
            _ => None,
        }
    }

    /// Hex digest of `data`
    pub fn compute(&self, data: &[u8]) -> String {
        use sha2::Digest;
        match self {
            DigestAlgorithm::Sha512 => hex::encode(sha2::Sha512::digest(data)),
            DigestAlgorithm::Sha256 => hex::encode(sha2::Sha256::digest(data)),
            DigestAlgorithm::Sha1 => hex::encode(sha1::Sha1::digest(data)),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calculate SHA256 hash of data
pub fn sha256_hash(data: &[u8]) -> String {
    DigestAlgorithm::Sha256.compute(data)
}

/// Digests an upstream registry publishes for a file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpectedDigest(BTreeMap<DigestAlgorithm, String>);

impl ExpectedDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, algorithm: DigestAlgorithm, hex_digest: impl Into<String>) -> Self {
        self.insert(algorithm, hex_digest);
        self
    }

    pub fn insert(&mut self, algorithm: DigestAlgorithm, hex_digest: impl Into<String>) {
        self.0
            .insert(algorithm, hex_digest.into().trim().to_ascii_lowercase());
    }

    /// Build from a `{algorithm name: hex}` map, ignoring unknown algorithms
    pub fn from_named<'a>(hashes: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let mut digest = Self::new();
        for (name, value) in hashes {
            if let Some(algorithm) = DigestAlgorithm::from_name(name) {
                digest.insert(algorithm, value.as_str());
            }
        }
        digest
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Strongest algorithm available together with its expected value
    pub fn strongest(&self) -> Option<(DigestAlgorithm, &str)> {
        self.0.iter().next().map(|(a, v)| (*a, v.as_str()))
    }
}

/// Check `data` against the strongest available digest. An empty digest set never
/// verifies.
pub fn verify(data: &[u8], expected: &ExpectedDigest) -> bool {
    match expected.strongest() {
        Some((algorithm, value)) => algorithm.compute(data) == value,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
    const HELLO_SHA1: &str = "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed";

    #[test]
    fn test_sha256_hash() {
        assert_eq!(sha256_hash(b"hello world"), HELLO_SHA256);
    }

    #[test]
    fn test_strongest_digest_wins() {
        let expected = ExpectedDigest::new()
            .with(DigestAlgorithm::Sha1, HELLO_SHA1)
            .with(DigestAlgorithm::Sha512, "00");
        assert_eq!(expected.strongest().map(|(a, _)| a), Some(DigestAlgorithm::Sha512));
        // sha1 matches but the stronger sha512 does not
        assert!(!verify(b"hello world", &expected));
    }

    #[test]
    fn test_verify_matches_case_insensitively() {
        let expected = ExpectedDigest::new().with(DigestAlgorithm::Sha256, HELLO_SHA256.to_uppercase());
        assert!(verify(b"hello world", &expected));
        assert!(!verify(b"hello world!", &expected));
    }

    #[test]
    fn test_empty_digest_never_verifies() {
        assert!(!verify(b"anything", &ExpectedDigest::new()));
    }

    #[test]
    fn test_from_named_ignores_unknown() {
        let hashes: BTreeMap<String, String> = [
            ("sha1".to_string(), HELLO_SHA1.to_string()),
            ("md5".to_string(), "5eb63bbbe01eeed093cb22bb8f5acdc3".to_string()),
        ]
        .into_iter()
        .collect();
        let expected = ExpectedDigest::from_named(&hashes);
        assert_eq!(expected.strongest(), Some((DigestAlgorithm::Sha1, HELLO_SHA1)));
        assert!(verify(b"hello world", &expected));
    }
}
