// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Algorithm-tagged content hashes.

use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest;
use thiserror::Error;

pub const HASH_LENGTH: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("unknown hash type tag {0}")]
    UnknownHashType(u32),

    #[error("unknown hash type name '{0}'")]
    UnknownHashName(String),

    #[error("digest must be {HASH_LENGTH} bytes, got {0}")]
    WrongLength(usize),

    #[error("malformed content hash '{0}'")]
    Malformed(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum HashType {
    Sha256 = 1,
    #[default]
    Blake3 = 2,
}

impl HashType {
    pub fn from_wire(tag: u32) -> Result<Self, HashError> {
        match tag {
            1 => Ok(HashType::Sha256),
            2 => Ok(HashType::Blake3),
            other => Err(HashError::UnknownHashType(other)),
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            HashType::Sha256 => "SHA256",
            HashType::Blake3 => "BLAKE3",
        }
    }
}

impl FromStr for HashType {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SHA256" => Ok(HashType::Sha256),
            "BLAKE3" => Ok(HashType::Blake3),
            _ => Err(HashError::UnknownHashName(s.to_string())),
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Digest of file bytes. Two hashes are equal only when both the algorithm
/// and the digest bytes match.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash {
    hash_type: HashType,
    bytes: [u8; HASH_LENGTH],
}

impl ContentHash {
    pub const fn new(hash_type: HashType, bytes: [u8; HASH_LENGTH]) -> Self {
        Self { hash_type, bytes }
    }

    pub fn from_slice(hash_type: HashType, bytes: &[u8]) -> Result<Self, HashError> {
        let bytes: [u8; HASH_LENGTH] =
            bytes.try_into().map_err(|_| HashError::WrongLength(bytes.len()))?;
        Ok(Self { hash_type, bytes })
    }

    /// Parses the wire pair `(hash type tag, digest bytes)`.
    pub fn from_wire(tag: u32, bytes: &[u8]) -> Result<Self, HashError> {
        Self::from_slice(HashType::from_wire(tag)?, bytes)
    }

    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub fn is_untracked(&self) -> bool {
        *self == WellKnownContentHashes::UNTRACKED_FILE
    }

    /// Sentinels never name stored content.
    pub fn is_special(&self) -> bool {
        self.is_untracked() || *self == WellKnownContentHashes::ABSENT_FILE
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash_type, self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, digest) = s.split_once(':').ok_or_else(|| HashError::Malformed(s.to_string()))?;
        let bytes = hex::decode(digest).map_err(|_| HashError::Malformed(s.to_string()))?;
        Self::from_slice(kind.parse()?, &bytes)
    }
}

pub struct WellKnownContentHashes;

impl WellKnownContentHashes {
    /// Content deliberately not tracked by the build. Never pinned or
    /// uploaded, and never valid as a declared dependency of a remote pip.
    pub const UNTRACKED_FILE: ContentHash = ContentHash::new(HashType::Sha256, [0xFF; HASH_LENGTH]);

    /// The file was probed and did not exist.
    pub const ABSENT_FILE: ContentHash = ContentHash::new(HashType::Sha256, [0x00; HASH_LENGTH]);
}

/// Incremental hasher for either supported algorithm.
pub enum ContentHasher {
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl ContentHasher {
    pub fn new(hash_type: HashType) -> Self {
        match hash_type {
            HashType::Sha256 => ContentHasher::Sha256(sha2::Sha256::new()),
            HashType::Blake3 => ContentHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Sha256(h) => h.update(data),
            ContentHasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finalize(self) -> ContentHash {
        match self {
            ContentHasher::Sha256(h) => ContentHash::new(HashType::Sha256, h.finalize().into()),
            ContentHasher::Blake3(h) => ContentHash::new(HashType::Blake3, *h.finalize().as_bytes()),
        }
    }
}

pub fn hash_bytes(hash_type: HashType, data: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new(hash_type);
    hasher.update(data);
    hasher.finalize()
}

/// Hashes everything `reader` yields. Returns the hash and the byte count.
pub fn hash_reader<R: Read>(hash_type: HashType, mut reader: R) -> io::Result<(ContentHash, u64)> {
    let mut hasher = ContentHasher::new(hash_type);
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize(), total))
}

pub fn hash_file(hash_type: HashType, path: &std::path::Path) -> io::Result<(ContentHash, u64)> {
    hash_reader(hash_type, std::fs::File::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[remex_test_utils::logged_test]
    fn sha256_of_empty_input_matches_known_digest() {
        let hash = hash_bytes(HashType::Sha256, b"");
        assert_eq!(
            hash.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[remex_test_utils::logged_test]
    fn blake3_of_empty_input_matches_known_digest() {
        let hash = hash_bytes(HashType::Blake3, b"");
        assert_eq!(
            hash.to_hex(),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[remex_test_utils::logged_test]
    fn equality_includes_algorithm_tag() {
        let bytes = [7u8; HASH_LENGTH];
        assert_ne!(
            ContentHash::new(HashType::Sha256, bytes),
            ContentHash::new(HashType::Blake3, bytes)
        );
    }

    #[remex_test_utils::logged_test]
    fn display_parses_back() {
        let hash = hash_bytes(HashType::Blake3, b"hello");
        let text = hash.to_string();
        assert!(text.starts_with("BLAKE3:"));
        assert_eq!(text.parse::<ContentHash>().unwrap(), hash);
    }

    #[remex_test_utils::logged_test]
    fn wire_form_is_validated() {
        assert_eq!(ContentHash::from_wire(9, &[0; 32]), Err(HashError::UnknownHashType(9)));
        assert_eq!(ContentHash::from_wire(1, &[0; 5]), Err(HashError::WrongLength(5)));
    }

    #[remex_test_utils::logged_test]
    fn reader_hash_matches_slice_hash_and_counts_bytes() {
        let data = vec![42u8; 200_000];
        let (hash, len) = hash_reader(HashType::Sha256, data.as_slice()).unwrap();
        assert_eq!(hash, hash_bytes(HashType::Sha256, &data));
        assert_eq!(len, 200_000);
    }

    #[remex_test_utils::logged_test]
    fn file_hash_reports_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, b"remote").unwrap();
        let (hash, len) = hash_file(HashType::Blake3, &path).unwrap();
        assert_eq!(len, 6);
        assert_eq!(hash, hash_bytes(HashType::Blake3, b"remote"));
    }

    #[remex_test_utils::logged_test]
    fn sentinels_are_special() {
        assert!(WellKnownContentHashes::UNTRACKED_FILE.is_untracked());
        assert!(WellKnownContentHashes::ABSENT_FILE.is_special());
        assert!(!hash_bytes(HashType::Sha256, b"x").is_special());
    }
}
