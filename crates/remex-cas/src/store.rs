// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Content store trait and the on-disk implementation.
//!
//! Layout under the store root:
//!
//! ```text
//! objects/<2 hex>/<TYPE>-<hex>   immutable content, named by its hash
//! tmp/<uuid>.partial             copies being ingested
//! ```

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use remex_pips::{hash_file, ContentHash, HashType};
use tracing::{debug, warn};

use crate::error::{CasError, CasResult};

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";

/// Outcome of pinning one hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PinResult {
    Success,
    ContentNotFound,
    Error(String),
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Checks local presence and reserves the content for this session.
    /// Never fetches from elsewhere.
    async fn pin(&self, hash: &ContentHash) -> PinResult;

    async fn exists(&self, hash: &ContentHash) -> CasResult<bool>;

    /// Ingests the file at `path` under the declared `hash` after checking
    /// the bytes actually hash to it. The file may be moved into the store.
    /// Ingesting content that is already present succeeds.
    async fn put_file(&self, hash: &ContentHash, path: &Path) -> CasResult<()>;

    /// Hashes the file at `path` and stores a copy. Returns the hash and
    /// the byte length. The original file is left in place.
    async fn store(&self, path: &Path, hash_type: HashType) -> CasResult<(ContentHash, u64)>;

    async fn read(&self, hash: &ContentHash) -> CasResult<Vec<u8>>;

    /// Ends the session: drops every reservation taken by [`pin`](Self::pin)
    /// and returns how many there were.
    fn release_pins(&self) -> usize;
}

pub struct FileSystemContentStore {
    root: PathBuf,
    pinned: Mutex<HashSet<ContentHash>>,
}

impl FileSystemContentStore {
    pub async fn open(root: impl Into<PathBuf>) -> CasResult<Self> {
        let root = root.into();
        for dir in [OBJECTS_DIR, TMP_DIR] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        debug!(operation = "cas_open", root = %root.display(), "opened content store");
        Ok(Self {
            root,
            pinned: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_pinned(&self, hash: &ContentHash) -> bool {
        self.pinned.lock().contains(hash)
    }

    pub fn object_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root
            .join(OBJECTS_DIR)
            .join(&hex[..2])
            .join(format!("{}-{}", hash.hash_type(), hex))
    }

    fn tmp_path(&self) -> PathBuf {
        self.root.join(TMP_DIR).join(format!("{}.partial", uuid::Uuid::new_v4()))
    }

    /// Moves an already verified file into its object slot.
    async fn place(&self, hash: &ContentHash, verified: &Path) -> CasResult<()> {
        let dest = self.object_path(hash);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(verified, &dest).await {
            Ok(()) => Ok(()),
            // Cross-device staging directory: copy into tmp first so the
            // final step is still an atomic rename.
            Err(e) if e.kind() == ErrorKind::CrossesDevices => {
                let tmp = self.tmp_path();
                tokio::fs::copy(verified, &tmp).await?;
                let renamed = tokio::fs::rename(&tmp, &dest).await;
                if renamed.is_err() {
                    let _ = tokio::fs::remove_file(&tmp).await;
                }
                Ok(renamed?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn hash_file_blocking(hash_type: HashType, path: &Path) -> CasResult<(ContentHash, u64)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(hash_type, &path))
        .await
        .map_err(|e| CasError::Io(std::io::Error::other(e)))?
        .map_err(CasError::from)
}

#[async_trait]
impl ContentStore for FileSystemContentStore {
    async fn pin(&self, hash: &ContentHash) -> PinResult {
        if hash.is_special() {
            return PinResult::Error(format!("{} is a sentinel hash", hash));
        }
        match self.exists(hash).await {
            Ok(true) => {
                self.pinned.lock().insert(*hash);
                PinResult::Success
            }
            Ok(false) => PinResult::ContentNotFound,
            Err(e) => PinResult::Error(e.to_string()),
        }
    }

    fn release_pins(&self) -> usize {
        let mut pinned = self.pinned.lock();
        let released = pinned.len();
        pinned.clear();
        released
    }

    async fn exists(&self, hash: &ContentHash) -> CasResult<bool> {
        Ok(tokio::fs::try_exists(self.object_path(hash)).await?)
    }

    async fn put_file(&self, hash: &ContentHash, path: &Path) -> CasResult<()> {
        if hash.is_special() {
            return Err(CasError::SpecialHash(*hash));
        }
        let (actual, length) = hash_file_blocking(hash.hash_type(), path).await?;
        if actual != *hash {
            warn!(
                operation = "cas_put_file",
                expected = %hash,
                actual = %actual,
                "rejecting content with mismatched hash"
            );
            return Err(CasError::HashMismatch {
                expected: *hash,
                actual,
            });
        }

        if self.exists(hash).await? {
            debug!(operation = "cas_put_file", hash = %hash, "content already present");
            return Ok(());
        }
        self.place(hash, path).await?;
        debug!(operation = "cas_put_file", hash = %hash, length, "ingested content");
        Ok(())
    }

    async fn store(&self, path: &Path, hash_type: HashType) -> CasResult<(ContentHash, u64)> {
        // Hash the private copy, not the original, so a concurrent writer
        // cannot make the stored bytes disagree with their name.
        let tmp = self.tmp_path();
        tokio::fs::copy(path, &tmp).await?;

        let result = async {
            let (hash, length) = hash_file_blocking(hash_type, &tmp).await?;
            if !self.exists(&hash).await? {
                self.place(&hash, &tmp).await?;
            }
            Ok((hash, length))
        }
        .await;

        if tokio::fs::try_exists(&tmp).await.unwrap_or(false) {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        if let Ok((hash, length)) = &result {
            debug!(operation = "cas_store", path = %path.display(), hash = %hash, length, "stored file");
        }
        result
    }

    async fn read(&self, hash: &ContentHash) -> CasResult<Vec<u8>> {
        match tokio::fs::read(self.object_path(hash)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CasError::NotFound(*hash)),
            Err(e) => Err(e.into()),
        }
    }
}
