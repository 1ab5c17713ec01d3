// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory content store used by tests and embedded agents.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use remex_pips::{hash_bytes, ContentHash, HashType};

use crate::error::{CasError, CasResult};
use crate::store::{ContentStore, PinResult};

#[derive(Default)]
struct Inner {
    objects: HashMap<ContentHash, Arc<[u8]>>,
    pinned: HashSet<ContentHash>,
}

#[derive(Default)]
pub struct InMemoryContentStore {
    inner: RwLock<Inner>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` directly and returns their hash.
    pub fn insert(&self, hash_type: HashType, bytes: &[u8]) -> ContentHash {
        let hash = hash_bytes(hash_type, bytes);
        self.inner.write().objects.entry(hash).or_insert_with(|| Arc::from(bytes));
        hash
    }

    pub fn len(&self) -> usize {
        self.inner.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pinned(&self, hash: &ContentHash) -> bool {
        self.inner.read().pinned.contains(hash)
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn pin(&self, hash: &ContentHash) -> PinResult {
        if hash.is_special() {
            return PinResult::Error(format!("{} is a sentinel hash", hash));
        }
        let mut inner = self.inner.write();
        if inner.objects.contains_key(hash) {
            inner.pinned.insert(*hash);
            PinResult::Success
        } else {
            PinResult::ContentNotFound
        }
    }

    async fn exists(&self, hash: &ContentHash) -> CasResult<bool> {
        Ok(self.inner.read().objects.contains_key(hash))
    }

    async fn put_file(&self, hash: &ContentHash, path: &Path) -> CasResult<()> {
        if hash.is_special() {
            return Err(CasError::SpecialHash(*hash));
        }
        let bytes = tokio::fs::read(path).await?;
        let actual = hash_bytes(hash.hash_type(), &bytes);
        if actual != *hash {
            return Err(CasError::HashMismatch {
                expected: *hash,
                actual,
            });
        }
        self.inner.write().objects.entry(actual).or_insert_with(|| Arc::from(bytes));
        let _ = tokio::fs::remove_file(path).await;
        Ok(())
    }

    async fn store(&self, path: &Path, hash_type: HashType) -> CasResult<(ContentHash, u64)> {
        let bytes = tokio::fs::read(path).await?;
        let length = bytes.len() as u64;
        Ok((self.insert(hash_type, &bytes), length))
    }

    async fn read(&self, hash: &ContentHash) -> CasResult<Vec<u8>> {
        self.inner
            .read()
            .objects
            .get(hash)
            .map(|bytes| bytes.to_vec())
            .ok_or(CasError::NotFound(*hash))
    }

    fn release_pins(&self) -> usize {
        let mut inner = self.inner.write();
        let released = inner.pinned.len();
        inner.pinned.clear();
        released
    }
}
