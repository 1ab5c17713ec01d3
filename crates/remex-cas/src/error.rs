// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use remex_pips::{ContentHash, HashError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CasError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("content hash mismatch: declared {expected}, actual {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("content {0} not found")]
    NotFound(ContentHash),

    #[error("{0} is a sentinel hash and names no content")]
    SpecialHash(ContentHash),

    #[error("invalid content hash: {0}")]
    InvalidHash(#[from] HashError),

    #[error("store file stream: {0}")]
    Stream(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type CasResult<T> = Result<T, CasError>;
