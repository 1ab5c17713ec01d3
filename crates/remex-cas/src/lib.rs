// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Content-addressable storage for remote execution agents.
//!
//! [`ContentStore`] is the local cache capability. [`ContentServer`] puts
//! the PinBulk and StoreFile calls in front of any store.

pub mod error;
pub mod memory;
pub mod service;
pub mod store;

pub use error::{CasError, CasResult};
pub use memory::InMemoryContentStore;
pub use service::{now_ms, ContentServer};
pub use store::{ContentStore, FileSystemContentStore, PinResult};
