// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Remote execution protocol: SSZ-based communication between the build
//! orchestrator and remote agents
//!
//! One connection carries a sequence of calls, each a length-prefixed SSZ
//! [`Request`] answered by one [`Response`]. `StoreFile` is client-streamed:
//! a header message, any number of chunk messages, then `StoreFileComplete`.

pub mod endpoint;
pub mod framing;
pub mod messages;

pub use endpoint::{Endpoint, EndpointError, Transport};
pub use framing::{read_frame, write_frame, FrameError, MAX_FRAME_LEN};
pub use messages::*;

pub const PROTOCOL_VERSION: &[u8] = b"1";

/// Session id stamped into request headers. The agent serves one logical
/// build session per connection.
pub const DEFAULT_SESSION_ID: u32 = 1;

/// Payload size of a StoreFile chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

pub fn encode_ssz(data: &impl ssz::Encode) -> Vec<u8> {
    data.as_ssz_bytes()
}

pub fn decode_ssz<T: ssz::Decode>(data: &[u8]) -> Result<T, ssz::DecodeError> {
    T::from_ssz_bytes(data)
}
