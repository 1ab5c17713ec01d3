// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Length-prefixed framing: 4-byte little-endian length, then the SSZ payload.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame unless the endpoint configures otherwise.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("SSZ decode error: {0}")]
    Decode(String),

    #[error("connection closed mid-frame")]
    Truncated,
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the connection
/// cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R, max_len: usize) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: ssz::Decode,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Truncated);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    crate::decode_ssz(&payload).map(Some).map_err(|e| FrameError::Decode(format!("{:?}", e)))
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: ssz::Encode,
{
    let payload = crate::encode_ssz(message);
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
