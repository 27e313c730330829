//! Length-delimited message framing.
//!
//! Each frame is a `u32` little-endian payload length followed by the bincode
//! encoding of one message.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Maximum payload size of a remote signer message.
pub const MAX_REMOTE_SIGNER_MSG_SIZE: usize = 1024 * 10;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("end of stream")]
    Eof,

    #[error("frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("couldn't decode message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("couldn't encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether the stream position is still at a frame boundary, i.e. the next
    /// frame can be read as if nothing happened.
    pub fn is_skippable(&self) -> bool {
        matches!(self, CodecError::FrameTooLarge { .. } | CodecError::Decode(_))
    }
}

/// Read one framed message.
///
/// Oversized frames are drained from the stream before the error is returned,
/// so the reader stays aligned on frame boundaries.
pub fn read_msg<R, T>(reader: &mut R, max_size: usize) -> Result<T, CodecError>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(CodecError::Eof),
        Err(e) => return Err(e.into()),
    }
    let msg_len = u32::from_le_bytes(len_buf) as usize;

    if msg_len > max_size {
        io::copy(&mut reader.by_ref().take(msg_len as u64), &mut io::sink())?;
        return Err(CodecError::FrameTooLarge {
            len: msg_len,
            max: max_size,
        });
    }

    let mut msg_buf = vec![0u8; msg_len];
    match reader.read_exact(&mut msg_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(CodecError::Eof),
        Err(e) => return Err(e.into()),
    }

    bincode::deserialize(&msg_buf).map_err(CodecError::Decode)
}

/// Write one framed message and flush the writer.
pub fn write_msg<W, T>(writer: &mut W, msg: &T, max_size: usize) -> Result<(), CodecError>
where
    W: Write,
    T: Serialize,
{
    let payload = bincode::serialize(msg).map_err(CodecError::Encode)?;
    if payload.len() > max_size {
        return Err(CodecError::FrameTooLarge {
            len: payload.len(),
            max: max_size,
        });
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}
