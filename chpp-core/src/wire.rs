//! App header codec: fixed 6-byte header (handle, type, transaction, error, command LE) via bincode.

use serde::{Deserialize, Serialize};

use crate::protocol::{AppErrorCode, MessageType};

/// Encoded size of [`AppHeader`].
pub const HEADER_LEN: usize = 6;

/// Header prefixed to every app-layer datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppHeader {
    /// Target/source endpoint handle.
    pub handle: u8,
    pub message_type: MessageType,
    /// Incremented per request by the sender, echoed by the response.
    pub transaction: u8,
    pub error: AppErrorCode,
    /// Index into the sender's outgoing request slots.
    pub command: u16,
}

impl AppHeader {
    /// Encode into a fresh header-sized buffer.
    pub fn encode(&self) -> Result<Vec<u8>, HeaderEncodeError> {
        let out = bincode::serialize(self)?;
        debug_assert_eq!(out.len(), HEADER_LEN);
        Ok(out)
    }

    /// Overwrite the header prefix of `datagram`.
    pub fn write_into(&self, datagram: &mut [u8]) -> Result<(), HeaderEncodeError> {
        if datagram.len() < HEADER_LEN {
            return Err(HeaderEncodeError::BufferTooShort(datagram.len()));
        }
        bincode::serialize_into(&mut datagram[..HEADER_LEN], self)?;
        Ok(())
    }

    /// Decode the header at the front of `datagram`. Trailing payload is ignored.
    pub fn decode(datagram: &[u8]) -> Result<Self, HeaderDecodeError> {
        if datagram.len() < HEADER_LEN {
            return Err(HeaderDecodeError::TooShort(datagram.len()));
        }
        let header: AppHeader = bincode::deserialize(&datagram[..HEADER_LEN])?;
        Ok(header)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("buffer of {0} bytes cannot hold an app header")]
    BufferTooShort(usize),
}

/// Error decoding an app header (truncated datagram or unknown message type).
#[derive(Debug, thiserror::Error)]
pub enum HeaderDecodeError {
    #[error("datagram of {0} bytes is shorter than an app header")]
    TooShort(usize),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
