//! Node protocol carried in request and response frames

use crate::error::{FabricError, FabricResult};
use bytes::Bytes;
use fleetstore_common::types::BlockId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Requests sent by the control plane (or a peer node) to a storage node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRequest {
    /// Store a whole block. Keyed by block id: repeating the write
    /// replaces the same block rather than creating a second one.
    WriteBlock { block: BlockId, data: Bytes, crc32c: u32 },
    ReadBlock { block: BlockId },
    ReadRange { block: BlockId, offset: u64, len: u64 },
    /// Remove blocks; missing ids are not an error
    DeleteBlocks { blocks: Vec<BlockId> },
    Ping,
    /// Echo the payload back, used by bandwidth diagnostics
    SelfTest { payload: Bytes },
}

impl NodeRequest {
    /// Requests that move block data use the streaming timeout
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        matches!(
            self,
            Self::WriteBlock { .. } | Self::ReadBlock { .. } | Self::ReadRange { .. } | Self::SelfTest { .. }
        )
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WriteBlock { .. } => "write_block",
            Self::ReadBlock { .. } => "read_block",
            Self::ReadRange { .. } => "read_range",
            Self::DeleteBlocks { .. } => "delete_blocks",
            Self::Ping => "ping",
            Self::SelfTest { .. } => "self_test",
        }
    }

    /// Build a write request, computing the checksum
    #[must_use]
    pub fn write(block: BlockId, data: Bytes) -> Self {
        let crc32c = crc32c::crc32c(&data);
        Self::WriteBlock { block, data, crc32c }
    }
}

/// Successful responses from a storage node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeResponse {
    /// The block is durably stored
    Written { block: BlockId, size: u64 },
    Data { block: BlockId, data: Bytes, crc32c: u32 },
    Deleted { count: u64 },
    Pong,
    SelfTest { payload: Bytes },
}

impl NodeResponse {
    #[must_use]
    pub fn data(block: BlockId, data: Bytes) -> Self {
        let crc32c = crc32c::crc32c(&data);
        Self::Data { block, data, crc32c }
    }

    /// Extract block data, verifying its checksum
    pub fn into_data(self) -> FabricResult<Bytes> {
        match self {
            Self::Data { block, data, crc32c } => {
                let actual = crc32c::crc32c(&data);
                if actual == crc32c {
                    Ok(data)
                } else {
                    Err(FabricError::Remote(RemoteError::new(
                        RemoteErrorCode::Corrupt,
                        format!("checksum mismatch for block {block}: expected {crc32c:08x}, got {actual:08x}"),
                    )))
                }
            }
            other => Err(FabricError::UnexpectedResponse(format!("expected data, got {other:?}"))),
        }
    }
}

/// Failure classes reported by a storage node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorCode {
    NotFound,
    Corrupt,
    Io,
    BadRequest,
}

impl fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::Corrupt => "corrupt",
            Self::Io => "io",
            Self::BadRequest => "bad request",
        };
        f.write_str(s)
    }
}

/// Error carried in an `Error` frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::NotFound, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::Io, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::BadRequest, message)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}

pub(crate) fn encode<T: Serialize>(value: &T) -> FabricResult<Bytes> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> FabricResult<T> {
    Ok(bincode::deserialize(body)?)
}
