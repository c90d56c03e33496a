//! Block directory
//!
//! Each block is one file named by its block id. Writes go to a temporary
//! file renamed into place, so a repeated write of the same block replaces
//! it whole and a reader never sees a partial block.

use async_trait::async_trait;
use bytes::Bytes;
use fleetstore_common::types::BlockId;
use fleetstore_fabric::{NodeRequest, NodeResponse, RemoteError, RemoteErrorCode, RequestHandler};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

pub struct BlockDir {
    root: PathBuf,
}

fn remote(block: BlockId, e: &io::Error) -> RemoteError {
    if e.kind() == io::ErrorKind::NotFound {
        RemoteError::not_found(format!("block {block}"))
    } else {
        RemoteError::io(format!("block {block}: {e}"))
    }
}

impl BlockDir {
    /// Open (creating if needed) a block directory
    pub async fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path(&self, block: BlockId) -> PathBuf {
        self.root.join(block.to_string())
    }

    pub async fn write(&self, block: BlockId, data: &[u8]) -> io::Result<()> {
        let tmp = self.root.join(format!(".{block}.tmp"));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, self.path(block)).await
    }

    pub async fn read(&self, block: BlockId) -> io::Result<Bytes> {
        fs::read(self.path(block)).await.map(Bytes::from)
    }

    pub async fn read_range(&self, block: BlockId, offset: u64, len: u64) -> io::Result<Bytes> {
        let mut file = fs::File::open(self.path(block)).await?;
        let size = file.metadata().await?.len();
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range {offset}+{len} beyond {size} bytes"),
            ));
        }
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; usize::try_from(len).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Remove blocks, returning how many existed
    pub async fn delete(&self, blocks: &[BlockId]) -> io::Result<u64> {
        let mut removed = 0;
        for block in blocks {
            match fs::remove_file(self.path(*block)).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl RequestHandler for BlockDir {
    async fn handle(&self, request: NodeRequest) -> Result<NodeResponse, RemoteError> {
        match request {
            NodeRequest::WriteBlock { block, data, crc32c } => {
                if crc32c::crc32c(&data) != crc32c {
                    warn!(block = %block, "checksum mismatch on write");
                    return Err(RemoteError::new(RemoteErrorCode::Corrupt, format!("block {block}")));
                }
                self.write(block, &data).await.map_err(|e| remote(block, &e))?;
                debug!(block = %block, size = data.len(), "block written");
                Ok(NodeResponse::Written {
                    block,
                    size: data.len() as u64,
                })
            }
            NodeRequest::ReadBlock { block } => {
                let data = self.read(block).await.map_err(|e| remote(block, &e))?;
                Ok(NodeResponse::data(block, data))
            }
            NodeRequest::ReadRange { block, offset, len } => match self.read_range(block, offset, len).await {
                Ok(data) => Ok(NodeResponse::data(block, data)),
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => Err(RemoteError::bad_request(e.to_string())),
                Err(e) => Err(remote(block, &e)),
            },
            NodeRequest::DeleteBlocks { blocks } => {
                let count = self
                    .delete(&blocks)
                    .await
                    .map_err(|e| RemoteError::io(e.to_string()))?;
                debug!(requested = blocks.len(), count, "blocks deleted");
                Ok(NodeResponse::Deleted { count })
            }
            NodeRequest::Ping => Ok(NodeResponse::Pong),
            NodeRequest::SelfTest { payload } => Ok(NodeResponse::SelfTest { payload }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn dir() -> (TempDir, BlockDir) {
        let tmp = TempDir::new().unwrap();
        let blocks = BlockDir::open(tmp.path().join("blocks")).await.unwrap();
        (tmp, blocks)
    }

    #[tokio::test]
    async fn test_write_is_keyed_by_block() {
        let (_tmp, dir) = dir().await;
        let block = BlockId::new();
        for payload in [&b"first"[..], &b"second"[..]] {
            let response = dir
                .handle(NodeRequest::write(block, Bytes::copy_from_slice(payload)))
                .await
                .unwrap();
            assert_eq!(
                response,
                NodeResponse::Written {
                    block,
                    size: payload.len() as u64
                }
            );
        }
        assert_eq!(dir.read(block).await.unwrap(), Bytes::from_static(b"second"));
        assert_eq!(std::fs::read_dir(&dir.root).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_write_rejected() {
        let (_tmp, dir) = dir().await;
        let block = BlockId::new();
        let err = dir
            .handle(NodeRequest::WriteBlock {
                block,
                data: Bytes::from_static(b"payload"),
                crc32c: 0,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, RemoteErrorCode::Corrupt);
        assert!(dir.read(block).await.is_err());
    }

    #[tokio::test]
    async fn test_reads_and_ranges() {
        let (_tmp, dir) = dir().await;
        let block = BlockId::new();
        dir.write(block, b"0123456789").await.unwrap();

        let data = dir.handle(NodeRequest::ReadRange { block, offset: 2, len: 3 }).await.unwrap();
        assert_eq!(data.into_data().unwrap(), Bytes::from_static(b"234"));

        let err = dir
            .handle(NodeRequest::ReadRange { block, offset: 8, len: 5 })
            .await
            .unwrap_err();
        assert_eq!(err.code, RemoteErrorCode::BadRequest);

        let missing = dir.handle(NodeRequest::ReadBlock { block: BlockId::new() }).await.unwrap_err();
        assert_eq!(missing.code, RemoteErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_delete_counts_existing() {
        let (_tmp, dir) = dir().await;
        let kept = BlockId::new();
        let gone = BlockId::new();
        dir.write(kept, b"a").await.unwrap();
        dir.write(gone, b"b").await.unwrap();

        let response = dir
            .handle(NodeRequest::DeleteBlocks {
                blocks: vec![gone, BlockId::new()],
            })
            .await
            .unwrap();
        assert_eq!(response, NodeResponse::Deleted { count: 1 });
        assert!(dir.read(kept).await.is_ok());
    }
}
