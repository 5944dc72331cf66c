//! Random-access byte sources over the compressed layer blob.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// Positional reader over a layer blob, `pread` semantics: no cursor, short
/// reads allowed, zero return means end of blob. Implementations must support
/// concurrent reads at disjoint offsets.
#[async_trait]
pub trait BlobReader: Send + Sync {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Fill `buf` completely from `offset`, failing if the blob ends first.
    async fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let wanted = buf.len();
        let mut filled = 0usize;
        while filled < wanted {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::TruncatedBlob {
                    offset,
                    wanted,
                    got: filled,
                });
            }
            filled += n;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: BlobReader + ?Sized> BlobReader for Arc<T> {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf).await
    }
}

/// Blob held entirely in memory. The workhorse for tests and for layers small
/// enough to pin.
#[derive(Clone)]
pub struct MemoryBlobReader {
    data: Bytes,
}

impl MemoryBlobReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl BlobReader for MemoryBlobReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let take = buf.len().min((len - offset) as usize);
        buf[..take].copy_from_slice(&self.data[offset as usize..offset as usize + take]);
        Ok(take)
    }
}

/// Positional reads over a blob file on local disk.
pub struct FileBlobReader {
    file: Arc<std::fs::File>,
}

impl FileBlobReader {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }
}

#[async_trait]
impl BlobReader for FileBlobReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        #[cfg(unix)]
        use std::os::unix::fs::FileExt;

        let len = buf.len();
        if len == 0 {
            return Ok(0);
        }
        let file = Arc::clone(&self.file);
        let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut local = vec![0u8; len];
            let n = file.read_at(&mut local, offset)?;
            local.truncate(n);
            Ok(local)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_memory_reads_are_positional() {
        let reader = MemoryBlobReader::new(vec![0, 1, 2, 3, 4, 5, 6, 7]);
        let mut buf = [0u8; 3];
        assert_eq!(reader.read_at(2, &mut buf).await.unwrap(), 3);
        assert_eq!(buf, [2, 3, 4]);
        // Short read at the tail, zero at the end.
        assert_eq!(reader.read_at(6, &mut buf).await.unwrap(), 2);
        assert_eq!(reader.read_at(8, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_exact_at_detects_truncation() {
        let reader = MemoryBlobReader::new(vec![9u8; 4]);
        let mut buf = [0u8; 8];
        let err = reader.read_exact_at(0, &mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            Error::TruncatedBlob {
                wanted: 8,
                got: 4,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_file_reader_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[7u8; 100]).unwrap();
        drop(f);

        let reader = FileBlobReader::open(&path).unwrap();
        let mut buf = [0u8; 10];
        reader.read_exact_at(45, &mut buf).await.unwrap();
        assert_eq!(buf, [7u8; 10]);
    }
}
