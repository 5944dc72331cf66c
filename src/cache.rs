//! Content-addressed span caches.
//!
//! Keys are digest strings; the compressed and uncompressed representations of
//! a span live in logical namespaces encoded in the key itself
//! ([`uncompressed_key`]), so no namespace support is assumed of a backend.
//! `put` is idempotent; keys are content-addressed, so re-putting a key is
//! only legal with equal bytes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Key of the uncompressed representation of a span whose compressed bytes
/// hash to `digest`.
pub fn uncompressed_key(digest: &str) -> String {
    format!("u:{digest}")
}

#[async_trait]
pub trait SpanCache: Send + Sync {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Read `[offset, offset + length)` of the entry, clamped to the entry's
    /// size. Missing keys fail with [`Error::CacheMiss`], distinguishable
    /// from backend failures.
    async fn get(&self, key: &str, offset: u64, length: u64) -> Result<Bytes>;

    /// Release resources. Subsequent operations fail with
    /// [`Error::CacheClosed`].
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<T: SpanCache + ?Sized> SpanCache for Arc<T> {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        (**self).put(key, data).await
    }

    async fn get(&self, key: &str, offset: u64, length: u64) -> Result<Bytes> {
        (**self).get(key, offset, length).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

fn clamp_range(len: usize, offset: u64, length: u64) -> (usize, usize) {
    let start = (offset as usize).min(len);
    let end = start.saturating_add(length as usize).min(len);
    (start, end)
}

/// Unbounded in-memory cache. Entries live until `close`.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Bytes>>,
    closed: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::CacheClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl SpanCache for MemoryCache {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.check_open()?;
        trace!(key, bytes = data.len(), "memory cache put");
        self.entries
            .write()
            .await
            .insert(key.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn get(&self, key: &str, offset: u64, length: u64) -> Result<Bytes> {
        self.check_open()?;
        let entries = self.entries.read().await;
        let entry = entries.get(key).ok_or_else(|| Error::CacheMiss {
            key: key.to_string(),
        })?;
        let (start, end) = clamp_range(entry.len(), offset, length);
        trace!(key, start, end, "memory cache hit");
        Ok(entry.slice(start..end))
    }

    async fn close(&self) -> Result<()> {
        self.check_open()?;
        self.closed.store(true, Ordering::Release);
        self.entries.write().await.clear();
        Ok(())
    }
}

/// Disk-backed cache: each entry is a file under the root directory named by
/// the sha256 of its key.
pub struct DirectoryCache {
    root: PathBuf,
    closed: AtomicBool,
}

impl DirectoryCache {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "directory cache ready");
        Ok(Self {
            root,
            closed: AtomicBool::new(false),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(Sha256::digest(key.as_bytes())))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::CacheClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl SpanCache for DirectoryCache {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let path = self.path_for(key);
        if tokio::fs::try_exists(&path).await? {
            // Content-addressed: an existing entry already holds these bytes.
            trace!(key, "directory cache put skipped, entry exists");
            return Ok(());
        }
        tokio::fs::write(&path, data).await?;
        trace!(key, bytes = data.len(), "directory cache put");
        Ok(())
    }

    async fn get(&self, key: &str, offset: u64, length: u64) -> Result<Bytes> {
        #[cfg(unix)]
        use std::os::unix::fs::FileExt;

        self.check_open()?;
        let path = self.path_for(key);
        let key_owned = key.to_string();
        let data = tokio::task::spawn_blocking(move || -> Result<Bytes> {
            let file = match std::fs::File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::CacheMiss { key: key_owned });
                }
                Err(e) => return Err(e.into()),
            };
            let file_len = file.metadata()?.len() as usize;
            let (start, end) = clamp_range(file_len, offset, length);
            let mut buf = vec![0u8; end - start];
            let mut filled = 0usize;
            while filled < buf.len() {
                let n = file.read_at(&mut buf[filled..], (start + filled) as u64)?;
                if n == 0 {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "cache entry shrank during read",
                    )));
                }
                filled += n;
            }
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        trace!(key, bytes = data.len(), "directory cache hit");
        Ok(data)
    }

    async fn close(&self) -> Result<()> {
        self.check_open()?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
