//! The object-backend abstraction every remote cache sits on: string
//! keys to byte blobs, no locking, last writer wins.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Stable identity of this cache, used as the disk-cache key.
    fn url(&self) -> String;

    /// HEAD/stat equivalent.
    async fn file_exists(&self, key: &str) -> Result<bool>;

    /// Idempotent write; a later write overwrites.
    async fn upsert_file(&self, key: &str, data: Vec<u8>, mime: &str) -> Result<()>;

    /// Fetch a whole object. Fails with
    /// [Error::NoSuchCacheFile](crate::Error::NoSuchCacheFile) when
    /// the key is absent.
    async fn get_file(&self, key: &str) -> Result<Vec<u8>>;

    /// Streaming fetch; the default buffers via [get_file](Self::get_file).
    async fn get_file_reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let data = self.get_file(key).await?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    /// Make pending writes durable / visible. Most backends are
    /// synchronous already.
    async fn sync(&self) -> Result<()> {
        Ok(())
    }
}
