//! Binary cache in a local directory. Writes are atomic renames so a
//! concurrent reader never observes a half-written object.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::cache::backend::CacheBackend;
use crate::error::{Error, Result};

pub struct LocalCacheBackend {
    root: PathBuf,
}

impl LocalCacheBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("nar"))?;
        Ok(LocalCacheBackend { root })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl CacheBackend for LocalCacheBackend {
    fn url(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(key)).await?)
    }

    async fn upsert_file(&self, key: &str, data: Vec<u8>, _mime: &str) -> Result<()> {
        let dest = self.object_path(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dir = dest.parent().unwrap_or(Path::new("/")).to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            std::io::Write::write_all(&mut tmp, &data)?;
            tmp.persist(&dest).map_err(|e| Error::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::UsageError(format!("backend task panicked: {e}")))?
    }

    async fn get_file(&self, key: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.object_path(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NoSuchCacheFile(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_file_reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        match tokio::fs::File::open(self.object_path(key)).await {
            Ok(file) => Ok(Box::new(tokio::io::BufReader::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NoSuchCacheFile(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
