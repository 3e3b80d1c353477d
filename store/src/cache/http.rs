//! Binary cache behind an HTTP(S) server, the classic deployment.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::cache::backend::CacheBackend;
use crate::error::{Error, Result};
use crate::transfer::{FileTransfer, FileTransferRequest, TransferError};

pub struct HttpCacheBackend {
    base: url::Url,
    transfer: Arc<FileTransfer>,
    verify_tls: bool,
}

impl HttpCacheBackend {
    pub fn new(base: url::Url, transfer: Arc<FileTransfer>) -> Self {
        HttpCacheBackend {
            base,
            transfer,
            verify_tls: true,
        }
    }

    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    fn key_url(&self, key: &str) -> Result<String> {
        Ok(self
            .base
            .join(key)
            .map_err(|e| Error::UsageError(format!("bad cache key {key:?}: {e}")))?
            .to_string())
    }

    fn request(&self, key: &str) -> Result<FileTransferRequest> {
        let mut request = FileTransferRequest::get(self.key_url(key)?);
        request.verify_tls = self.verify_tls;
        Ok(request)
    }
}

fn map_missing(key: &str, e: TransferError) -> Error {
    match e {
        // some object stores answer 403 for absent keys when listing
        // is disabled; treat both as a miss
        TransferError::NotFound { .. } | TransferError::Forbidden { .. } => {
            Error::NoSuchCacheFile(key.to_string())
        }
        e => e.into(),
    }
}

#[async_trait]
impl CacheBackend for HttpCacheBackend {
    fn url(&self) -> String {
        let mut url = self.base.to_string();
        while url.ends_with('/') {
            url.pop();
        }
        url
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        let mut request = self.request(key)?;
        request.head = true;
        match self.transfer.enqueue(request).await {
            Ok(_) => Ok(true),
            Err(TransferError::NotFound { .. } | TransferError::Forbidden { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_file(&self, key: &str, data: Vec<u8>, mime: &str) -> Result<()> {
        let mut request = FileTransferRequest::put(self.key_url(key)?, data, mime);
        request.verify_tls = self.verify_tls;
        self.transfer.enqueue(request).await?;
        Ok(())
    }

    async fn get_file(&self, key: &str) -> Result<Vec<u8>> {
        let result = self
            .transfer
            .enqueue(self.request(key)?)
            .await
            .map_err(|e| map_missing(key, e))?;
        Ok(result.data)
    }

    async fn get_file_reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let reader = self
            .transfer
            .download_reader(self.request(key)?)
            .await
            .map_err(|e| map_missing(key, e))?;
        Ok(Box::new(reader))
    }
}
