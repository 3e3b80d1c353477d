//! Binary cache in IPFS, talked to through a local daemon's HTTP API.
//!
//! Objects live under one MFS directory; `sync` flushes it and, when
//! an IPNS name is configured, republishes the directory's CID under
//! that name. The writer sees its own writes immediately; other
//! readers resolving via IPNS may see the previous root until the
//! record's TTL elapses.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::cache::backend::CacheBackend;
use crate::error::{Error, Result};
use crate::transfer::{FileTransfer, FileTransferRequest, TransferError};

pub struct IpfsCacheBackend {
    /// Daemon API endpoint, e.g. `http://127.0.0.1:5001`.
    api: url::Url,
    /// MFS directory holding the cache objects.
    mfs_root: String,
    /// IPNS name to publish on [sync](CacheBackend::sync); `None`
    /// leaves the cache addressed by its changing CID only.
    ipns_name: Option<String>,
    /// Writes are refused unless explicitly allowed, since they mutate
    /// a shared published tree.
    allow_modify: bool,
    transfer: Arc<FileTransfer>,
}

#[derive(Deserialize)]
struct StatResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

impl IpfsCacheBackend {
    pub fn new(
        api: url::Url,
        mfs_root: impl Into<String>,
        ipns_name: Option<String>,
        allow_modify: bool,
        transfer: Arc<FileTransfer>,
    ) -> Self {
        IpfsCacheBackend {
            api,
            mfs_root: mfs_root.into(),
            ipns_name,
            allow_modify,
            transfer,
        }
    }

    fn api_url(&self, endpoint: &str, args: &[(&str, &str)]) -> Result<String> {
        let mut url = self
            .api
            .join(endpoint)
            .map_err(|e| Error::UsageError(format!("bad IPFS API endpoint: {e}")))?;
        url.query_pairs_mut().extend_pairs(args);
        Ok(url.to_string())
    }

    fn file_arg(&self, key: &str) -> String {
        format!("{}/{}", self.mfs_root, key)
    }

    async fn api_call(&self, endpoint: &str, args: &[(&str, &str)]) -> Result<Vec<u8>> {
        let mut request = FileTransferRequest::post(self.api_url(endpoint, args)?, None);
        // daemon errors surface as 500s; retrying those only delays
        // the miss answer
        request.tries = 1;
        Ok(self.transfer.enqueue(request).await?.data)
    }
}

/// A minimal multipart/form-data body with a single `file` part, as
/// the daemon's write endpoints expect.
fn multipart_file(data: &[u8]) -> (String, Vec<u8>) {
    let boundary = "nixstore-ipfs-boundary";
    let mut body = Vec::with_capacity(data.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"file\"; filename=\"file\"\r\n\
          Content-Type: application/octet-stream\r\n\r\n",
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

#[async_trait]
impl CacheBackend for IpfsCacheBackend {
    fn url(&self) -> String {
        match &self.ipns_name {
            Some(name) => format!("ipns://{name}"),
            None => format!("ipfs+mfs://{}", self.mfs_root.trim_start_matches('/')),
        }
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        let arg = self.file_arg(key);
        match self.api_call("/api/v0/files/stat", &[("arg", &arg)]).await {
            Ok(_) => Ok(true),
            // the daemon answers 500 for missing MFS paths, which the
            // transfer layer classifies as transient/misc; both mean
            // "not there" here
            Err(Error::Transfer(
                TransferError::Misc { .. } | TransferError::Transient { .. },
            )) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, data))]
    async fn upsert_file(&self, key: &str, data: Vec<u8>, _mime: &str) -> Result<()> {
        if !self.allow_modify {
            return Err(Error::UsageError(
                "cannot modify IPFS cache without allow-modify".to_string(),
            ));
        }

        let arg = self.file_arg(key);
        let url = self.api_url(
            "/api/v0/files/write",
            &[
                ("arg", arg.as_str()),
                ("create", "true"),
                ("parents", "true"),
                ("truncate", "true"),
            ],
        )?;
        let (mime, body) = multipart_file(&data);
        let mut request = FileTransferRequest::post(url, Some(body));
        request.mime_type = Some(mime);
        self.transfer.enqueue(request).await?;
        Ok(())
    }

    async fn get_file(&self, key: &str) -> Result<Vec<u8>> {
        let arg = self.file_arg(key);
        match self.api_call("/api/v0/files/read", &[("arg", &arg)]).await {
            Ok(data) => Ok(data),
            // the daemon answers 500 with a JSON error for missing
            // files; distinguishing would need body inspection, so a
            // read failure on a stat-less file maps to a miss
            Err(e) => {
                if self.file_exists(key).await? {
                    Err(e)
                } else {
                    Err(Error::NoSuchCacheFile(key.to_string()))
                }
            }
        }
    }

    /// Flush the MFS directory and republish it under the configured
    /// IPNS name. New writers observe the new root immediately.
    async fn sync(&self) -> Result<()> {
        let stat = self
            .api_call("/api/v0/files/stat", &[("arg", &self.mfs_root)])
            .await?;
        let stat: StatResponse = serde_json::from_slice(&stat)
            .map_err(|e| Error::UsageError(format!("unexpected files/stat reply: {e}")))?;

        if let Some(name) = &self.ipns_name {
            debug!(root = %stat.hash, name = %name, "publishing IPNS record");
            let arg = format!("/ipfs/{}", stat.hash);
            self.api_call(
                "/api/v0/name/publish",
                &[("arg", arg.as_str()), ("key", name.as_str())],
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::multipart_file;

    #[test]
    fn multipart_body_shape() {
        let (mime, body) = multipart_file(b"hello");
        assert!(mime.starts_with("multipart/form-data; boundary="));
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("Content-Disposition: form-data; name=\"file\""));
        assert!(body.contains("hello"));
        assert!(body.trim_end().ends_with("--"));
    }
}
