//! Binary cache in an S3-compatible bucket.
//!
//! Credentials come from the usual AWS environment; the cache URL
//! carries bucket, optional key prefix, and `region` / `endpoint`
//! query parameters: `s3://bucket/prefix?region=eu-west-1`.

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::{ObjectStore, WriteMultipart};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::cache::backend::CacheBackend;
use crate::error::{Error, Result};

/// Objects at least this large are uploaded in parts.
const MULTIPART_THRESHOLD: usize = 100 * 1024 * 1024;

#[derive(Debug)]
pub struct S3CacheBackend {
    url: String,
    prefix: String,
    store: Box<dyn ObjectStore>,
}

impl S3CacheBackend {
    pub fn new(url: &url::Url) -> Result<Self> {
        let bucket = url
            .host_str()
            .ok_or_else(|| Error::UsageError(format!("S3 URL {url} has no bucket")))?;

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "region" => builder = builder.with_region(value.as_ref()),
                "endpoint" => {
                    builder = builder
                        .with_endpoint(value.as_ref())
                        .with_allow_http(value.starts_with("http://"));
                }
                "profile" => {} // resolved by from_env
                _ => {
                    return Err(Error::UsageError(format!(
                        "unsupported S3 parameter {key:?}"
                    )))
                }
            }
        }

        Ok(S3CacheBackend {
            url: format!("s3://{bucket}{}", url.path().trim_end_matches('/')),
            prefix: url.path().trim_matches('/').to_string(),
            store: Box::new(builder.build()?),
        })
    }

    fn object_path(&self, key: &str) -> object_store::path::Path {
        if self.prefix.is_empty() {
            object_store::path::Path::from(key)
        } else {
            object_store::path::Path::from(format!("{}/{}", self.prefix, key))
        }
    }
}

fn map_missing(key: &str, e: object_store::Error) -> Error {
    match e {
        object_store::Error::NotFound { .. } => Error::NoSuchCacheFile(key.to_string()),
        e => e.into(),
    }
}

#[async_trait]
impl CacheBackend for S3CacheBackend {
    fn url(&self) -> String {
        self.url.clone()
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&self.object_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_file(&self, key: &str, data: Vec<u8>, _mime: &str) -> Result<()> {
        let path = self.object_path(key);
        if data.len() >= MULTIPART_THRESHOLD {
            let upload = self.store.put_multipart(&path).await?;
            let mut write = WriteMultipart::new(upload);
            write.write(&data);
            write.finish().await?;
        } else {
            self.store.put(&path, bytes::Bytes::from(data).into()).await?;
        }
        Ok(())
    }

    async fn get_file(&self, key: &str) -> Result<Vec<u8>> {
        let result = self
            .store
            .get(&self.object_path(key))
            .await
            .map_err(|e| map_missing(key, e))?;
        Ok(result.bytes().await?.to_vec())
    }

    async fn get_file_reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let result = self
            .store
            .get(&self.object_path(key))
            .await
            .map_err(|e| map_missing(key, e))?;
        let stream = result
            .into_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::S3CacheBackend;

    #[test]
    fn url_parsing() {
        std::env::set_var("AWS_ACCESS_KEY_ID", "test");
        std::env::set_var("AWS_SECRET_ACCESS_KEY", "test");

        let url = url::Url::parse("s3://example-cache/prefix?region=eu-west-1").unwrap();
        let backend = S3CacheBackend::new(&url).unwrap();
        assert_eq!(backend.url, "s3://example-cache/prefix");
        assert_eq!(backend.object_path("x.narinfo").to_string(), "prefix/x.narinfo");

        let url = url::Url::parse("s3://example-cache?region=eu-west-1").unwrap();
        let backend = S3CacheBackend::new(&url).unwrap();
        assert_eq!(backend.object_path("x.narinfo").to_string(), "x.narinfo");

        let url = url::Url::parse("s3://example-cache?weird=1").unwrap();
        S3CacheBackend::new(&url).unwrap_err();
    }
}
