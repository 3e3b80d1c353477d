//! HTTP file transfer: the narrow interface every network backend
//! goes through.
//!
//! One shared [FileTransfer] per process gives connection reuse and a
//! global concurrency bound. Only `Transient` failures are retried,
//! with jittered exponential backoff.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::Semaphore;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument, warn};

use crate::settings::Settings;

#[derive(Clone, Debug)]
pub struct FileTransferRequest {
    pub uri: String,
    pub headers: Vec<(String, String)>,
    /// When set and still valid, the server replies 304 and `cached`
    /// is returned instead of data.
    pub expected_etag: Option<String>,
    /// Body to upload; its presence makes this a PUT unless `post`.
    pub data: Option<Vec<u8>>,
    pub mime_type: Option<String>,
    pub verify_tls: bool,
    pub head: bool,
    /// Use POST (APIs like the IPFS daemon want POST even for reads).
    pub post: bool,
    /// Retry attempts; 0 inherits the transfer's configured default.
    pub tries: usize,
    /// Base backoff delay; zero inherits the configured default.
    pub base_retry_delay: Duration,
}

impl FileTransferRequest {
    pub fn get(uri: impl Into<String>) -> Self {
        FileTransferRequest {
            uri: uri.into(),
            headers: vec![],
            expected_etag: None,
            data: None,
            mime_type: None,
            verify_tls: true,
            head: false,
            post: false,
            tries: 0,
            base_retry_delay: Duration::ZERO,
        }
    }

    pub fn post(uri: impl Into<String>, data: Option<Vec<u8>>) -> Self {
        FileTransferRequest {
            post: true,
            data,
            ..Self::get(uri)
        }
    }

    pub fn head(uri: impl Into<String>) -> Self {
        FileTransferRequest {
            head: true,
            ..Self::get(uri)
        }
    }

    pub fn put(uri: impl Into<String>, data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        FileTransferRequest {
            data: Some(data),
            mime_type: Some(mime_type.into()),
            ..Self::get(uri)
        }
    }
}

#[derive(Debug, Default)]
pub struct FileTransferResult {
    pub data: Vec<u8>,
    pub etag: Option<String>,
    /// Every URL visited in the redirect chain.
    pub urls_visited: Vec<String>,
    /// True iff `expected_etag` was still valid (no data returned).
    pub cached: bool,
    /// Target of a `Link: <...>; rel="immutable"` header, if any.
    pub immutable_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{uri} does not exist")]
    NotFound { uri: String },
    #[error("access to {uri} was forbidden")]
    Forbidden { uri: String },
    #[error("transient failure fetching {uri}: {reason}")]
    Transient { uri: String, reason: String },
    #[error("failed to fetch {uri}: {reason}")]
    Misc { uri: String, reason: String },
    #[error("transfer interrupted")]
    Interrupted,
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient { .. })
    }
}

pub struct FileTransfer {
    client: reqwest::Client,
    /// Only built on demand for `verify_tls = false` requests.
    insecure_client: reqwest::Client,
    permits: Arc<Semaphore>,
    tries: usize,
    base_retry_delay: Duration,
}

impl FileTransfer {
    pub fn new(settings: &Settings) -> crate::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("nixstore/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(25));
        if let Some(cert_file) = &settings.ssl_cert_file {
            let pem = std::fs::read(cert_file)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| crate::Error::UsageError(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(FileTransfer {
            client: builder.build().map_err(client_build_error)?,
            insecure_client: reqwest::Client::builder()
                .user_agent(concat!("nixstore/", env!("CARGO_PKG_VERSION")))
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(client_build_error)?,
            permits: Arc::new(Semaphore::new(settings.http_connections.max(1))),
            tries: settings.download_attempts,
            base_retry_delay: settings.base_retry_delay,
        })
    }

    /// Run the request, buffering the response body. Retries transient
    /// failures per the request's schedule.
    #[instrument(skip(self, request), fields(uri = %request.uri))]
    pub async fn enqueue(
        &self,
        request: FileTransferRequest,
    ) -> Result<FileTransferResult, TransferError> {
        let strategy = self.strategy_for(&request);

        RetryIf::spawn(
            strategy,
            || self.attempt(&request),
            |e: &TransferError| {
                let retry = e.is_transient();
                if retry {
                    warn!(error = %e, "retrying transfer");
                }
                retry
            },
        )
        .await
    }

    async fn attempt(
        &self,
        request: &FileTransferRequest,
    ) -> Result<FileTransferResult, TransferError> {
        let _permit = self.permit().await?;
        let response = self.send(request).await?;

        if request.expected_etag.is_some() && response.status() == StatusCode::NOT_MODIFIED {
            return Ok(FileTransferResult {
                cached: true,
                etag: request.expected_etag.clone(),
                urls_visited: vec![request.uri.clone()],
                ..Default::default()
            });
        }

        let mut result = FileTransferResult {
            etag: header_string(&response, reqwest::header::ETAG),
            immutable_url: immutable_link(&response),
            urls_visited: visited(&request.uri, &response),
            ..Default::default()
        };

        let response = check_status(&request.uri, response)?;
        result.data = response
            .bytes()
            .await
            .map_err(|e| body_error(&request.uri, e))?
            .to_vec();
        Ok(result)
    }

    /// Run a GET, handing back a streaming reader over the body. The
    /// status line is checked (and retried) before the stream starts;
    /// mid-stream failures surface as read errors.
    #[instrument(skip(self, request), fields(uri = %request.uri))]
    pub async fn download_reader(
        &self,
        request: FileTransferRequest,
    ) -> Result<impl AsyncRead + Send + Unpin, TransferError> {
        let strategy = self.strategy_for(&request);

        let response = RetryIf::spawn(
            strategy,
            || async {
                let _permit = self.permit().await?;
                let response = self.send(&request).await?;
                check_status(&request.uri, response)
            },
            TransferError::is_transient,
        )
        .await?;

        let permit = self.permit().await?;
        let uri = request.uri.clone();
        let stream = response
            .bytes_stream()
            .map_err(move |e| io::Error::new(io::ErrorKind::Other, body_error(&uri, e)));
        Ok(StreamReader::new(PermitStream {
            inner: stream,
            _permit: permit,
        }))
    }

    pub async fn exists(&self, uri: &str) -> Result<bool, TransferError> {
        match self.enqueue(FileTransferRequest::head(uri)).await {
            Ok(_) => Ok(true),
            Err(TransferError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn strategy_for(
        &self,
        request: &FileTransferRequest,
    ) -> impl Iterator<Item = Duration> {
        let tries = if request.tries == 0 {
            self.tries
        } else {
            request.tries
        };
        let base = if request.base_retry_delay.is_zero() {
            self.base_retry_delay
        } else {
            request.base_retry_delay
        };
        ExponentialBackoff::from_millis(2)
            .factor(base.as_millis().max(1) as u64 / 2)
            .map(jitter)
            .take(tries.saturating_sub(1))
    }

    async fn permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit, TransferError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::Interrupted)
    }

    async fn send(
        &self,
        request: &FileTransferRequest,
    ) -> Result<reqwest::Response, TransferError> {
        let client = if request.verify_tls {
            &self.client
        } else {
            &self.insecure_client
        };

        let method = if request.head {
            Method::HEAD
        } else if request.post {
            Method::POST
        } else if request.data.is_some() {
            Method::PUT
        } else {
            Method::GET
        };

        let mut builder = client.request(method, &request.uri);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(etag) = &request.expected_etag {
            builder = builder.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(mime) = &request.mime_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, mime);
        }
        if let Some(data) = &request.data {
            builder = builder.body(data.clone());
        }

        debug!("sending request");
        builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                TransferError::Transient {
                    uri: request.uri.clone(),
                    reason: e.to_string(),
                }
            } else {
                TransferError::Misc {
                    uri: request.uri.clone(),
                    reason: e.to_string(),
                }
            }
        })
    }
}

pin_project_lite::pin_project! {
    /// Holds a connection permit for as long as the body stream lives.
    struct PermitStream<S> {
        #[pin]
        inner: S,
        _permit: tokio::sync::OwnedSemaphorePermit,
    }
}

impl<S: Stream<Item = io::Result<Bytes>>> Stream for PermitStream<S> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

fn check_status(uri: &str, response: reqwest::Response) -> Result<reqwest::Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => TransferError::NotFound {
            uri: uri.to_string(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransferError::Forbidden {
            uri: uri.to_string(),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => TransferError::Transient {
            uri: uri.to_string(),
            reason: status.to_string(),
        },
        s if s.is_server_error() => TransferError::Transient {
            uri: uri.to_string(),
            reason: status.to_string(),
        },
        s => TransferError::Misc {
            uri: uri.to_string(),
            reason: s.to_string(),
        },
    })
}

fn body_error(uri: &str, e: reqwest::Error) -> TransferError {
    if e.is_timeout() {
        TransferError::Transient {
            uri: uri.to_string(),
            reason: e.to_string(),
        }
    } else {
        TransferError::Misc {
            uri: uri.to_string(),
            reason: e.to_string(),
        }
    }
}

fn client_build_error(e: reqwest::Error) -> crate::Error {
    crate::Error::UsageError(format!("failed to construct HTTP client: {e}"))
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn immutable_link(response: &reqwest::Response) -> Option<String> {
    let link = header_string(response, reqwest::header::LINK)?;
    // e.g.: <https://cache.example/ipfs/Qm...>; rel="immutable"
    for part in link.split(',') {
        let part = part.trim();
        if part.contains("rel=\"immutable\"") {
            let url = part.split(';').next()?.trim();
            return Some(url.trim_start_matches('<').trim_end_matches('>').to_string());
        }
    }
    None
}

fn visited(original: &str, response: &reqwest::Response) -> Vec<String> {
    let final_url = response.url().to_string();
    if final_url == original {
        vec![final_url]
    } else {
        vec![original.to_string(), final_url]
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{FileTransferRequest, TransferError};

    #[test]
    fn request_constructors() {
        let get = FileTransferRequest::get("http://example.com/a");
        assert!(!get.head && get.data.is_none());

        let head = FileTransferRequest::head("http://example.com/a");
        assert!(head.head);

        let put = FileTransferRequest::put("http://example.com/a", b"x".to_vec(), "text/plain");
        assert_eq!(put.mime_type.as_deref(), Some("text/plain"));
    }

    // only Transient may be retried
    #[rstest]
    #[case::not_found(TransferError::NotFound { uri: "u".into() }, false)]
    #[case::forbidden(TransferError::Forbidden { uri: "u".into() }, false)]
    #[case::transient(TransferError::Transient { uri: "u".into(), reason: "r".into() }, true)]
    #[case::misc(TransferError::Misc { uri: "u".into(), reason: "r".into() }, false)]
    #[case::interrupted(TransferError::Interrupted, false)]
    fn error_classification_is_stable(#[case] error: TransferError, #[case] retried: bool) {
        assert_eq!(error.is_transient(), retried);
    }
}
