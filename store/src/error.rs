//! The engine's error taxonomy.
//!
//! Expected misses (a path not in a cache, a stale disk-cache row) are
//! modelled as `Ok(None)` by the functions that produce them;
//! everything here represents an actual failure. `Transient` failures
//! are retried by the layer that issued the request and only surface
//! when retries are exhausted.

use std::path::PathBuf;

use nixwire::store_path::StorePath;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("path {0} is not valid")]
    InvalidPath(StorePath),

    #[error(transparent)]
    BadArchive(#[from] nixwire::nar::Error),

    #[error("bad hash: {0}")]
    BadHash(#[from] nixwire::hash::Error),

    #[error("artifact {path} is corrupt: hash of contents is {actual}, recorded {expected}")]
    CorruptArtifact {
        path: StorePath,
        expected: String,
        actual: String,
    },

    #[error("no trusted signature on path info for {0}")]
    SignatureMismatch(StorePath),

    #[error("cache file {0:?} does not exist")]
    NoSuchCacheFile(String),

    #[error("builder for {drv} {status}; last log lines in {log_path:?}")]
    BuildError {
        drv: StorePath,
        status: String,
        log_path: Option<PathBuf>,
    },

    #[error("substituter failed for {path}: {reason}")]
    SubstError { path: StorePath, reason: String },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("interrupted by user")]
    Interrupted,

    #[error("{0}")]
    UsageError(String),

    #[error(transparent)]
    Transfer(#[from] crate::transfer::TransferError),

    #[error("object store: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error(transparent)]
    StorePath(#[from] nixwire::store_path::Error),

    #[error(transparent)]
    Expr(#[from] nixwire::expr::Error),

    #[error(transparent)]
    Ca(#[from] nixwire::ca::Error),

    #[error("narinfo: {0}")]
    NarInfo(#[from] nixwire::narinfo::Error),

    #[error("key: {0}")]
    Key(#[from] nixwire::narinfo::KeyError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying at the issuing layer can help.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Error::Transfer(e) => e.is_transient(),
            _ => false,
        }
    }
}
