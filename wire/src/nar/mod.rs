//! The NAR ("Nix archive") canonical serialization of a file-system
//! object tree.
//!
//! The format is deterministic: dumping the same tree twice produces
//! byte-identical output, which is what makes NAR hashes meaningful.
//! See [wire] for the framing, [writer] for serialization from a real
//! file system, [reader] for the streaming parser and its event sink,
//! and [restore] for materializing a parsed archive back on disk.

use std::path::PathBuf;

use thiserror::Error;

pub mod reader;
pub mod restore;
pub mod wire;
pub mod writer;

pub use reader::{copy_nar, parse, NullSink, ParseOptions, ParseSink};
pub use restore::{restore, restore_with, RestoreSink};
pub use writer::{dump, DumpOptions};

/// Suffix appended to the N-th case-colliding directory entry when the
/// case hack is enabled (case-insensitive file systems, i.e. macOS).
pub const CASE_HACK_SUFFIX: &str = "~nix~case~hack~";

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad archive: {0}")]
    BadArchive(String),
    #[error("file {0:?} has an unsupported type")]
    UnsupportedFileType(PathBuf),
    #[error("case collision between {0:?} and {1:?}")]
    CaseCollision(PathBuf, PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn bad(reason: impl Into<String>) -> Self {
        Error::BadArchive(reason.into())
    }
}
