//! Crate-wide error taxonomy.
//!
//! Every engine stage reports through the same set of kinds:
//!
//! | Kind | When |
//! |------|------|
//! | `Format` | A decoded structure violates its grammar (block map, varint, manifest, info file) |
//! | `Checksum` | Computed hash does not match the stored hash |
//! | `FileMissing` | An expected object is absent from the repository |
//! | `FileOpen` / `FileRead` / `FileWrite` | The I/O layer refused or truncated |
//! | `Crypto` | Decrypt failed — wrong key or corrupted payload |
//! | `ArchiveMismatch` | Archive-id resolution found no compatible history row |
//! | `Protocol` | A worker response violated the job contract |
//!
//! Propagation policy: inside the block-map codec, the delta planner, and the
//! incremental writer an error is fatal to the *current file* only — callers
//! surface it and continue with the next file.  The verify engine demotes
//! per-file errors to result records and never aborts the run on one failure.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("format violation: {0}")]
    Format(String),

    #[error("checksum mismatch for '{name}': expected {expected}, got {actual}")]
    Checksum {
        name:     String,
        expected: String,
        actual:   String,
    },

    #[error("missing object '{0}'")]
    FileMissing(String),

    #[error("unable to open '{name}': {source}")]
    FileOpen { name: String, source: io::Error },

    #[error("unable to read '{name}': {source}")]
    FileRead { name: String, source: io::Error },

    #[error("unable to write '{name}': {source}")]
    FileWrite { name: String, source: io::Error },

    #[error("decrypt failed — wrong key or corrupted payload")]
    Crypto,

    #[error("no archive history row matches cluster version {version} system-id {system_id}")]
    ArchiveMismatch { version: String, system_id: u64 },

    #[error("worker protocol violation: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Shorthand for grammar violations.
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
