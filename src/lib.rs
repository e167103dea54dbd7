//! # coffer — block-incremental backup/restore engine
//!
//! Engine guarantees (frozen for repository format 5):
//! - All multi-byte integers in block maps are base-128 LE varints; signed
//!   values are zig-zag mapped.  Never negotiated
//! - A block-incremental object is `[ payload || map ]`; the map length is
//!   carried in the manifest, never inferred
//! - Every block checksum is truncated SHA-1 of the plaintext; file-level
//!   checksums are full 40-hex SHA-1
//! - Manifests and info files are keyed text with a mandatory checksum over
//!   the canonical serialization, stored as primary + `.copy` pairs
//! - `backrest-format` MUST equal 5; readers fail immediately on anything
//!   else — no partial decode, no fallback
//! - WAL segment names order lexicographically within one timeline only;
//!   no engine routine compares segments across timelines
//! - A restored block-incremental file is verified block-by-block against
//!   the plan before any byte is handed out

pub mod error;
pub mod varint;
pub mod chunked;
pub mod filter;
pub mod storage;
pub mod keyval;
pub mod blockmap;
pub mod wal;
pub mod manifest;
pub mod info;
pub mod delta;
pub mod writer;
pub mod backup;
pub mod restore;
pub mod verify;

/// Repository format generation; everything here reads and writes format 5.
pub const REPOSITORY_FORMAT: u64 = 5;

// Flat re-exports for the most common types.
pub use blockmap::{BlockMap, BlockMapItem};
pub use delta::{DeltaPlan, DeltaReader, DeltaWrite};
pub use error::{Error, Result};
pub use filter::{Compress, FilterPipeline};
pub use info::{ArchiveInfo, BackupInfo};
pub use manifest::{BackupType, ClusterInfo, Label, Manifest};
pub use storage::{MemoryStorage, PosixStorage, Storage};
pub use verify::{verify, VerifyOptions, VerifyReport};
pub use wal::{WalRange, WalSegment};
pub use writer::BlockIncrWriter;
