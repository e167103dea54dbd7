//! Repository verification — internal consistency of backups and their
//! covering WAL ranges.
//!
//! The engine runs in stages: load the info files, enumerate work, build WAL
//! ranges per archive-id, dispatch per-file checksum jobs to a worker pool,
//! and reconcile the results — file failures become invalid-file records, WAL
//! gaps intersect each backup's archive range, and files deferred to a prior
//! backup inherit that backup's verdict without being re-read.  A single bad
//! file never aborts the run.

mod engine;
mod output;
mod pool;

pub use engine::verify;
pub use output::{render_json, render_text};
pub use pool::{run_jobs, JobResult, VerifyJob};

use std::time::Duration;

use serde::Serialize;

use crate::manifest::Label;
use crate::wal::WalSegment;

/// Default WAL segment size (16 MiB).
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub stanza:           String,
    /// Verify only this backup (plus everything it references).
    pub backup_label:     Option<Label>,
    /// Bound WAL checking to this range; a backup filter's own range takes
    /// precedence when both are given.
    pub archive_start:    Option<WalSegment>,
    pub archive_stop:     Option<WalSegment>,
    pub wal_segment_size: u64,
    /// Worker pool size; 0 = one per CPU.
    pub workers:          usize,
    /// Sleep intervals between job retries; the list length bounds attempts.
    pub retries:          Vec<Duration>,
}

impl VerifyOptions {
    pub fn new(stanza: &str) -> Self {
        Self {
            stanza:           stanza.to_owned(),
            backup_label:     None,
            archive_start:    None,
            archive_stop:     None,
            wal_segment_size: DEFAULT_WAL_SEGMENT_SIZE,
            workers:          0,
            retries:          Vec::new(),
        }
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupStatus {
    Valid,
    Invalid,
    MissingManifest,
    InProgress,
}

/// Per-scope failure counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub missing:          u64,
    pub checksum_invalid: u64,
    pub size_invalid:     u64,
    pub wal_invalid:      u64,
    pub other:            u64,
}

impl Counters {
    pub fn total(&self) -> u64 {
        self.missing + self.checksum_invalid + self.size_invalid + self.wal_invalid + self.other
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidFile {
    pub path:   String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub label:         String,
    pub status:        BackupStatus,
    pub total_files:   u64,
    pub valid_files:   u64,
    pub counters:      Counters,
    pub invalid_files: Vec<InvalidFile>,
    /// Set once every directly-stored file of this backup has a verdict;
    /// gates reference inheritance by later backups.
    #[serde(skip)]
    pub file_verify_complete: bool,
}

impl BackupResult {
    pub fn new(label: &str) -> Self {
        Self {
            label:         label.to_owned(),
            status:        BackupStatus::Valid,
            total_files:   0,
            valid_files:   0,
            counters:      Counters::default(),
            invalid_files: Vec::new(),
            file_verify_complete: false,
        }
    }

    /// Status only ever moves toward `Invalid`; arrival order of job results
    /// cannot resurrect a backup.
    pub fn mark_invalid(&mut self) {
        if self.status == BackupStatus::Valid {
            self.status = BackupStatus::Invalid;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveResult {
    pub archive_id:  String,
    pub total_wal:   u64,
    pub valid_wal:   u64,
    pub counters:    Counters,
}

impl ArchiveResult {
    pub fn new(archive_id: &str) -> Self {
        Self {
            archive_id: archive_id.to_owned(),
            total_wal:  0,
            valid_wal:  0,
            counters:   Counters::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub stanza:          String,
    /// `ok` iff `job_error_total == 0`.
    pub status:          String,
    pub job_error_total: u64,
    pub errors:          Vec<String>,
    pub archives:        Vec<ArchiveResult>,
    pub backups:         Vec<BackupResult>,
}

impl VerifyReport {
    pub fn new(stanza: &str) -> Self {
        Self {
            stanza:          stanza.to_owned(),
            status:          "ok".to_owned(),
            job_error_total: 0,
            errors:          Vec::new(),
            archives:        Vec::new(),
            backups:         Vec::new(),
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.job_error_total += 1;
    }

    pub fn finalize(&mut self) {
        self.status = if self.job_error_total == 0 { "ok" } else { "error" }.to_owned();
    }

    pub fn is_ok(&self) -> bool {
        self.job_error_total == 0
    }
}
