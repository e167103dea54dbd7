//! Verify worker pool — per-file checksum jobs over a channel-fed thread set.
//!
//! The dispatcher is single-threaded; concurrency exists only at the job
//! boundary.  Jobs flow out over one channel, results return keyed over
//! another, and workers never share state beyond the repository handle.
//! Deterministic verdicts (missing, checksum, size) return immediately;
//! transient failures walk the configured retry-sleep list, and the first
//! failure's message is the one retained.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};
use log::{debug, warn};
use sha1::{Digest, Sha1};

use crate::error::Error;
use crate::filter::FilterPipeline;
use crate::storage::Storage;

/// One per-file verification job.
#[derive(Debug, Clone)]
pub struct VerifyJob {
    /// Result key, `<archive-id>/<path>` or `<label>/<path>`.
    pub key:               String,
    /// Repository object to read.
    pub path:              String,
    /// Bundle extent when the file shares its object.
    pub range:             Option<(u64, u64)>,
    pub pipeline:          FilterPipeline,
    /// Expected SHA-1 of the decoded content, 40 hex digits.
    pub expected_checksum: String,
    /// Expected decoded size; `None` skips the size check.
    pub expected_size:     Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Ok,
    FileMissing,
    ChecksumMismatch,
    SizeInvalid,
    Other(String),
}

impl JobResult {
    fn retryable(&self) -> bool {
        matches!(self, JobResult::Other(_))
    }
}

/// Run every job and collect results by key.
pub fn run_jobs(
    storage: &dyn Storage,
    jobs:    Vec<VerifyJob>,
    workers: usize,
    retries: &[Duration],
) -> HashMap<String, JobResult> {
    if jobs.is_empty() {
        return HashMap::new();
    }
    let workers = if workers == 0 { num_cpus::get() } else { workers }.min(jobs.len());

    let (job_tx, job_rx) = bounded::<VerifyJob>(workers * 2);
    let (result_tx, result_rx) = unbounded::<(String, JobResult)>();
    let total = jobs.len();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for job in job_rx.iter() {
                    let result = execute_with_retry(storage, &job, retries);
                    if result_tx.send((job.key, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(job_rx);
        drop(result_tx);

        for job in jobs {
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);

        let mut results = HashMap::with_capacity(total);
        for (key, result) in result_rx.iter() {
            if !matches!(result, JobResult::Ok) {
                debug!("verify job '{key}': {result:?}");
            }
            results.insert(key, result);
        }
        results
    })
}

fn execute_with_retry(
    storage: &dyn Storage,
    job:     &VerifyJob,
    retries: &[Duration],
) -> JobResult {
    let first = execute(storage, job);
    if !first.retryable() {
        return first;
    }
    for (attempt, sleep) in retries.iter().enumerate() {
        std::thread::sleep(*sleep);
        warn!(
            "retrying '{}' (attempt {}) after: {first:?}",
            job.key,
            attempt + 2
        );
        match execute(storage, job) {
            // Keep the first failure's message when retries keep failing.
            JobResult::Other(_) => {}
            good => return good,
        }
    }
    first
}

fn execute(storage: &dyn Storage, job: &VerifyJob) -> JobResult {
    let stored = match job.range {
        Some((offset, size)) => storage.read_range(&job.path, offset, size),
        None                 => storage.read(&job.path),
    };
    let stored = match stored {
        Ok(bytes) => bytes,
        Err(Error::FileMissing(_)) => return JobResult::FileMissing,
        Err(e) => return JobResult::Other(e.to_string()),
    };

    let decoded = match job.pipeline.decode(&stored) {
        Ok(bytes) => bytes,
        Err(Error::Crypto) => return JobResult::Other("decrypt failed".to_owned()),
        // A broken compression frame means the stored bytes are corrupt.
        Err(_) => return JobResult::ChecksumMismatch,
    };

    if let Some(expected) = job.expected_size {
        if decoded.len() as u64 != expected {
            return JobResult::SizeInvalid;
        }
    }

    if hex::encode(Sha1::digest(&decoded)) != job.expected_checksum {
        return JobResult::ChecksumMismatch;
    }
    JobResult::Ok
}
