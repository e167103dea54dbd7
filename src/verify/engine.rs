//! The staged verify algorithm.
//!
//! Stage A loads and cross-checks the info files.  Stage B enumerates
//! backups (pulling in everything a filtered backup references).  Stage C
//! lists WAL per archive-id, drops duplicates, and folds the survivors into
//! contiguous ranges.  Stage D dispatches one checksum job per WAL file and
//! per directly-stored backup file.  Stage E reduces: job failures become
//! per-scope counters, inter-range WAL gaps intersect each backup's archive
//! range, and files deferred to a prior backup inherit that backup's verdict
//! once its own file verification is complete.

use std::collections::{BTreeMap, HashMap};

use log::warn;

use crate::filter::{derive_key, Compress, FilterPipeline};
use crate::info::{ArchiveInfo, BackupInfo};
use crate::keyval::COPY_EXT;
use crate::manifest::{Label, Manifest, MANIFEST_FILE};
use crate::storage::Storage;
use crate::wal::{self, build_ranges, WalFileName, WalRange, WalSegment};

use super::pool::{run_jobs, JobResult, VerifyJob};
use super::{ArchiveResult, BackupResult, BackupStatus, VerifyOptions, VerifyReport};

/// Loaded state for one backup under verification.
struct BackupWork {
    result:   BackupResult,
    manifest: Option<Manifest>,
}

/// Attribution for a dispatched WAL job.
struct WalJobRef {
    archive_idx: usize,
    segment:     WalSegment,
}

/// Attribution for a dispatched backup-file job.
struct FileJobRef {
    label: Label,
    name:  String,
}

pub fn verify(storage: &dyn Storage, opts: &VerifyOptions) -> VerifyReport {
    let mut report = VerifyReport::new(&opts.stanza);

    // ── Stage A: info files ──────────────────────────────────────────────────
    let backup_info = match BackupInfo::load(storage) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!("backup.info: {e}");
            report.error("No usable backup.info file");
            None
        }
    };
    let archive_info = match ArchiveInfo::load(storage) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!("archive.info: {e}");
            report.error("No usable archive.info file");
            None
        }
    };

    if backup_info.is_none() && archive_info.is_none() {
        report.finalize();
        return report;
    }
    if let (Some(b), Some(a)) = (&backup_info, &archive_info) {
        if b.history != a.history {
            report.error("backup.info and archive.info cluster histories differ");
        }
    }

    let backup_key = cipher_key(backup_info.as_ref().and_then(|i| i.cipher_pass.as_deref()), opts);
    let archive_key =
        cipher_key(archive_info.as_ref().and_then(|i| i.cipher_pass.as_deref()), opts);

    let pg_version = backup_info
        .as_ref()
        .map(|i| i.db.version.as_str())
        .or_else(|| archive_info.as_ref().map(|i| i.db.version.as_str()))
        .and_then(|v| wal::pg_version_num(v).ok())
        .unwrap_or(150000);

    // ── Stage B: enumerate work ──────────────────────────────────────────────
    let on_disk: Vec<Label> = storage
        .list("backup")
        .unwrap_or_default()
        .iter()
        .filter_map(|name| Label::parse(name).ok())
        .collect();
    let newest = on_disk.last().cloned();

    let mut work: BTreeMap<Label, BackupWork> = BTreeMap::new();
    let mut archive_range: Option<(WalSegment, WalSegment)> =
        match (&opts.archive_start, &opts.archive_stop) {
            (Some(start), Some(stop)) => Some((start.clone(), stop.clone())),
            _ => None,
        };

    let selected: Vec<Label> = match &opts.backup_label {
        None => on_disk.clone(),
        Some(filter) => {
            if !on_disk.contains(filter) {
                report.error(format!("backup '{filter}' not found in the repository"));
                Vec::new()
            } else {
                // Recursively pull in every referenced backup.
                let mut selected = vec![filter.clone()];
                let mut queue = vec![filter.clone()];
                while let Some(label) = queue.pop() {
                    if let Ok(manifest) = Manifest::load(storage, &label) {
                        if label == *filter {
                            if let (Some(start), Some(stop)) = (
                                manifest.data.archive_start.clone(),
                                manifest.data.archive_stop.clone(),
                            ) {
                                archive_range = Some((start, stop));
                            }
                        }
                        for reference in manifest.reference_list() {
                            if !selected.contains(reference) && on_disk.contains(reference) {
                                selected.push(reference.clone());
                                queue.push(reference.clone());
                            }
                        }
                    }
                }
                selected.sort();
                selected
            }
        }
    };

    for label in &selected {
        work.insert(label.clone(), load_backup(storage, label, &newest, &backup_info, &mut report));
    }

    // ── Stage C: WAL ranges per archive-id ───────────────────────────────────
    let mut archives: Vec<ArchiveResult> = Vec::new();
    let mut archive_ranges: Vec<Vec<WalRange>> = Vec::new();
    let mut jobs: Vec<VerifyJob> = Vec::new();
    let mut wal_refs: HashMap<String, WalJobRef> = HashMap::new();

    if archive_info.is_some() {
        let archive_ids: Vec<String> = storage
            .list("archive")
            .unwrap_or_default()
            .into_iter()
            .filter(|name| name != "archive.info" && *name != format!("archive.info{COPY_EXT}"))
            .collect();

        for archive_id in archive_ids {
            let mut result = ArchiveResult::new(&archive_id);
            let archive_idx = archives.len();

            // Collect candidate files keyed by (segment, partial) so
            // duplicates surface regardless of checksum or extension.
            let mut candidates: BTreeMap<(WalSegment, bool), Vec<(String, WalFileName)>> =
                BTreeMap::new();
            for tl_dir in storage.list(&format!("archive/{archive_id}")).unwrap_or_default() {
                for file in storage
                    .list(&format!("archive/{archive_id}/{tl_dir}"))
                    .unwrap_or_default()
                {
                    let Some(parsed) = WalFileName::parse(&file) else {
                        continue;
                    };
                    if let Some((start, stop)) = &archive_range {
                        let seg = &parsed.segment;
                        if !seg.same_timeline(start)
                            || seg.as_str() < start.as_str()
                            || seg.as_str() > stop.as_str()
                        {
                            continue;
                        }
                    }
                    let path = format!("archive/{archive_id}/{tl_dir}/{file}");
                    candidates
                        .entry((parsed.segment.clone(), parsed.partial))
                        .or_default()
                        .push((path, parsed));
                }
            }

            let mut range_segments: Vec<WalSegment> = Vec::new();
            for ((segment, partial), copies) in candidates {
                if copies.len() > 1 {
                    // Skip all copies; log one error.
                    report.error(format!("duplicate WAL '{segment}'"));
                    continue;
                }
                let (path, parsed) = copies.into_iter().next().unwrap();
                if !partial {
                    range_segments.push(segment.clone());
                }

                result.total_wal += 1;
                let key = path.trim_start_matches("archive/").to_owned();
                wal_refs.insert(key.clone(), WalJobRef { archive_idx, segment });
                jobs.push(VerifyJob {
                    key,
                    path,
                    range: None,
                    pipeline: FilterPipeline::new(parsed.compress).with_key(archive_key),
                    expected_checksum: parsed.checksum,
                    expected_size: (!partial).then_some(opts.wal_segment_size),
                });
            }

            archive_ranges.push(build_ranges(&range_segments, opts.wal_segment_size, pg_version));
            archives.push(result);
        }
    }

    // ── Stage D: backup file jobs ────────────────────────────────────────────
    let mut file_refs: HashMap<String, FileJobRef> = HashMap::new();

    for (label, backup) in &mut work {
        let Some(manifest) = &backup.manifest else {
            continue;
        };
        if manifest.files.is_empty() {
            backup.result.mark_invalid();
            report.error(format!("backup '{label}' contains no files"));
            continue;
        }
        for (name, entry) in &manifest.files {
            backup.result.total_files += 1;
            if entry.size == 0 {
                backup.result.valid_files += 1;
                continue;
            }
            if entry.reference.as_ref().is_some_and(|r| r != label) {
                continue; // deferred to the prior backup's verdict
            }

            // Block-incremental objects verify their stored form; plain
            // objects decode through the backup's filter pipeline and verify
            // the plaintext checksum.
            let (pipeline, expected_checksum, expected_size) = if entry.is_block_incr() {
                let Some(checksum_repo) = entry.checksum_repo.clone() else {
                    continue;
                };
                (FilterPipeline::new(Compress::None), checksum_repo, entry.size_repo)
            } else {
                let Some(checksum) = entry.checksum.clone() else {
                    continue;
                };
                (
                    FilterPipeline::new(manifest.data.compress).with_key(backup_key),
                    checksum,
                    Some(entry.size),
                )
            };

            let key = format!("{label}/{name}");
            file_refs.insert(key.clone(), FileJobRef { label: label.clone(), name: name.clone() });
            jobs.push(VerifyJob {
                key,
                path: manifest.file_repo_path(name, entry),
                range: entry
                    .bundle_offset
                    .zip(entry.size_repo)
                    .filter(|_| entry.is_bundled()),
                pipeline,
                expected_checksum,
                expected_size,
            });
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────
    let results = run_jobs(storage, jobs, opts.workers, &opts.retries);

    // ── Stage E: reduce ──────────────────────────────────────────────────────
    let mut invalid_segments: Vec<Vec<WalSegment>> = vec![Vec::new(); archives.len()];
    for (key, job_ref) in &wal_refs {
        let Some(result) = results.get(key) else { continue };
        let archive = &mut archives[job_ref.archive_idx];
        match result {
            JobResult::Ok => archive.valid_wal += 1,
            JobResult::FileMissing => {
                // Expire may legitimately remove an archived segment mid-run.
                warn!("WAL '{key}' disappeared during verification");
            }
            other => {
                match other {
                    JobResult::ChecksumMismatch => archive.counters.checksum_invalid += 1,
                    JobResult::SizeInvalid      => archive.counters.size_invalid += 1,
                    _                           => archive.counters.other += 1,
                }
                report.job_error_total += 1;
                invalid_segments[job_ref.archive_idx].push(job_ref.segment.clone());
            }
        }
    }

    for (archive_idx, ranges) in archive_ranges.iter().enumerate() {
        // Invalid segments charge every backup whose archive range covers
        // them; ranges are sorted by stop, first with stop ≥ segment wins.
        for segment in &invalid_segments[archive_idx] {
            let covered = ranges
                .iter()
                .any(|r| r.stop.as_str() >= segment.as_str() && r.contains(segment));
            if covered {
                for backup in work.values_mut() {
                    charge_segment(backup, segment);
                }
            }
        }

        // Inter-range gaps plus a final unbounded gap, per timeline.
        let mut by_timeline: BTreeMap<&str, Vec<&WalRange>> = BTreeMap::new();
        for range in ranges {
            by_timeline.entry(range.start.timeline()).or_default().push(range);
        }
        for ranges in by_timeline.values() {
            for pair in ranges.windows(2) {
                let gap_start = pair[0].stop.next(opts.wal_segment_size, pg_version);
                let gap_stop = pair[1].start.clone();
                if gap_start.as_str() >= gap_stop.as_str() {
                    continue;
                }
                update_wal_files_missing(
                    &mut work,
                    &mut report,
                    &gap_start,
                    Some(&gap_stop),
                    opts.wal_segment_size,
                    pg_version,
                );
            }
            let last = ranges.last().unwrap();
            update_wal_files_missing(
                &mut work,
                &mut report,
                &last.stop.next(opts.wal_segment_size, pg_version),
                None,
                opts.wal_segment_size,
                pg_version,
            );
        }
    }

    // Direct file results first; inheritance runs as a separate pass once
    // every backup's own files have a verdict.
    for (key, job_ref) in &file_refs {
        let Some(result) = results.get(key) else { continue };
        let backup = work.get_mut(&job_ref.label).unwrap();
        apply_file_result(backup, &mut report, &job_ref.name, result, true);
    }
    for backup in work.values_mut() {
        backup.result.file_verify_complete = true;
    }

    // Reference inheritance: a deferred file takes the prior backup's verdict
    // without being re-read.
    let labels: Vec<Label> = work.keys().cloned().collect();
    for label in &labels {
        let Some(manifest) = work[label].manifest.clone() else { continue };
        for (name, entry) in &manifest.files {
            let Some(reference) = &entry.reference else { continue };
            if reference == label || entry.size == 0 {
                continue;
            }
            let inherited = match work.get(reference) {
                Some(prior) if prior.result.file_verify_complete => prior
                    .result
                    .invalid_files
                    .iter()
                    .find(|f| f.path == *name)
                    .map(|f| f.reason.clone()),
                _ => {
                    // The referenced backup was never verified (deleted or
                    // filtered out unexpectedly); the file cannot be trusted.
                    Some("reference not verified".to_owned())
                }
            };
            let backup = work.get_mut(label).unwrap();
            match inherited {
                None => backup.result.valid_files += 1,
                Some(reason) => {
                    let result = match reason.as_str() {
                        "missing"          => JobResult::FileMissing,
                        "checksum invalid" => JobResult::ChecksumMismatch,
                        "size invalid"     => JobResult::SizeInvalid,
                        other              => JobResult::Other(other.to_owned()),
                    };
                    // Already counted once when the prior backup failed.
                    apply_file_result(backup, &mut report, name, &result, false);
                }
            }
        }
    }

    report.archives = archives;
    report.backups = work.into_values().map(|b| b.result).collect();
    report.finalize();
    report
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn cipher_key(pass: Option<&str>, opts: &VerifyOptions) -> Option<[u8; 32]> {
    pass.and_then(|p| derive_key(p, opts.stanza.as_bytes()).ok())
}

fn load_backup(
    storage:     &dyn Storage,
    label:       &Label,
    newest:      &Option<Label>,
    backup_info: &Option<BackupInfo>,
    report:      &mut VerifyReport,
) -> BackupWork {
    let mut result = BackupResult::new(label.as_str());
    let main_path = format!("backup/{label}/{MANIFEST_FILE}");
    let main_exists = storage.exists(&main_path).unwrap_or(false);

    if !main_exists {
        let in_current = backup_info
            .as_ref()
            .is_some_and(|i| i.current.contains_key(label));
        if newest.as_ref() == Some(label) && !in_current {
            // A backup being taken right now has no manifest yet.
            result.status = BackupStatus::InProgress;
            return BackupWork { result, manifest: None };
        }
    }

    match Manifest::load(storage, label) {
        Ok(manifest) => BackupWork { result, manifest: Some(manifest) },
        Err(e) => {
            result.status = BackupStatus::MissingManifest;
            report.error(format!("backup '{label}' has no usable manifest: {e}"));
            BackupWork { result, manifest: None }
        }
    }
}

fn charge_segment(backup: &mut BackupWork, segment: &WalSegment) {
    let Some(manifest) = &backup.manifest else { return };
    let (Some(start), Some(stop)) =
        (&manifest.data.archive_start, &manifest.data.archive_stop)
    else {
        return;
    };
    if start.same_timeline(segment)
        && start.as_str() <= segment.as_str()
        && segment.as_str() <= stop.as_str()
    {
        backup.result.counters.wal_invalid += 1;
        backup.result.mark_invalid();
    }
}

/// Intersect a WAL gap `[gap_start, gap_stop)` with each backup's
/// `[archive_start, archive_stop]`; the overlap (in segments) becomes
/// `wal_invalid` on the backup and counts toward the job error total.
fn update_wal_files_missing(
    work:             &mut BTreeMap<Label, BackupWork>,
    report:           &mut VerifyReport,
    gap_start:        &WalSegment,
    gap_stop:         Option<&WalSegment>,
    wal_segment_size: u64,
    pg_version:       u32,
) {
    for backup in work.values_mut() {
        let Some(manifest) = &backup.manifest else { continue };
        let (Some(start), Some(stop)) =
            (&manifest.data.archive_start, &manifest.data.archive_stop)
        else {
            continue;
        };
        if !start.same_timeline(gap_start) {
            continue;
        }

        let overlap_start = if start.as_str() > gap_start.as_str() { start } else { gap_start };
        let stop_excl = stop.next(wal_segment_size, pg_version);
        let overlap_stop = match gap_stop {
            Some(gs) if gs.as_str() < stop_excl.as_str() => gs.clone(),
            _ => stop_excl,
        };

        if overlap_start.as_str() < overlap_stop.as_str() {
            let missing = overlap_start.dist(&overlap_stop, wal_segment_size, pg_version);
            backup.result.counters.wal_invalid += missing;
            report.job_error_total += missing;
            backup.result.mark_invalid();
        }
    }
}

fn apply_file_result(
    backup:       &mut BackupWork,
    report:       &mut VerifyReport,
    name:         &str,
    result:       &JobResult,
    count_global: bool,
) {
    let reason = match result {
        JobResult::Ok => {
            backup.result.valid_files += 1;
            return;
        }
        JobResult::FileMissing => {
            backup.result.counters.missing += 1;
            "missing"
        }
        JobResult::ChecksumMismatch => {
            backup.result.counters.checksum_invalid += 1;
            "checksum invalid"
        }
        JobResult::SizeInvalid => {
            backup.result.counters.size_invalid += 1;
            "size invalid"
        }
        JobResult::Other(msg) => {
            backup.result.counters.other += 1;
            msg.as_str()
        }
    };
    backup.result.invalid_files.push(super::InvalidFile {
        path:   name.to_owned(),
        reason: reason.to_owned(),
    });
    backup.result.mark_invalid();
    if count_global {
        report.job_error_total += 1;
    }
}
