//! End-to-end repository scenarios: seeded repositories run through the
//! verify engine, and the full backup → incremental → restore cycle.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

use coffer::backup::{backup_cluster, BackupOptions};
use coffer::info::{ArchiveInfo, BackupInfo, BackupInfoEntry, HistoryRow};
use coffer::manifest::{
    BackupType, ClusterInfo, FileEntry, Label, Manifest, ManifestData, Target, TargetType,
};
use coffer::restore::{restore_backup, RestoreOptions};
use coffer::verify::{verify, BackupStatus, VerifyOptions};
use coffer::{Compress, MemoryStorage, Storage, WalSegment};

const WAL_SIZE: u64 = 65536;

fn sha(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

fn cluster() -> ClusterInfo {
    ClusterInfo { id: 1, version: "15".into(), system_id: 0x42 }
}

fn options() -> VerifyOptions {
    let mut opts = VerifyOptions::new("main");
    opts.wal_segment_size = WAL_SIZE;
    opts.workers = 2;
    opts
}

fn seed_infos(storage: &MemoryStorage, current: &[(&str, &str, &str)]) {
    let mut history = BTreeMap::new();
    history.insert(1, HistoryRow { version: "15".into(), system_id: 0x42 });

    let mut info = BackupInfo {
        db: cluster(),
        history: history.clone(),
        current: BTreeMap::new(),
        cipher_pass: None,
    };
    for (label, start, stop) in current {
        info.current.insert(
            Label::parse(label).unwrap(),
            BackupInfoEntry {
                backup_type:   Label::parse(label).unwrap().backup_type(),
                archive_start: Some(WalSegment::parse(start).unwrap()),
                archive_stop:  Some(WalSegment::parse(stop).unwrap()),
            },
        );
    }
    info.save(storage).unwrap();

    ArchiveInfo { db: cluster(), history, cipher_pass: None }
        .save(storage)
        .unwrap();
}

/// Seed one backup: a manifest plus plain stored objects.  `stored` overrides
/// the object bytes to simulate corruption; `reference` defers the file to a
/// prior backup without storing anything.
struct SeedFile<'a> {
    name:      &'a str,
    data:      &'a [u8],
    stored:    Option<&'a [u8]>,
    reference: Option<&'a str>,
}

impl<'a> SeedFile<'a> {
    fn plain(name: &'a str, data: &'a [u8]) -> Self {
        Self { name, data, stored: None, reference: None }
    }
}

fn seed_backup(
    storage: &MemoryStorage,
    label:   &str,
    range:   Option<(&str, &str)>,
    files:   &[SeedFile],
) {
    let label = Label::parse(label).unwrap();
    let mut reference_list: Vec<Label> = files
        .iter()
        .filter_map(|f| f.reference.map(|r| Label::parse(r).unwrap()))
        .collect();
    reference_list.push(label.clone());
    reference_list.sort();
    reference_list.dedup();

    let mut manifest = Manifest::new(ManifestData {
        label:          label.clone(),
        backup_type:    label.backup_type(),
        prior:          None,
        reference_list,
        archive_start:  range.map(|(s, _)| WalSegment::parse(s).unwrap()),
        archive_stop:   range.map(|(_, s)| WalSegment::parse(s).unwrap()),
        lsn_start:      None,
        lsn_stop:       None,
        timestamp_start: 1_704_067_200,
        timestamp_stop:  1_704_067_260,
        cluster:        cluster(),
        compress:       Compress::None,
        block_incr:     false,
        bundle:         false,
    });
    manifest.targets.insert(
        "pg_data".into(),
        Target { target_type: TargetType::Path, path: "/var/lib/pgsql".into(), tablespace_id: None },
    );

    for file in files {
        manifest.files.insert(
            file.name.to_owned(),
            FileEntry {
                size:  file.data.len() as u64,
                mtime: 1_704_067_200,
                user:  "postgres".into(),
                group: "postgres".into(),
                mode:  "0600".into(),
                reference:     file.reference.map(|r| Label::parse(r).unwrap()),
                bundle_id:     None,
                bundle_offset: None,
                size_repo:     Some(file.data.len() as u64),
                checksum:      (!file.data.is_empty()).then(|| sha(file.data)),
                checksum_repo: None,
                block_incr_map_size: 0,
                block_incr_size: 0,
                block_incr_checksum_size: 0,
            },
        );
        if file.reference.is_none() && !file.data.is_empty() {
            let stored = file.stored.unwrap_or(file.data);
            storage
                .write(&format!("backup/{label}/{}", file.name), stored)
                .unwrap();
        }
    }
    manifest.save(storage).unwrap();
}

fn seed_wal(storage: &MemoryStorage, archive_id: &str, segment: &str, data: &[u8]) {
    let seg = WalSegment::parse(segment).unwrap();
    let path = format!("archive/{archive_id}/{}/{}-{}", seg.timeline_dir(), seg, sha(data));
    storage.write(&path, data).unwrap();
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn empty_repository_reports_both_info_files() {
    let storage = MemoryStorage::new();
    let report = verify(&storage, &options());

    assert_eq!(report.status, "error");
    assert_eq!(
        report.errors,
        vec!["No usable backup.info file", "No usable archive.info file"]
    );
    assert!(!report.is_ok());
}

#[test]
fn single_valid_backup_without_wal() {
    let storage = MemoryStorage::new();
    seed_infos(&storage, &[]);
    seed_backup(
        &storage,
        "20240101-000000F",
        None,
        &[SeedFile::plain("base/1/1", b"cluster file contents")],
    );

    let report = verify(&storage, &options());
    assert_eq!(report.status, "ok");
    assert!(report.archives.is_empty());
    assert_eq!(report.backups.len(), 1);
    let backup = &report.backups[0];
    assert_eq!(backup.status, BackupStatus::Valid);
    assert_eq!(backup.total_files, 1);
    assert_eq!(backup.valid_files, 1);
}

#[test]
fn corrupted_file_marks_backup_invalid() {
    let storage = MemoryStorage::new();
    seed_infos(&storage, &[]);
    seed_backup(
        &storage,
        "20240101-000000F",
        None,
        &[SeedFile {
            name:      "base/1/1",
            // Same length as the manifest size so only the checksum trips.
            data:      b"original contents",
            stored:    Some(b"corrupted content"),
            reference: None,
        }],
    );

    let report = verify(&storage, &options());
    assert_eq!(report.status, "error");
    let backup = &report.backups[0];
    assert_eq!(backup.status, BackupStatus::Invalid);
    assert_eq!(backup.counters.checksum_invalid, 1);
    assert_eq!(backup.invalid_files.len(), 1);
    assert_eq!(backup.invalid_files[0].path, "base/1/1");
}

#[test]
fn missing_wal_inside_backup_range() {
    let storage = MemoryStorage::new();
    seed_infos(
        &storage,
        &[("20240101-000000F", "000000010000000000000001", "000000010000000000000003")],
    );
    seed_backup(
        &storage,
        "20240101-000000F",
        Some(("000000010000000000000001", "000000010000000000000003")),
        &[SeedFile::plain("base/1/1", b"data")],
    );

    let wal = vec![0u8; WAL_SIZE as usize];
    seed_wal(&storage, "15-1", "000000010000000000000001", &wal);
    seed_wal(&storage, "15-1", "000000010000000000000003", &wal);

    let report = verify(&storage, &options());
    assert_eq!(report.status, "error");
    assert_eq!(report.job_error_total, 1);

    let backup = &report.backups[0];
    assert_eq!(backup.status, BackupStatus::Invalid);
    assert_eq!(backup.counters.wal_invalid, 1);

    // Both present segments verified clean.
    assert_eq!(report.archives[0].total_wal, 2);
    assert_eq!(report.archives[0].valid_wal, 2);
}

#[test]
fn duplicate_wal_is_one_error_and_no_jobs() {
    let storage = MemoryStorage::new();
    seed_infos(&storage, &[]);

    let wal = vec![7u8; WAL_SIZE as usize];
    let other = vec![8u8; WAL_SIZE as usize];
    seed_wal(&storage, "15-1", "000000010000000000000005", &wal);
    seed_wal(&storage, "15-1", "000000010000000000000005", &other);

    let report = verify(&storage, &options());
    assert_eq!(report.job_error_total, 1);
    assert!(report
        .errors
        .iter()
        .any(|e| e.contains("duplicate WAL '000000010000000000000005'")));
    // Neither copy was dispatched.
    assert_eq!(report.archives[0].total_wal, 0);
    assert_eq!(report.archives[0].valid_wal, 0);
}

#[test]
fn reference_inheritance_propagates_the_verdict() {
    let storage = MemoryStorage::new();
    seed_infos(&storage, &[]);

    // Backup A stores one good file and one corrupted file.
    seed_backup(
        &storage,
        "20240101-000000F",
        None,
        &[
            SeedFile::plain("base/1/2", b"good bytes"),
            SeedFile {
                name:      "base/1/1",
                data:      b"real bytes",
                stored:    Some(b"fake bytes"),
                reference: None,
            },
        ],
    );
    // Backup B defers both files to A.
    seed_backup(
        &storage,
        "20240101-000000F_20240102-000000I",
        None,
        &[
            SeedFile {
                name:      "base/1/1",
                data:      b"real bytes",
                stored:    None,
                reference: Some("20240101-000000F"),
            },
            SeedFile {
                name:      "base/1/2",
                data:      b"good bytes",
                stored:    None,
                reference: Some("20240101-000000F"),
            },
        ],
    );

    let report = verify(&storage, &options());
    let a = report
        .backups
        .iter()
        .find(|b| b.label == "20240101-000000F")
        .unwrap();
    let b = report
        .backups
        .iter()
        .find(|b| b.label == "20240101-000000F_20240102-000000I")
        .unwrap();

    assert_eq!(a.status, BackupStatus::Invalid);
    assert_eq!(b.status, BackupStatus::Invalid);

    // The failure arrives with the same reason, without re-reading; the good
    // file inherits validity.
    assert_eq!(b.invalid_files.len(), 1);
    assert_eq!(b.invalid_files[0].path, "base/1/1");
    assert_eq!(b.invalid_files[0].reason, "checksum invalid");
    assert_eq!(b.valid_files, 1);

    // The physical corruption counts once globally.
    assert_eq!(report.job_error_total, 1);
}

// ── Backup / restore cycle ───────────────────────────────────────────────────

#[test]
fn block_incremental_backup_and_restore_cycle() {
    let block = 1024usize;
    let storage = MemoryStorage::new();
    let pg = tempfile::tempdir().unwrap();

    // Three-block file: the incremental rewrites only the middle block.
    let mut original = Vec::new();
    for b in 0u8..3 {
        original.extend(std::iter::repeat(b).take(block));
    }
    std::fs::create_dir_all(pg.path().join("base/1")).unwrap();
    std::fs::write(pg.path().join("base/1/1"), &original).unwrap();

    let mut opts = BackupOptions::new("main", cluster());
    opts.block_incr = true;
    opts.block_size = block as u64;
    opts.super_block_size = (block * 4) as u64;
    opts.checksum_size = 10;
    let full = backup_cluster(&storage, pg.path(), &opts).unwrap();

    let mut changed = original.clone();
    changed[block..2 * block].fill(0xAB);
    std::fs::write(pg.path().join("base/1/1"), &changed).unwrap();

    opts.backup_type = BackupType::Incr;
    let incr = backup_cluster(&storage, pg.path(), &opts).unwrap();
    assert_ne!(full, incr);

    // The incremental object holds one super-block plus the map, far less
    // than the full object.
    let full_obj = storage.read(&format!("backup/{full}/base/1/1")).unwrap();
    let incr_obj = storage.read(&format!("backup/{incr}/base/1/1")).unwrap();
    assert!(incr_obj.len() < full_obj.len());

    // Restore the incremental from scratch and compare.
    let target = tempfile::tempdir().unwrap();
    let restore_opts = RestoreOptions {
        stanza:      "main".into(),
        cipher_pass: None,
        delta:       false,
    };
    let summary = restore_backup(&storage, &incr, target.path(), &restore_opts).unwrap();
    assert_eq!(summary.files_restored, 1);
    let restored = std::fs::read(target.path().join("base/1/1")).unwrap();
    assert_eq!(restored, changed);

    // A delta restore over the stale original only fetches the one changed
    // block.
    let stale = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(stale.path().join("base/1")).unwrap();
    std::fs::write(stale.path().join("base/1/1"), &original).unwrap();
    let delta_opts = RestoreOptions {
        stanza:      "main".into(),
        cipher_pass: None,
        delta:       true,
    };
    let summary = restore_backup(&storage, &incr, stale.path(), &delta_opts).unwrap();
    assert_eq!(summary.blocks_fetched, 1);
    assert_eq!(std::fs::read(stale.path().join("base/1/1")).unwrap(), changed);

    // The whole repository verifies clean.
    let report = verify(&storage, &options());
    assert_eq!(report.status, "ok");
}

#[test]
fn stop_file_gates_new_backups() {
    let storage = MemoryStorage::new();
    let pg = tempfile::tempdir().unwrap();
    std::fs::write(pg.path().join("pg_control"), b"control").unwrap();
    storage.write("stop", b"").unwrap();

    let opts = BackupOptions::new("main", cluster());
    assert!(backup_cluster(&storage, pg.path(), &opts).is_err());

    storage.remove("stop");
    assert!(backup_cluster(&storage, pg.path(), &opts).is_ok());
}

#[test]
fn unchanged_files_are_referenced_not_restored_twice() {
    let storage = MemoryStorage::new();
    let pg = tempfile::tempdir().unwrap();
    std::fs::write(pg.path().join("pg_control"), b"control data").unwrap();
    std::fs::write(pg.path().join("stable"), b"never changes").unwrap();

    let opts = BackupOptions::new("main", cluster());
    let full = backup_cluster(&storage, pg.path(), &opts).unwrap();

    let mut incr_opts = BackupOptions::new("main", cluster());
    incr_opts.backup_type = BackupType::Incr;
    let incr = backup_cluster(&storage, pg.path(), &incr_opts).unwrap();

    // Nothing changed, so the incremental stores no file objects.
    let manifest = Manifest::load(&storage, &incr).unwrap();
    for (name, entry) in &manifest.files {
        assert_eq!(
            entry.reference.as_ref().map(|l| l.as_str()),
            Some(full.as_str()),
            "'{name}' should be deferred to the full backup"
        );
        assert!(!storage.exists(&format!("backup/{incr}/{name}")).unwrap());
    }

    // Restore resolves everything through the reference.
    let target = tempfile::tempdir().unwrap();
    let restore_opts = RestoreOptions {
        stanza:      "main".into(),
        cipher_pass: None,
        delta:       false,
    };
    restore_backup(&storage, &incr, target.path(), &restore_opts).unwrap();
    assert_eq!(
        std::fs::read(target.path().join("pg_control")).unwrap(),
        b"control data"
    );
    assert_eq!(
        std::fs::read(target.path().join("stable")).unwrap(),
        b"never changes"
    );
}
