//! Backup command — copy a cluster data directory into the repository.
//!
//! A full backup copies every file; a differential or incremental consults
//! the prior backup's manifest and skips files whose size, mtime, and
//! checksum are unchanged, recording a `reference` to the backup that
//! already stores them.  Changed files either go through the
//! block-incremental writer (reusing unchanged blocks from the prior map) or
//! are stored whole through the filter pipeline.
//!
//! Cluster introspection is the caller's job: version and system id arrive
//! as a [`ClusterInfo`] value object.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::Utc;
use log::{info, warn};
use sha1::{Digest, Sha1};

use crate::blockmap::{self, BlockMap};
use crate::error::{Error, Result};
use crate::filter::{derive_key, Compress, FilterPipeline};
use crate::info::{ArchiveInfo, BackupInfo, BackupInfoEntry, HistoryRow};
use crate::manifest::{
    BackupType, ClusterInfo, FileEntry, Label, Manifest, ManifestData, PathEntry, Target,
    TargetType,
};
use crate::storage::Storage;
use crate::wal::WalSegment;
use crate::writer::{self, BlockIncrWriter};

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub stanza:        String,
    pub backup_type:   BackupType,
    pub cluster:       ClusterInfo,
    pub compress:      Compress,
    pub cipher_pass:   Option<String>,
    /// Enable block-incremental storage for files of at least one block.
    pub block_incr:    bool,
    pub block_size:    u64,
    pub super_block_size: u64,
    pub checksum_size: usize,
    /// WAL range covered by this backup, when the caller knows it.
    pub archive_start: Option<WalSegment>,
    pub archive_stop:  Option<WalSegment>,
}

impl BackupOptions {
    pub fn new(stanza: &str, cluster: ClusterInfo) -> Self {
        Self {
            stanza:        stanza.to_owned(),
            backup_type:   BackupType::Full,
            cluster,
            compress:      Compress::None,
            cipher_pass:   None,
            block_incr:    false,
            block_size:    writer::DEFAULT_BLOCK_SIZE,
            super_block_size: writer::DEFAULT_BLOCK_SIZE * writer::DEFAULT_SUPER_BLOCK_FACTOR,
            checksum_size: writer::DEFAULT_CHECKSUM_SIZE,
            archive_start: None,
            archive_stop:  None,
        }
    }
}

/// Name of the flag object that gates new backup processes.
pub const STOP_FILE: &str = "stop";

/// Run a backup of `pg_path` into the repository.  Returns the new label.
pub fn backup_cluster(
    storage: &dyn Storage,
    pg_path: &Path,
    opts:    &BackupOptions,
) -> Result<Label> {
    // The stop file is the only cross-process coordination: its presence
    // means an operator has halted new backups.
    if storage.exists(STOP_FILE)? {
        return Err(Error::format("stop file present; new backups are disabled"));
    }

    let mut backup_info = load_or_init_info(storage, opts)?;
    let key = opts
        .cipher_pass
        .as_deref()
        .map(|p| derive_key(p, opts.stanza.as_bytes()))
        .transpose()?;
    let pipeline = FilterPipeline::new(opts.compress).with_key(key);

    // Resolve the prior backup for diff/incr.
    let prior = match opts.backup_type {
        BackupType::Full => None,
        BackupType::Diff => latest_backup(storage, |l| l.backup_type() == BackupType::Full)?,
        BackupType::Incr => latest_backup(storage, |_| true)?,
    };
    let backup_type = if prior.is_none() && opts.backup_type != BackupType::Full {
        warn!("no prior backup exists; taking a full backup instead");
        BackupType::Full
    } else {
        opts.backup_type
    };
    let prior_manifest = prior
        .as_ref()
        .map(|label| Manifest::load(storage, label))
        .transpose()?;

    let label = new_label(backup_type, prior_manifest.as_ref())?;
    info!("backup {label} ({}) starting", backup_type.as_str());

    let mut reference_list: Vec<Label> = prior_manifest
        .as_ref()
        .map(|m| m.reference_list().to_vec())
        .unwrap_or_default();
    reference_list.push(label.clone());

    let mut manifest = Manifest::new(ManifestData {
        label:          label.clone(),
        backup_type,
        prior:          prior.clone(),
        reference_list,
        archive_start:  opts.archive_start.clone(),
        archive_stop:   opts.archive_stop.clone(),
        lsn_start:      None,
        lsn_stop:       None,
        timestamp_start: Utc::now().timestamp(),
        timestamp_stop:  0,
        cluster:        opts.cluster.clone(),
        compress:       opts.compress,
        block_incr:     opts.block_incr,
        bundle:         false,
    });
    manifest.targets.insert(
        "pg_data".to_owned(),
        Target {
            target_type:   TargetType::Path,
            path:          pg_path.display().to_string(),
            tablespace_id: None,
        },
    );

    let self_reference = manifest.self_reference();
    let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    collect_tree(pg_path, "", &mut manifest, &mut files)?;

    for (name, data) in files {
        let checksum = hex::encode(Sha1::digest(&data));
        let meta_entry = manifest.files.get_mut(&name).expect("collected");
        meta_entry.checksum = (!data.is_empty()).then(|| checksum.clone());

        if data.is_empty() {
            continue;
        }

        // Unchanged since the prior backup: record a reference, store nothing.
        if let Some(prior_entry) = prior_manifest.as_ref().and_then(|m| m.file(&name)) {
            if prior_entry.size == data.len() as u64
                && prior_entry.checksum.as_deref() == Some(checksum.as_str())
            {
                let target = prior_entry
                    .reference
                    .clone()
                    .unwrap_or_else(|| prior.clone().expect("prior exists"));
                let meta_entry = manifest.files.get_mut(&name).expect("collected");
                meta_entry.reference = Some(target);
                meta_entry.size_repo = prior_entry.size_repo;
                meta_entry.checksum_repo = prior_entry.checksum_repo.clone();
                meta_entry.block_incr_map_size = prior_entry.block_incr_map_size;
                meta_entry.block_incr_size = prior_entry.block_incr_size;
                meta_entry.block_incr_checksum_size = prior_entry.block_incr_checksum_size;
                continue;
            }
        }

        if opts.block_incr && data.len() as u64 >= opts.block_size {
            let prior_map = prior_block_map(storage, prior_manifest.as_ref(), &name)?;
            let block_incr = BlockIncrWriter::new(
                opts.block_size,
                opts.super_block_size,
                opts.checksum_size,
                &pipeline,
                prior_map.as_ref(),
                self_reference,
            )?;
            let file = writer::write_all(block_incr, &data)?;
            let path = format!("backup/{label}/{name}");
            storage.write(&path, &file.object)?;

            let meta_entry = manifest.files.get_mut(&name).expect("collected");
            meta_entry.size_repo = Some(file.object.len() as u64);
            meta_entry.checksum_repo = Some(hex::encode(Sha1::digest(&file.object)));
            meta_entry.block_incr_map_size = file.map_size;
            meta_entry.block_incr_size = opts.block_size;
            meta_entry.block_incr_checksum_size = opts.checksum_size as u64;
        } else {
            let stored = pipeline.encode(&data)?;
            let path = format!("backup/{label}/{name}{}", opts.compress.ext());
            storage.write(&path, &stored)?;

            let meta_entry = manifest.files.get_mut(&name).expect("collected");
            meta_entry.size_repo = Some(stored.len() as u64);
            if stored != data {
                meta_entry.checksum_repo = Some(hex::encode(Sha1::digest(&stored)));
            }
        }
    }

    manifest.data.timestamp_stop = Utc::now().timestamp();
    manifest.save(storage)?;

    backup_info.current.insert(
        label.clone(),
        BackupInfoEntry {
            backup_type,
            archive_start: opts.archive_start.clone(),
            archive_stop:  opts.archive_stop.clone(),
        },
    );
    backup_info.save(storage)?;

    info!("backup {label} complete ({} files)", manifest.files.len());
    Ok(label)
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn load_or_init_info(storage: &dyn Storage, opts: &BackupOptions) -> Result<BackupInfo> {
    match BackupInfo::load(storage) {
        Ok(info) => {
            if info.db.version != opts.cluster.version
                || info.db.system_id != opts.cluster.system_id
            {
                return Err(Error::ArchiveMismatch {
                    version:   opts.cluster.version.clone(),
                    system_id: opts.cluster.system_id,
                });
            }
            Ok(info)
        }
        Err(Error::FileMissing(_)) => {
            // First backup into this repository: seed both info files.
            let mut history = BTreeMap::new();
            history.insert(
                opts.cluster.id,
                HistoryRow {
                    version:   opts.cluster.version.clone(),
                    system_id: opts.cluster.system_id,
                },
            );
            let backup_info = BackupInfo {
                db:          opts.cluster.clone(),
                history:     history.clone(),
                current:     BTreeMap::new(),
                cipher_pass: opts.cipher_pass.clone(),
            };
            backup_info.save(storage)?;
            ArchiveInfo {
                db:          opts.cluster.clone(),
                history,
                cipher_pass: opts.cipher_pass.clone(),
            }
            .save(storage)?;
            Ok(backup_info)
        }
        Err(e) => Err(e),
    }
}

fn latest_backup(
    storage: &dyn Storage,
    accept:  impl Fn(&Label) -> bool,
) -> Result<Option<Label>> {
    Ok(storage
        .list("backup")?
        .iter()
        .filter_map(|name| Label::parse(name).ok())
        .filter(accept)
        .max())
}

fn new_label(backup_type: BackupType, prior: Option<&Manifest>) -> Result<Label> {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let text = match backup_type {
        BackupType::Full => format!("{stamp}F"),
        BackupType::Diff => {
            let full = prior.expect("diff has a prior").data.label.full_label().to_owned();
            format!("{full}_{stamp}D")
        }
        BackupType::Incr => {
            let full = prior.expect("incr has a prior").data.label.full_label().to_owned();
            format!("{full}_{stamp}I")
        }
    };
    Label::parse(&text)
}

/// Decode the prior backup's block map for `name`, when one exists.
fn prior_block_map(
    storage: &dyn Storage,
    prior:   Option<&Manifest>,
    name:    &str,
) -> Result<Option<BlockMap>> {
    let Some(prior) = prior else { return Ok(None) };
    let Some(entry) = prior.file(name) else { return Ok(None) };
    if !entry.is_block_incr() {
        return Ok(None);
    }
    let Some(size_repo) = entry.size_repo else { return Ok(None) };

    let path = prior.file_repo_path(name, entry);
    let map_bytes =
        storage.read_range(&path, size_repo - entry.block_incr_map_size, entry.block_incr_map_size)?;
    let map = blockmap::decode(
        &mut map_bytes.as_slice(),
        entry.block_incr_size,
        entry.block_incr_checksum_size as usize,
    )?;
    Ok(Some(map))
}

/// Walk the data directory, filling path entries and collecting file bytes.
fn collect_tree(
    root:     &Path,
    prefix:   &str,
    manifest: &mut Manifest,
    files:    &mut BTreeMap<String, Vec<u8>>,
) -> Result<()> {
    let dir = root.join(prefix);
    let entries = fs::read_dir(&dir).map_err(|e| Error::FileOpen {
        name:   dir.display().to_string(),
        source: e,
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::FileRead {
            name:   dir.display().to_string(),
            source: e,
        })?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let relative = if prefix.is_empty() {
            file_name.clone()
        } else {
            format!("{prefix}/{file_name}")
        };
        let meta = entry.metadata().map_err(|e| Error::FileRead {
            name:   relative.clone(),
            source: e,
        })?;

        if meta.is_dir() {
            manifest.paths.insert(relative.clone(), file_meta(&meta));
            collect_tree(root, &relative, manifest, files)?;
        } else if meta.is_file() {
            let data = fs::read(entry.path()).map_err(|e| Error::FileRead {
                name:   relative.clone(),
                source: e,
            })?;
            let pm = file_meta(&meta);
            manifest.files.insert(
                relative.clone(),
                FileEntry {
                    size:  data.len() as u64,
                    mtime: meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0),
                    user:  pm.user,
                    group: pm.group,
                    mode:  pm.mode,
                    reference: None,
                    bundle_id: None,
                    bundle_offset: None,
                    size_repo: None,
                    checksum: None,
                    checksum_repo: None,
                    block_incr_map_size: 0,
                    block_incr_size: 0,
                    block_incr_checksum_size: 0,
                },
            );
            files.insert(relative, data);
        }
        // Symlinks and special files in the data directory are the
        // tablespace layer's concern; skipped here.
    }
    Ok(())
}

#[cfg(unix)]
fn file_meta(meta: &fs::Metadata) -> PathEntry {
    use std::os::unix::fs::MetadataExt;
    PathEntry {
        user:  "postgres".to_owned(),
        group: "postgres".to_owned(),
        mode:  format!("{:04o}", meta.mode() & 0o7777),
    }
}

#[cfg(not(unix))]
fn file_meta(_meta: &fs::Metadata) -> PathEntry {
    PathEntry {
        user:  "postgres".to_owned(),
        group: "postgres".to_owned(),
        mode:  "0600".to_owned(),
    }
}
