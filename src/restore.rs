//! Restore command — materialise a backup onto the local filesystem.
//!
//! Plain files are read whole through the filter pipeline; block-incremental
//! files decode their trailing map and go through the delta planner, which
//! pulls each block from whichever backup in the chain stores it.  With
//! `delta` enabled the target's existing files are hashed block-by-block
//! first so unchanged blocks are never fetched.
//!
//! Reference indices in a block map stay valid against the restored
//! manifest's reference list because every backup's list extends its
//! prior's — see [`crate::manifest::ManifestData::reference_list`].

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info};
use sha1::{Digest, Sha1};

use crate::blockmap;
use crate::delta::{block_checksum, DeltaPlan, DeltaReader};
use crate::error::{Error, Result};
use crate::filter::{derive_key, FilterPipeline};
use crate::manifest::{FileEntry, Label, Manifest};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub stanza:      String,
    pub cipher_pass: Option<String>,
    /// Reuse matching blocks already present in the target.
    pub delta:       bool,
}

#[derive(Debug, Default)]
pub struct RestoreSummary {
    pub files_restored: u64,
    pub blocks_fetched: u64,
    pub bytes_written:  u64,
}

/// Restore `label` into `target`, creating it as needed.
pub fn restore_backup(
    storage: &dyn Storage,
    label:   &Label,
    target:  &Path,
    opts:    &RestoreOptions,
) -> Result<RestoreSummary> {
    let manifest = Manifest::load(storage, label)?;
    let key = opts
        .cipher_pass
        .as_deref()
        .map(|p| derive_key(p, opts.stanza.as_bytes()))
        .transpose()?;
    let references = manifest.reference_list();

    fs::create_dir_all(target).map_err(|e| Error::FileWrite {
        name:   target.display().to_string(),
        source: e,
    })?;
    for name in manifest.paths.keys() {
        fs::create_dir_all(target.join(name)).map_err(|e| Error::FileWrite {
            name:   name.clone(),
            source: e,
        })?;
    }

    let mut summary = RestoreSummary::default();
    for (name, entry) in &manifest.files {
        let dest = target.join(name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::FileWrite {
                name:   name.clone(),
                source: e,
            })?;
        }

        if entry.size == 0 {
            fs::write(&dest, b"").map_err(|e| Error::FileWrite {
                name:   name.clone(),
                source: e,
            })?;
            summary.files_restored += 1;
            continue;
        }

        let fetched = if entry.is_block_incr() {
            restore_block_incr(storage, &manifest, references, name, entry, &dest, key, opts)?
        } else {
            restore_plain(storage, &manifest, name, entry, &dest, key)?
        };
        summary.files_restored += 1;
        summary.blocks_fetched += fetched;
        summary.bytes_written += entry.size;
    }

    info!(
        "restored {} file(s) from {label} into {}",
        summary.files_restored,
        target.display()
    );
    Ok(summary)
}

fn restore_plain(
    storage:  &dyn Storage,
    manifest: &Manifest,
    name:     &str,
    entry:    &FileEntry,
    dest:     &Path,
    key:      Option<[u8; 32]>,
) -> Result<u64> {
    let stored = storage.read(&manifest.file_repo_path(name, entry))?;
    let pipeline = FilterPipeline::new(manifest.data.compress).with_key(key);
    let data = pipeline.decode(&stored)?;

    if data.len() as u64 != entry.size {
        return Err(Error::format(format!(
            "'{name}': restored {} bytes, manifest says {}",
            data.len(),
            entry.size
        )));
    }
    if let Some(expected) = &entry.checksum {
        let actual = hex::encode(Sha1::digest(&data));
        if actual != *expected {
            return Err(Error::Checksum {
                name:     name.to_owned(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    fs::write(dest, &data).map_err(|e| Error::FileWrite { name: name.to_owned(), source: e })?;
    Ok(0)
}

#[allow(clippy::too_many_arguments)]
fn restore_block_incr(
    storage:    &dyn Storage,
    manifest:   &Manifest,
    references: &[Label],
    name:       &str,
    entry:      &FileEntry,
    dest:       &Path,
    key:        Option<[u8; 32]>,
    opts:       &RestoreOptions,
) -> Result<u64> {
    let size_repo = entry
        .size_repo
        .ok_or_else(|| Error::format(format!("'{name}': block-incremental without a stored size")))?;
    let block_size = entry.block_incr_size;
    let checksum_size = entry.block_incr_checksum_size as usize;

    // The map trails the stored object.
    let path = manifest.file_repo_path(name, entry);
    let map_bytes =
        storage.read_range(&path, size_repo - entry.block_incr_map_size, entry.block_incr_map_size)?;
    let map = blockmap::decode(&mut map_bytes.as_slice(), block_size, checksum_size)?;

    // Local block state for a delta restore.
    let delta_map: Vec<Vec<u8>> = if opts.delta {
        match fs::read(dest) {
            Ok(existing) => existing
                .chunks(block_size as usize)
                .map(|chunk| block_checksum(chunk, checksum_size))
                .collect(),
            Err(_) => Vec::new(),
        }
    } else {
        Vec::new()
    };

    let plan = DeltaPlan::build(&map, &delta_map, block_size);
    let pipeline = FilterPipeline::new(manifest.data.compress).with_key(key);
    let mut reader = DeltaReader::new(&plan, storage, references, name, &pipeline, block_size);

    let mut out = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(!opts.delta)
        .open(dest)
        .map_err(|e| Error::FileOpen { name: name.to_owned(), source: e })?;
    out.set_len(entry.size)
        .map_err(|e| Error::FileWrite { name: name.to_owned(), source: e })?;

    let mut fetched = 0u64;
    while let Some(write) = reader.next()? {
        out.seek(SeekFrom::Start(write.offset))
            .map_err(|e| Error::FileWrite { name: name.to_owned(), source: e })?;
        out.write_all(&write.data)
            .map_err(|e| Error::FileWrite { name: name.to_owned(), source: e })?;
        fetched += 1;
    }
    debug!("'{name}': {fetched} block(s) fetched from the repository");
    Ok(fetched)
}
