//! Repository info files — the format anchor of each logical tree.
//!
//! `backup/backup.info` and `archive/archive.info` gate everything else: no
//! backup or archive object is trusted until its info file has loaded, its
//! `backrest-format` matched, and its checksum verified.  Both are stored as
//! primary + `.copy` pairs; both carry the cluster history list, which MUST
//! be identical across the two files for the repository to be coherent.
//!
//! `[cipher]` optionally carries the passphrase that unlocks the repository's
//! filter pipelines.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::keyval::{self, KeyValDoc};
use crate::manifest::{BackupType, ClusterInfo, Label};
use crate::storage::Storage;
use crate::wal::WalSegment;
use crate::REPOSITORY_FORMAT;

pub const BACKUP_INFO_FILE:  &str = "backup/backup.info";
pub const ARCHIVE_INFO_FILE: &str = "archive/archive.info";

/// One row of the cluster history: a cluster generation that has written to
/// this repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub version:   String,
    pub system_id: u64,
}

// ── archive.info ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub db:          ClusterInfo,
    pub history:     BTreeMap<u32, HistoryRow>,
    pub cipher_pass: Option<String>,
}

impl ArchiveInfo {
    pub fn load(storage: &dyn Storage) -> Result<Self> {
        let doc = keyval::load_pair(storage, ARCHIVE_INFO_FILE)?;
        check_format(&doc)?;
        Ok(Self {
            db:          read_db(&doc)?,
            history:     read_history(&doc)?,
            cipher_pass: read_cipher(&doc),
        })
    }

    pub fn save(&self, storage: &dyn Storage) -> Result<()> {
        let mut doc = KeyValDoc::new();
        doc.set("backrest", "backrest-format", json!(REPOSITORY_FORMAT));
        write_db(&mut doc, &self.db);
        write_history(&mut doc, &self.history);
        write_cipher(&mut doc, &self.cipher_pass);
        keyval::save_pair(storage, ARCHIVE_INFO_FILE, &doc)
    }

    /// The archive-id of the current cluster generation, `<ver>-<id>`.
    pub fn archive_id(&self) -> String {
        format!("{}-{}", self.db.version, self.db.id)
    }

    /// Resolve the archive-id for a given cluster identity.
    /// [`Error::ArchiveMismatch`] when no history row is compatible.
    pub fn archive_id_for(&self, version: &str, system_id: u64) -> Result<String> {
        // Newest row wins when a generation was repeated.
        for (id, row) in self.history.iter().rev() {
            if row.version == version && row.system_id == system_id {
                return Ok(format!("{}-{id}", row.version));
            }
        }
        Err(Error::ArchiveMismatch { version: version.to_owned(), system_id })
    }
}

// ── backup.info ──────────────────────────────────────────────────────────────

/// Summary row for a backup in the repository's current list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfoEntry {
    pub backup_type:   BackupType,
    pub archive_start: Option<WalSegment>,
    pub archive_stop:  Option<WalSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub db:          ClusterInfo,
    pub history:     BTreeMap<u32, HistoryRow>,
    pub current:     BTreeMap<Label, BackupInfoEntry>,
    pub cipher_pass: Option<String>,
}

impl BackupInfo {
    pub fn load(storage: &dyn Storage) -> Result<Self> {
        let doc = keyval::load_pair(storage, BACKUP_INFO_FILE)?;
        check_format(&doc)?;

        let mut current = BTreeMap::new();
        if let Some(section) = doc.section("backup:current") {
            for (label, value) in section {
                let obj = value
                    .as_object()
                    .ok_or_else(|| Error::format(format!("backup '{label}' is not an object")))?;
                let backup_type = BackupType::parse(
                    obj.get("backup-type")
                        .and_then(Value::as_str)
                        .ok_or_else(|| Error::format(format!("backup '{label}': no type")))?,
                )?;
                let seg = |key: &str| -> Result<Option<WalSegment>> {
                    match obj.get(key).and_then(Value::as_str) {
                        Some(s) => Ok(Some(WalSegment::parse(s)?)),
                        None    => Ok(None),
                    }
                };
                current.insert(
                    Label::parse(label)?,
                    BackupInfoEntry {
                        backup_type,
                        archive_start: seg("backup-archive-start")?,
                        archive_stop:  seg("backup-archive-stop")?,
                    },
                );
            }
        }

        Ok(Self {
            db:          read_db(&doc)?,
            history:     read_history(&doc)?,
            current,
            cipher_pass: read_cipher(&doc),
        })
    }

    pub fn save(&self, storage: &dyn Storage) -> Result<()> {
        let mut doc = KeyValDoc::new();
        doc.set("backrest", "backrest-format", json!(REPOSITORY_FORMAT));
        write_db(&mut doc, &self.db);
        write_history(&mut doc, &self.history);
        write_cipher(&mut doc, &self.cipher_pass);
        for (label, entry) in &self.current {
            let mut obj = serde_json::Map::new();
            obj.insert("backup-type".into(), json!(entry.backup_type.as_str()));
            if let Some(s) = &entry.archive_start {
                obj.insert("backup-archive-start".into(), json!(s.as_str()));
            }
            if let Some(s) = &entry.archive_stop {
                obj.insert("backup-archive-stop".into(), json!(s.as_str()));
            }
            doc.set("backup:current", label.as_str(), Value::Object(obj));
        }
        keyval::save_pair(storage, BACKUP_INFO_FILE, &doc)
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────────

fn check_format(doc: &KeyValDoc) -> Result<()> {
    let format = doc.get_u64("backrest", "backrest-format")?;
    if format != REPOSITORY_FORMAT {
        return Err(Error::format(format!(
            "repository format {format} (expected {REPOSITORY_FORMAT})"
        )));
    }
    Ok(())
}

fn read_db(doc: &KeyValDoc) -> Result<ClusterInfo> {
    Ok(ClusterInfo {
        id:        doc.get_u64("db", "db-id")? as u32,
        version:   doc.get_str("db", "db-version")?.to_owned(),
        system_id: doc.get_u64("db", "db-system-id")?,
    })
}

fn write_db(doc: &mut KeyValDoc, db: &ClusterInfo) {
    doc.set("db", "db-id", json!(db.id));
    doc.set("db", "db-version", json!(db.version));
    doc.set("db", "db-system-id", json!(db.system_id));
}

fn read_history(doc: &KeyValDoc) -> Result<BTreeMap<u32, HistoryRow>> {
    let mut history = BTreeMap::new();
    if let Some(section) = doc.section("db:history") {
        for (id, value) in section {
            let id: u32 = id
                .parse()
                .map_err(|_| Error::format(format!("history id '{id}' is not numeric")))?;
            let obj = value
                .as_object()
                .ok_or_else(|| Error::format(format!("history row {id} is not an object")))?;
            history.insert(
                id,
                HistoryRow {
                    version: obj
                        .get("db-version")
                        .and_then(Value::as_str)
                        .ok_or_else(|| Error::format(format!("history row {id}: no version")))?
                        .to_owned(),
                    system_id: obj
                        .get("db-system-id")
                        .and_then(Value::as_u64)
                        .ok_or_else(|| Error::format(format!("history row {id}: no system id")))?,
                },
            );
        }
    }
    Ok(history)
}

fn write_history(doc: &mut KeyValDoc, history: &BTreeMap<u32, HistoryRow>) {
    for (id, row) in history {
        doc.set(
            "db:history",
            &id.to_string(),
            json!({"db-version": row.version, "db-system-id": row.system_id}),
        );
    }
}

fn read_cipher(doc: &KeyValDoc) -> Option<String> {
    doc.get("cipher", "cipher-pass")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn write_cipher(doc: &mut KeyValDoc, pass: &Option<String>) {
    if let Some(pass) = pass {
        doc.set("cipher", "cipher-pass", json!(pass));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn db() -> ClusterInfo {
        ClusterInfo { id: 1, version: "15".into(), system_id: 0xDEADBEEF }
    }

    fn history() -> BTreeMap<u32, HistoryRow> {
        let mut h = BTreeMap::new();
        h.insert(1, HistoryRow { version: "15".into(), system_id: 0xDEADBEEF });
        h
    }

    #[test]
    fn archive_info_roundtrip_and_id() {
        let storage = MemoryStorage::new();
        let info = ArchiveInfo { db: db(), history: history(), cipher_pass: None };
        info.save(&storage).unwrap();
        assert!(storage.exists("archive/archive.info.copy").unwrap());

        let loaded = ArchiveInfo::load(&storage).unwrap();
        assert_eq!(loaded, info);
        assert_eq!(loaded.archive_id(), "15-1");
        assert_eq!(loaded.archive_id_for("15", 0xDEADBEEF).unwrap(), "15-1");
        assert!(matches!(
            loaded.archive_id_for("16", 0xDEADBEEF),
            Err(Error::ArchiveMismatch { .. })
        ));
    }

    #[test]
    fn backup_info_current_list() {
        let storage = MemoryStorage::new();
        let mut info = BackupInfo {
            db: db(),
            history: history(),
            current: BTreeMap::new(),
            cipher_pass: Some("swordfish".into()),
        };
        info.current.insert(
            Label::parse("20240101-000000F").unwrap(),
            BackupInfoEntry {
                backup_type:   BackupType::Full,
                archive_start: Some(WalSegment::parse("000000010000000000000001").unwrap()),
                archive_stop:  Some(WalSegment::parse("000000010000000000000003").unwrap()),
            },
        );
        info.save(&storage).unwrap();
        let loaded = BackupInfo::load(&storage).unwrap();
        assert_eq!(loaded, info);
    }

    #[test]
    fn wrong_format_rejected() {
        let storage = MemoryStorage::new();
        let mut doc = KeyValDoc::new();
        doc.set("backrest", "backrest-format", json!(4));
        doc.set("db", "db-id", json!(1));
        doc.set("db", "db-version", json!("15"));
        doc.set("db", "db-system-id", json!(1u64));
        keyval::save_pair(&storage, ARCHIVE_INFO_FILE, &doc).unwrap();
        assert!(ArchiveInfo::load(&storage).is_err());
    }
}
