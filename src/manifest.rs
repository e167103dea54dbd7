//! Backup manifest — one backup's complete description.
//!
//! Five logical sections ride a keyed text document ([`crate::keyval`]):
//! `[backup]` (WAL/LSN range, type, prior label, flags), `[backup:db]`
//! (cluster identity), `[backup:target]`, `[target:path]`, `[target:link]`,
//! `[target:file]`, and `[db]` (oid → name/last-system-oid).  Keys sort, the
//! trailing checksum covers the canonical serialization, and every manifest
//! is written twice (`backup.manifest` + `.copy`).
//!
//! A manifest's files may defer their bytes to a prior backup via
//! `reference`; the chain is walked *by label* through an index map, never by
//! pointer, and terminates at a full backup.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::filter::Compress;
use crate::keyval::{self, KeyValDoc};
use crate::storage::Storage;
use crate::wal::WalSegment;
use crate::REPOSITORY_FORMAT;

pub const MANIFEST_FILE: &str = "backup.manifest";

// ── Labels ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Diff,
    Incr,
}

impl BackupType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Diff => "diff",
            BackupType::Incr => "incr",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupType::Full),
            "diff" => Ok(BackupType::Diff),
            "incr" => Ok(BackupType::Incr),
            _ => Err(Error::format(format!("unknown backup type '{s}'"))),
        }
    }
}

/// A backup label: `YYYYMMDD-HHMMSSF` for a full backup, with an optional
/// `_YYYYMMDD-HHMMSS(D|I)` suffix for a differential or incremental that
/// references it.  Lexicographic order of labels is chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    text: String,
}

impl Label {
    pub fn parse(text: &str) -> Result<Self> {
        let (full, suffix) = match text.split_once('_') {
            Some((f, s)) => (f, Some(s)),
            None         => (text, None),
        };
        Self::check_stamp(full, 'F', text)?;
        if let Some(suffix) = suffix {
            if !Self::stamp_ok(suffix, 'D') && !Self::stamp_ok(suffix, 'I') {
                return Err(Error::format(format!("'{text}' is not a backup label")));
            }
        }
        Ok(Self { text: text.to_owned() })
    }

    fn check_stamp(s: &str, kind: char, whole: &str) -> Result<()> {
        if Self::stamp_ok(s, kind) {
            Ok(())
        } else {
            Err(Error::format(format!("'{whole}' is not a backup label")))
        }
    }

    fn stamp_ok(s: &str, kind: char) -> bool {
        s.len() == 16
            && s.ends_with(kind)
            && chrono::NaiveDateTime::parse_from_str(&s[..15], "%Y%m%d-%H%M%S").is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn backup_type(&self) -> BackupType {
        match self.text.chars().last() {
            Some('D') => BackupType::Diff,
            Some('I') => BackupType::Incr,
            _         => BackupType::Full,
        }
    }

    /// The full backup this label belongs to (itself, for a full).
    pub fn full_label(&self) -> &str {
        match self.text.split_once('_') {
            Some((full, _)) => full,
            None            => &self.text,
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

// ── Entries ──────────────────────────────────────────────────────────────────

/// Cluster identity, supplied by the caller as a value object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub id:        u32,
    pub version:   String,
    pub system_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Path,
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub target_type:   TargetType,
    pub path:          String,
    pub tablespace_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub user:  String,
    pub group: String,
    pub mode:  String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub user:        String,
    pub group:       String,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub size:          u64,
    pub mtime:         i64,
    pub user:          String,
    pub group:         String,
    pub mode:          String,
    /// Label of the backup physically storing the bytes; `None` = this one.
    pub reference:     Option<Label>,
    /// Set iff bundled.
    pub bundle_id:     Option<u64>,
    pub bundle_offset: Option<u64>,
    /// Stored size in the repository; differs from `size` when compressed,
    /// encrypted, or block-incremental.
    pub size_repo:     Option<u64>,
    /// SHA-1 of the plaintext; absent for zero-length files.
    pub checksum:      Option<String>,
    /// SHA-1 of the stored form when it differs from the plaintext checksum.
    pub checksum_repo: Option<String>,
    /// Trailing block-map length; 0 iff the file is not block-incremental.
    pub block_incr_map_size:      u64,
    pub block_incr_size:          u64,
    pub block_incr_checksum_size: u64,
}

impl FileEntry {
    pub fn is_block_incr(&self) -> bool {
        self.block_incr_map_size > 0
    }

    pub fn is_bundled(&self) -> bool {
        self.bundle_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbEntry {
    pub name:            String,
    pub last_system_oid: u64,
}

// ── Manifest ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestData {
    pub label:         Label,
    pub backup_type:   BackupType,
    pub prior:         Option<Label>,
    /// Every backup label this manifest's bytes may live in, sorted ascending
    /// with this backup's own label included.  Block maps index into this
    /// list, so it is authoritative and carried on disk — a prior backup can
    /// contribute blocks without contributing any whole file.
    pub reference_list: Vec<Label>,
    pub archive_start: Option<WalSegment>,
    pub archive_stop:  Option<WalSegment>,
    pub lsn_start:     Option<String>,
    pub lsn_stop:      Option<String>,
    pub timestamp_start: i64,
    pub timestamp_stop:  i64,
    pub cluster:       ClusterInfo,
    pub compress:      Compress,
    pub block_incr:    bool,
    pub bundle:        bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub data:    ManifestData,
    pub targets: BTreeMap<String, Target>,
    pub paths:   BTreeMap<String, PathEntry>,
    pub links:   BTreeMap<String, LinkEntry>,
    pub files:   BTreeMap<String, FileEntry>,
    pub dbs:     BTreeMap<u64, DbEntry>,
}

impl Manifest {
    pub fn new(data: ManifestData) -> Self {
        Self {
            data,
            targets: BTreeMap::new(),
            paths:   BTreeMap::new(),
            links:   BTreeMap::new(),
            files:   BTreeMap::new(),
            dbs:     BTreeMap::new(),
        }
    }

    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    /// The manifest's reference list; block map indices resolve through it.
    pub fn reference_list(&self) -> &[Label] {
        &self.data.reference_list
    }

    /// This backup's own index in the reference list.
    pub fn self_reference(&self) -> u32 {
        self.data
            .reference_list
            .iter()
            .position(|l| *l == self.data.label)
            .map(|p| p as u32)
            .unwrap_or(0)
    }

    /// Repository path of a file's stored object.  Bundled files share one
    /// object per bundle id; block-incremental objects carry no compression
    /// extension because filtering happens per super-block inside.
    pub fn file_repo_path(&self, name: &str, entry: &FileEntry) -> String {
        let label = entry
            .reference
            .as_ref()
            .unwrap_or(&self.data.label)
            .as_str();
        match entry.bundle_id {
            Some(bundle) => format!("backup/{label}/bundle/{bundle}"),
            None => format!(
                "backup/{label}/{name}{}",
                if entry.is_block_incr() { "" } else { self.data.compress.ext() }
            ),
        }
    }

    // ── Invariants ───────────────────────────────────────────────────────────

    /// Validate chain, range, and bundle invariants.  Called after load and
    /// before save.
    pub fn validate(&self) -> Result<()> {
        let label = &self.data.label;

        if !self.data.reference_list.contains(label) {
            return Err(Error::format(format!(
                "reference list of '{label}' does not include the backup itself"
            )));
        }
        if !self.data.reference_list.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::format(format!(
                "reference list of '{label}' is not sorted ascending"
            )));
        }

        for (name, file) in &self.files {
            if let Some(reference) = &file.reference {
                if !self.data.reference_list.contains(reference) {
                    return Err(Error::format(format!(
                        "file '{name}' references '{reference}' missing from the reference list"
                    )));
                }
                // The reference must precede this backup inside the same
                // full-backup chain.
                if reference.as_str() >= label.as_str()
                    || reference.full_label() != label.full_label()
                {
                    return Err(Error::format(format!(
                        "file '{name}' references '{reference}' outside the chain of '{label}'"
                    )));
                }
            }
            if file.bundle_id.is_some() != file.bundle_offset.is_some() {
                return Err(Error::format(format!(
                    "file '{name}' has a partial bundle location"
                )));
            }
            if file.is_bundled() && file.size_repo.is_none() {
                return Err(Error::format(format!(
                    "bundled file '{name}' is missing its stored size"
                )));
            }
        }

        if let (Some(start), Some(stop)) = (&self.data.archive_start, &self.data.archive_stop) {
            if !start.same_timeline(stop) || start.as_str() > stop.as_str() {
                return Err(Error::format(format!(
                    "archive range {start}..{stop} is not ordered on one timeline"
                )));
            }
        }

        // Two bundled files sharing (reference, bundleId) must occupy
        // disjoint extents.
        let mut extents: BTreeMap<(Option<&Label>, u64), Vec<(u64, u64, &str)>> = BTreeMap::new();
        for (name, file) in &self.files {
            if let (Some(bundle), Some(offset), Some(size_repo)) =
                (file.bundle_id, file.bundle_offset, file.size_repo)
            {
                extents
                    .entry((file.reference.as_ref(), bundle))
                    .or_default()
                    .push((offset, size_repo, name.as_str()));
            }
        }
        for ((_, bundle), mut files) in extents {
            files.sort();
            for pair in files.windows(2) {
                let (off_a, size_a, name_a) = pair[0];
                let (off_b, _, name_b) = pair[1];
                if off_a + size_a > off_b {
                    return Err(Error::format(format!(
                        "bundle {bundle}: '{name_a}' and '{name_b}' overlap"
                    )));
                }
            }
        }

        Ok(())
    }

    // ── Load / save ──────────────────────────────────────────────────────────

    pub fn load(storage: &dyn Storage, label: &Label) -> Result<Self> {
        let path = format!("backup/{label}/{MANIFEST_FILE}");
        let doc = keyval::load_pair(storage, &path)?;
        let manifest = Self::from_doc(&doc)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn save(&self, storage: &dyn Storage) -> Result<()> {
        self.validate()?;
        let path = format!("backup/{}/{MANIFEST_FILE}", self.data.label);
        keyval::save_pair(storage, &path, &self.to_doc())
    }

    pub fn to_doc(&self) -> KeyValDoc {
        let mut doc = KeyValDoc::new();
        doc.set("backrest", "backrest-format", json!(REPOSITORY_FORMAT));

        let d = &self.data;
        doc.set("backup", "backup-label", json!(d.label.as_str()));
        doc.set("backup", "backup-type", json!(d.backup_type.as_str()));
        doc.set("backup", "backup-timestamp-start", json!(d.timestamp_start));
        doc.set("backup", "backup-timestamp-stop", json!(d.timestamp_stop));
        doc.set("backup", "backup-block-incr", json!(d.block_incr));
        doc.set("backup", "backup-bundle", json!(d.bundle));
        doc.set(
            "backup",
            "backup-compress-type",
            json!(match d.compress {
                Compress::None => "none",
                Compress::Gz   => "gz",
                Compress::Bz2  => "bz2",
                Compress::Lz4  => "lz4",
                Compress::Zst  => "zst",
            }),
        );
        if let Some(prior) = &d.prior {
            doc.set("backup", "backup-prior", json!(prior.as_str()));
        }
        doc.set(
            "backup",
            "backup-reference",
            json!(d.reference_list.iter().map(Label::as_str).collect::<Vec<_>>()),
        );
        if let Some(s) = &d.archive_start {
            doc.set("backup", "backup-archive-start", json!(s.as_str()));
        }
        if let Some(s) = &d.archive_stop {
            doc.set("backup", "backup-archive-stop", json!(s.as_str()));
        }
        if let Some(l) = &d.lsn_start {
            doc.set("backup", "backup-lsn-start", json!(l));
        }
        if let Some(l) = &d.lsn_stop {
            doc.set("backup", "backup-lsn-stop", json!(l));
        }

        doc.set("backup:db", "db-id", json!(d.cluster.id));
        doc.set("backup:db", "db-version", json!(d.cluster.version));
        doc.set("backup:db", "db-system-id", json!(d.cluster.system_id));

        for (name, t) in &self.targets {
            let mut obj = serde_json::Map::new();
            obj.insert(
                "type".into(),
                json!(match t.target_type {
                    TargetType::Path => "path",
                    TargetType::Link => "link",
                }),
            );
            obj.insert("path".into(), json!(t.path));
            if let Some(ts) = t.tablespace_id {
                obj.insert("tablespace-id".into(), json!(ts));
            }
            doc.set("backup:target", name, Value::Object(obj));
        }

        for (name, p) in &self.paths {
            doc.set(
                "target:path",
                name,
                json!({"user": p.user, "group": p.group, "mode": p.mode}),
            );
        }
        for (name, l) in &self.links {
            doc.set(
                "target:link",
                name,
                json!({"user": l.user, "group": l.group, "destination": l.destination}),
            );
        }
        for (name, f) in &self.files {
            let mut obj = serde_json::Map::new();
            obj.insert("size".into(), json!(f.size));
            obj.insert("timestamp".into(), json!(f.mtime));
            obj.insert("user".into(), json!(f.user));
            obj.insert("group".into(), json!(f.group));
            obj.insert("mode".into(), json!(f.mode));
            if let Some(r) = &f.reference {
                obj.insert("reference".into(), json!(r.as_str()));
            }
            if let Some(b) = f.bundle_id {
                obj.insert("bundle-id".into(), json!(b));
            }
            if let Some(o) = f.bundle_offset {
                obj.insert("bundle-offset".into(), json!(o));
            }
            if let Some(s) = f.size_repo {
                obj.insert("size-repo".into(), json!(s));
            }
            if let Some(c) = &f.checksum {
                obj.insert("checksum".into(), json!(c));
            }
            if let Some(c) = &f.checksum_repo {
                obj.insert("checksum-repo".into(), json!(c));
            }
            if f.block_incr_map_size > 0 {
                obj.insert("block-incr-size".into(), json!(f.block_incr_size));
                obj.insert("block-incr-map-size".into(), json!(f.block_incr_map_size));
                obj.insert(
                    "block-incr-checksum-size".into(),
                    json!(f.block_incr_checksum_size),
                );
            }
            doc.set("target:file", name, Value::Object(obj));
        }

        for (oid, db) in &self.dbs {
            doc.set(
                "db",
                &oid.to_string(),
                json!({"name": db.name, "last-system-oid": db.last_system_oid}),
            );
        }

        doc
    }

    pub fn from_doc(doc: &KeyValDoc) -> Result<Self> {
        let format = doc.get_u64("backrest", "backrest-format")?;
        if format != REPOSITORY_FORMAT {
            return Err(Error::format(format!(
                "repository format {format} (expected {REPOSITORY_FORMAT})"
            )));
        }

        let label = Label::parse(doc.get_str("backup", "backup-label")?)?;
        let backup_type = BackupType::parse(doc.get_str("backup", "backup-type")?)?;

        let opt_str = |section: &str, key: &str| -> Option<String> {
            doc.get(section, key)
                .and_then(Value::as_str)
                .map(str::to_owned)
        };

        let prior = match opt_str("backup", "backup-prior") {
            Some(p) => Some(Label::parse(&p)?),
            None    => None,
        };
        let archive_start = match opt_str("backup", "backup-archive-start") {
            Some(s) => Some(WalSegment::parse(&s)?),
            None    => None,
        };
        let archive_stop = match opt_str("backup", "backup-archive-stop") {
            Some(s) => Some(WalSegment::parse(&s)?),
            None    => None,
        };
        let compress = opt_str("backup", "backup-compress-type")
            .and_then(|s| Compress::from_option(&s))
            .unwrap_or(Compress::None);

        let reference_list = match doc.get("backup", "backup-reference") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .ok_or_else(|| Error::format("backup-reference holds a non-string"))
                        .and_then(Label::parse)
                })
                .collect::<Result<Vec<Label>>>()?,
            _ => vec![label.clone()],
        };

        let data = ManifestData {
            label,
            backup_type,
            prior,
            reference_list,
            archive_start,
            archive_stop,
            lsn_start: opt_str("backup", "backup-lsn-start"),
            lsn_stop:  opt_str("backup", "backup-lsn-stop"),
            timestamp_start: doc
                .get("backup", "backup-timestamp-start")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            timestamp_stop: doc
                .get("backup", "backup-timestamp-stop")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            cluster: ClusterInfo {
                id:        doc.get_u64("backup:db", "db-id")? as u32,
                version:   doc.get_str("backup:db", "db-version")?.to_owned(),
                system_id: doc.get_u64("backup:db", "db-system-id")?,
            },
            compress,
            block_incr: doc
                .get("backup", "backup-block-incr")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            bundle: doc
                .get("backup", "backup-bundle")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };

        let mut manifest = Manifest::new(data);

        if let Some(section) = doc.section("backup:target") {
            for (name, value) in section {
                let obj = as_object(name, value)?;
                let target_type = match obj.get("type").and_then(Value::as_str) {
                    Some("path") => TargetType::Path,
                    Some("link") => TargetType::Link,
                    _ => return Err(Error::format(format!("target '{name}': bad type"))),
                };
                manifest.targets.insert(
                    name.clone(),
                    Target {
                        target_type,
                        path: obj_str(obj, name, "path")?,
                        tablespace_id: obj
                            .get("tablespace-id")
                            .and_then(Value::as_u64)
                            .map(|v| v as u32),
                    },
                );
            }
        }

        if let Some(section) = doc.section("target:path") {
            for (name, value) in section {
                let obj = as_object(name, value)?;
                manifest.paths.insert(
                    name.clone(),
                    PathEntry {
                        user:  obj_str(obj, name, "user")?,
                        group: obj_str(obj, name, "group")?,
                        mode:  obj_str(obj, name, "mode")?,
                    },
                );
            }
        }

        if let Some(section) = doc.section("target:link") {
            for (name, value) in section {
                let obj = as_object(name, value)?;
                manifest.links.insert(
                    name.clone(),
                    LinkEntry {
                        user:        obj_str(obj, name, "user")?,
                        group:       obj_str(obj, name, "group")?,
                        destination: obj_str(obj, name, "destination")?,
                    },
                );
            }
        }

        if let Some(section) = doc.section("target:file") {
            for (name, value) in section {
                let obj = as_object(name, value)?;
                let reference = match obj.get("reference").and_then(Value::as_str) {
                    Some(r) => Some(Label::parse(r)?),
                    None    => None,
                };
                manifest.files.insert(
                    name.clone(),
                    FileEntry {
                        size: obj
                            .get("size")
                            .and_then(Value::as_u64)
                            .ok_or_else(|| Error::format(format!("file '{name}': no size")))?,
                        mtime: obj.get("timestamp").and_then(Value::as_i64).unwrap_or(0),
                        user:  obj_str(obj, name, "user")?,
                        group: obj_str(obj, name, "group")?,
                        mode:  obj_str(obj, name, "mode")?,
                        reference,
                        bundle_id:     obj.get("bundle-id").and_then(Value::as_u64),
                        bundle_offset: obj.get("bundle-offset").and_then(Value::as_u64),
                        size_repo:     obj.get("size-repo").and_then(Value::as_u64),
                        checksum:      obj.get("checksum").and_then(Value::as_str).map(str::to_owned),
                        checksum_repo: obj
                            .get("checksum-repo")
                            .and_then(Value::as_str)
                            .map(str::to_owned),
                        block_incr_map_size: obj
                            .get("block-incr-map-size")
                            .and_then(Value::as_u64)
                            .unwrap_or(0),
                        block_incr_size: obj
                            .get("block-incr-size")
                            .and_then(Value::as_u64)
                            .unwrap_or(0),
                        block_incr_checksum_size: obj
                            .get("block-incr-checksum-size")
                            .and_then(Value::as_u64)
                            .unwrap_or(0),
                    },
                );
            }
        }

        if let Some(section) = doc.section("db") {
            for (oid, value) in section {
                let obj = as_object(oid, value)?;
                let oid: u64 = oid
                    .parse()
                    .map_err(|_| Error::format(format!("db oid '{oid}' is not numeric")))?;
                manifest.dbs.insert(
                    oid,
                    DbEntry {
                        name: obj
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                        last_system_oid: obj
                            .get("last-system-oid")
                            .and_then(Value::as_u64)
                            .unwrap_or(0),
                    },
                );
            }
        }

        Ok(manifest)
    }
}

fn as_object<'v>(
    name: &str,
    value: &'v Value,
) -> Result<&'v serde_json::Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| Error::format(format!("entry '{name}' is not an object")))
}

fn obj_str(obj: &serde_json::Map<String, Value>, name: &str, key: &str) -> Result<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::format(format!("entry '{name}': missing '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    pub fn cluster() -> ClusterInfo {
        ClusterInfo { id: 1, version: "15".into(), system_id: 0x1122334455667788 }
    }

    pub fn file(size: u64) -> FileEntry {
        FileEntry {
            size,
            mtime: 1_704_067_200,
            user:  "postgres".into(),
            group: "postgres".into(),
            mode:  "0600".into(),
            reference: None,
            bundle_id: None,
            bundle_offset: None,
            size_repo: None,
            checksum: None,
            checksum_repo: None,
            block_incr_map_size: 0,
            block_incr_size: 0,
            block_incr_checksum_size: 0,
        }
    }

    fn manifest(label: &str) -> Manifest {
        Manifest::new(ManifestData {
            label:         Label::parse(label).unwrap(),
            backup_type:   Label::parse(label).unwrap().backup_type(),
            prior:         None,
            reference_list: vec![Label::parse(label).unwrap()],
            archive_start: Some(WalSegment::parse("000000010000000000000001").unwrap()),
            archive_stop:  Some(WalSegment::parse("000000010000000000000003").unwrap()),
            lsn_start:     Some("0/1000028".into()),
            lsn_stop:      Some("0/3000050".into()),
            timestamp_start: 1_704_067_200,
            timestamp_stop:  1_704_067_260,
            cluster:       cluster(),
            compress:      Compress::None,
            block_incr:    false,
            bundle:        false,
        })
    }

    #[test]
    fn label_parsing() {
        let full = Label::parse("20240101-000000F").unwrap();
        assert_eq!(full.backup_type(), BackupType::Full);
        assert_eq!(full.full_label(), "20240101-000000F");

        let incr = Label::parse("20240101-000000F_20240102-120000I").unwrap();
        assert_eq!(incr.backup_type(), BackupType::Incr);
        assert_eq!(incr.full_label(), "20240101-000000F");
        assert!(full < incr);

        assert!(Label::parse("not-a-label").is_err());
        assert!(Label::parse("20241301-000000F").is_err());
        assert!(Label::parse("20240101-000000X").is_err());
    }

    #[test]
    fn save_load_roundtrip() {
        let storage = MemoryStorage::new();
        let mut m = manifest("20240101-000000F");
        m.targets.insert(
            "pg_data".into(),
            Target { target_type: TargetType::Path, path: "/var/lib/pgsql".into(), tablespace_id: None },
        );
        m.paths.insert(
            "pg_data".into(),
            PathEntry { user: "postgres".into(), group: "postgres".into(), mode: "0700".into() },
        );
        let mut f = file(8192);
        f.checksum = Some("9a8b7c6d5e9a8b7c6d5e9a8b7c6d5e9a8b7c6d5e".into());
        m.files.insert("pg_data/base/1/1".into(), f);
        m.dbs.insert(16384, DbEntry { name: "app".into(), last_system_oid: 13756 });

        m.save(&storage).unwrap();
        let loaded = Manifest::load(&storage, &m.data.label).unwrap();
        assert_eq!(loaded, m);
    }

    #[test]
    fn reference_list_resolves_block_map_indices() {
        let mut m = manifest("20240101-000000F_20240103-000000I");
        m.data.reference_list = vec![
            Label::parse("20240101-000000F").unwrap(),
            Label::parse("20240101-000000F_20240102-000000I").unwrap(),
            Label::parse("20240101-000000F_20240103-000000I").unwrap(),
        ];
        let mut a = file(100);
        a.reference = Some(Label::parse("20240101-000000F").unwrap());
        m.files.insert("pg_data/base/1/1".into(), a);
        m.validate().unwrap();
        assert_eq!(m.self_reference(), 2);

        // A file reference missing from the list fails validation.
        let mut b = file(100);
        b.reference = Some(Label::parse("20240101-000000F_20240102-120000I").unwrap());
        m.files.insert("pg_data/base/1/2".into(), b);
        assert!(m.validate().is_err());

        // An unsorted list fails too.
        m.files.remove("pg_data/base/1/2");
        m.data.reference_list.swap(0, 1);
        assert!(m.validate().is_err());
    }

    #[test]
    fn reference_outside_chain_rejected() {
        let mut m = manifest("20240101-000000F_20240102-000000I");
        let mut f = file(100);
        f.reference = Some(Label::parse("20231201-000000F").unwrap());
        m.files.insert("pg_data/base/1/1".into(), f);
        assert!(m.validate().is_err());
    }

    #[test]
    fn overlapping_bundle_extents_rejected() {
        let mut m = manifest("20240101-000000F");
        let mut a = file(100);
        a.bundle_id = Some(1);
        a.bundle_offset = Some(0);
        a.size_repo = Some(120);
        let mut b = file(100);
        b.bundle_id = Some(1);
        b.bundle_offset = Some(100);
        b.size_repo = Some(80);
        m.files.insert("pg_data/base/1/1".into(), a);
        m.files.insert("pg_data/base/1/2".into(), b);
        assert!(m.validate().is_err());

        // Disjoint extents pass.
        m.files.get_mut("pg_data/base/1/2").unwrap().bundle_offset = Some(120);
        m.validate().unwrap();
    }

    #[test]
    fn archive_range_must_be_ordered() {
        let mut m = manifest("20240101-000000F");
        m.data.archive_start = Some(WalSegment::parse("000000010000000000000005").unwrap());
        m.data.archive_stop = Some(WalSegment::parse("000000010000000000000003").unwrap());
        assert!(m.validate().is_err());

        // Cross-timeline ranges are meaningless too.
        m.data.archive_start = Some(WalSegment::parse("000000020000000000000001").unwrap());
        assert!(m.validate().is_err());
    }
}
