//! Repository storage seam — an abstract byte-addressable object store.
//!
//! The engine consumes exactly five primitives: whole-object read, ranged
//! read, atomic write, child listing, and existence.  Anything a POSIX
//! filesystem, an SMB share, or an object store can supply.  Remote drivers
//! live outside this crate; two implementations ship here:
//!
//! - [`MemoryStorage`] — test double, a flat path → bytes map.
//! - [`PosixStorage`] — thin `std::fs` binding rooted at a directory, used by
//!   the CLI.  Writes go through a temp name + rename so a crashed upload
//!   never leaves a half-written object at its final path.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

pub trait Storage: Send + Sync {
    /// Read a whole object.  [`Error::FileMissing`] when absent.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Read `len` bytes at `offset`.  Short objects are a read error, not a
    /// short read — callers always know the extent they want.
    fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Store an object, replacing any prior content atomically.
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Immediate children of a directory-like prefix, sorted, no duplicates.
    /// A missing prefix lists as empty.
    fn list(&self, path: &str) -> Result<Vec<String>>;

    fn exists(&self, path: &str) -> Result<bool>;
}

// ── Memory ───────────────────────────────────────────────────────────────────

/// Flat in-memory store keyed by `/`-separated paths.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove an object; absent is fine.
    pub fn remove(&self, path: &str) {
        self.objects.lock().unwrap().remove(path);
    }
}

impl Storage for MemoryStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::FileMissing(path.to_owned()))
    }

    fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let data = self.read(path)?;
        let start = offset as usize;
        let end = start + len as usize;
        if end > data.len() {
            return Err(Error::FileRead {
                name: path.to_owned(),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("range {start}..{end} exceeds object size {}", data.len()),
                ),
            });
        }
        Ok(data[start..end].to_vec())
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_owned(), data.to_vec());
        Ok(())
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        let objects = self.objects.lock().unwrap();
        let mut children = BTreeSet::new();
        for key in objects.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if rest.is_empty() {
                    continue;
                }
                let child = rest.split('/').next().unwrap_or(rest);
                children.insert(child.to_owned());
            }
        }
        Ok(children.into_iter().collect())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(path))
    }
}

// ── POSIX ────────────────────────────────────────────────────────────────────

pub struct PosixStorage {
    root: PathBuf,
}

impl PosixStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_owned() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Storage for PosixStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        match fs::read(&full) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::FileMissing(path.to_owned()))
            }
            Err(e) => Err(Error::FileRead { name: path.to_owned(), source: e }),
        }
    }

    fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        let mut f = match fs::File::open(&full) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileMissing(path.to_owned()));
            }
            Err(e) => return Err(Error::FileOpen { name: path.to_owned(), source: e }),
        };
        f.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::FileRead { name: path.to_owned(), source: e })?;
        let mut buf = vec![0u8; len as usize];
        f.read_exact(&mut buf)
            .map_err(|e| Error::FileRead { name: path.to_owned(), source: e })?;
        Ok(buf)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::FileWrite { name: path.to_owned(), source: e })?;
        }
        // Temp + rename keeps the final path atomic on POSIX filesystems.
        let tmp = full.with_extension("partial");
        {
            let mut f = fs::File::create(&tmp)
                .map_err(|e| Error::FileOpen { name: path.to_owned(), source: e })?;
            f.write_all(data)
                .map_err(|e| Error::FileWrite { name: path.to_owned(), source: e })?;
        }
        fs::rename(&tmp, &full)
            .map_err(|e| Error::FileWrite { name: path.to_owned(), source: e })?;
        Ok(())
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let full = self.resolve(path);
        let entries = match fs::read_dir(&full) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::FileOpen { name: path.to_owned(), source: e }),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_list_returns_immediate_children() {
        let s = MemoryStorage::new();
        s.write("backup/20240101-000000F/backup.manifest", b"m").unwrap();
        s.write("backup/20240101-000000F/base/1/1", b"d").unwrap();
        s.write("backup/backup.info", b"i").unwrap();
        assert_eq!(
            s.list("backup").unwrap(),
            vec!["20240101-000000F".to_owned(), "backup.info".to_owned()]
        );
        assert_eq!(s.list("archive").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn memory_range_reads() {
        let s = MemoryStorage::new();
        s.write("obj", b"0123456789").unwrap();
        assert_eq!(s.read_range("obj", 2, 3).unwrap(), b"234");
        assert!(s.read_range("obj", 8, 5).is_err());
        assert!(matches!(s.read("gone"), Err(Error::FileMissing(_))));
    }

    #[test]
    fn posix_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = PosixStorage::new(dir.path());
        s.write("backup/label/file", b"payload").unwrap();
        assert!(s.exists("backup/label/file").unwrap());
        assert_eq!(s.read("backup/label/file").unwrap(), b"payload");
        assert_eq!(s.read_range("backup/label/file", 3, 4).unwrap(), b"load");
        assert_eq!(s.list("backup").unwrap(), vec!["label".to_owned()]);
        assert!(matches!(s.read("missing"), Err(Error::FileMissing(_))));
    }
}
