//! Keyed text documents — the manifest / info file carrier format.
//!
//! ```text
//! [backrest]
//! backrest-checksum="0c4ceecaf0f9d76fad7bd2f7f7bbaf0dfdb14b27"
//! backrest-format=5
//!
//! [section]
//! key=<JSON value>
//! ```
//!
//! Sections and keys are emitted sorted, values as compact JSON.  The
//! checksum is SHA-1 over the canonical JSON serialization of every
//! non-checksum key (sections sorted, keys sorted), so identical logical
//! content always hashes identically regardless of formatting history.
//!
//! Every document is stored twice: primary and `<name>.copy`.  Loading reads
//! the primary and falls back to the copy on any failure including a checksum
//! mismatch; a divergent but readable pair trusts the primary and logs.

use std::collections::BTreeMap;

use log::warn;
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::storage::Storage;

/// Extension of the redundant second copy.
pub const COPY_EXT: &str = ".copy";

const SECTION_BACKREST: &str = "backrest";
const KEY_CHECKSUM:     &str = "backrest-checksum";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValDoc {
    sections: BTreeMap<String, BTreeMap<String, Value>>,
}

impl KeyValDoc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, section: &str, key: &str, value: Value) {
        self.sections
            .entry(section.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.sections.get(section)?.get(key)
    }

    pub fn section(&self, section: &str) -> Option<&BTreeMap<String, Value>> {
        self.sections.get(section)
    }

    /// Required string key; [`Error::Format`] when absent or mistyped.
    pub fn get_str(&self, section: &str, key: &str) -> Result<&str> {
        self.get(section, key)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::format(format!("missing key '{key}' in [{section}]")))
    }

    /// Required unsigned key.
    pub fn get_u64(&self, section: &str, key: &str) -> Result<u64> {
        self.get(section, key)
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::format(format!("missing key '{key}' in [{section}]")))
    }

    /// SHA-1 over the canonical JSON form of every non-checksum key.
    pub fn checksum(&self) -> String {
        let mut canonical: BTreeMap<&str, BTreeMap<&str, &Value>> = BTreeMap::new();
        for (section, keys) in &self.sections {
            for (key, value) in keys {
                if section == SECTION_BACKREST && key == KEY_CHECKSUM {
                    continue;
                }
                canonical
                    .entry(section.as_str())
                    .or_default()
                    .insert(key.as_str(), value);
            }
        }
        let bytes = serde_json::to_vec(&canonical).expect("canonical form serializes");
        hex::encode(Sha1::digest(&bytes))
    }

    /// Render with the checksum stamped into `[backrest]`.
    pub fn to_text(&self) -> String {
        let mut doc = self.clone();
        let checksum = doc.checksum();
        doc.set(SECTION_BACKREST, KEY_CHECKSUM, Value::String(checksum));

        let mut out = String::new();
        for (section, keys) in &doc.sections {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push('[');
            out.push_str(section);
            out.push_str("]\n");
            for (key, value) in keys {
                out.push_str(key);
                out.push('=');
                out.push_str(&value.to_string());
                out.push('\n');
            }
        }
        out
    }

    /// Parse and verify the embedded checksum.
    pub fn parse(text: &str) -> Result<Self> {
        let mut doc = KeyValDoc::new();
        let mut current: Option<String> = None;

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(name.to_owned());
                continue;
            }
            let section = current
                .as_deref()
                .ok_or_else(|| Error::format(format!("line {}: key before any section", line_no + 1)))?;
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::format(format!("line {}: expected key=value", line_no + 1)))?;
            let value: Value = serde_json::from_str(value)
                .map_err(|e| Error::format(format!("line {}: bad value: {e}", line_no + 1)))?;
            doc.set(section, key, value);
        }

        let stored = doc
            .get(SECTION_BACKREST, KEY_CHECKSUM)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| Error::format("document has no backrest-checksum"))?;
        doc.sections
            .get_mut(SECTION_BACKREST)
            .unwrap()
            .remove(KEY_CHECKSUM);

        let actual = doc.checksum();
        if actual != stored {
            return Err(Error::Checksum {
                name:     "keyed document".to_owned(),
                expected: stored,
                actual,
            });
        }
        Ok(doc)
    }
}

// ── Primary/copy pair ────────────────────────────────────────────────────────

/// Write a document to `path` and `path.copy`.
pub fn save_pair(storage: &dyn Storage, path: &str, doc: &KeyValDoc) -> Result<()> {
    let text = doc.to_text();
    storage.write(path, text.as_bytes())?;
    storage.write(&format!("{path}{COPY_EXT}"), text.as_bytes())?;
    Ok(())
}

/// Load `path`, falling back to `path.copy`.
///
/// A readable primary wins even when the copy diverges (logged).  Both
/// unusable is a single error for the pair, favouring the primary's failure.
pub fn load_pair(storage: &dyn Storage, path: &str) -> Result<KeyValDoc> {
    let copy_path = format!("{path}{COPY_EXT}");

    let primary = storage
        .read(path)
        .and_then(|bytes| parse_bytes(path, &bytes));

    match primary {
        Ok(doc) => {
            if let Ok(copy_bytes) = storage.read(&copy_path) {
                match parse_bytes(&copy_path, &copy_bytes) {
                    Ok(copy) if copy.checksum() != doc.checksum() => {
                        warn!("'{copy_path}' diverges from primary; using primary");
                    }
                    Err(e) => warn!("'{copy_path}' is unusable ({e}); using primary"),
                    _ => {}
                }
            }
            Ok(doc)
        }
        Err(primary_err) => {
            match storage.read(&copy_path).and_then(|b| parse_bytes(&copy_path, &b)) {
                Ok(doc) => {
                    warn!("'{path}' is unusable ({primary_err}); loaded copy");
                    Ok(doc)
                }
                Err(_) => Err(primary_err),
            }
        }
    }
}

fn parse_bytes(path: &str, bytes: &[u8]) -> Result<KeyValDoc> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::format(format!("'{path}' is not valid UTF-8")))?;
    KeyValDoc::parse(text).map_err(|e| match e {
        Error::Checksum { expected, actual, .. } => Error::Checksum {
            name: path.to_owned(),
            expected,
            actual,
        },
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn sample() -> KeyValDoc {
        let mut doc = KeyValDoc::new();
        doc.set("backrest", "backrest-format", json!(5));
        doc.set("backup", "backup-type", json!("full"));
        doc.set("backup", "backup-label", json!("20240101-000000F"));
        doc
    }

    #[test]
    fn text_roundtrip_is_identity() {
        let doc = sample();
        let text = doc.to_text();
        let parsed = KeyValDoc::parse(&text).unwrap();
        assert_eq!(parsed, doc);
        // Deterministic: identical bytes for identical content.
        assert_eq!(parsed.to_text(), text);
    }

    #[test]
    fn tampering_fails_the_checksum() {
        let text = sample().to_text().replace("full", "diff");
        assert!(matches!(
            KeyValDoc::parse(&text),
            Err(Error::Checksum { .. })
        ));
    }

    #[test]
    fn missing_checksum_is_format_error() {
        let err = KeyValDoc::parse("[backup]\nbackup-type=\"full\"\n").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn pair_falls_back_to_copy() {
        let storage = MemoryStorage::new();
        let doc = sample();
        save_pair(&storage, "backup/backup.info", &doc).unwrap();

        // Corrupt the primary; the copy must still load.
        storage.write("backup/backup.info", b"garbage").unwrap();
        let loaded = load_pair(&storage, "backup/backup.info").unwrap();
        assert_eq!(loaded, doc);

        // Remove both: the pair error surfaces the primary failure.
        storage.remove("backup/backup.info");
        storage.remove("backup/backup.info.copy");
        assert!(load_pair(&storage, "backup/backup.info").is_err());
    }

    #[test]
    fn divergent_copy_prefers_primary() {
        let storage = MemoryStorage::new();
        save_pair(&storage, "doc", &sample()).unwrap();
        let mut other = sample();
        other.set("backup", "backup-type", json!("incr"));
        storage.write("doc.copy", other.to_text().as_bytes()).unwrap();

        let loaded = load_pair(&storage, "doc").unwrap();
        assert_eq!(loaded.get_str("backup", "backup-type").unwrap(), "full");
    }
}
