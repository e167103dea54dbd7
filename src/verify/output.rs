//! Verify report rendering — aligned text for humans, JSON for machines.

use super::{BackupStatus, VerifyReport};

/// Human-readable rendering.
pub fn render_text(report: &VerifyReport) -> String {
    let mut out = String::new();

    out.push_str(&format!("stanza: {}\n", report.stanza));
    out.push_str(&format!("status: {}\n", report.status));

    if !report.errors.is_empty() {
        out.push('\n');
        for error in &report.errors {
            out.push_str(&format!("error: {error}\n"));
        }
    }

    out.push('\n');
    if report.archives.is_empty() {
        out.push_str("archives: none found\n");
    } else {
        for a in &report.archives {
            out.push_str(&format!(
                "archive: {}, total wal checked: {}, total valid wal: {}\n",
                a.archive_id, a.total_wal, a.valid_wal
            ));
            let c = &a.counters;
            if c.total() > 0 {
                out.push_str(&format!(
                    "  missing: {}, checksum invalid: {}, size invalid: {}, other: {}\n",
                    c.missing, c.checksum_invalid, c.size_invalid, c.other
                ));
            }
        }
    }

    out.push('\n');
    if report.backups.is_empty() {
        out.push_str("backups: none found\n");
    } else {
        for b in &report.backups {
            let status = match b.status {
                BackupStatus::Valid           => "valid",
                BackupStatus::Invalid         => "invalid",
                BackupStatus::MissingManifest => "manifest missing",
                BackupStatus::InProgress      => "in progress",
            };
            out.push_str(&format!(
                "backup: {}, status: {}, total files checked: {}, total valid files: {}\n",
                b.label, status, b.total_files, b.valid_files
            ));
            let c = &b.counters;
            if c.total() > 0 {
                out.push_str(&format!(
                    "  missing: {}, checksum invalid: {}, size invalid: {}, wal invalid: {}, other: {}\n",
                    c.missing, c.checksum_invalid, c.size_invalid, c.wal_invalid, c.other
                ));
            }
            for f in &b.invalid_files {
                out.push_str(&format!("  invalid file: {} ({})\n", f.path, f.reason));
            }
        }
    }

    out
}

/// Structured rendering: one object with per-archive and per-backup counters.
pub fn render_json(report: &VerifyReport) -> String {
    serde_json::to_string_pretty(report).expect("report serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{ArchiveResult, BackupResult};

    #[test]
    fn text_lists_backups_and_archives() {
        let mut report = VerifyReport::new("main");
        report.archives.push(ArchiveResult::new("15-1"));
        let mut backup = BackupResult::new("20240101-000000F");
        backup.total_files = 1;
        backup.valid_files = 1;
        report.backups.push(backup);
        report.finalize();

        let text = render_text(&report);
        assert!(text.contains("status: ok"));
        assert!(text.contains(
            "backup: 20240101-000000F, status: valid, total files checked: 1, total valid files: 1"
        ));
    }

    #[test]
    fn json_round_trips_through_serde() {
        let mut report = VerifyReport::new("main");
        report.error("No usable backup.info file");
        report.finalize();

        let json = render_json(&report);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["errors"][0], "No usable backup.info file");
        assert_eq!(value["job_error_total"], 1);
    }
}
