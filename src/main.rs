use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use coffer::backup::{backup_cluster, BackupOptions};
use coffer::restore::{restore_backup, RestoreOptions};
use coffer::verify::{render_json, render_text, verify, VerifyOptions};
use coffer::{BackupType, ClusterInfo, Compress, Label, PosixStorage, WalSegment};

#[derive(Parser)]
#[command(name = "coffer", version = "1.0.0", about = "Block-incremental cluster backup")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a cluster data directory into the repository
    Backup {
        /// Repository root
        #[arg(short, long)]
        repo: PathBuf,
        /// Cluster data directory
        #[arg(short, long)]
        pg: PathBuf,
        #[arg(short, long, default_value = "main")]
        stanza: String,
        /// Backup type: full, diff, incr
        #[arg(short = 't', long, default_value = "full")]
        r#type: String,
        /// Compression: none, gz, bz2, lz4, zst
        #[arg(short, long, default_value = "none")]
        compress: String,
        /// Store changed files block-incrementally
        #[arg(long)]
        block_incr: bool,
        /// Block size in KiB
        #[arg(long, default_value = "128")]
        block_size: u64,
        /// Encrypt the repository with this passphrase
        #[arg(long)]
        cipher_pass: Option<String>,
        /// Cluster version (introspection is out of scope)
        #[arg(long, default_value = "15")]
        pg_version: String,
        /// Cluster system identifier
        #[arg(long, default_value = "0")]
        system_id: u64,
    },
    /// Restore a backup into a target directory
    Restore {
        #[arg(short, long)]
        repo: PathBuf,
        #[arg(short, long)]
        target: PathBuf,
        /// Backup label to restore
        #[arg(short, long)]
        label: String,
        #[arg(short, long, default_value = "main")]
        stanza: String,
        /// Reuse matching blocks already present in the target
        #[arg(long)]
        delta: bool,
        #[arg(long)]
        cipher_pass: Option<String>,
    },
    /// Check repository consistency: backups, manifests, WAL coverage
    Verify {
        #[arg(short, long)]
        repo: PathBuf,
        #[arg(short, long, default_value = "main")]
        stanza: String,
        /// Verify only this backup and everything it references
        #[arg(short, long)]
        backup: Option<String>,
        /// Bound WAL checking to start at this segment
        #[arg(long)]
        archive_start: Option<String>,
        /// Bound WAL checking to stop at this segment
        #[arg(long)]
        archive_stop: Option<String>,
        /// Output mode: text or json
        #[arg(short, long, default_value = "text")]
        output: String,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    match Cli::parse().command {

        // ── Backup ───────────────────────────────────────────────────────────
        Commands::Backup {
            repo, pg, stanza, r#type, compress, block_incr,
            block_size, cipher_pass, pg_version, system_id,
        } => {
            let storage = PosixStorage::new(&repo);
            let cluster = ClusterInfo { id: 1, version: pg_version, system_id };
            let mut opts = BackupOptions::new(&stanza, cluster);
            opts.backup_type = BackupType::parse(&r#type)?;
            opts.compress = parse_compress(&compress);
            opts.block_incr = block_incr;
            opts.block_size = block_size * 1024;
            opts.super_block_size = opts.block_size * 8;
            opts.cipher_pass = cipher_pass;

            let label = backup_cluster(&storage, &pg, &opts)?;
            println!("backup complete: {label}");
            Ok(ExitCode::SUCCESS)
        }

        // ── Restore ──────────────────────────────────────────────────────────
        Commands::Restore { repo, target, label, stanza, delta, cipher_pass } => {
            let storage = PosixStorage::new(&repo);
            let label = Label::parse(&label)?;
            let opts = RestoreOptions { stanza, cipher_pass, delta };
            let summary = restore_backup(&storage, &label, &target, &opts)?;
            println!(
                "restore complete: {} file(s), {} block(s) fetched, {} B written",
                summary.files_restored, summary.blocks_fetched, summary.bytes_written
            );
            Ok(ExitCode::SUCCESS)
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { repo, stanza, backup, archive_start, archive_stop, output } => {
            let storage = PosixStorage::new(&repo);
            let mut opts = VerifyOptions::new(&stanza);
            opts.backup_label = backup.as_deref().map(Label::parse).transpose()?;
            opts.archive_start = archive_start.as_deref().map(WalSegment::parse).transpose()?;
            opts.archive_stop = archive_stop.as_deref().map(WalSegment::parse).transpose()?;

            let report = verify(&storage, &opts);
            match output.as_str() {
                "json" => print!("{}", render_json(&report)),
                _      => print!("{}", render_text(&report)),
            }
            Ok(if report.is_ok() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn parse_compress(s: &str) -> Compress {
    Compress::from_option(s).unwrap_or_else(|| {
        eprintln!("Unknown compression '{}', storing uncompressed", s);
        Compress::None
    })
}
