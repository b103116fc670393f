use std::path::Path;

use dropvault_core::protocol::{FileEntry, VersionEntry};
use dropvault_engine::client::{DownloadReport, UploadReport};

/// Formats a byte count into a human-readable string (B, KiB, MiB, GiB).
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Formats a transfer rate in MB/s.
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{:.2} MB/s", bytes_per_sec / 1_000_000.0)
}

/// Prints the server startup banner.
pub fn print_banner(
    listen_addr: &str,
    storage_root: &Path,
    versions_root: &Path,
    max_connections: usize,
) {
    println!();
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║              🗄   DropVault  Server  🗄               ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  Listen   : {listen_addr:<40} ║");
    println!("║  Storage  : {:<40} ║", storage_root.display().to_string());
    println!("║  Versions : {:<40} ║", versions_root.display().to_string());
    println!("║  Max conn : {max_connections:<40} ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
}

/// Prints the stored files, each followed by its archived versions.
pub fn print_file_table(files: &[FileEntry]) {
    if files.is_empty() {
        println!("  (no files stored)");
        return;
    }

    let width = files
        .iter()
        .map(|f| f.filename.len())
        .max()
        .unwrap_or(0)
        .max("Name".len());
    println!("  {:<width$}  {:>12}  Modified", "Name", "Size");
    println!("  {}", "─".repeat(width + 36));
    for file in files {
        println!(
            "  {:<width$}  {:>12}  {}",
            file.filename,
            format_size(file.size),
            file.modified
        );
        for version in &file.versions {
            println!(
                "    ↳ {:<w$}  {:>12}  {}",
                version.filename,
                format_size(version.size),
                version.modified,
                w = width.saturating_sub(4),
            );
        }
    }
    println!();
    println!("  {} file(s)", files.len());
}

/// Prints the archived versions of `filename`, newest first.
pub fn print_version_table(filename: &str, versions: &[VersionEntry]) {
    if versions.is_empty() {
        println!("  {filename} has no archived versions");
        return;
    }

    println!("  Versions of {filename} (newest first):");
    for (i, version) in versions.iter().enumerate() {
        println!(
            "  {:>3}. {}  {:>12}  {}",
            i + 1,
            version.filename,
            format_size(version.size),
            version.modified
        );
    }
}

pub fn print_upload_report(report: &UploadReport) {
    println!(
        "  ✅ Uploaded {} as \"{}\" ({}, {:.2?})",
        report.requested,
        report.stored_as,
        format_size(report.filesize),
        report.elapsed
    );
    println!("     SHA-256: {}", report.hash);
}

pub fn print_download_report(report: &DownloadReport) {
    let resumed = match report.resumes {
        0 => String::new(),
        1 => ", resumed once".to_owned(),
        n => format!(", resumed {n} times"),
    };
    println!(
        "  ✅ Downloaded {} to {} ({}, {:.2?}{resumed})",
        report.filename,
        report.path.display(),
        format_size(report.filesize),
        report.elapsed
    );
    println!("     SHA-256 verified: {}", report.hash);
}
