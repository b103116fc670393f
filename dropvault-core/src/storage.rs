//! On-disk layout of a DropVault storage root.
//!
//! ```text
//! <root>/
//! ├── report.pdf                     active files, one per name
//! ├── .incoming/report.pdf.part      uploads in flight
//! └── version_history/               versions root (configurable)
//!     └── report/
//!         └── report_20261016_101500.pdf
//! ```
//!
//! Uploads are written to a staging file and renamed over the active file
//! only once their digest has been verified, so an active file never holds
//! unverified bytes. Same-name uploads are serialised through [`NameLocks`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{FileEntry, HandlingMode, VersionEntry};

/// Default name of the versions root, created inside the storage root.
pub const DEFAULT_VERSIONS_DIR: &str = "version_history";
/// Directory inside the storage root holding uploads still in flight.
pub const STAGING_DIR: &str = ".incoming";
const VERSION_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const MODIFIED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Rejects names that are not a single, visible path component.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for empty names, names starting with `.`
/// (which covers `.` and `..`), and names containing `/`, `\` or NUL.
pub fn validate_filename(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.starts_with('.') {
        "hidden and relative names are not allowed"
    } else if name.contains(['/', '\\', '\0']) {
        "name must not contain path separators"
    } else {
        return Ok(());
    };
    Err(Error::Protocol(format!("invalid filename {name:?}: {reason}")))
}

/// Splits `name` into stem and extension (the extension keeps its dot).
///
/// `"a.tar.gz"` → `("a.tar", ".gz")`, `"README"` → `("README", "")`.
#[must_use]
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

fn format_modified(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format(MODIFIED_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occupancy {
    Vacant,
    File,
    Directory,
}

async fn occupancy(path: &Path) -> Result<Occupancy> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(Occupancy::Directory),
        Ok(_) => Ok(Occupancy::File),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Occupancy::Vacant),
        Err(e) => Err(e.into()),
    }
}

// ── Per-name locks ──────────────────────────────────────────────────

/// Table of per-filename async mutexes.
///
/// Entries are pruned lazily once nobody holds or waits on them.
#[derive(Debug, Default)]
pub struct NameLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive claim on one filename, released on drop.
#[derive(Debug)]
pub struct NameGuard {
    _guard: OwnedMutexGuard<()>,
}

impl NameLocks {
    fn entry(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(map.entry(name.to_owned()).or_default())
    }

    /// Waits until `name` is free and claims it.
    pub async fn lock(&self, name: &str) -> NameGuard {
        NameGuard {
            _guard: self.entry(name).lock_owned().await,
        }
    }

    /// Claims `name` if nobody else holds it.
    pub fn try_lock(&self, name: &str) -> Option<NameGuard> {
        self.entry(name)
            .try_lock_owned()
            .ok()
            .map(|guard| NameGuard { _guard: guard })
    }
}

// ── Duplicate resolution ────────────────────────────────────────────

/// Target chosen for an upload by [`Storage::resolve`].
#[derive(Debug)]
pub struct Resolution {
    filename: String,
    is_duplicate: bool,
    _reservation: Option<NameGuard>,
}

impl Resolution {
    fn new(filename: &str, is_duplicate: bool) -> Self {
        Self {
            filename: filename.to_owned(),
            is_duplicate,
            _reservation: None,
        }
    }

    /// Name the upload will be stored under.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Whether the requested name was already taken.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        self.is_duplicate
    }
}

// ── Staged uploads ──────────────────────────────────────────────────

/// An upload being written to the staging area.
///
/// Dropping it without [`commit`](StagedFile::commit) removes the staging
/// file, so every early return on an error path cleans up after itself.
#[derive(Debug)]
pub struct StagedFile {
    file: Option<fs::File>,
    path: PathBuf,
    target: PathBuf,
    disarmed: bool,
}

impl StagedFile {
    /// Appends `data` to the staging file.
    ///
    /// # Errors
    ///
    /// Propagates write errors.
    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(data).await,
            None => Err(std::io::Error::other("staging file already closed")),
        }
    }

    /// Final location of the file once committed.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Flushes the staging file and atomically moves it over the target.
    ///
    /// # Errors
    ///
    /// Returns an error if syncing or renaming fails; the staging file is
    /// removed in that case.
    pub async fn commit(mut self) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        fs::rename(&self.path, &self.target).await?;
        self.disarmed = true;
        Ok(())
    }

    /// Removes the staging file.
    pub async fn discard(mut self) {
        self.file.take();
        if let Err(e) = fs::remove_file(&self.path).await {
            warn!(path = %self.path.display(), error = %e, "Failed to remove staging file");
        }
        self.disarmed = true;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.disarmed {
            self.file.take();
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ── Storage ─────────────────────────────────────────────────────────

/// A storage root with its versions root and staging area.
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    versions_root: PathBuf,
    staging_root: PathBuf,
    locks: NameLocks,
}

impl Storage {
    /// Opens `root`, keeping versions in `<root>/version_history`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let versions_root = root.join(DEFAULT_VERSIONS_DIR);
        Self::open_with_versions(root, versions_root).await
    }

    /// Opens `root` with an explicit versions root.
    ///
    /// Creates the storage root, versions root and staging area if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub async fn open_with_versions(
        root: impl Into<PathBuf>,
        versions_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let root = root.into();
        let versions_root = versions_root.into();
        let staging_root = root.join(STAGING_DIR);

        for dir in [&root, &versions_root, &staging_root] {
            fs::create_dir_all(dir).await?;
        }
        debug!(
            root = %root.display(),
            versions_root = %versions_root.display(),
            "Storage opened"
        );

        Ok(Self {
            root,
            versions_root,
            staging_root,
            locks: NameLocks::default(),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn versions_root(&self) -> &Path {
        &self.versions_root
    }

    /// Path of the active file called `filename`.
    #[must_use]
    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// Claims `filename` for the duration of an upload.
    pub async fn lock(&self, filename: &str) -> NameGuard {
        self.locks.lock(filename).await
    }

    /// Decides where an upload of `filename` lands under `mode`.
    ///
    /// The caller is expected to hold the lock for `filename`. Under
    /// [`HandlingMode::Rename`] the chosen `name_vN.ext` is reserved until
    /// the returned [`Resolution`] is dropped, so concurrent uploads never
    /// pick the same suffix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for invalid names or names that refer to
    /// a directory, and I/O errors from probing the filesystem.
    pub async fn resolve(&self, filename: &str, mode: HandlingMode) -> Result<Resolution> {
        validate_filename(filename)?;

        match occupancy(&self.path_of(filename)).await? {
            Occupancy::Vacant => return Ok(Resolution::new(filename, false)),
            Occupancy::Directory => {
                return Err(Error::Protocol(format!("{filename} is a directory")));
            }
            Occupancy::File => {}
        }

        match mode {
            HandlingMode::Overwrite => {
                info!(filename, "File exists, will be overwritten");
                Ok(Resolution::new(filename, true))
            }
            HandlingMode::Versioning => {
                info!(filename, "File exists, versioning enabled");
                Ok(Resolution::new(filename, true))
            }
            HandlingMode::Rename => {
                let (stem, ext) = split_extension(filename);
                let mut counter: u64 = 2;
                loop {
                    let candidate = format!("{stem}_v{counter}{ext}");
                    counter += 1;

                    let Some(reservation) = self.locks.try_lock(&candidate) else {
                        continue;
                    };
                    if occupancy(&self.path_of(&candidate)).await? != Occupancy::Vacant {
                        continue;
                    }

                    info!(filename, renamed = %candidate, "File exists, renamed");
                    return Ok(Resolution {
                        filename: candidate,
                        is_duplicate: true,
                        _reservation: Some(reservation),
                    });
                }
            }
        }
    }

    /// Copies the active `filename` into its versions directory.
    ///
    /// Returns the archive path, or `None` when there is nothing to archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails.
    pub async fn archive(&self, filename: &str) -> Result<Option<PathBuf>> {
        validate_filename(filename)?;
        let source = self.path_of(filename);
        if occupancy(&source).await? != Occupancy::File {
            return Ok(None);
        }

        let (stem, ext) = split_extension(filename);
        let dir = self.versions_root.join(stem);
        fs::create_dir_all(&dir).await?;

        let timestamp = Local::now().format(VERSION_TIMESTAMP_FORMAT).to_string();
        let mut dest = dir.join(format!("{stem}_{timestamp}{ext}"));
        let mut n: u32 = 2;
        while occupancy(&dest).await? != Occupancy::Vacant {
            dest = dir.join(format!("{stem}_{timestamp}_{n:03}{ext}"));
            n += 1;
        }

        fs::copy(&source, &dest).await?;
        info!(filename, archive = %dest.display(), "Archived previous version");
        Ok(Some(dest))
    }

    /// Opens a fresh staging file for an upload that will land on `filename`.
    ///
    /// # Errors
    ///
    /// Returns an error if the staging file cannot be created.
    pub async fn stage(&self, filename: &str) -> Result<StagedFile> {
        validate_filename(filename)?;
        let path = self.staging_root.join(format!("{filename}.part"));
        let file = fs::File::create(&path).await?;
        Ok(StagedFile {
            file: Some(file),
            path,
            target: self.path_of(filename),
            disarmed: false,
        })
    }

    /// Active files sorted by name, each with its archived versions.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage root cannot be read.
    pub async fn list(&self) -> Result<Vec<FileEntry>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Ok(filename) = entry.file_name().into_string() else {
                continue;
            };
            if filename.starts_with('.') {
                continue;
            }
            let meta = match fs::metadata(entry.path()).await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    debug!(filename, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            let versions = self.versions(&filename).await?;
            files.push(FileEntry {
                modified: format_modified(meta.modified()?),
                size: meta.len(),
                filename,
                versions,
            });
        }

        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(files)
    }

    /// Archived versions of `filename`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the versions directory exists but cannot be read.
    pub async fn versions(&self, filename: &str) -> Result<Vec<VersionEntry>> {
        let (stem, ext) = split_extension(filename);
        let dir = self.versions_root.join(stem);

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !is_version_of(&name, stem, ext) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            versions.push(VersionEntry {
                modified: format_modified(meta.modified()?),
                size: meta.len(),
                filename: name,
            });
        }

        // Timestamps are embedded in the names.
        versions.sort_by(|a, b| b.filename.cmp(&a.filename));
        Ok(versions)
    }
}

/// Whether `name` is `<stem>_<timestamp>[_NNN]<ext>`. `a.txt` and `a`
/// share the `a/` versions directory, so the extension alone can't tell
/// their archives apart.
fn is_version_of(name: &str, stem: &str, ext: &str) -> bool {
    name.strip_prefix(stem)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(ext))
        .is_some_and(|stamp| {
            !stamp.is_empty() && stamp.bytes().all(|b| b.is_ascii_digit() || b == b'_')
        })
}
