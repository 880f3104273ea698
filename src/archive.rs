use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::FileOpError;

/// One archived source awaiting review of its results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReview {
    pub original_source_path: PathBuf,
    pub completed_source_path: PathBuf,
    pub result_image_paths: Vec<PathBuf>,
    pub archived_at: DateTime<Utc>,
}

/// `PendingReview.json` under the root directory.
pub struct PendingReviewLedger {
    path: PathBuf,
    entries: Mutex<Vec<PendingReview>>,
}

impl PendingReviewLedger {
    /// Load the ledger. A corrupt file is backed up and replaced by an empty ledger.
    pub fn open(path: PathBuf) -> Self {
        let entries = match load_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("Failed to load {}: {:#}", path.display(), e);
                backup_corrupt(&path);
                Vec::new()
            }
        };
        log::debug!("Loaded {} pending reviews from {}", entries.len(), path.display());
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry unless its original source is already listed.
    pub fn add(&self, entry: PendingReview) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries
            .iter()
            .any(|item| item.original_source_path == entry.original_source_path)
        {
            log::warn!(
                "Duplicate pending review for {} ignored",
                entry.original_source_path.display()
            );
            return Ok(false);
        }
        entries.push(entry);
        self.save(&entries)?;
        Ok(true)
    }

    pub fn remove(&self, original_source_path: &Path) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|item| item.original_source_path != original_source_path);
        if entries.len() == before {
            return Ok(false);
        }
        self.save(&entries)?;
        Ok(true)
    }

    pub fn entries(&self) -> Vec<PendingReview> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
        self.save(&entries)
    }

    fn save(&self, entries: &[PendingReview]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

fn load_entries(path: &Path) -> Result<Vec<PendingReview>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn backup_corrupt(path: &Path) {
    if !path.exists() {
        return;
    }
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let backup = path.with_extension(format!("json.corrupt_{stamp}"));
    match std::fs::copy(path, &backup) {
        Ok(_) => log::info!("Backed up corrupt ledger to {}", backup.display()),
        Err(e) => log::error!("Could not back up corrupt ledger {}: {}", path.display(), e),
    }
}

/// Moves fully processed sources into the archive directory and records them
/// in the review ledger.
pub struct SourceArchiver {
    archive_dir: PathBuf,
    ledger: Option<PendingReviewLedger>,
}

impl SourceArchiver {
    pub fn new(archive_dir: PathBuf, ledger: Option<PendingReviewLedger>) -> Self {
        Self { archive_dir, ledger }
    }

    pub fn ledger(&self) -> Option<&PendingReviewLedger> {
        self.ledger.as_ref()
    }

    /// Move `source` into the archive. The ledger is only touched once the
    /// move succeeded; ledger write errors are logged.
    pub fn archive(&self, source: &Path, results: Vec<PathBuf>) -> Result<PathBuf, FileOpError> {
        let target = free_target(&self.archive_dir, source);

        std::fs::create_dir_all(&self.archive_dir).map_err(|e| FileOpError::Move {
            from: source.to_path_buf(),
            to: target.clone(),
            source: e,
        })?;
        move_file(source, &target)?;

        if let Some(ledger) = &self.ledger {
            let entry = PendingReview {
                original_source_path: source.to_path_buf(),
                completed_source_path: target.clone(),
                result_image_paths: results,
                archived_at: Utc::now(),
            };
            if let Err(e) = ledger.add(entry) {
                log::error!("Failed to record pending review for {}: {:#}", source.display(), e);
            }
        }

        Ok(target)
    }
}

/// `archive_dir/<name>`, or `<stem>_<n>.<ext>` when an earlier run already
/// archived a file with that name.
fn free_target(archive_dir: &Path, source: &Path) -> PathBuf {
    let file_name = source.file_name().unwrap_or(source.as_os_str());
    let target = archive_dir.join(file_name);
    if !target.exists() {
        return target;
    }

    let stem = source.file_stem().unwrap_or_default().to_string_lossy();
    let extension = source
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    (1..)
        .map(|n| archive_dir.join(format!("{stem}_{n}{extension}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(target)
}

/// Rename, falling back to copy + delete across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<(), FileOpError> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)
        .and_then(|_| std::fs::remove_file(from))
        .map_err(|source| FileOpError::Move {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })
}
