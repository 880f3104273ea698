use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::models::{Person, SourceImage};
use crate::utils::{has_image_extension, validate_image_file};

/// Directory layout under the root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootLayout {
    pub root: PathBuf,
    pub faces_dir: PathBuf,
    pub sources_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub final_dir: PathBuf,
}

impl RootLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let sources_dir = root.join("SourceImages");
        Self {
            faces_dir: root.join("Faces"),
            archive_dir: sources_dir.join("Completed"),
            staging_dir: root.join("Temp"),
            final_dir: root.join("Final"),
            sources_dir,
            root,
        }
    }

    /// `None` unless `root` is an existing directory.
    pub fn existing(root: &Path) -> Option<Self> {
        root.is_dir().then(|| Self::new(root))
    }

    pub fn review_ledger_path(&self) -> PathBuf {
        self.root.join("PendingReview.json")
    }
}

/// Image files directly inside `dir`, sorted by file name.
fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to read directory entry in {}", dir.display()))?;
        if entry.file_type().is_file() && has_image_extension(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Keep the first file per stem. Output names only carry the stem, so two
/// files that differ by extension would write the same result.
fn first_per_stem(files: Vec<PathBuf>, kind: &str) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    files
        .into_iter()
        .filter(|path| {
            let stem = path.file_stem().map(|stem| stem.to_os_string()).unwrap_or_default();
            let first = seen.insert(stem);
            if !first {
                log::warn!("Skipping {kind} {}: another file has the same name", path.display());
            }
            first
        })
        .collect()
}

/// Scan the pending-sources directory (not recursing into the archive) and
/// drop files whose header doesn't look like an image.
pub fn scan_sources(layout: &RootLayout) -> Result<Vec<SourceImage>> {
    if !layout.sources_dir.is_dir() {
        log::warn!("Source directory not found: {}", layout.sources_dir.display());
        return Ok(Vec::new());
    }

    let candidates = image_files(&layout.sources_dir)?;
    let sources: Vec<SourceImage> = candidates
        .par_iter()
        .filter_map(|path| match validate_image_file(path) {
            Ok(()) => Some(SourceImage::new(path.clone())),
            Err(e) => {
                log::warn!("Skipping source {}: {}", path.display(), e);
                None
            }
        })
        .collect();
    let sources: Vec<SourceImage> = first_per_stem(sources.into_iter().map(|s| s.path).collect(), "source")
        .into_iter()
        .map(SourceImage::new)
        .collect();

    log::info!("Found {} source images in {}", sources.len(), layout.sources_dir.display());
    Ok(sources)
}

/// Person discovery with an explicit cache, rescanned on demand.
pub struct PeopleLibrary {
    layout: RootLayout,
    cache: Option<Vec<Person>>,
}

impl PeopleLibrary {
    pub fn new(layout: RootLayout) -> Self {
        Self { layout, cache: None }
    }

    pub fn layout(&self) -> &RootLayout {
        &self.layout
    }

    /// Cached persons, scanning on first use or when `force_rescan` is set.
    pub fn persons(&mut self, force_rescan: bool) -> Result<&[Person]> {
        if force_rescan || self.cache.is_none() {
            let scanned = self.scan()?;
            self.cache = Some(scanned);
        }
        Ok(self.cache.as_deref().unwrap_or_default())
    }

    pub fn refresh(&mut self) -> Result<&[Person]> {
        log::debug!("Invalidating person cache");
        self.persons(true)
    }

    /// Known persons matching `names`, in the order given.
    pub fn select(&mut self, names: &[String]) -> Result<Vec<Person>> {
        let persons = self.persons(false)?;
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            match persons.iter().find(|person| &person.name == name) {
                Some(person) => selected.push(person.clone()),
                None => log::warn!("Unknown person requested: {name}"),
            }
        }
        Ok(selected)
    }

    fn scan(&self) -> Result<Vec<Person>> {
        let faces_dir = &self.layout.faces_dir;
        if !faces_dir.is_dir() {
            log::warn!("Faces directory not found: {}", faces_dir.display());
            return Ok(Vec::new());
        }

        log::info!("Scanning for persons in {}", faces_dir.display());
        let mut persons = Vec::new();
        for entry in WalkDir::new(faces_dir).min_depth(1).max_depth(1).follow_links(false) {
            let entry = entry.with_context(|| format!("Failed to scan {}", faces_dir.display()))?;
            if !entry.file_type().is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let faces = first_per_stem(image_files(entry.path())?, "face");
            if faces.is_empty() {
                log::warn!("No face images found for person: {name}");
            }
            persons.push(Person {
                name,
                directory: entry.into_path(),
                faces,
            });
        }

        persons.sort_by(|a, b| a.name.cmp(&b.name));
        log::info!("Found {} persons", persons.len());
        Ok(persons)
    }
}
