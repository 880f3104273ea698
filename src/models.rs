use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A person discovered under the faces directory, identified by its folder name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    pub directory: PathBuf,
    pub faces: Vec<PathBuf>,
}

impl Person {
    pub fn face_assets(&self) -> impl Iterator<Item = FaceAsset> + '_ {
        self.faces.iter().map(|face| FaceAsset {
            person: self.name.clone(),
            face: face.clone(),
        })
    }
}

/// One face image of one person. Each selected asset gets its own worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceAsset {
    pub person: String,
    pub face: PathBuf,
}

impl FaceAsset {
    pub fn face_stem(&self) -> String {
        file_stem(&self.face)
    }

    pub fn worker_id(&self) -> WorkerId {
        WorkerId(format!("{}/{}", self.person, self.face_stem()))
    }
}

/// A pending source image, identified by its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceImage {
    pub path: PathBuf,
}

impl SourceImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Display name used in logs and output names.
    pub fn stem(&self) -> String {
        file_stem(&self.path)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// `person/face-stem`, unique within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic staging file name: `"{person} {face-stem} {source-stem}.{ext}"`.
///
/// Results can be grouped by person and source from the name alone. Parsing
/// splits on the first two spaces, so the person name and face stem must not
/// contain spaces while the source stem may.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputName {
    pub person: String,
    pub face_stem: String,
    pub source_stem: String,
    pub extension: String,
}

impl OutputName {
    pub fn new(asset: &FaceAsset, source: &SourceImage, extension: &str) -> Self {
        Self {
            person: asset.person.clone(),
            face_stem: asset.face_stem(),
            source_stem: source.stem(),
            extension: extension.to_string(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{} {} {}.{}",
            self.person, self.face_stem, self.source_stem, self.extension
        )
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, extension) = file_name.rsplit_once('.')?;
        let mut parts = stem.splitn(3, ' ');
        let person = parts.next()?;
        let face_stem = parts.next()?;
        let source_stem = parts.next()?;

        if person.is_empty() || face_stem.is_empty() || source_stem.is_empty() || extension.is_empty() {
            return None;
        }

        Some(Self {
            person: person.to_string(),
            face_stem: face_stem.to_string(),
            source_stem: source_stem.to_string(),
            extension: extension.to_string(),
        })
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        Self::parse(path.file_name()?.to_str()?)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}
