use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by a browser session.
///
/// The worker treats `Transient` and `NotFound` as retryable and
/// `Fatal`/`Launch` as a reason to throw the whole session away.
#[derive(Debug, Error, Clone)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("transient browser error: {0}")]
    Transient(String),
    #[error("fatal browser error: {0}")]
    Fatal(String),
}

impl BrowserError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrowserError::Fatal(_) | BrowserError::Launch(_))
    }
}

/// Outcome of a failed step inside a worker's per-source cycle.
#[derive(Debug, Error)]
pub enum SwapError {
    /// Timeout-like failure; the same source is retried after a refresh.
    #[error("{0}")]
    Transient(String),
    /// The page sits in a busy or disabled state without progress.
    #[error("stuck: {0}")]
    Stuck(String),
    /// The browser is unusable and the session must be recreated.
    #[error("browser session lost: {0}")]
    FatalSession(String),
    #[error(transparent)]
    FileOp(#[from] FileOpError),
    /// The shared stop signal was observed.
    #[error("stop requested")]
    Stopped,
}

impl SwapError {
    /// Timeout-class failures are expected and logged without detail.
    pub fn is_expected(&self) -> bool {
        matches!(self, SwapError::Transient(_) | SwapError::Stuck(_))
    }
}

impl From<BrowserError> for SwapError {
    fn from(error: BrowserError) -> Self {
        if error.is_fatal() {
            SwapError::FatalSession(error.to_string())
        } else {
            SwapError::Transient(error.to_string())
        }
    }
}

/// Bad run configuration. A run that fails validation never starts.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("root directory is not set or is not a directory")]
    NoRootDirectory,
    #[error("no persons selected")]
    NothingSelected,
    #[error("selected persons have no face images")]
    NoFaces,
    #[error("no source images found in {0}")]
    NoSources(PathBuf),
    #[error("a run is already active")]
    AlreadyRunning,
    #[error("site profile is incomplete: {0} is not configured")]
    IncompleteSite(&'static str),
    #[error("failed to prepare staging directory {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Archive and save failures. Logged by the caller, never fatal to a run.
#[derive(Debug, Error)]
pub enum FileOpError {
    #[error("failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode result image: {0}")]
    Decode(String),
    #[error("failed to encode {path}: {reason}")]
    Encode { path: PathBuf, reason: String },
}
