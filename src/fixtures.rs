//! Shared test fakes: a scripted in-memory browser, a canned fetcher and
//! temporary root layouts.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use tempfile::TempDir;

use crate::OutputFormat;
use crate::browser::{BrowserLauncher, BrowserSession, ElementRef, Locator};
use crate::config::Timeouts;
use crate::converter::ResultConverter;
use crate::error::BrowserError;
use crate::fetch::AssetFetcher;
use crate::page::SiteProfile;
use crate::worker::WorkerSettings;

pub fn site_profile() -> SiteProfile {
    SiteProfile {
        url: "https://swap.test/".into(),
        ready: Locator::from("#app"),
        face_input: Locator::from("#face-input"),
        face_thumbnail: Locator::from("#face-thumb"),
        face_busy: Locator::from("#face-busy"),
        source_input: Locator::from("#source-input"),
        source_thumbnail: Locator::from("#source-thumb"),
        source_busy: Locator::from("#source-busy"),
        start_button: Locator::from("#start"),
        result_image: Locator::from("#result"),
        progress_container: Locator::from("#progress"),
        progress_text: Locator::from("#progress-text"),
        rate_limit_popup: Locator::from("#rate-limit"),
        rate_limit_dismiss: Locator::from("#rate-limit-close"),
    }
}

/// A 4x3 RGBA PNG.
pub fn png_bytes() -> Vec<u8> {
    let img = RgbaImage::from_pixel(4, 3, Rgba([200, 120, 40, 128]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode fixture png");
    out.into_inner()
}

/// Temp root with `Faces/<person>/<face>.png` and `SourceImages/<source>.png`.
pub fn root_with(persons: &[(&str, &[&str])], sources: &[&str]) -> TempDir {
    let root = tempfile::tempdir().expect("tempdir");
    for (name, faces) in persons {
        add_person(root.path(), name, faces);
    }
    let sources_dir = root.path().join("SourceImages");
    std::fs::create_dir_all(&sources_dir).expect("create sources dir");
    for source in sources {
        std::fs::write(sources_dir.join(format!("{source}.png")), png_bytes()).expect("write source");
    }
    root
}

pub fn add_person(root: &Path, name: &str, faces: &[&str]) {
    let dir = root.join("Faces").join(name);
    std::fs::create_dir_all(&dir).expect("create person dir");
    for face in faces {
        std::fs::write(dir.join(format!("{face}.png")), png_bytes()).expect("write face");
    }
}

/// Millisecond-scale budgets so failure paths finish quickly.
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        poll_interval: Duration::from_millis(2),
        element_wait: Duration::from_millis(100),
        page_ready: Duration::from_millis(200),
        upload: Duration::from_millis(200),
        upload_stuck: Duration::from_millis(40),
        swap_no_progress: Duration::from_millis(60),
        swap_stall: Duration::from_millis(60),
        swap_overall: Duration::from_millis(500),
        rate_limit_cooldown: Duration::from_millis(5),
        retry_delay: Duration::from_millis(5),
    }
}

pub fn worker_settings(max_attempts: u32) -> WorkerSettings {
    WorkerSettings {
        timeouts: fast_timeouts(),
        max_attempts,
        converter: ResultConverter::new(OutputFormat::Jpeg, 75),
        close_sessions: true,
    }
}

/// What the fake page does for a given source (keyed by file stem).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapBehavior {
    Succeed,
    /// The swap never finishes and never shows progress.
    NeverProgress,
    /// Progress shows a constant value and never finishes.
    Stall,
    /// The first start click shows the rate-limit popup, the second works.
    RateLimitOnce,
    RateLimitAlways,
    /// The source busy indicator stays up and no thumbnail appears.
    StuckUpload,
    /// Clicking start kills the browser.
    SessionLost,
}

impl SwapBehavior {
    fn completes(self) -> bool {
        matches!(self, SwapBehavior::Succeed | SwapBehavior::RateLimitOnce)
    }

    fn progress(self) -> Option<&'static str> {
        match self {
            SwapBehavior::Succeed | SwapBehavior::RateLimitOnce => Some("50%"),
            SwapBehavior::Stall => Some("10%"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeStats {
    pub launches: usize,
    pub failed_launches: usize,
    pub closes: usize,
    pub resets: usize,
    pub face_uploads: usize,
    pub source_uploads: usize,
    pub swaps: usize,
}

type BehaviorFn = dyn Fn(&str) -> SwapBehavior + Send + Sync;

/// Scripted launcher. Clones share counters, so a test can keep one and hand
/// another to the code under test.
#[derive(Clone)]
pub struct FakeBrowser {
    behavior: Arc<BehaviorFn>,
    swap_delay: Duration,
    launch_failures: Arc<AtomicU32>,
    results: Arc<AtomicU64>,
    stats: Arc<Mutex<FakeStats>>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self {
            behavior: Arc::new(|_| SwapBehavior::Succeed),
            swap_delay: Duration::from_millis(5),
            launch_failures: Arc::new(AtomicU32::new(0)),
            results: Arc::new(AtomicU64::new(0)),
            stats: Arc::new(Mutex::new(FakeStats::default())),
        }
    }

    pub fn with_behavior(mut self, behavior: impl Fn(&str) -> SwapBehavior + Send + Sync + 'static) -> Self {
        self.behavior = Arc::new(behavior);
        self
    }

    pub fn with_swap_delay(mut self, delay: Duration) -> Self {
        self.swap_delay = delay;
        self
    }

    /// The next `count` launches fail.
    pub fn failing_launches(self, count: u32) -> Self {
        self.launch_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn stats(&self) -> FakeStats {
        self.stats.lock().unwrap().clone()
    }

    fn bump(&self, update: impl FnOnce(&mut FakeStats)) {
        update(&mut self.stats.lock().unwrap());
    }
}

impl BrowserLauncher for FakeBrowser {
    fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let failing = self
            .launch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.bump(|s| s.failed_launches += 1);
            return Err(BrowserError::Launch("scripted launch failure".into()));
        }
        self.bump(|s| s.launches += 1);
        Ok(Box::new(FakeSession {
            browser: self.clone(),
            site: site_profile(),
            url: "about:blank".into(),
            face: false,
            source: None,
            source_busy: false,
            result: None,
            swap: None,
            popup: false,
            rate_limited: HashSet::new(),
            closed: false,
        }))
    }
}

struct FakeSession {
    browser: FakeBrowser,
    site: SiteProfile,
    url: String,
    face: bool,
    /// Stem of the uploaded source.
    source: Option<String>,
    source_busy: bool,
    result: Option<String>,
    swap: Option<(Instant, SwapBehavior)>,
    popup: bool,
    rate_limited: HashSet<String>,
    closed: bool,
}

impl FakeSession {
    fn alive(&mut self) -> Result<(), BrowserError> {
        if self.closed {
            return Err(BrowserError::Fatal("session closed".into()));
        }
        if let Some((started, behavior)) = self.swap {
            if behavior.completes() && started.elapsed() >= self.browser.swap_delay {
                let n = self.browser.results.fetch_add(1, Ordering::SeqCst);
                self.result = Some(format!("https://fake.test/result/{n}.webp"));
                self.swap = None;
            }
        }
        Ok(())
    }

    fn loaded(&self) -> bool {
        self.url.starts_with(&self.site.url)
    }

    fn progress(&self) -> Option<&'static str> {
        self.swap.and_then(|(_, behavior)| behavior.progress())
    }

    fn start_enabled(&self) -> bool {
        self.face && self.source.is_some() && self.swap.is_none()
    }

    fn not_found(locator: &Locator) -> BrowserError {
        BrowserError::NotFound(locator.to_string())
    }
}

impl BrowserSession for FakeSession {
    fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.alive()?;
        self.url = url.to_string();
        Ok(())
    }

    fn current_url(&mut self) -> Result<String, BrowserError> {
        self.alive()?;
        Ok(self.url.clone())
    }

    fn find(&mut self, locator: &Locator) -> Result<ElementRef, BrowserError> {
        self.alive()?;
        let present = if !self.loaded() {
            false
        } else if *locator == self.site.result_image {
            self.result.is_some()
        } else if *locator == self.site.rate_limit_popup {
            self.popup
        } else if *locator == self.site.progress_container {
            self.progress().is_some()
        } else {
            true
        };
        if present {
            Ok(ElementRef(locator.to_string()))
        } else {
            Err(Self::not_found(locator))
        }
    }

    fn read_attribute(&mut self, locator: &Locator, name: &str) -> Result<Option<String>, BrowserError> {
        self.alive()?;
        if !self.loaded() {
            return Err(Self::not_found(locator));
        }
        if name != "src" {
            return Ok(None);
        }
        let value = if *locator == self.site.face_thumbnail {
            self.face.then(|| "blob:https://swap.test/face".to_string())
        } else if *locator == self.site.source_thumbnail {
            self.source.as_ref().map(|stem| format!("blob:https://swap.test/{stem}"))
        } else if *locator == self.site.result_image {
            self.result.clone()
        } else {
            None
        };
        Ok(value)
    }

    fn read_text(&mut self, locator: &Locator) -> Result<String, BrowserError> {
        self.alive()?;
        if *locator == self.site.progress_text {
            return self
                .progress()
                .map(str::to_string)
                .ok_or_else(|| Self::not_found(locator));
        }
        Ok(String::new())
    }

    fn is_displayed(&mut self, locator: &Locator) -> Result<bool, BrowserError> {
        self.alive()?;
        if !self.loaded() {
            return Ok(false);
        }
        let shown = if *locator == self.site.result_image {
            self.result.is_some()
        } else if *locator == self.site.progress_container {
            self.progress().is_some()
        } else if *locator == self.site.rate_limit_popup {
            self.popup
        } else if *locator == self.site.source_busy {
            self.source_busy
        } else {
            *locator != self.site.face_busy
        };
        Ok(shown)
    }

    fn is_enabled(&mut self, locator: &Locator) -> Result<bool, BrowserError> {
        self.alive()?;
        if *locator == self.site.start_button {
            return Ok(self.start_enabled());
        }
        Ok(true)
    }

    fn upload(&mut self, locator: &Locator, file: &Path) -> Result<(), BrowserError> {
        self.alive()?;
        if !self.loaded() {
            return Err(Self::not_found(locator));
        }
        let stem = file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        if *locator == self.site.face_input {
            self.face = true;
            self.browser.bump(|s| s.face_uploads += 1);
        } else if *locator == self.site.source_input {
            self.source = None;
            self.source_busy = (self.browser.behavior)(&stem) == SwapBehavior::StuckUpload;
            if !self.source_busy {
                self.source = Some(stem);
            }
            self.browser.bump(|s| s.source_uploads += 1);
        } else {
            return Err(Self::not_found(locator));
        }
        Ok(())
    }

    fn click(&mut self, locator: &Locator) -> Result<(), BrowserError> {
        self.alive()?;
        if *locator == self.site.rate_limit_dismiss {
            self.popup = false;
            return Ok(());
        }
        if *locator != self.site.start_button || !self.start_enabled() {
            return Ok(());
        }

        let stem = self.source.clone().unwrap_or_default();
        match (self.browser.behavior)(&stem) {
            SwapBehavior::SessionLost => {
                self.closed = true;
                Err(BrowserError::Fatal("browser crashed".into()))
            }
            SwapBehavior::RateLimitAlways => {
                self.popup = true;
                Ok(())
            }
            SwapBehavior::RateLimitOnce if self.rate_limited.insert(stem.clone()) => {
                self.popup = true;
                Ok(())
            }
            behavior => {
                self.swap = Some((Instant::now(), behavior));
                self.browser.bump(|s| s.swaps += 1);
                Ok(())
            }
        }
    }

    fn clear_state(&mut self) -> Result<(), BrowserError> {
        self.alive()?;
        self.face = false;
        self.source = None;
        self.source_busy = false;
        self.result = None;
        self.swap = None;
        self.popup = false;
        self.browser.bump(|s| s.resets += 1);
        Ok(())
    }

    fn close(&mut self) -> Result<(), BrowserError> {
        self.closed = true;
        self.browser.bump(|s| s.closes += 1);
        Ok(())
    }
}

/// Returns [`png_bytes`] for every URL.
pub struct FakeFetcher;

impl AssetFetcher for FakeFetcher {
    fn fetch(&self, _url: &str) -> anyhow::Result<Vec<u8>> {
        Ok(png_bytes())
    }
}
