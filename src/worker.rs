//! Per-face worker: one browser session, one face image, every pending
//! source in a fixed order.
//!
//! Each state handler returns the next state, so the stop signal is checked
//! between every step. Failures never escape [`FaceSwapWorker::run`]; they
//! become `TaskFailed` events and the worker carries on.

use crossbeam_channel::Sender;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::browser::{BrowserLauncher, BrowserSession};
use crate::config::Timeouts;
use crate::converter::ResultConverter;
use crate::error::SwapError;
use crate::events::{RunEvent, Severity};
use crate::fetch::AssetFetcher;
use crate::models::{FaceAsset, OutputName, SourceImage, WorkerId};
use crate::page::{SiteProfile, Slot, SwapPage};
use crate::stop::StopSignal;

/// Extra in-place retries for an upload that simply timed out.
const UPLOAD_RETRIES: u32 = 2;

/// Settings shared by every worker of a run.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub timeouts: Timeouts,
    pub max_attempts: u32,
    pub converter: ResultConverter,
    /// `false` leaves visible windows open after cleanup.
    pub close_sessions: bool,
}

/// Everything a worker needs, handed over by the supervisor.
pub struct WorkerContext {
    pub asset: FaceAsset,
    pub sources: Arc<Vec<SourceImage>>,
    pub staging_dir: PathBuf,
    pub settings: Arc<WorkerSettings>,
    pub site: Arc<SiteProfile>,
    pub launcher: Arc<dyn BrowserLauncher>,
    pub fetcher: Arc<dyn AssetFetcher>,
    pub stop: StopSignal,
    pub events: Sender<RunEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    EnsuringSession,
    EnsuringFaceUploaded,
    SelectingSource,
    EnsuringSourceUploaded,
    Swapping,
    Saving,
    Stopping,
    Cleanup,
    Done,
}

impl WorkerState {
    /// States a stop request may interrupt. A finished swap is still saved.
    fn interruptible(self) -> bool {
        !matches!(
            self,
            WorkerState::Saving | WorkerState::Stopping | WorkerState::Cleanup | WorkerState::Done
        )
    }
}

#[derive(Clone)]
struct EventSink {
    id: WorkerId,
    person: String,
    events: Sender<RunEvent>,
}

impl EventSink {
    fn emit(&self, event: RunEvent) {
        // The relay is gone after a kill; nobody is listening any more.
        let _ = self.events.send(event);
    }

    fn log(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        log::log!(target: "faceswap_pilot::worker", severity.level(), "[{}] {}", self.id, message);
        self.emit(RunEvent::log(Some(self.id.clone()), severity, message));
    }
}

/// Emits `WorkerFinished` exactly once, however the run loop is left.
struct FinishGuard(EventSink);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.emit(RunEvent::WorkerFinished {
            worker: self.0.id.clone(),
            person: self.0.person.clone(),
        });
    }
}

enum SwapOutcome {
    Finished(String),
    RateLimited,
}

pub struct FaceSwapWorker {
    ctx: WorkerContext,
    sink: EventSink,
    state: WorkerState,
    session: Option<Box<dyn BrowserSession>>,
    face_uploaded: bool,
    needs_refresh: bool,
    /// Position in `ctx.sources`.
    index: usize,
    /// Failed attempts on the current source.
    attempts: u32,
    result_url: Option<String>,
}

impl FaceSwapWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        let sink = EventSink {
            id: ctx.asset.worker_id(),
            person: ctx.asset.person.clone(),
            events: ctx.events.clone(),
        };
        Self {
            ctx,
            sink,
            state: WorkerState::Starting,
            session: None,
            face_uploaded: false,
            needs_refresh: false,
            index: 0,
            attempts: 0,
            result_url: None,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.sink.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Drive the state machine to `Done`.
    pub fn run(mut self) {
        let _finished = FinishGuard(self.sink.clone());
        while self.state != WorkerState::Done {
            self.advance();
        }
    }

    fn advance(&mut self) {
        if self.ctx.stop.is_set() && self.state.interruptible() {
            self.state = WorkerState::Stopping;
        }

        self.state = match self.state {
            WorkerState::Starting => {
                self.sink.log(
                    Severity::Info,
                    format!("Starting with {} source images", self.ctx.sources.len()),
                );
                WorkerState::EnsuringSession
            }
            WorkerState::EnsuringSession => self.ensure_session(),
            WorkerState::EnsuringFaceUploaded => self.ensure_face(),
            WorkerState::SelectingSource => self.select_source(),
            WorkerState::EnsuringSourceUploaded => self.ensure_source(),
            WorkerState::Swapping => self.swap(),
            WorkerState::Saving => self.save(),
            WorkerState::Stopping => {
                self.sink.log(Severity::Info, "Stop requested, wrapping up");
                WorkerState::Cleanup
            }
            WorkerState::Cleanup => {
                self.cleanup();
                WorkerState::Done
            }
            WorkerState::Done => WorkerState::Done,
        };
    }

    fn current_source(&self) -> Option<SourceImage> {
        self.ctx.sources.get(self.index).cloned()
    }

    /// Sleep before retrying `next`, unless a stop arrives first.
    fn retry_later(&self, next: WorkerState) -> WorkerState {
        if self.ctx.stop.wait(self.ctx.settings.timeouts.retry_delay) {
            WorkerState::Stopping
        } else {
            next
        }
    }

    fn ensure_session(&mut self) -> WorkerState {
        if self.session.is_some() {
            return WorkerState::EnsuringFaceUploaded;
        }

        let timeouts = &self.ctx.settings.timeouts;
        let mut session = match self.ctx.launcher.launch() {
            Ok(session) => session,
            Err(e) => {
                self.sink.log(Severity::Warn, format!("{e}; retrying"));
                return self.retry_later(WorkerState::EnsuringSession);
            }
        };

        let mut page = SwapPage::new(&mut *session, &self.ctx.site);
        let ready = match page.go_home() {
            Ok(()) => page.wait_ready(timeouts.page_ready, timeouts.poll_interval),
            Err(e) => {
                self.sink.log(Severity::Warn, e.to_string());
                false
            }
        };

        if !ready {
            self.sink.log(
                Severity::Warn,
                "Service page did not become ready, relaunching browser",
            );
            if let Err(e) = session.close() {
                self.sink.log(Severity::Debug, format!("Close failed: {e}"));
            }
            return self.retry_later(WorkerState::EnsuringSession);
        }

        self.sink.log(Severity::Info, "Browser session ready");
        self.session = Some(session);
        self.face_uploaded = false;
        self.needs_refresh = false;
        WorkerState::EnsuringFaceUploaded
    }

    fn ensure_face(&mut self) -> WorkerState {
        if self.index >= self.ctx.sources.len() {
            return WorkerState::Cleanup;
        }
        if self.face_uploaded {
            return WorkerState::SelectingSource;
        }

        let face = self.ctx.asset.face.clone();
        match self.upload(Slot::Face, &face) {
            Ok(()) => {
                self.face_uploaded = true;
                self.sink.log(Severity::Debug, "Face uploaded");
                WorkerState::SelectingSource
            }
            Err(e) => self.fail_attempt(e),
        }
    }

    fn select_source(&mut self) -> WorkerState {
        let Some(source) = self.current_source() else {
            self.sink.log(Severity::Info, "All source images processed");
            return WorkerState::Cleanup;
        };
        if self.needs_refresh {
            return self.recover();
        }
        if self.session.is_none() {
            return WorkerState::EnsuringSession;
        }
        if !self.face_uploaded {
            return WorkerState::EnsuringFaceUploaded;
        }

        self.sink.log(
            Severity::Debug,
            format!(
                "Processing {} ({}/{})",
                source.file_name(),
                self.index + 1,
                self.ctx.sources.len()
            ),
        );
        WorkerState::EnsuringSourceUploaded
    }

    /// Soft reset first; recreate the browser if that fails.
    fn recover(&mut self) -> WorkerState {
        self.needs_refresh = false;
        self.face_uploaded = false;

        let Some(session) = self.session.as_mut() else {
            return WorkerState::EnsuringSession;
        };
        let timeouts = &self.ctx.settings.timeouts;
        let mut page = SwapPage::new(&mut **session, &self.ctx.site);
        let recovered = match page.reset() {
            Ok(()) => page.wait_ready(timeouts.page_ready, timeouts.poll_interval),
            Err(e) => {
                self.sink.log(Severity::Debug, format!("Page reset failed: {e}"));
                false
            }
        };

        if recovered {
            self.sink.log(Severity::Info, "Page state reset");
            WorkerState::EnsuringFaceUploaded
        } else {
            self.sink.log(Severity::Warn, "Page reset failed, recreating browser session");
            self.discard_session();
            WorkerState::EnsuringSession
        }
    }

    fn ensure_source(&mut self) -> WorkerState {
        let Some(source) = self.current_source() else {
            return WorkerState::SelectingSource;
        };
        match self.upload(Slot::Source, &source.path) {
            Ok(()) => WorkerState::Swapping,
            Err(e) => self.fail_attempt(e),
        }
    }

    fn upload(&mut self, slot: Slot, file: &Path) -> Result<(), SwapError> {
        let mut retries = 0;
        loop {
            if self.ctx.stop.is_set() {
                return Err(SwapError::Stopped);
            }
            let Some(session) = self.session.as_mut() else {
                return Err(SwapError::FatalSession("no browser session".into()));
            };
            let mut page = SwapPage::new(&mut **session, &self.ctx.site);
            match upload_once(&mut page, slot, file, &self.ctx.stop, &self.ctx.settings.timeouts) {
                Err(SwapError::Transient(reason)) if retries < UPLOAD_RETRIES => {
                    retries += 1;
                    self.sink.log(
                        Severity::Debug,
                        format!("{reason}; retrying upload ({retries}/{UPLOAD_RETRIES})"),
                    );
                }
                other => return other,
            }
        }
    }

    fn swap(&mut self) -> WorkerState {
        match self.trigger_swap() {
            Ok(url) => {
                self.result_url = Some(url);
                WorkerState::Saving
            }
            Err(e) => self.fail_attempt(e),
        }
    }

    /// Click start and wait for a new result, retrying once on a rate limit.
    fn trigger_swap(&mut self) -> Result<String, SwapError> {
        let timeouts = &self.ctx.settings.timeouts;
        let mut retried = false;
        loop {
            if self.ctx.stop.is_set() {
                return Err(SwapError::Stopped);
            }
            let Some(session) = self.session.as_mut() else {
                return Err(SwapError::FatalSession("no browser session".into()));
            };
            let mut page = SwapPage::new(&mut **session, &self.ctx.site);

            let previous = page.result_ref();
            page.click_start()?;
            match await_result(&mut page, previous.as_deref(), &self.ctx.stop, timeouts)? {
                SwapOutcome::Finished(url) => return Ok(url),
                SwapOutcome::RateLimited if !retried => {
                    retried = true;
                    if let Err(e) = page.dismiss_rate_limit() {
                        self.sink.log(Severity::Debug, format!("Dismissing rate-limit popup failed: {e}"));
                    }
                    self.sink.log(
                        Severity::Warn,
                        format!("Rate limited, retrying in {:?}", timeouts.rate_limit_cooldown),
                    );
                    if self.ctx.stop.wait(timeouts.rate_limit_cooldown) {
                        return Err(SwapError::Stopped);
                    }
                }
                SwapOutcome::RateLimited => {
                    return Err(SwapError::Transient("rate limited again after cooldown".into()));
                }
            }
        }
    }

    fn save(&mut self) -> WorkerState {
        let (Some(url), Some(source)) = (self.result_url.take(), self.current_source()) else {
            return WorkerState::SelectingSource;
        };

        match self.store_result(&url, &source) {
            Ok(output) => {
                self.sink.log(
                    Severity::Info,
                    format!("Saved {}", output.file_name().unwrap_or_default().to_string_lossy()),
                );
                self.sink.emit(RunEvent::TaskSucceeded {
                    worker: self.sink.id.clone(),
                    person: self.sink.person.clone(),
                    face: self.ctx.asset.face.clone(),
                    source: source.path.clone(),
                    output,
                });
                self.index += 1;
                self.attempts = 0;
                WorkerState::SelectingSource
            }
            Err(e) => self.fail_attempt(e),
        }
    }

    fn store_result(&self, url: &str, source: &SourceImage) -> Result<PathBuf, SwapError> {
        let bytes = self
            .ctx
            .fetcher
            .fetch(url)
            .map_err(|e| SwapError::Transient(format!("result download failed: {e:#}")))?;

        let converter = &self.ctx.settings.converter;
        let name = OutputName::new(&self.ctx.asset, source, converter.extension());
        let output = self.ctx.staging_dir.join(name.file_name());
        converter.convert(&bytes, &output)?;
        Ok(output)
    }

    /// Count a failed attempt on the current source and pick the next state.
    fn fail_attempt(&mut self, error: SwapError) -> WorkerState {
        if matches!(error, SwapError::Stopped) {
            return WorkerState::Stopping;
        }
        let Some(source) = self.current_source() else {
            return WorkerState::SelectingSource;
        };

        match error {
            SwapError::FatalSession(_) => {
                self.discard_session();
                self.needs_refresh = true;
            }
            // The page itself is fine after a local write failure.
            SwapError::FileOp(_) => {}
            _ => self.needs_refresh = true,
        }

        self.attempts += 1;
        let cap = self.ctx.settings.max_attempts.max(1);
        let final_failure = self.attempts >= cap;
        let message = format!(
            "{} failed (attempt {}/{}): {}",
            source.file_name(),
            self.attempts,
            cap,
            error
        );
        if error.is_expected() {
            self.sink.log(Severity::Warn, message);
        } else {
            self.sink.log(Severity::Error, format!("{message} ({error:?})"));
        }

        self.sink.emit(RunEvent::TaskFailed {
            worker: self.sink.id.clone(),
            person: self.sink.person.clone(),
            face: self.ctx.asset.face.clone(),
            source: source.path.clone(),
            reason: error.to_string(),
            attempt: self.attempts,
            final_failure,
        });

        if final_failure {
            self.sink.log(
                Severity::Warn,
                format!("Giving up on {} after {cap} attempts", source.file_name()),
            );
            self.index += 1;
            self.attempts = 0;
        }
        WorkerState::SelectingSource
    }

    fn discard_session(&mut self) {
        self.face_uploaded = false;
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close() {
                self.sink.log(Severity::Debug, format!("Close failed: {e}"));
            }
        }
    }

    fn cleanup(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if self.ctx.stop.is_killed() {
            self.sink.log(Severity::Warn, "Run killed, browser session left open");
        } else if !self.ctx.settings.close_sessions {
            self.sink.log(Severity::Info, "Leaving browser window open for inspection");
        } else {
            match session.close() {
                Ok(()) => self.sink.log(Severity::Debug, "Browser session closed"),
                Err(e) => self.sink.log(Severity::Warn, format!("Closing browser session failed: {e}")),
            }
        }
    }
}

fn slot_label(slot: Slot) -> &'static str {
    match slot {
        Slot::Face => "face",
        Slot::Source => "source",
    }
}

/// Upload `file` into `slot` and wait for its thumbnail. For the source slot
/// the start button must also become enabled.
fn upload_once(
    page: &mut SwapPage<'_>,
    slot: Slot,
    file: &Path,
    stop: &StopSignal,
    timeouts: &Timeouts,
) -> Result<(), SwapError> {
    let label = slot_label(slot);
    page.upload(slot, file)?;

    let started = Instant::now();
    let mut busy_since: Option<Instant> = None;
    while !page.has_thumbnail(slot) {
        if page.is_busy(slot) {
            let since = *busy_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= timeouts.upload_stuck {
                return Err(SwapError::Stuck(format!(
                    "{label} upload busy for {:?} without a thumbnail",
                    timeouts.upload_stuck
                )));
            }
        } else {
            busy_since = None;
        }
        if started.elapsed() >= timeouts.upload {
            return Err(SwapError::Transient(format!(
                "{label} upload timed out after {:?}",
                timeouts.upload
            )));
        }
        if stop.wait(timeouts.poll_interval) {
            return Err(SwapError::Stopped);
        }
    }

    if slot == Slot::Source {
        let started = Instant::now();
        while !page.start_enabled()? {
            if started.elapsed() >= timeouts.element_wait {
                return Err(SwapError::Stuck("start button stayed disabled after upload".into()));
            }
            if stop.wait(timeouts.poll_interval) {
                return Err(SwapError::Stopped);
            }
        }
    }
    Ok(())
}

/// Poll until the result reference differs from `previous`.
///
/// Without any progress indicator the wait ends after `swap_no_progress`;
/// once progress was seen, after `swap_stall` without a change. `swap_overall`
/// caps both.
fn await_result(
    page: &mut SwapPage<'_>,
    previous: Option<&str>,
    stop: &StopSignal,
    timeouts: &Timeouts,
) -> Result<SwapOutcome, SwapError> {
    let started = Instant::now();
    let mut last_progress: Option<(u8, Instant)> = None;

    loop {
        if let Some(current) = page.result_ref() {
            if previous != Some(current.as_str()) {
                return Ok(SwapOutcome::Finished(current));
            }
        }
        if page.rate_limited() {
            return Ok(SwapOutcome::RateLimited);
        }

        if let Some(percent) = page.progress_percent() {
            if last_progress.is_none_or(|(seen, _)| seen != percent) {
                last_progress = Some((percent, Instant::now()));
            }
        }

        match last_progress {
            None if started.elapsed() >= timeouts.swap_no_progress => {
                return Err(SwapError::Transient(format!(
                    "no progress within {:?}",
                    timeouts.swap_no_progress
                )));
            }
            Some((percent, changed)) if changed.elapsed() >= timeouts.swap_stall => {
                return Err(SwapError::Stuck(format!(
                    "progress stalled at {percent}% for {:?}",
                    timeouts.swap_stall
                )));
            }
            _ => {}
        }
        if started.elapsed() >= timeouts.swap_overall {
            return Err(SwapError::Transient(format!(
                "swap exceeded {:?}",
                timeouts.swap_overall
            )));
        }

        if stop.wait(timeouts.poll_interval) {
            return Err(SwapError::Stopped);
        }
    }
}
