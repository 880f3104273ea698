//! Owns the lifecycle of a run: validates the plan, spawns one worker thread
//! per face asset, relays their events and shuts down in order.

use crossbeam_channel::{Receiver, unbounded};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::archive::{PendingReviewLedger, SourceArchiver};
use crate::browser::BrowserLauncher;
use crate::coordinator::{Completion, CompletionCoordinator};
use crate::error::ValidationError;
use crate::events::{EventBus, RunEvent, Severity};
use crate::fetch::AssetFetcher;
use crate::library::RootLayout;
use crate::models::{Person, SourceImage};
use crate::page::SiteProfile;
use crate::stop::StopSignal;
use crate::worker::{FaceSwapWorker, WorkerContext, WorkerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Killing,
}

/// What to run: the root paths, the selected persons and the pending sources.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub layout: Option<RootLayout>,
    pub persons: Vec<Person>,
    pub sources: Vec<SourceImage>,
}

struct Control {
    state: SupervisorState,
    /// Bumped by `kill()` so a detached relay drops whatever it still receives.
    generation: u64,
    stop: Option<StopSignal>,
    coordinator: Option<Arc<CompletionCoordinator>>,
    workers: usize,
}

fn lock(control: &Mutex<Control>) -> MutexGuard<'_, Control> {
    control.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct WorkerSupervisor {
    launcher: Arc<dyn BrowserLauncher>,
    fetcher: Arc<dyn AssetFetcher>,
    site: Arc<SiteProfile>,
    settings: Arc<WorkerSettings>,
    bus: Arc<EventBus>,
    control: Arc<Mutex<Control>>,
}

impl WorkerSupervisor {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        fetcher: Arc<dyn AssetFetcher>,
        site: SiteProfile,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            launcher,
            fetcher,
            site: Arc::new(site),
            settings: Arc::new(settings),
            bus: Arc::new(EventBus::new()),
            control: Arc::new(Mutex::new(Control {
                state: SupervisorState::Idle,
                generation: 0,
                stop: None,
                coordinator: None,
                workers: 0,
            })),
        }
    }

    pub fn subscribe(&self) -> Receiver<RunEvent> {
        self.bus.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        lock(&self.control).state
    }

    /// Coordinator of the active run, for progress display.
    pub fn coordinator(&self) -> Option<Arc<CompletionCoordinator>> {
        lock(&self.control).coordinator.clone()
    }

    pub fn start(&self, plan: RunPlan) -> Result<(), ValidationError> {
        let mut control = lock(&self.control);
        if control.state != SupervisorState::Idle {
            return Err(ValidationError::AlreadyRunning);
        }

        let layout = plan
            .layout
            .filter(|layout| layout.root.is_dir())
            .ok_or(ValidationError::NoRootDirectory)?;
        if plan.persons.is_empty() {
            return Err(ValidationError::NothingSelected);
        }
        let persons: Vec<Person> = plan
            .persons
            .into_iter()
            .filter(|person| {
                if person.faces.is_empty() {
                    self.bus.log(
                        Severity::Warn,
                        format!("Skipping {}: no face images", person.name),
                    );
                }
                !person.faces.is_empty()
            })
            .collect();
        if persons.is_empty() {
            return Err(ValidationError::NoFaces);
        }
        if plan.sources.is_empty() {
            return Err(ValidationError::NoSources(layout.sources_dir.clone()));
        }
        std::fs::create_dir_all(&layout.staging_dir).map_err(|source| ValidationError::Staging {
            path: layout.staging_dir.clone(),
            source,
        })?;

        control.state = SupervisorState::Starting;
        control.generation += 1;
        let generation = control.generation;
        let stop = StopSignal::new();

        let totals: HashMap<String, usize> = persons
            .iter()
            .map(|person| (person.name.clone(), person.faces.len()))
            .collect();
        let selected: Vec<(String, usize)> = totals.iter().map(|(n, f)| (n.clone(), *f)).collect();
        let ledger = PendingReviewLedger::open(layout.review_ledger_path());
        let archiver = SourceArchiver::new(layout.archive_dir.clone(), Some(ledger));
        let coordinator = Arc::new(CompletionCoordinator::new(
            &selected,
            archiver,
            Arc::clone(&self.bus),
        ));

        let sources = Arc::new(plan.sources);
        let (tx, rx) = unbounded();
        let mut handles = Vec::new();
        for asset in persons.iter().flat_map(|person| person.face_assets()) {
            let id = asset.worker_id();
            let ctx = WorkerContext {
                asset,
                sources: Arc::clone(&sources),
                staging_dir: layout.staging_dir.clone(),
                settings: Arc::clone(&self.settings),
                site: Arc::clone(&self.site),
                launcher: Arc::clone(&self.launcher),
                fetcher: Arc::clone(&self.fetcher),
                stop: stop.clone(),
                events: tx.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("worker {id}"))
                .spawn(move || FaceSwapWorker::new(ctx).run());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => self
                    .bus
                    .log(Severity::Error, format!("Failed to start worker {id}: {e}")),
            }
        }
        // The relay ends once every worker has dropped its sender.
        drop(tx);

        control.state = SupervisorState::Running;
        control.stop = Some(stop.clone());
        control.coordinator = Some(Arc::clone(&coordinator));
        control.workers = handles.len();
        self.bus.log(
            Severity::Info,
            format!(
                "Started {} workers for {} persons over {} source images",
                handles.len(),
                persons.len(),
                sources.len()
            ),
        );
        self.bus.emit(RunEvent::RunStarted {
            workers: handles.len(),
            sources: sources.len(),
        });
        drop(control);

        let relay = Relay {
            generation,
            control: Arc::clone(&self.control),
            bus: Arc::clone(&self.bus),
            coordinator,
            totals,
            stop,
        };
        thread::spawn(move || relay.run(rx, handles));
        Ok(())
    }

    /// Ask every worker to stop at its next checkpoint. Does not block.
    pub fn stop(&self) {
        let mut control = lock(&self.control);
        if !matches!(control.state, SupervisorState::Starting | SupervisorState::Running) {
            return;
        }
        control.state = SupervisorState::Stopping;
        if let Some(stop) = &control.stop {
            stop.set();
        }
        self.bus.log(Severity::Info, "Stop requested, waiting for workers to finish");
    }

    /// Abandon the run immediately. Worker threads are detached and exit at
    /// their next checkpoint; anything they still send is dropped.
    pub fn kill(&self) {
        let mut control = lock(&self.control);
        if control.state == SupervisorState::Idle {
            return;
        }
        control.state = SupervisorState::Killing;
        if let Some(stop) = control.stop.take() {
            stop.kill();
        }
        control.generation += 1;
        control.coordinator = None;
        self.bus.log(
            Severity::Warn,
            format!(
                "Killed {} workers; browser sessions may be left open",
                control.workers
            ),
        );
        self.bus.emit(RunEvent::RunKilled);
        control.state = SupervisorState::Idle;
    }
}

/// Forwards worker events to subscribers and per-source outcomes to the
/// coordinator, then finalizes the run.
struct Relay {
    generation: u64,
    control: Arc<Mutex<Control>>,
    bus: Arc<EventBus>,
    coordinator: Arc<CompletionCoordinator>,
    totals: HashMap<String, usize>,
    stop: StopSignal,
}

impl Relay {
    fn run(self, events: Receiver<RunEvent>, handles: Vec<JoinHandle<()>>) {
        for event in events.iter() {
            let completion = self.completion_for(&event);
            {
                // Holding the lock keeps a concurrent kill() from interleaving.
                let control = lock(&self.control);
                if control.generation != self.generation {
                    continue;
                }
                if let RunEvent::WorkerFinished { person, .. } = &event {
                    self.coordinator.worker_finished(person);
                }
                self.bus.emit(event);
            }
            // Archiving runs with the control lock released.
            if let Some(completion) = completion {
                if self.is_current() {
                    self.coordinator.report(completion);
                }
            }
        }

        // Every sender is gone; confirm each thread exited before finalizing.
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("{name} panicked");
            }
        }

        let mut control = lock(&self.control);
        if control.generation != self.generation {
            return;
        }
        let stopped = self.stop.is_set();
        control.state = SupervisorState::Idle;
        control.stop = None;
        control.coordinator = None;
        self.bus.log(
            Severity::Info,
            format!(
                "Run finished ({} sources archived)",
                self.coordinator.archived_count()
            ),
        );
        self.bus.emit(RunEvent::RunFinished { stopped });
    }

    fn is_current(&self) -> bool {
        lock(&self.control).generation == self.generation
    }

    /// Per-source outcome to hand to the coordinator, if any.
    fn completion_for(&self, event: &RunEvent) -> Option<Completion> {
        match event {
            RunEvent::TaskSucceeded {
                person,
                face,
                source,
                output,
                ..
            } => Some(self.completion(person, face, source, true, Some(output.clone()))),
            RunEvent::TaskFailed {
                person,
                face,
                source,
                final_failure: true,
                ..
            } => Some(self.completion(person, face, source, false, None)),
            _ => None,
        }
    }

    fn completion(
        &self,
        person: &str,
        face: &Path,
        source: &Path,
        success: bool,
        output: Option<PathBuf>,
    ) -> Completion {
        Completion {
            source: source.to_path_buf(),
            person: person.to_string(),
            face: face.to_path_buf(),
            face_total: self.totals.get(person).copied().unwrap_or(0),
            success,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, FakeBrowser, FakeFetcher, SwapBehavior};
    use crate::library::{PeopleLibrary, scan_sources};
    use crossbeam_channel::RecvTimeoutError;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn supervisor(browser: &FakeBrowser, max_attempts: u32) -> WorkerSupervisor {
        WorkerSupervisor::new(
            Arc::new(browser.clone()),
            Arc::new(FakeFetcher),
            fixtures::site_profile(),
            fixtures::worker_settings(max_attempts),
        )
    }

    fn plan(root: &TempDir) -> RunPlan {
        let layout = RootLayout::new(root.path());
        let mut library = PeopleLibrary::new(layout.clone());
        RunPlan {
            persons: library.persons(false).unwrap().to_vec(),
            sources: scan_sources(&layout).unwrap(),
            layout: Some(layout),
        }
    }

    /// Collect events until a terminal one arrives.
    fn drain(events: &Receiver<RunEvent>) -> Vec<RunEvent> {
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    seen.push(event);
                    if terminal {
                        return seen;
                    }
                }
                Err(RecvTimeoutError::Timeout) => panic!("run did not finish"),
                Err(RecvTimeoutError::Disconnected) => return seen,
            }
        }
    }

    fn count(events: &[RunEvent], pred: impl Fn(&RunEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    #[test]
    fn archives_each_source_after_all_workers() {
        let root = fixtures::root_with(
            &[("Ann", &["face1", "face2"]), ("Bob", &["smile"])],
            &["one", "two", "three"],
        );
        let browser = FakeBrowser::new();
        let supervisor = supervisor(&browser, 3);
        let events = supervisor.subscribe();

        supervisor.start(plan(&root)).unwrap();
        let seen = drain(&events);

        assert!(seen.contains(&RunEvent::RunStarted { workers: 3, sources: 3 }));
        assert_eq!(seen.last(), Some(&RunEvent::RunFinished { stopped: false }));
        assert_eq!(count(&seen, |e| matches!(e, RunEvent::TaskSucceeded { .. })), 9);
        assert_eq!(count(&seen, |e| matches!(e, RunEvent::WorkerFinished { .. })), 3);

        // Each source is archived after its third success, never earlier.
        for source in ["one", "two", "three"] {
            let path = root.path().join("SourceImages").join(format!("{source}.png"));
            let archived_at = seen
                .iter()
                .position(|e| matches!(e, RunEvent::SourceArchived { source, .. } if *source == path))
                .expect("source archived");
            let successes_before = seen[..archived_at]
                .iter()
                .filter(|e| matches!(e, RunEvent::TaskSucceeded { source, .. } if *source == path))
                .count();
            assert_eq!(successes_before, 3);
            assert!(!path.exists());
            assert!(root.path().join("SourceImages/Completed").join(format!("{source}.png")).exists());
        }
        assert_eq!(count(&seen, |e| matches!(e, RunEvent::SourceArchived { .. })), 3);

        let ledger = PendingReviewLedger::open(root.path().join("PendingReview.json"));
        let entries = ledger.entries();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|entry| entry.result_image_paths.len() == 3));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[test]
    fn face_files_sharing_a_stem_run_once() {
        let root = fixtures::root_with(&[("Ann", &["face1"])], &["beach"]);
        std::fs::write(root.path().join("Faces/Ann/face1.jpg"), fixtures::png_bytes()).unwrap();
        let browser = FakeBrowser::new();
        let supervisor = supervisor(&browser, 1);
        let events = supervisor.subscribe();

        supervisor.start(plan(&root)).unwrap();
        let seen = drain(&events);

        assert!(seen.contains(&RunEvent::RunStarted { workers: 1, sources: 1 }));
        assert_eq!(count(&seen, |e| matches!(e, RunEvent::TaskSucceeded { .. })), 1);
        assert_eq!(count(&seen, |e| matches!(e, RunEvent::SourceArchived { .. })), 1);
        assert!(!root.path().join("SourceImages/beach.png").exists());
    }

    #[test]
    fn sources_sharing_a_stem_never_share_an_output() {
        let root = fixtures::root_with(&[("Ann", &["face1"])], &["beach"]);
        std::fs::write(root.path().join("SourceImages/beach.gif"), b"GIF89a-rest-of-file").unwrap();
        let browser = FakeBrowser::new();
        let supervisor = supervisor(&browser, 1);
        let events = supervisor.subscribe();

        supervisor.start(plan(&root)).unwrap();
        let seen = drain(&events);

        let outputs: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                RunEvent::TaskSucceeded { output, .. } => Some(output.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(outputs, [root.path().join("Temp/Ann face1 beach.jpg")]);
        assert!(root.path().join("SourceImages/beach.png").exists());
    }

    #[test]
    fn final_failure_keeps_source_pending() {
        let root = fixtures::root_with(&[("Ann", &["face1"])], &["bad", "good"]);
        let browser = FakeBrowser::new().with_behavior(|stem| match stem {
            "bad" => SwapBehavior::NeverProgress,
            _ => SwapBehavior::Succeed,
        });
        let supervisor = supervisor(&browser, 1);
        let events = supervisor.subscribe();

        supervisor.start(plan(&root)).unwrap();
        let seen = drain(&events);

        assert_eq!(count(&seen, |e| matches!(e, RunEvent::SourceArchived { .. })), 1);
        assert!(root.path().join("SourceImages/bad.png").exists());
        assert!(!root.path().join("SourceImages/good.png").exists());
    }

    #[test]
    fn stop_finishes_every_worker() {
        let root = fixtures::root_with(&[("Ann", &["face1", "face2"])], &["a", "b", "c", "d", "e", "f"]);
        let browser = FakeBrowser::new().with_swap_delay(Duration::from_millis(30));
        let supervisor = supervisor(&browser, 3);
        let events = supervisor.subscribe();

        supervisor.start(plan(&root)).unwrap();
        loop {
            match events.recv_timeout(Duration::from_secs(10)) {
                Ok(RunEvent::TaskSucceeded { .. }) => break,
                Ok(_) => {}
                Err(e) => panic!("no success before stop: {e}"),
            }
        }
        supervisor.stop();
        let seen = drain(&events);

        assert_eq!(seen.last(), Some(&RunEvent::RunFinished { stopped: true }));
        assert_eq!(count(&seen, |e| matches!(e, RunEvent::WorkerFinished { .. })), 2);
        assert!(count(&seen, |e| matches!(e, RunEvent::TaskSucceeded { .. })) < 11);
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(browser.stats().closes, browser.stats().launches);
    }

    #[test]
    fn kill_returns_to_idle_immediately() {
        let root = fixtures::root_with(&[("Ann", &["face1"]), ("Bob", &["smile"])], &["one"]);
        let browser = FakeBrowser::new().with_behavior(|_| SwapBehavior::NeverProgress);
        let mut settings = fixtures::worker_settings(1);
        settings.timeouts.swap_no_progress = Duration::from_secs(60);
        settings.timeouts.swap_overall = Duration::from_secs(60);
        let supervisor = WorkerSupervisor::new(
            Arc::new(browser.clone()),
            Arc::new(FakeFetcher),
            fixtures::site_profile(),
            settings,
        );
        let events = supervisor.subscribe();

        supervisor.start(plan(&root)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        supervisor.kill();
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        supervisor.kill();

        std::thread::sleep(Duration::from_millis(100));
        let seen: Vec<_> = events.try_iter().collect();
        assert_eq!(count(&seen, |e| matches!(e, RunEvent::RunKilled)), 1);
        assert_eq!(count(&seen, |e| matches!(e, RunEvent::RunFinished { .. })), 0);
        let killed_at = seen.iter().position(|e| matches!(e, RunEvent::RunKilled)).unwrap();
        assert!(
            seen[killed_at + 1..].is_empty(),
            "events leaked after kill: {:?}",
            &seen[killed_at + 1..]
        );

        // A new run can start right away.
        supervisor.start(plan(&root)).unwrap();
        supervisor.kill();
    }

    #[test]
    fn rejects_invalid_plans() {
        let browser = FakeBrowser::new();
        let supervisor = supervisor(&browser, 1);
        let root = fixtures::root_with(&[("Ann", &["face1"]), ("Empty", &[])], &[]);

        let err = supervisor.start(RunPlan::default()).unwrap_err();
        assert!(matches!(err, ValidationError::NoRootDirectory));

        let mut no_persons = plan(&root);
        no_persons.persons.clear();
        assert!(matches!(
            supervisor.start(no_persons).unwrap_err(),
            ValidationError::NothingSelected
        ));

        let mut only_empty = plan(&root);
        only_empty.persons.retain(|p| p.name == "Empty");
        assert!(matches!(supervisor.start(only_empty).unwrap_err(), ValidationError::NoFaces));

        assert!(matches!(
            supervisor.start(plan(&root)).unwrap_err(),
            ValidationError::NoSources(_)
        ));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[test]
    fn second_start_is_rejected_while_running() {
        let root = fixtures::root_with(&[("Ann", &["face1"])], &["one"]);
        let browser = FakeBrowser::new().with_behavior(|_| SwapBehavior::NeverProgress);
        let supervisor = supervisor(&browser, 3);
        let events = supervisor.subscribe();

        supervisor.start(plan(&root)).unwrap();
        assert!(matches!(
            supervisor.start(plan(&root)).unwrap_err(),
            ValidationError::AlreadyRunning
        ));
        supervisor.stop();
        drain(&events);
    }

    #[test]
    fn person_progress_tracks_finished_workers() {
        let root = fixtures::root_with(&[("Ann", &["face1", "face2"])], &["one"]);
        let browser = FakeBrowser::new().with_behavior(|_| SwapBehavior::NeverProgress);
        let mut settings = fixtures::worker_settings(1);
        settings.timeouts.swap_no_progress = Duration::from_secs(60);
        settings.timeouts.swap_overall = Duration::from_secs(60);
        let supervisor = WorkerSupervisor::new(
            Arc::new(browser),
            Arc::new(FakeFetcher),
            fixtures::site_profile(),
            settings,
        );
        let events = supervisor.subscribe();

        supervisor.start(plan(&root)).unwrap();
        let coordinator = supervisor.coordinator().expect("active run");
        assert_eq!(coordinator.progress_for_person("Ann"), (0, 2));

        supervisor.stop();
        drain(&events);
        assert_eq!(coordinator.progress_for_person("Ann"), (2, 2));
        assert!(supervisor.coordinator().is_none());
    }
}
