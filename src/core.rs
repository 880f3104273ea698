use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    RunOutcome, RunReport,
    browser::BrowserLauncher,
    config::RunOptions,
    converter::ResultConverter,
    error::ValidationError,
    events::RunEvent,
    fetch::{AssetFetcher, HttpFetcher},
    library::{PeopleLibrary, RootLayout, scan_sources},
    progress::{NoOpProgressReporter, ProgressReporter},
    stats::RunStats,
    supervisor::{RunPlan, WorkerSupervisor},
    utils::format_duration,
    webdriver::WebDriverLauncher,
    worker::WorkerSettings,
};

/// How often the event pump wakes up to check the runtime limit.
const PUMP_INTERVAL: Duration = Duration::from_millis(200);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Core engine: resolves the run plan, drives a supervisor to completion and
/// summarizes the result.
pub struct SwapCore {
    options: RunOptions,
    stats: RunStats,
}

impl SwapCore {
    /// Create a new core engine with the given options
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            stats: RunStats::new(),
        }
    }

    /// Run against the configured WebDriver endpoint without progress output
    pub fn run(&self) -> Result<RunReport> {
        self.run_with_progress(&NoOpProgressReporter)
    }

    /// Run against the configured WebDriver endpoint
    pub fn run_with_progress(&self, reporter: &dyn ProgressReporter) -> Result<RunReport> {
        self.options.site.validate()?;
        let launcher = WebDriverLauncher::new(
            &self.options.webdriver_url,
            self.options.headless,
            self.options.browser_args.clone(),
        )?;
        let fetcher = HttpFetcher::new(FETCH_TIMEOUT)?;
        self.run_with_backends(Arc::new(launcher), Arc::new(fetcher), reporter)
    }

    /// Resolve the root layout, selected persons and pending sources.
    pub fn plan(&self) -> Result<RunPlan> {
        let layout = self
            .options
            .root_dir
            .as_deref()
            .and_then(RootLayout::existing)
            .ok_or(ValidationError::NoRootDirectory)?;

        let mut library = PeopleLibrary::new(layout.clone());
        let persons = if self.options.all_persons {
            library.persons(false)?.to_vec()
        } else {
            library.select(&self.options.persons)?
        };
        let sources = scan_sources(&layout)?;

        Ok(RunPlan {
            layout: Some(layout),
            persons,
            sources,
        })
    }

    /// Run with explicit browser and download backends
    pub fn run_with_backends(
        &self,
        launcher: Arc<dyn BrowserLauncher>,
        fetcher: Arc<dyn AssetFetcher>,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        let start_time = Instant::now();
        let start_time_utc = Utc::now();

        let plan = self.plan()?;
        let layout = plan.layout.clone().ok_or(ValidationError::NoRootDirectory)?;
        let workers: usize = plan.persons.iter().map(|p| p.faces.len()).sum();
        let sources = plan.sources.len();

        let settings = WorkerSettings {
            timeouts: self.options.timeouts.clone(),
            max_attempts: self.options.attempt_cap(),
            converter: ResultConverter::new(self.options.output_format, self.options.quality),
            close_sessions: self.options.close_sessions(),
        };
        let supervisor = WorkerSupervisor::new(launcher, fetcher, self.options.site.clone(), settings);
        let events = supervisor.subscribe();
        supervisor.start(plan).context("Run could not start")?;

        log::info!(
            "Running {} workers over {} sources in {}",
            workers,
            sources,
            layout.root.display()
        );
        reporter.start_run(workers, sources);
        let outcome = self.pump(&supervisor, &events, reporter);
        reporter.finish_run(outcome == RunOutcome::Killed);

        let duration = start_time.elapsed();
        log::info!("Run {:?} after {}", outcome, format_duration(duration));

        Ok(RunReport {
            start_time: start_time_utc,
            end_time: Utc::now(),
            duration,
            root_dir: layout.root.clone(),
            staging_dir: layout.staging_dir.clone(),
            outcome,
            workers,
            sources,
            succeeded: self.stats.succeeded(),
            failed_attempts: self.stats.failed_attempts(),
            final_failures: self.stats.final_failures(),
            archived: self.stats.archived(),
            output_bytes: self.stats.output_bytes(),
            output_format: self.options.output_format.extension().to_string(),
            quality: self.options.quality,
            errors: self.stats.get_errors(),
        })
    }

    /// Feed events to the stats and reporter until the run ends, enforcing
    /// the runtime limit with stop first and kill after the grace period.
    fn pump(
        &self,
        supervisor: &WorkerSupervisor,
        events: &Receiver<RunEvent>,
        reporter: &dyn ProgressReporter,
    ) -> RunOutcome {
        let started = Instant::now();
        let mut stop_requested: Option<Instant> = None;

        loop {
            match events.recv_timeout(PUMP_INTERVAL) {
                Ok(event) => {
                    self.stats.record(&event);
                    reporter.on_event(&event);
                    match event {
                        RunEvent::RunFinished { stopped: true } => return RunOutcome::Stopped,
                        RunEvent::RunFinished { stopped: false } => return RunOutcome::Completed,
                        RunEvent::RunKilled => return RunOutcome::Killed,
                        _ => {}
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    log::error!("Event stream closed before the run finished");
                    return RunOutcome::Killed;
                }
            }

            if let Some(limit) = self.options.max_runtime {
                if stop_requested.is_none() && started.elapsed() >= limit {
                    log::warn!("Runtime limit of {} reached, stopping", format_duration(limit));
                    supervisor.stop();
                    stop_requested = Some(Instant::now());
                }
            }
            if let Some(requested) = stop_requested {
                if requested.elapsed() >= self.options.stop_grace {
                    log::warn!(
                        "Workers still running {} after stop, killing",
                        format_duration(self.options.stop_grace)
                    );
                    supervisor.kill();
                }
            }
        }
    }

    /// Get current run statistics
    pub fn get_stats(&self) -> &RunStats {
        &self.stats
    }
}
