use crate::events::{RunEvent, Severity};

/// Trait for reporting run progress.
/// This allows different front ends (CLI, a future UI) to render events their own way
pub trait ProgressReporter: Send + Sync {
    /// Report that the run has started with the given shape
    fn start_run(&self, workers: usize, sources: usize);

    /// Called for every event the run emits
    fn on_event(&self, event: &RunEvent);

    /// Report that the run is over
    fn finish_run(&self, _killed: bool) {}
}

/// A no-op progress reporter for when progress reporting is not needed
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn start_run(&self, _workers: usize, _sources: usize) {}
    fn on_event(&self, _event: &RunEvent) {}
}

/// Prints every event as one JSON line on stdout.
pub struct JsonEventReporter;

impl ProgressReporter for JsonEventReporter {
    fn start_run(&self, _workers: usize, _sources: usize) {}

    fn on_event(&self, event: &RunEvent) {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => log::error!("Failed to serialize event: {e}"),
        }
    }
}

/// Console-based progress reporter using indicatif.
///
/// The bar counts (worker, source) tasks that reached an outcome: a success
/// or a final failure.
#[cfg(feature = "cli")]
pub struct ConsoleProgressReporter {
    progress_bar: indicatif::ProgressBar,
}

#[cfg(feature = "cli")]
impl Default for ConsoleProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cli")]
impl ConsoleProgressReporter {
    pub fn new() -> Self {
        let progress_bar = indicatif::ProgressBar::new(0);

        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        progress_bar.set_style(style);

        Self { progress_bar }
    }
}

#[cfg(feature = "cli")]
impl ProgressReporter for ConsoleProgressReporter {
    fn start_run(&self, workers: usize, sources: usize) {
        self.progress_bar.set_length((workers * sources) as u64);
        self.progress_bar
            .set_message(format!("{workers} workers swapping..."));
    }

    fn on_event(&self, event: &RunEvent) {
        match event {
            RunEvent::TaskSucceeded { output, .. } => {
                self.progress_bar.inc(1);
                let size = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);
                self.progress_bar.println(format!(
                    "✅ {} ({})",
                    output.display(),
                    humansize::format_size(size, humansize::DECIMAL)
                ));
            }
            RunEvent::TaskFailed {
                worker,
                source,
                reason,
                final_failure,
                ..
            } => {
                if *final_failure {
                    self.progress_bar.inc(1);
                    self.progress_bar
                        .println(format!("❌ {worker} gave up on {}: {reason}", source.display()));
                }
            }
            RunEvent::SourceArchived { source, .. } => {
                self.progress_bar
                    .println(format!("📦 Archived {}", source.display()));
            }
            RunEvent::Log {
                severity: Severity::Error,
                worker,
                message,
            } => {
                let who = worker.as_ref().map(|w| w.to_string()).unwrap_or_default();
                self.progress_bar.println(format!("⚠️  {who} {message}"));
            }
            _ => {}
        }
    }

    fn finish_run(&self, killed: bool) {
        if killed {
            self.progress_bar.abandon_with_message("Run killed");
        } else {
            self.progress_bar.finish_with_message("Run finished");
        }
    }
}
