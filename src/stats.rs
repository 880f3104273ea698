use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::events::RunEvent;
use crate::models::WorkerId;

/// Counters for one run, fed from the event stream.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub succeeded: Arc<AtomicU64>,
    pub failed_attempts: Arc<AtomicU64>,
    pub final_failures: Arc<AtomicU64>,
    pub archived: Arc<AtomicU64>,
    pub workers_finished: Arc<AtomicU64>,
    pub output_bytes: Arc<AtomicU64>,
    errors: Arc<Mutex<Vec<ErrorRecord>>>,
}

/// Latest failure per (worker, source), with how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub worker: WorkerId,
    pub source: PathBuf,
    pub error_message: String,
    pub retry_count: u32,
    pub final_failure: bool,
    pub timestamp: std::time::SystemTime,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &RunEvent) {
        match event {
            RunEvent::TaskSucceeded { output, .. } => {
                let size = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);
                self.record_success(size);
            }
            RunEvent::TaskFailed {
                worker,
                source,
                reason,
                attempt,
                final_failure,
                ..
            } => self.record_failure(worker, source, reason, *attempt, *final_failure),
            RunEvent::SourceArchived { .. } => {
                self.archived.fetch_add(1, Ordering::Relaxed);
            }
            RunEvent::WorkerFinished { .. } => {
                self.workers_finished.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_success(&self, output_bytes: u64) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.output_bytes.fetch_add(output_bytes, Ordering::Relaxed);
    }

    pub fn record_failure(
        &self,
        worker: &WorkerId,
        source: &Path,
        error: &str,
        attempt: u32,
        final_failure: bool,
    ) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        if final_failure {
            self.final_failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        // Retries update the existing record for this worker and source
        let existing = errors
            .iter_mut()
            .rev()
            .find(|e| &e.worker == worker && e.source == source);
        match existing {
            Some(record) => {
                record.error_message = error.to_string();
                record.retry_count = attempt.saturating_sub(1);
                record.final_failure = final_failure;
                record.timestamp = std::time::SystemTime::now();
            }
            None => errors.push(ErrorRecord {
                worker: worker.clone(),
                source: source.to_path_buf(),
                error_message: error.to_string(),
                retry_count: attempt.saturating_sub(1),
                final_failure,
                timestamp: std::time::SystemTime::now(),
            }),
        }
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    pub fn final_failures(&self) -> u64 {
        self.final_failures.load(Ordering::Relaxed)
    }

    pub fn archived(&self) -> u64 {
        self.archived.load(Ordering::Relaxed)
    }

    pub fn output_bytes(&self) -> u64 {
        self.output_bytes.load(Ordering::Relaxed)
    }

    pub fn get_errors(&self) -> Vec<String> {
        self.get_error_records()
            .iter()
            .map(|e| {
                format!(
                    "{} / {}: {} (retries: {})",
                    e.worker,
                    e.source.display(),
                    e.error_message,
                    e.retry_count
                )
            })
            .collect()
    }

    pub fn get_error_records(&self) -> Vec<ErrorRecord> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_success_rate(&self) -> f64 {
        let success = self.succeeded();
        let total = success + self.final_failures();
        if total > 0 {
            success as f64 / total as f64
        } else {
            0.0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.succeeded() == 0 && self.failed_attempts() == 0
    }
}
