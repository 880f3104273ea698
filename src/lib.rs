//! # Faceswap Pilot Library
//!
//! Drives a browser-based face swap service for every (face, source image)
//! pair of a run.
//!
//! One worker per face image owns a browser session and walks the pending
//! source images through a small state machine. A completion coordinator
//! archives each source once every face of every selected person has produced
//! a result for it, and a supervisor starts, stops and kills the whole run.

pub mod archive;
pub mod browser;
pub mod config;
pub mod converter;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod events;
pub mod fetch;
pub mod library;
pub mod models;
pub mod page;
pub mod progress;
pub mod stats;
pub mod stop;
pub mod supervisor;
pub mod utils;
pub mod webdriver;
pub mod worker;

#[cfg(test)]
mod fixtures;

// Re-export commonly used types
pub use browser::{BrowserLauncher, BrowserSession, Locator};
pub use config::{Config, ProfileConfig, RunOptions, Timeouts};
pub use coordinator::CompletionCoordinator;
pub use core::SwapCore;
pub use error::{BrowserError, FileOpError, SwapError, ValidationError};
pub use events::{EventBus, RunEvent, Severity};
pub use library::{PeopleLibrary, RootLayout};
pub use page::SiteProfile;
pub use progress::ProgressReporter;
pub use stats::RunStats;
pub use supervisor::{RunPlan, SupervisorState, WorkerSupervisor};
pub use utils::{format_duration, validate_image_file, ImageValidationError};
pub use worker::{FaceSwapWorker, WorkerState};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every worker went through all of its sources
    Completed,
    /// A stop was requested and every worker wound down
    Stopped,
    /// The run was abandoned without waiting for workers
    Killed,
}

/// Summary of one run
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunReport {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
    pub root_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub outcome: RunOutcome,
    pub workers: usize,
    pub sources: usize,
    pub succeeded: u64,
    pub failed_attempts: u64,
    pub final_failures: u64,
    pub archived: u64,
    pub output_bytes: u64,
    pub output_format: String,
    pub quality: u8,
    pub errors: Vec<String>,
}

impl RunReport {
    /// (worker, source) tasks that reached an outcome, per minute.
    pub fn tasks_per_minute(&self) -> f64 {
        let minutes = self.duration.as_secs_f64() / 60.0;
        if minutes > 0.0 {
            (self.succeeded + self.final_failures) as f64 / minutes
        } else {
            0.0
        }
    }
}

/// File format for saved swap results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

/// Report output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Csv,
}

impl ReportFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }
}

/// Write a run report into `dir` and return its path
pub fn generate_report(report: &RunReport, format: ReportFormat, dir: &Path) -> Result<PathBuf> {
    match format {
        ReportFormat::Json => generate_json_report(report, dir),
        ReportFormat::Csv => generate_csv_report(report, dir),
    }
}

fn generate_json_report(report: &RunReport, dir: &Path) -> Result<PathBuf> {
    let json = serde_json::to_string_pretty(report)?;
    let report_path = dir.join("faceswap_report.json");
    std::fs::write(&report_path, json)?;
    log::info!("Report saved to: {}", report_path.display());
    Ok(report_path)
}

fn generate_csv_report(report: &RunReport, dir: &Path) -> Result<PathBuf> {
    let report_path = dir.join("faceswap_report.csv");
    let mut writer = csv::Writer::from_path(&report_path)?;

    let outcome = match report.outcome {
        RunOutcome::Completed => "completed",
        RunOutcome::Stopped => "stopped",
        RunOutcome::Killed => "killed",
    };
    let rows = [
        ("start_time", report.start_time.format("%Y-%m-%d %H:%M:%S UTC").to_string()),
        ("end_time", report.end_time.format("%Y-%m-%d %H:%M:%S UTC").to_string()),
        ("duration_seconds", report.duration.as_secs().to_string()),
        ("root_dir", report.root_dir.display().to_string()),
        ("staging_dir", report.staging_dir.display().to_string()),
        ("outcome", outcome.to_string()),
        ("workers", report.workers.to_string()),
        ("sources", report.sources.to_string()),
        ("succeeded", report.succeeded.to_string()),
        ("failed_attempts", report.failed_attempts.to_string()),
        ("final_failures", report.final_failures.to_string()),
        ("archived", report.archived.to_string()),
        ("output_bytes", report.output_bytes.to_string()),
        ("tasks_per_minute", format!("{:.2}", report.tasks_per_minute())),
        ("output_format", report.output_format.clone()),
        ("quality", report.quality.to_string()),
    ];

    writer.write_record(["metric", "value"])?;
    for (metric, value) in &rows {
        writer.write_record([*metric, value.as_str()])?;
    }
    for error in &report.errors {
        writer.write_record(["error", error.as_str()])?;
    }
    writer.flush()?;

    log::info!("Report saved to: {}", report_path.display());
    Ok(report_path)
}
