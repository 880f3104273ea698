use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use crate::models::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn level(self) -> log::Level {
        match self {
            Severity::Debug => log::Level::Debug,
            Severity::Info => log::Level::Info,
            Severity::Warn => log::Level::Warn,
            Severity::Error => log::Level::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Everything the core tells the outside world about a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// `worker` is `None` for supervisor and coordinator messages.
    Log {
        worker: Option<WorkerId>,
        severity: Severity,
        message: String,
    },
    TaskSucceeded {
        worker: WorkerId,
        person: String,
        face: PathBuf,
        source: PathBuf,
        output: PathBuf,
    },
    TaskFailed {
        worker: WorkerId,
        person: String,
        face: PathBuf,
        source: PathBuf,
        reason: String,
        attempt: u32,
        final_failure: bool,
    },
    WorkerFinished {
        worker: WorkerId,
        person: String,
    },
    SourceArchived {
        source: PathBuf,
        archived_to: PathBuf,
    },
    RunStarted {
        workers: usize,
        sources: usize,
    },
    RunFinished {
        stopped: bool,
    },
    RunKilled,
}

impl RunEvent {
    pub fn log(worker: Option<WorkerId>, severity: Severity, message: impl Into<String>) -> Self {
        RunEvent::Log {
            worker,
            severity,
            message: message.into(),
        }
    }

    /// Terminal events that end a run from a subscriber's point of view.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::RunFinished { .. } | RunEvent::RunKilled)
    }
}

/// Fan-out of [`RunEvent`]s to any number of channel subscribers.
///
/// Subscribers that dropped their receiver are pruned on the next emit.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<RunEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<RunEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn emit(&self, event: RunEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Log through `log` and publish the same line as an event.
    pub fn log(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        log::log!(target: "faceswap_pilot::run", severity.level(), "{message}");
        self.emit(RunEvent::log(None, severity, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_events() {
        let bus = EventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.emit(RunEvent::RunKilled);

        assert_eq!(first.try_recv().unwrap(), RunEvent::RunKilled);
        assert_eq!(second.try_recv().unwrap(), RunEvent::RunKilled);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.emit(RunEvent::RunFinished { stopped: false });
        bus.emit(RunEvent::RunKilled);

        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_string(&RunEvent::RunStarted { workers: 3, sources: 2 }).unwrap();
        assert_eq!(json, r#"{"event":"run_started","workers":3,"sources":2}"#);
    }
}
