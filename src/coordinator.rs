//! Decides when a source image is done for every selected person.
//!
//! All mutation goes through one mutex. The archive move runs after the
//! lock is released, but the tables are updated first, so concurrent
//! reports for the same source can never trigger it twice.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::archive::SourceArchiver;
use crate::events::{EventBus, RunEvent, Severity};

/// One per-source outcome from a worker.
#[derive(Debug, Clone)]
pub struct Completion {
    pub source: PathBuf,
    pub person: String,
    /// Face image of the reporting worker.
    pub face: PathBuf,
    /// Number of faces the person has in this run.
    pub face_total: usize,
    pub success: bool,
    pub output: Option<PathBuf>,
}

#[derive(Default)]
struct Tables {
    selected: BTreeSet<String>,
    /// Workers per person.
    workers_total: HashMap<String, usize>,
    workers_done: HashMap<String, usize>,
    /// Distinct face images done per (source, person).
    progress: HashMap<(PathBuf, String), HashSet<PathBuf>>,
    /// Persons fully done per source.
    overall: HashMap<PathBuf, BTreeSet<String>>,
    results: HashMap<PathBuf, BTreeSet<PathBuf>>,
    archived: HashSet<PathBuf>,
}

pub struct CompletionCoordinator {
    tables: Mutex<Tables>,
    archiver: SourceArchiver,
    bus: Arc<EventBus>,
}

impl CompletionCoordinator {
    /// `persons` lists every selected person with their worker (face) count.
    pub fn new(persons: &[(String, usize)], archiver: SourceArchiver, bus: Arc<EventBus>) -> Self {
        let mut tables = Tables::default();
        for (person, faces) in persons {
            tables.selected.insert(person.clone());
            tables.workers_total.insert(person.clone(), *faces);
        }
        Self {
            tables: Mutex::new(tables),
            archiver,
            bus,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn report(&self, completion: Completion) {
        let Completion {
            source,
            person,
            face,
            face_total,
            success,
            output,
        } = completion;

        if !success {
            self.bus.log(
                Severity::Warn,
                format!(
                    "{person}/{} gave up on {}; it stays pending",
                    face.display(),
                    source.display()
                ),
            );
            return;
        }

        let ready = {
            let mut guard = self.lock();
            let tables = &mut *guard;
            if tables.archived.contains(&source) || !tables.selected.contains(&person) {
                return;
            }
            if tables
                .overall
                .get(&source)
                .is_some_and(|done| done.contains(&person))
            {
                return;
            }

            if let Some(output) = output {
                tables.results.entry(source.clone()).or_default().insert(output);
            }

            let faces = tables
                .progress
                .entry((source.clone(), person.clone()))
                .or_default();
            faces.insert(face);
            if faces.len() < face_total {
                return;
            }

            let done = tables.overall.entry(source.clone()).or_default();
            done.insert(person.clone());
            if *done != tables.selected {
                return;
            }

            // Fully done: clear the tables before archiving so nothing re-triggers.
            tables.overall.remove(&source);
            let selected: Vec<String> = tables.selected.iter().cloned().collect();
            for name in selected {
                tables.progress.remove(&(source.clone(), name));
            }
            tables.archived.insert(source.clone());
            tables.results.remove(&source).unwrap_or_default()
        };

        self.archive(&source, ready.into_iter().collect());
    }

    fn archive(&self, source: &Path, results: Vec<PathBuf>) {
        match self.archiver.archive(source, results) {
            Ok(target) => {
                self.bus.log(
                    Severity::Info,
                    format!("Archived {} -> {}", source.display(), target.display()),
                );
                self.bus.emit(RunEvent::SourceArchived {
                    source: source.to_path_buf(),
                    archived_to: target,
                });
            }
            Err(e) => self.bus.log(Severity::Error, format!("Archive failed: {e}")),
        }
    }

    pub fn worker_finished(&self, person: &str) {
        *self.lock().workers_done.entry(person.to_string()).or_default() += 1;
    }

    /// `(finished workers, total workers)` for one person.
    pub fn progress_for_person(&self, person: &str) -> (usize, usize) {
        let tables = self.lock();
        (
            tables.workers_done.get(person).copied().unwrap_or(0),
            tables.workers_total.get(person).copied().unwrap_or(0),
        )
    }

    pub fn is_archived(&self, source: &Path) -> bool {
        self.lock().archived.contains(source)
    }

    pub fn archived_count(&self) -> usize {
        self.lock().archived.len()
    }

    /// Sources that have partial progress recorded.
    pub fn in_flight(&self) -> usize {
        let tables = self.lock();
        tables
            .progress
            .keys()
            .map(|(source, _)| source)
            .collect::<HashSet<_>>()
            .len()
    }
}
