use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use tracing::info;

use crate::config::Settings;
use crate::core::batch::{BatchDriver, BatchOptions, BatchReport};
use crate::core::build::BuildReport;
use crate::core::cancel::CancelToken;
use crate::core::collection::{Collection, StageOutcome};
use crate::core::error::{BuildError, ConfigError};
use crate::core::event::BatchEvent;
use crate::core::file::StagedFile;
use crate::core::orchestrator::ParseOrchestrator;
use crate::core::scratch::ScratchDir;

/// Everything a front end talks to: the staged files and the parser that processes them.
pub struct Session {
    collection: Collection,
    orchestrator: ParseOrchestrator,
    scratch: ScratchDir,
    jobs: usize,
    current: Mutex<Option<CancelToken>>,
}

impl Session {
    pub fn open(settings: &Settings) -> Result<Self, ConfigError> {
        let orchestrator = ParseOrchestrator::new(settings.orchestrator_config()?)?;
        Ok(Self::new(orchestrator, settings.scratch()).with_jobs(settings.jobs()))
    }

    pub fn new(orchestrator: ParseOrchestrator, scratch: ScratchDir) -> Self {
        Self {
            collection: Collection::new(),
            orchestrator,
            scratch,
            jobs: 1,
            current: Mutex::new(None),
        }
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn orchestrator(&self) -> &ParseOrchestrator {
        &self.orchestrator
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    pub fn add_path(&self, path: impl AsRef<Path>) -> StagedFile {
        let file = StagedFile::from_path(path);
        self.collection.add(file.clone());
        file
    }

    /// `key` is an id, an id prefix, or a 1-based position. Unknown keys remove nothing.
    pub fn remove(&self, key: &str) -> Option<StagedFile> {
        let file = self.collection.find(key)?;
        self.collection.delete(file.id())
    }

    pub fn stage(&self) -> Vec<StageOutcome> {
        self.collection.stage_to_scratch(&self.scratch)
    }

    pub fn process(&self, stage_first: bool, events: Option<Sender<BatchEvent>>) -> BatchReport {
        let token = CancelToken::new();
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(token.clone());

        let options = BatchOptions {
            stage_into: stage_first.then(|| self.scratch.clone()),
            jobs: self.jobs,
        };
        let mut driver = BatchDriver::new(&self.orchestrator, options).with_cancel(token);
        if let Some(events) = events {
            driver = driver.with_events(events);
        }
        let report = driver.process_all(&self.collection);

        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = None;
        report
    }

    /// Stops the running batch, if any. Returns whether there was one.
    pub fn cancel_current(&self) -> bool {
        match self.current.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            Some(token) => {
                info!("cancelling batch");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn rebuild(&self) -> Result<Option<BuildReport>, BuildError> {
        self.orchestrator.rebuild()
    }
}
