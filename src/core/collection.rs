use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::core::error::CopyError;
use crate::core::event::CollectionEvent;
use crate::core::file::{FileId, StagedFile};
use crate::core::scratch::ScratchDir;

#[derive(Default)]
struct Inner {
    files: Vec<StagedFile>,
    subscribers: Vec<Sender<CollectionEvent>>,
}

impl Inner {
    fn publish(&mut self, event: CollectionEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

/// Ordered set of staged files for one session. Clones share the same state.
#[derive(Clone, Default)]
pub struct Collection {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
pub struct StageOutcome {
    pub file: StagedFile,
    pub result: Result<std::path::PathBuf, CopyError>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Mutations are single Vec operations, a poisoned lock still holds a valid list.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, file: StagedFile) {
        let mut inner = self.lock();
        debug!(id = %file.id(), path = file.path(), "file added");
        inner.files.push(file.clone());
        inner.publish(CollectionEvent::Added(file));
    }

    pub fn delete(&self, id: FileId) -> Option<StagedFile> {
        let mut inner = self.lock();
        let position = inner.files.iter().position(|file| file.id() == id)?;
        let removed = inner.files.remove(position);
        debug!(id = %removed.id(), path = removed.path(), "file removed");
        inner.publish(CollectionEvent::Removed(removed.clone()));
        Some(removed)
    }

    pub fn get(&self, id: FileId) -> Option<StagedFile> {
        self.lock().files.iter().find(|file| file.id() == id).cloned()
    }

    /// Resolves a full id, an id prefix, or a 1-based position in the listing.
    pub fn find(&self, key: &str) -> Option<StagedFile> {
        let inner = self.lock();
        if let Ok(index) = key.parse::<usize>() {
            if index >= 1 && index <= inner.files.len() && key.len() < 8 {
                return inner.files.get(index - 1).cloned();
            }
        }

        let mut matches = inner.files.iter().filter(|file| file.id().matches_prefix(key));
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first.clone())
    }

    pub fn snapshot(&self) -> Vec<StagedFile> {
        self.lock().files.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock()
            .files
            .iter()
            .map(|file| file.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().files.is_empty()
    }

    pub fn subscribe(&self) -> Receiver<CollectionEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Copies every file into the scratch directory. Each copy is independent; a failed copy
    /// is reported in its outcome and the rest still run.
    pub fn stage_to_scratch(&self, scratch: &ScratchDir) -> Vec<StageOutcome> {
        let files = self.snapshot();
        let outcomes: Vec<StageOutcome> = files
            .into_iter()
            .map(|file| {
                let result = scratch.copy_in(&file);
                if let Err(err) = &result {
                    info!(id = %file.id(), "{err}");
                }
                StageOutcome { file, result }
            })
            .collect();

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(
            staged = outcomes.len() - failed,
            failed,
            dir = %scratch.path().display(),
            "staging finished"
        );
        outcomes
    }
}
