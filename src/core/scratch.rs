use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::core::error::CopyError;
use crate::core::file::StagedFile;

/// Staging area for copies of the user's files, keyed by display name.
///
/// Copies to the same destination are serialized, so concurrent staging of two files that share
/// a name still ends with one complete file: whichever copy ran last. Private copies live one
/// directory down, under the file's short id.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
    locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::default(),
        }
    }

    pub fn default_location() -> PathBuf {
        std::env::temp_dir().join("cuedrop")
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn destination_for(&self, file: &StagedFile) -> PathBuf {
        self.root.join(file.name())
    }

    /// Per-file destination, `<root>/<short id>/<name>`. Never shared between two files.
    pub fn private_destination_for(&self, file: &StagedFile) -> PathBuf {
        self.root.join(file.id().short()).join(file.name())
    }

    fn lock_for(&self, destination: &Path) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(destination.to_path_buf()).or_default())
    }

    /// Removes any existing file at the destination, then copies.
    pub fn copy_in(&self, file: &StagedFile) -> Result<PathBuf, CopyError> {
        self.copy_to(file, self.destination_for(file))
    }

    pub fn copy_in_private(&self, file: &StagedFile) -> Result<PathBuf, CopyError> {
        self.copy_to(file, self.private_destination_for(file))
    }

    fn copy_to(&self, file: &StagedFile, destination: PathBuf) -> Result<PathBuf, CopyError> {
        let source = file.path_buf();
        let to_copy_error = |err: io::Error| CopyError {
            source_path: source.clone(),
            destination: destination.clone(),
            message: err.to_string(),
        };

        let parent = destination.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(to_copy_error)?;

        let lock = self.lock_for(&destination);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        match fs::remove_file(&destination) {
            Ok(()) => debug!(path = %destination.display(), "removed previous scratch copy"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(to_copy_error(err)),
        }

        fs::copy(&source, &destination).map_err(to_copy_error)?;
        debug!(
            from = %source.display(),
            to = %destination.display(),
            "copied into scratch"
        );
        Ok(destination)
    }
}

impl Default for ScratchDir {
    fn default() -> Self {
        Self::new(Self::default_location())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collection::Collection;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, contents: &str) -> PathBuf {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn overwrites_existing_copy() {
        let td = TempDir::new().unwrap();
        let scratch = ScratchDir::new(td.path().join("scratch"));
        let src = write(td.path(), "in/a.cue", "fresh");
        write(td.path(), "scratch/a.cue", "stale");

        let dest = scratch.copy_in(&StagedFile::from_path(&src)).unwrap();
        assert_eq!(fs::read_to_string(dest).unwrap(), "fresh");
    }

    #[test]
    fn same_name_last_writer_wins() {
        let td = TempDir::new().unwrap();
        let scratch = ScratchDir::new(td.path().join("scratch"));
        let first = write(td.path(), "one/show.cue", "first");
        let second = write(td.path(), "two/show.cue", "second");

        let collection = Collection::new();
        collection.add(StagedFile::from_path(&first));
        collection.add(StagedFile::from_path(&second));

        let outcomes = collection.stage_to_scratch(&scratch);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(
            fs::read_to_string(td.path().join("scratch/show.cue")).unwrap(),
            "second"
        );
    }

    #[test]
    fn failed_copy_does_not_stop_others() {
        let td = TempDir::new().unwrap();
        let scratch = ScratchDir::new(td.path().join("scratch"));
        let good = write(td.path(), "in/good.cue", "ok");

        let collection = Collection::new();
        collection.add(StagedFile::from_path(td.path().join("in/missing.cue")));
        collection.add(StagedFile::from_path(&good));

        let outcomes = collection.stage_to_scratch(&scratch);
        let err = outcomes[0].result.as_ref().unwrap_err();
        assert!(err.source_path.ends_with("missing.cue"));
        assert_eq!(
            outcomes[1].result.as_ref().unwrap(),
            &td.path().join("scratch/good.cue")
        );
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn concurrent_same_name_copies_leave_one_whole_file() {
        let td = TempDir::new().unwrap();
        let scratch = ScratchDir::new(td.path().join("scratch"));
        let contents: Vec<String> = (0..6).map(|n| n.to_string().repeat(4096)).collect();
        let files: Vec<StagedFile> = contents
            .iter()
            .enumerate()
            .map(|(n, body)| StagedFile::from_path(write(td.path(), &format!("{n}/x.cue"), body)))
            .collect();

        std::thread::scope(|s| {
            for file in &files {
                let scratch = scratch.clone();
                s.spawn(move || scratch.copy_in(file).unwrap());
            }
        });

        let result = fs::read_to_string(td.path().join("scratch/x.cue")).unwrap();
        assert!(contents.contains(&result));
    }

    #[test]
    fn private_copies_keep_same_named_files_apart() {
        let td = TempDir::new().unwrap();
        let scratch = ScratchDir::new(td.path().join("scratch"));
        let first = StagedFile::from_path(write(td.path(), "one/show.cue", "first"));
        let second = StagedFile::from_path(write(td.path(), "two/show.cue", "second"));

        let a = scratch.copy_in_private(&first).unwrap();
        let b = scratch.copy_in_private(&second).unwrap();

        assert_ne!(a, b);
        assert!(a.ends_with(format!("{}/show.cue", first.id().short())));
        assert_eq!(fs::read_to_string(a).unwrap(), "first");
        assert_eq!(fs::read_to_string(b).unwrap(), "second");
    }
}
