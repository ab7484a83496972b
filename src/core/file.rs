use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, enough to address a file in an interactive session.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }

    pub fn matches_prefix(&self, prefix: &str) -> bool {
        let prefix = prefix.to_ascii_lowercase();
        !prefix.is_empty()
            && (self.0.simple().to_string().starts_with(&prefix)
                || self.0.hyphenated().to_string().starts_with(&prefix))
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file the user asked to process. Never mutated; delete and re-add to change it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedFile {
    id: FileId,
    path: String,
    name: String,
}

impl StagedFile {
    /// Relative paths are resolved against the current directory. The file itself is not
    /// checked; missing files surface when they are processed.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };
        let name = absolute
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| absolute.to_string_lossy().to_string());

        Self {
            id: FileId::new(),
            path: absolute.to_string_lossy().to_string(),
            name,
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path_buf(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_last_component() {
        let file = StagedFile::from_path("/tmp/shows/a.cue");
        assert_eq!(file.path(), "/tmp/shows/a.cue");
        assert_eq!(file.name(), "a.cue");
    }

    #[test]
    fn relative_paths_become_absolute() {
        let file = StagedFile::from_path("b.cue");
        assert!(Path::new(file.path()).is_absolute());
        assert_eq!(file.name(), "b.cue");
    }

    #[test]
    fn same_path_gets_distinct_ids() {
        let a = StagedFile::from_path("/tmp/a.cue");
        let b = StagedFile::from_path("/tmp/a.cue");
        assert_eq!(a.path(), b.path());
        assert_eq!(a.name(), b.name());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn id_prefix_lookup() {
        let id = FileId::new();
        assert!(id.matches_prefix(&id.short()));
        assert!(id.matches_prefix(&id.to_string()));
        assert!(!id.matches_prefix(""));
    }
}
