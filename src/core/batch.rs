use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::thread;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::core::cancel::CancelToken;
use crate::core::collection::Collection;
use crate::core::error::{CopyError, ParseError};
use crate::core::event::BatchEvent;
use crate::core::file::StagedFile;
use crate::core::orchestrator::{ParseOutput, SheetParser};
use crate::core::scratch::ScratchDir;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Copy every file into this directory first and parse the copies.
    pub stage_into: Option<ScratchDir>,
    /// Parallel parser processes. 1 keeps strict collection order.
    pub jobs: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            stage_into: None,
            jobs: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Parsed(ParseOutput),
    Failed(ParseError),
    NotStaged(CopyError),
    Skipped,
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FileOutcome::Parsed(_))
    }
}

#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub file: StagedFile,
    /// Path handed to the parser, the scratch copy when staging is on.
    pub parsed_path: Option<PathBuf>,
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|e| e.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, FileOutcome::Failed(_) | FileOutcome::NotStaged(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, FileOutcome::Skipped))
            .count()
    }

    pub fn to_json(&self) -> Value {
        let entries: Vec<Value> = self
            .entries
            .iter()
            .map(|entry| {
                let mut value = json!({
                    "id": entry.file.id(),
                    "name": entry.file.name(),
                    "path": entry.file.path(),
                    "parsed_path": entry
                        .parsed_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().to_string()),
                });
                let details = match &entry.outcome {
                    FileOutcome::Parsed(out) => json!({
                        "status": "parsed",
                        "output": out.output,
                        "exit_code": out.exit_code,
                        "elapsed_ms": out.elapsed.as_millis() as u64,
                        "build_warning": out.build_warning.as_ref().map(ToString::to_string),
                    }),
                    FileOutcome::Failed(err) => json!({
                        "status": "failed",
                        "error": err.to_string(),
                        "output": err.output(),
                    }),
                    FileOutcome::NotStaged(err) => json!({
                        "status": "not_staged",
                        "error": err.to_string(),
                    }),
                    FileOutcome::Skipped => json!({ "status": "skipped" }),
                };
                if let (Some(map), Value::Object(extra)) = (value.as_object_mut(), details) {
                    map.extend(extra);
                }
                value
            })
            .collect();

        json!({
            "cancelled": self.cancelled,
            "succeeded": self.succeeded(),
            "failed": self.failed(),
            "skipped": self.skipped(),
            "files": entries,
        })
    }
}

fn stage_entry(
    scratch: &ScratchDir,
    file: &StagedFile,
    name_counts: &HashMap<String, usize>,
) -> Result<PathBuf, CopyError> {
    if name_counts.get(file.name()).copied().unwrap_or(0) > 1 {
        scratch.copy_in_private(file)
    } else {
        scratch.copy_in(file)
    }
}

/// Parses every file of a collection snapshot, one outcome per file.
pub struct BatchDriver<'a, P: SheetParser> {
    parser: &'a P,
    options: BatchOptions,
    cancel: CancelToken,
    events: Option<Sender<BatchEvent>>,
}

impl<'a, P: SheetParser> BatchDriver<'a, P> {
    pub fn new(parser: &'a P, options: BatchOptions) -> Self {
        Self {
            parser,
            options,
            cancel: CancelToken::new(),
            events: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: Sender<BatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }

    pub fn process_all(&self, collection: &Collection) -> BatchReport {
        self.process(collection.snapshot())
    }

    pub fn process(&self, files: Vec<StagedFile>) -> BatchReport {
        let total = files.len();
        info!(total, jobs = self.options.jobs, "batch started");

        let mut entries: Vec<BatchEntry> = files
            .into_iter()
            .map(|file| BatchEntry {
                parsed_path: None,
                file,
                outcome: FileOutcome::Skipped,
            })
            .collect();

        // Files sharing a name would overwrite each other's copy before being parsed.
        let mut name_counts: HashMap<String, usize> = HashMap::new();
        for entry in &entries {
            *name_counts.entry(entry.file.name().to_string()).or_default() += 1;
        }

        let mut pending: Vec<usize> = Vec::with_capacity(total);
        for (index, entry) in entries.iter_mut().enumerate() {
            match &self.options.stage_into {
                Some(scratch) => match stage_entry(scratch, &entry.file, &name_counts) {
                    Ok(copy) => {
                        entry.parsed_path = Some(copy);
                        pending.push(index);
                    }
                    Err(err) => entry.outcome = FileOutcome::NotStaged(err),
                },
                None => {
                    entry.parsed_path = Some(entry.file.path_buf());
                    pending.push(index);
                }
            }
        }

        let jobs = self.options.jobs.max(1).min(pending.len().max(1));
        if jobs == 1 {
            for (done, &index) in pending.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    self.emit(BatchEvent::Cancelled {
                        remaining: pending.len() - done,
                    });
                    break;
                }
                let outcome = self.run_one(index, &entries[index]);
                entries[index].outcome = outcome;
            }
        } else {
            self.run_pool(jobs, &pending, &mut entries);
        }

        let report = BatchReport {
            cancelled: self.cancel.is_cancelled()
                && entries.iter().any(|e| e.outcome == FileOutcome::Skipped),
            entries,
        };
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            "batch finished"
        );
        report
    }

    fn run_pool(&self, jobs: usize, pending: &[usize], entries: &mut [BatchEntry]) {
        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<(usize, FileOutcome)>> = Mutex::new(Vec::new());
        let snapshot: &[BatchEntry] = entries;

        thread::scope(|scope| {
            for _ in 0..jobs {
                scope.spawn(|| loop {
                    let slot = next.fetch_add(1, Ordering::SeqCst);
                    let Some(&index) = pending.get(slot) else {
                        break;
                    };
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let outcome = self.run_one(index, &snapshot[index]);
                    results
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .push((index, outcome));
                });
            }
        });

        let results = results.into_inner().unwrap_or_else(|p| p.into_inner());
        let finished = results.len();
        for (index, outcome) in results {
            entries[index].outcome = outcome;
        }
        if finished < pending.len() {
            self.emit(BatchEvent::Cancelled {
                remaining: pending.len() - finished,
            });
        }
    }

    fn run_one(&self, index: usize, entry: &BatchEntry) -> FileOutcome {
        let path = entry
            .parsed_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| entry.file.path().to_string());

        self.emit(BatchEvent::Started {
            index,
            id: entry.file.id(),
            name: entry.file.name().to_string(),
        });
        debug!(index, %path, "parsing");

        let outcome = match self.parser.parse(&path, Some(&self.cancel)) {
            Ok(output) => FileOutcome::Parsed(output),
            Err(ParseError::Cancelled) => FileOutcome::Skipped,
            Err(err) => {
                info!(name = entry.file.name(), "{err}");
                FileOutcome::Failed(err)
            }
        };

        self.emit(BatchEvent::Finished {
            index,
            id: entry.file.id(),
            ok: outcome.is_success(),
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::core::orchestrator::ParseResult;

    /// Answers from a table keyed by path, records every call.
    #[derive(Default)]
    struct FakeParser {
        failures: HashMap<String, ParseError>,
        calls: Mutex<Vec<String>>,
        cancel_after: Option<(usize, CancelToken)>,
    }

    impl SheetParser for FakeParser {
        fn parse(&self, path: &str, _cancel: Option<&CancelToken>) -> ParseResult {
            let mut calls = self.calls.lock().unwrap();
            calls.push(path.to_string());
            if let Some((after, token)) = &self.cancel_after {
                if calls.len() == *after {
                    token.cancel();
                }
            }
            match self.failures.get(path) {
                Some(err) => Err(err.clone()),
                None => Ok(ParseOutput {
                    output: format!("parsed {path}\n"),
                    exit_code: Some(0),
                    elapsed: Duration::from_millis(1),
                    build_warning: None,
                }),
            }
        }
    }

    fn collection_of(paths: &[&str]) -> Collection {
        let collection = Collection::new();
        for path in paths {
            collection.add(StagedFile::from_path(path));
        }
        collection
    }

    fn launch_error() -> ParseError {
        ParseError::Launch {
            program: "python3".to_string(),
            message: "permission denied".to_string(),
        }
    }

    #[test]
    fn failure_in_the_middle_does_not_stop_the_batch() {
        let mut parser = FakeParser::default();
        parser.failures.insert("/tmp/b.cue".to_string(), launch_error());
        let collection = collection_of(&["/tmp/a.cue", "/tmp/b.cue", "/tmp/c.cue"]);

        let report = BatchDriver::new(&parser, BatchOptions::default()).process_all(&collection);

        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.entries[1].outcome, FileOutcome::Failed(launch_error()));
        match &report.entries[2].outcome {
            FileOutcome::Parsed(out) => assert_eq!(out.output, "parsed /tmp/c.cue\n"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            *parser.calls.lock().unwrap(),
            vec!["/tmp/a.cue", "/tmp/b.cue", "/tmp/c.cue"]
        );
        assert!(!report.cancelled);
    }

    #[test]
    fn duplicates_are_parsed_twice() {
        let parser = FakeParser::default();
        let collection = collection_of(&["/tmp/a.cue", "/tmp/a.cue"]);
        let report = BatchDriver::new(&parser, BatchOptions::default()).process_all(&collection);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(parser.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn cancel_stops_before_next_file() {
        let token = CancelToken::new();
        let parser = FakeParser {
            cancel_after: Some((2, token.clone())),
            ..FakeParser::default()
        };
        let collection = collection_of(&["/tmp/a.cue", "/tmp/b.cue", "/tmp/c.cue", "/tmp/d.cue"]);
        let (tx, rx) = mpsc::channel();

        let report = BatchDriver::new(&parser, BatchOptions::default())
            .with_cancel(token)
            .with_events(tx)
            .process_all(&collection);

        assert!(report.cancelled);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.skipped(), 2);
        assert_eq!(parser.calls.lock().unwrap().len(), 2);
        let events: Vec<BatchEvent> = rx.try_iter().collect();
        assert_eq!(events.last(), Some(&BatchEvent::Cancelled { remaining: 2 }));
    }

    #[test]
    fn pool_keeps_collection_order_in_report() {
        let mut parser = FakeParser::default();
        parser.failures.insert("/tmp/3.cue".to_string(), launch_error());
        let paths: Vec<String> = (0..8).map(|n| format!("/tmp/{n}.cue")).collect();
        let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        let collection = collection_of(&refs);

        let options = BatchOptions {
            jobs: 3,
            ..BatchOptions::default()
        };
        let report = BatchDriver::new(&parser, options).process_all(&collection);

        let names: Vec<&str> = report.entries.iter().map(|e| e.file.name()).collect();
        assert_eq!(
            names,
            vec!["0.cue", "1.cue", "2.cue", "3.cue", "4.cue", "5.cue", "6.cue", "7.cue"]
        );
        assert_eq!(report.succeeded(), 7);
        assert!(matches!(report.entries[3].outcome, FileOutcome::Failed(_)));
    }

    #[test]
    fn staging_failures_are_attributed_and_skip_parse() {
        let td = tempfile::TempDir::new().unwrap();
        let good = td.path().join("good.cue");
        std::fs::write(&good, "cue").unwrap();
        let collection = Collection::new();
        collection.add(StagedFile::from_path(td.path().join("gone.cue")));
        collection.add(StagedFile::from_path(&good));

        let parser = FakeParser::default();
        let options = BatchOptions {
            stage_into: Some(ScratchDir::new(td.path().join("scratch"))),
            ..BatchOptions::default()
        };
        let report = BatchDriver::new(&parser, options).process_all(&collection);

        assert!(matches!(report.entries[0].outcome, FileOutcome::NotStaged(_)));
        assert!(report.entries[1].outcome.is_success());
        let staged = td.path().join("scratch/good.cue");
        assert_eq!(report.entries[1].parsed_path.as_deref(), Some(staged.as_path()));
        assert_eq!(
            *parser.calls.lock().unwrap(),
            vec![staged.to_string_lossy().to_string()]
        );
    }

    #[test]
    fn staged_files_sharing_a_name_are_parsed_from_their_own_copy() {
        let td = tempfile::TempDir::new().unwrap();
        for dir in ["one", "two", "three"] {
            std::fs::create_dir_all(td.path().join(dir)).unwrap();
        }
        std::fs::write(td.path().join("one/show.cue"), "FIRST").unwrap();
        std::fs::write(td.path().join("two/show.cue"), "SECOND").unwrap();
        std::fs::write(td.path().join("three/other.cue"), "OTHER").unwrap();
        let collection = Collection::new();
        collection.add(StagedFile::from_path(td.path().join("one/show.cue")));
        collection.add(StagedFile::from_path(td.path().join("two/show.cue")));
        collection.add(StagedFile::from_path(td.path().join("three/other.cue")));

        let parser = FakeParser::default();
        let options = BatchOptions {
            stage_into: Some(ScratchDir::new(td.path().join("scratch"))),
            ..BatchOptions::default()
        };
        let report = BatchDriver::new(&parser, options).process_all(&collection);

        let contents: Vec<String> = report
            .entries
            .iter()
            .map(|e| std::fs::read_to_string(e.parsed_path.as_ref().unwrap()).unwrap())
            .collect();
        assert_eq!(contents, vec!["FIRST", "SECOND", "OTHER"]);
        assert_ne!(report.entries[0].parsed_path, report.entries[1].parsed_path);
        assert_eq!(
            report.entries[2].parsed_path.as_deref(),
            Some(td.path().join("scratch/other.cue").as_path())
        );
    }

    #[test]
    fn json_report_has_one_object_per_file() {
        let mut parser = FakeParser::default();
        parser.failures.insert("/tmp/b.cue".to_string(), launch_error());
        let collection = collection_of(&["/tmp/a.cue", "/tmp/b.cue"]);
        let report = BatchDriver::new(&parser, BatchOptions::default()).process_all(&collection);

        let json = report.to_json();
        assert_eq!(json["succeeded"], 1);
        assert_eq!(json["files"][0]["status"], "parsed");
        assert_eq!(json["files"][0]["output"], "parsed /tmp/a.cue\n");
        assert_eq!(json["files"][1]["status"], "failed");
        assert_eq!(json["files"][1]["name"], "b.cue");
    }
}
