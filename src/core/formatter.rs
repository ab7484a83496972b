use std::time::Duration;

use crate::core::batch::{BatchEntry, BatchReport, FileOutcome};
use crate::core::collection::StageOutcome;
use crate::core::error::ParseError;
use crate::core::event::{error_summary, BatchEvent};
use crate::core::file::StagedFile;

pub fn format_file_line(position: usize, file: &StagedFile) -> String {
    format!("{position:>3}. {}  {}  ({})", file.id().short(), file.name(), file.path())
}

pub fn format_selection_count(count: usize) -> String {
    match count {
        1 => "1 file".to_string(),
        n => format!("{n} files"),
    }
}

pub fn format_entry_line(entry: &BatchEntry) -> String {
    let name = entry.file.name();
    match &entry.outcome {
        FileOutcome::Parsed(out) => {
            let mut line = format!("ok     {name} ({})", format_duration(out.elapsed));
            if let Some(warning) = &out.build_warning {
                line.push_str(&format!(" [build: {warning}]"));
            }
            line
        }
        FileOutcome::Failed(err @ ParseError::TimedOut { output, .. }) => {
            match error_summary(output) {
                Some(last) => format!("failed {name}: {err} -> {last}"),
                None => format!("failed {name}: {err}"),
            }
        }
        FileOutcome::Failed(err) => format!("failed {name}: {err}"),
        FileOutcome::NotStaged(err) => format!("failed {name}: {err}"),
        FileOutcome::Skipped => format!("skip   {name}"),
    }
}

pub fn format_stage_line(outcome: &StageOutcome) -> String {
    match &outcome.result {
        Ok(dest) => format!("staged {} -> {}", outcome.file.name(), dest.display()),
        Err(err) => format!("failed {}: {err}", outcome.file.name()),
    }
}

pub fn format_report_summary(report: &BatchReport) -> String {
    let mut line = format!(
        "Batch  : {} parsed, {} failed, {} skipped",
        report.succeeded(),
        report.failed(),
        report.skipped()
    );
    if report.cancelled {
        line.push_str(" (cancelled)");
    }
    line
}

/// Progress line for a batch event. `Finished` is covered by the report and prints nothing.
pub fn format_batch_event(event: &BatchEvent, total: usize) -> Option<String> {
    match event {
        BatchEvent::Started { index, name, .. } => Some(format!("[{}/{total}] {name}", index + 1)),
        BatchEvent::Finished { .. } => None,
        BatchEvent::Cancelled { remaining } => Some(format!(
            "cancelled, {} not started",
            format_selection_count(*remaining)
        )),
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    if total_secs < 60 {
        return format!("{:.2}s", duration.as_secs_f64());
    }
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}
