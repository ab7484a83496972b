use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::file::{FileId, StagedFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Noise,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionEvent {
    Added(StagedFile),
    Removed(StagedFile),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    Started { index: usize, id: FileId, name: String },
    Finished { index: usize, id: FileId, ok: bool },
    Cancelled { remaining: usize },
}

static RE_EXCEPTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Za-z_][\w.]*\.)?([A-Z]\w*(?:Error|Exception|Exit|Interrupt)):\s*(.*)$")
        .unwrap()
});
static RE_WARNING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(^|\W)(\w*warning):\s").unwrap());
static RE_TRACE_FRAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*File ".*", line \d+"#).unwrap());

pub fn classify_output_line(line: &str) -> LogLevel {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LogLevel::Noise;
    }

    if trimmed.starts_with("Traceback (most recent call last)") {
        return LogLevel::Error;
    }
    if RE_EXCEPTION.is_match(trimmed) {
        return LogLevel::Error;
    }
    if RE_TRACE_FRAME.is_match(line) {
        return LogLevel::Noise;
    }
    if RE_WARNING.is_match(trimmed) {
        return LogLevel::Warning;
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("error") || lower.contains("no such file") {
        return LogLevel::Error;
    }

    LogLevel::Info
}

/// Picks the line that best explains a failed run: the last exception line, else the last
/// error-looking line, else the last non-empty line.
pub fn error_summary(output: &str) -> Option<String> {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if let Some(line) = lines.iter().rev().find(|line| RE_EXCEPTION.is_match(line)) {
        return Some(line.to_string());
    }

    if let Some(line) = lines
        .iter()
        .rev()
        .find(|line| classify_output_line(line) == LogLevel::Error)
    {
        return Some(line.to_string());
    }

    lines.last().map(|line| line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_python_failures() {
        assert_eq!(
            classify_output_line("Traceback (most recent call last):"),
            LogLevel::Error
        );
        assert_eq!(
            classify_output_line(
                "FileNotFoundError: [Errno 2] No such file or directory: 'x.xlsx'"
            ),
            LogLevel::Error
        );
        assert_eq!(
            classify_output_line("  File \"parser.py\", line 12, in <module>"),
            LogLevel::Noise
        );
        assert_eq!(
            classify_output_line("UserWarning: Workbook contains no default style"),
            LogLevel::Warning
        );
        assert_eq!(classify_output_line("    \"Sheet1.csv\": ["), LogLevel::Info);
        assert_eq!(classify_output_line("   "), LogLevel::Noise);
    }

    #[test]
    fn summary_prefers_last_exception_line() {
        let output = "Traceback (most recent call last):\n  File \"parser.py\", line 3\nValueError: bad sheet\n\n";
        assert_eq!(error_summary(output).as_deref(), Some("ValueError: bad sheet"));
    }

    #[test]
    fn summary_falls_back_to_last_line() {
        assert_eq!(error_summary("one\ntwo\n").as_deref(), Some("two"));
        assert_eq!(error_summary("\n  \n"), None);
    }

    #[test]
    fn summary_finds_qualified_exception() {
        let output = "pandas.errors.EmptyDataError: No columns to parse from file";
        assert_eq!(error_summary(output).as_deref(), Some(output));
    }
}
