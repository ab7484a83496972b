use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::style::Stylize;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use cuedrop::config::{BuildSettings, Settings};
use cuedrop::core::batch::{BatchReport, FileOutcome};
use cuedrop::core::build::BuildPolicy;
use cuedrop::core::collection::Collection;
use cuedrop::core::error::{AppError, ConfigError};
use cuedrop::core::event::{classify_output_line, BatchEvent, LogLevel};
use cuedrop::core::file::StagedFile;
use cuedrop::core::formatter::{
    format_batch_event, format_entry_line, format_report_summary, format_stage_line,
};
use cuedrop::core::orchestrator::ParseOrchestrator;
use cuedrop::Session;

use crate::repl;

#[derive(Debug, Parser)]
#[command(
    name = "cuedrop",
    version,
    about = "Stage cue sheets and run them through an external parser"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// YAML settings file
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,
    /// Interpreter that runs the parser script
    #[arg(long, env = "CUEDROP_INTERPRETER", global = true)]
    pub interpreter: Option<String>,
    /// Parser script handed to the interpreter
    #[arg(long, env = "CUEDROP_SCRIPT", global = true)]
    pub script: Option<PathBuf>,
    #[arg(long, env = "CUEDROP_SCRATCH_DIR", value_name = "DIR", global = true)]
    pub scratch_dir: Option<PathBuf>,
    /// Per-file timeout in seconds
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<f64>,
    /// Let the parser's stderr through to the terminal instead of capturing it
    #[arg(long = "no-capture-stderr", global = true)]
    pub no_capture_stderr: bool,
    /// Treat non-zero parser exits as success
    #[arg(long, global = true)]
    pub ignore_exit_code: bool,
    /// Directory the build command runs in
    #[arg(long, value_name = "DIR", global = true)]
    pub build_dir: Option<PathBuf>,
    #[arg(long, value_enum, global = true)]
    pub build_policy: Option<BuildPolicy>,
    /// Parse even when the build step fails
    #[arg(long, global = true)]
    pub ignore_build_errors: bool,
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

impl GlobalArgs {
    fn overrides(&self) -> Settings {
        let build = if self.build_dir.is_some()
            || self.build_policy.is_some()
            || self.ignore_build_errors
        {
            Some(BuildSettings {
                working_dir: self.build_dir.clone(),
                policy: self.build_policy,
                fail_on_error: self.ignore_build_errors.then_some(false),
                ..BuildSettings::default()
            })
        } else {
            None
        };

        Settings {
            interpreter: self.interpreter.clone(),
            script: self.script.clone(),
            capture_stderr: self.no_capture_stderr.then_some(false),
            ignore_exit_code: self.ignore_exit_code.then_some(true),
            timeout_secs: self.timeout,
            scratch_dir: self.scratch_dir.clone(),
            jobs: None,
            build,
        }
    }

    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let base = match &self.config {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        Ok(base.merge(self.overrides()))
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Parse files and print the parser output
    Parse(ParseArgs),
    /// Copy files into the scratch directory
    Stage(StageArgs),
    /// Validate configuration and run the build step
    Check,
    /// Interactive session (default)
    Repl,
}

#[derive(Debug, Args)]
pub struct ParseArgs {
    #[arg(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,
    /// Copy into the scratch directory first and parse the copies
    #[arg(long)]
    pub stage: bool,
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,
    /// Print the batch report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct StageArgs {
    #[arg(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,
}

pub fn execute(cli: Cli) -> Result<(), AppError> {
    let mut settings = cli.global.settings()?;

    match cli.command.unwrap_or(Commands::Repl) {
        Commands::Parse(args) => {
            if args.jobs.is_some() {
                settings.jobs = args.jobs;
            }
            let session = Session::open(&settings)?;
            for file in &args.files {
                session.add_path(file);
            }
            let report = run_batch(&session, args.stage, io::stderr().is_terminal());
            print_report(&report, args.json)?;
            check_report(&report)
        }
        Commands::Stage(args) => {
            let collection = Collection::new();
            for file in &args.files {
                collection.add(StagedFile::from_path(file));
            }
            let outcomes = collection.stage_to_scratch(&settings.scratch());
            let mut failed = 0;
            for outcome in &outcomes {
                let line = format_stage_line(outcome);
                if outcome.result.is_err() {
                    failed += 1;
                    eprintln!("{}", paint(line, LogLevel::Error));
                } else {
                    println!("{line}");
                }
            }
            if failed > 0 {
                return Err(AppError::BatchFailed {
                    failed,
                    total: outcomes.len(),
                });
            }
            Ok(())
        }
        Commands::Check => {
            let orchestrator = ParseOrchestrator::new(settings.orchestrator_config()?)?;
            println!("interpreter: {}", orchestrator.interpreter().display());
            println!("script     : {}", orchestrator.script().display());
            println!("scratch    : {}", settings.scratch().path().display());
            match orchestrator.rebuild()? {
                Some(report) => {
                    print!("{}", report.output);
                    println!("build      : ok");
                }
                None => println!("build      : not configured"),
            }
            Ok(())
        }
        Commands::Repl => {
            let session = Session::open(&settings)?;
            repl::run(&session)
        }
    }
}

const KEY_POLL: Duration = Duration::from_millis(50);

struct RawModeGuard;

impl RawModeGuard {
    fn enter() -> Option<Self> {
        enable_raw_mode().ok().map(|_| Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Runs the session's batch on a worker thread. On an interactive terminal, Ctrl-C or Esc
/// cancels it. Progress lines go to stderr when `show_progress` is set.
pub fn run_batch(session: &Session, stage_first: bool, show_progress: bool) -> BatchReport {
    let total = session.collection().len();
    let (tx, rx) = mpsc::channel();
    let interactive = io::stdin().is_terminal();

    thread::scope(|scope| {
        let worker = scope.spawn(move || session.process(stage_first, Some(tx)));
        let raw = if interactive { RawModeGuard::enter() } else { None };
        let line_end = if raw.is_some() { "\r\n" } else { "\n" };
        let mut cancel_requested = false;

        while !worker.is_finished() {
            if cancel_requested && session.cancel_current() {
                cancel_requested = false;
                eprint!("{}{line_end}", paint("cancelling...".to_string(), LogLevel::Warning));
            }
            print_progress(&rx, total, show_progress, line_end);
            if raw.is_some() {
                cancel_requested |= interrupt_pressed(KEY_POLL);
            } else {
                thread::sleep(KEY_POLL);
            }
        }

        drop(raw);
        print_progress(&rx, total, show_progress, "\n");
        worker
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
    })
}

fn interrupt_pressed(wait: Duration) -> bool {
    match event::poll(wait) {
        Ok(true) => match event::read() {
            Ok(Event::Key(key)) => match key.code {
                KeyCode::Esc => true,
                KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
                _ => false,
            },
            _ => false,
        },
        Ok(false) => false,
        Err(_) => {
            thread::sleep(wait);
            false
        }
    }
}

fn print_progress(events: &Receiver<BatchEvent>, total: usize, show: bool, line_end: &str) {
    for event in events.try_iter() {
        if !show {
            continue;
        }
        if let Some(line) = format_batch_event(&event, total) {
            eprint!("{}{line_end}", paint(line, LogLevel::Noise));
        }
    }
}

/// Parser output goes to stdout, one section per file; failures and the summary to stderr.
pub fn print_report(report: &BatchReport, json: bool) -> Result<(), AppError> {
    let mut stdout = io::stdout().lock();

    if json {
        let rendered = serde_json::to_string_pretty(&report.to_json()).map_err(|err| {
            AppError::InvalidCommand {
                message: err.to_string(),
            }
        })?;
        writeln!(stdout, "{rendered}")?;
        return Ok(());
    }

    let multiple = report.entries.len() > 1;
    for entry in &report.entries {
        match &entry.outcome {
            FileOutcome::Parsed(out) => {
                if multiple {
                    writeln!(stdout, "==> {} <==", entry.file.name())?;
                }
                write!(stdout, "{}", out.output)?;
                if multiple && !out.output.is_empty() && !out.output.ends_with('\n') {
                    writeln!(stdout)?;
                }
                if out.build_warning.is_some() {
                    eprintln!("{}", paint(format_entry_line(entry), LogLevel::Warning));
                }
            }
            _ => eprintln!("{}", paint(format_entry_line(entry), LogLevel::Error)),
        }
    }
    stdout.flush()?;

    if multiple || report.cancelled {
        eprintln!("{}", format_report_summary(report));
    }
    Ok(())
}

pub fn check_report(report: &BatchReport) -> Result<(), AppError> {
    let failed = report.failed() + report.skipped();
    if failed > 0 {
        return Err(AppError::BatchFailed {
            failed,
            total: report.entries.len(),
        });
    }
    Ok(())
}

pub fn paint(line: String, level: LogLevel) -> String {
    if !io::stderr().is_terminal() {
        return line;
    }
    match level {
        LogLevel::Error => line.red().to_string(),
        LogLevel::Warning => line.yellow().to_string(),
        LogLevel::Info => line,
        LogLevel::Noise => line.dark_grey().to_string(),
    }
}

pub fn paint_output(output: &str) -> String {
    output
        .split_inclusive('\n')
        .map(|line| {
            let level = classify_output_line(line);
            match level {
                LogLevel::Error | LogLevel::Warning => {
                    let (text, newline) = match line.strip_suffix('\n') {
                        Some(text) => (text, "\n"),
                        None => (line, ""),
                    };
                    format!("{}{newline}", paint(text.to_string(), level))
                }
                _ => line.to_string(),
            }
        })
        .collect()
}

pub fn parse_line(line: &str) -> Result<repl::ReplCommand, String> {
    let mut argv = Vec::new();
    argv.push("cuedrop".to_string());

    let tokens = shell_words::split(line).map_err(|err| err.to_string())?;
    argv.extend(tokens);

    let parsed = repl::ReplCli::try_parse_from(argv).map_err(|err| err.to_string())?;
    Ok(parsed.command)
}
