use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cuedrop::core::batch::FileOutcome;
use cuedrop::core::error::AppError;
use cuedrop::core::event::{CollectionEvent, LogLevel};
use cuedrop::core::formatter::{
    format_entry_line, format_file_line, format_report_summary, format_selection_count,
    format_stage_line,
};
use cuedrop::Session;

use crate::cli::{paint, paint_output, parse_line, run_batch};

#[derive(Debug, Parser)]
#[command(name = "cuedrop", disable_version_flag = true)]
pub struct ReplCli {
    #[command(subcommand)]
    pub command: ReplCommand,
}

#[derive(Debug, Subcommand)]
pub enum ReplCommand {
    /// Add files to the collection
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Remove files by id, id prefix or list position
    #[command(alias = "delete")]
    Rm {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// List the collection
    #[command(alias = "list")]
    Ls,
    /// Copy every file into the scratch directory
    Stage,
    /// Parse every file in the collection
    Process {
        #[arg(long)]
        stage: bool,
    },
    /// Run the build command again
    Rebuild,
}

pub fn run(session: &Session) -> Result<(), AppError> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = String::new();
    let changes = session.collection().subscribe();

    println!("cuedrop ready. Type 'help' for commands, 'exit' to quit.");

    loop {
        line.clear();
        print!("cuedrop> ");
        stdout.flush()?;

        let bytes_read = stdin.read_line(&mut line)?;
        if bytes_read == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if trimmed.eq_ignore_ascii_case("exit") || trimmed.eq_ignore_ascii_case("quit") {
            break;
        }

        match parse_line(trimmed) {
            Ok(command) => {
                if let Err(err) = dispatch(session, command) {
                    eprintln!("{}", paint(err.to_string(), LogLevel::Error));
                }
            }
            Err(err) => eprintln!("{err}"),
        }

        for change in changes.try_iter() {
            match change {
                CollectionEvent::Added(file) => println!("+ {}", file.name()),
                CollectionEvent::Removed(file) => println!("- {}", file.name()),
            }
        }
    }

    Ok(())
}

fn dispatch(session: &Session, command: ReplCommand) -> Result<(), AppError> {
    match command {
        ReplCommand::Add { paths } => {
            for path in paths {
                session.add_path(path);
            }
        }
        ReplCommand::Rm { keys } => {
            for key in keys {
                if session.remove(&key).is_none() {
                    eprintln!("no file matches '{key}'");
                }
            }
        }
        ReplCommand::Ls => {
            let files = session.collection().snapshot();
            for (position, file) in files.iter().enumerate() {
                println!("{}", format_file_line(position + 1, file));
            }
            println!("{}", format_selection_count(files.len()));
        }
        ReplCommand::Stage => {
            for outcome in session.stage() {
                let line = format_stage_line(&outcome);
                if outcome.result.is_err() {
                    eprintln!("{}", paint(line, LogLevel::Error));
                } else {
                    println!("{line}");
                }
            }
        }
        ReplCommand::Process { stage } => {
            if session.collection().is_empty() {
                return Err(AppError::InvalidCommand {
                    message: "nothing to process, add files first".to_string(),
                });
            }
            let report = run_batch(session, stage, true);
            for entry in &report.entries {
                match &entry.outcome {
                    FileOutcome::Parsed(out) => {
                        println!("{}", format_entry_line(entry));
                        print!("{}", paint_output(&out.output));
                    }
                    FileOutcome::Failed(err) => {
                        eprintln!("{}", paint(format_entry_line(entry), LogLevel::Error));
                        if let Some(output) = err.output() {
                            eprint!("{}", paint_output(output));
                        }
                    }
                    _ => eprintln!("{}", paint(format_entry_line(entry), LogLevel::Error)),
                }
            }
            println!("{}", format_report_summary(&report));
        }
        ReplCommand::Rebuild => match session.rebuild()? {
            Some(report) => {
                print!("{}", report.output);
                println!("build ok");
            }
            None => println!("no build step configured"),
        },
    }
    Ok(())
}
