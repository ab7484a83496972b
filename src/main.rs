mod cli;
mod repl;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = cli::Cli::parse();
    init_tracing(cli.global.verbose);

    if let Err(err) = cli::execute(cli) {
        eprintln!("{err}");
        std::process::exit(err.exit_code());
    }
}
