mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pumplink_config::{Config, LogFormat, LoggingSection};

use crate::cli::{Cli, Command};
use crate::error::CliError;

fn main() {
    let cli = Cli::parse();

    // Logging settings come from the config file; a broken file is
    // reported by the command that needs it, not here.
    let logging = load_config(&cli.global)
        .map(|cfg| cfg.logging)
        .unwrap_or_default();
    init_tracing(cli.global.verbose, &logging);

    if let Err(err) = run(cli) {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// `-v` counts win over `RUST_LOG`, which wins over `logging.level`.
fn init_tracing(verbosity: u8, logging: &LoggingSection) {
    let filter = match verbosity {
        0 => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&logging.level)),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Load the config from `--config` or the platform path.
pub(crate) fn load_config(global: &cli::GlobalOpts) -> Result<Config, CliError> {
    let config = match &global.config {
        Some(path) => pumplink_config::load_config_from(path)?,
        None => pumplink_config::load_config()?,
    };
    Ok(config)
}

fn run(cli: Cli) -> Result<(), CliError> {
    tracing::debug!(command = ?cli.command, "dispatching command");
    match cli.command {
        Command::Identity(args) => commands::identity::handle(args, &cli.global),
        Command::Profile(args) => commands::profile::handle(args, &cli.global),
        Command::History(args) => commands::history::handle(&args, &cli.global),
        Command::Config(args) => commands::config_cmd::handle(args, &cli.global),

        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "pumplink", &mut std::io::stdout());
            Ok(())
        }
    }
}
