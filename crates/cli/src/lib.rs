pub mod bootstrap;
pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use parley_core::config::{AppConfig, LoadOptions};

#[derive(Debug, Parser)]
#[command(
    name = "parley",
    about = "Parley operator CLI",
    long_about = "Inspect configuration, prepare the demo ledger, list discovered actions, \
                  and hold a conversation with the action runtime.",
    after_help = "Examples:\n  parley config\n  parley seed\n  parley catalog\n  parley chat"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Insert the demo customers and products into the configured database")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Discover every action the runtime can execute and report statistics")]
    Catalog,
    #[command(about = "Talk to the runtime line by line over stdin/stdout")]
    Chat {
        #[arg(long, help = "Session id to resume; a fresh one is generated when omitted")]
        session: Option<String>,
        #[arg(long, default_value = "operator", help = "User id recorded on created records")]
        user: String,
    },
}

/// Installs the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
fn init_logging(config: &AppConfig) {
    use parley_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    match config.logging.format {
        Compact => builder.compact().init(),
        Pretty => builder.pretty().init(),
        Json => builder.json().init(),
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    if let Ok(config) = AppConfig::load(LoadOptions::default()) {
        init_logging(&config);
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Catalog => commands::catalog::run(),
        Command::Chat { session, user } => commands::chat::run(session, &user),
    };

    if !result.output.is_empty() {
        println!("{}", result.output);
    }
    ExitCode::from(result.exit_code)
}
