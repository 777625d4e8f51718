pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "opsdesk",
    about = "Opsdesk operator CLI",
    long_about = "Check runtime readiness, inspect effective configuration, and list the tools each catalog profile exposes.",
    after_help = "Examples:\n  opsdesk doctor --json\n  opsdesk config\n  opsdesk catalog --profile ide"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, Slack token readiness, runtime settings, and catalog build")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "List the validated tools of one catalog profile")]
    Catalog {
        #[arg(long, default_value = "chat", value_parser = ["chat", "ide"])]
        profile: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Catalog { profile } => commands::catalog::run(&profile),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
