pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "aidgent",
    about = "Aidgent operator CLI",
    long_about = "Operate the Aidgent triage service: migrations, config inspection, readiness checks and clinical policy validation.",
    after_help = "Examples:\n  aidgent doctor --json\n  aidgent config\n  aidgent policy --dir config"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, the clinical policy bundle, and database readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Load and validate slot policy, questions and red-flag rules")]
    Policy {
        #[arg(long, help = "Policy directory to validate instead of the configured one")]
        dir: Option<PathBuf>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Policy { dir } => commands::policy::run(dir),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
