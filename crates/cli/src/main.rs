use std::process::ExitCode;

fn main() -> ExitCode {
    aidgent_cli::run()
}
