use std::process::ExitCode;

fn main() -> ExitCode {
    office_unlock::cli::run()
}
