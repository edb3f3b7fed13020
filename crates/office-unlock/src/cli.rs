//! Command-line surface: `office-unlock <INPUT> <OUTPUT> <PASSWORD>`.
//!
//! Standard output carries exactly one line, `SUCCESS:<output-path>` or `ERROR:<message>`.
//! Diagnostics go to standard error through `RUST_LOG` (default `warn`).

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::{decrypt_or_copy, Outcome, UnlockError};

#[derive(Debug, Parser)]
#[command(
    name = "office-unlock",
    about = "Decrypt a password-protected Office document, or copy it if it is not encrypted.",
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct Args {
    /// Document to read.
    #[arg(value_name = "INPUT", allow_hyphen_values = true)]
    pub input: PathBuf,

    /// Path to write the plaintext document to (replaced if it exists).
    #[arg(value_name = "OUTPUT", allow_hyphen_values = true)]
    pub output: PathBuf,

    /// Password for the document; ignored when the input is not encrypted.
    #[arg(value_name = "PASSWORD", allow_hyphen_values = true)]
    pub password: OsString,
}

impl Args {
    /// Parse a full argument list (the first item is the program name).
    ///
    /// Exactly three operands are required and every operand is taken literally, so `--` and
    /// values that look like flags are accepted as paths or passwords.
    pub fn parse_operands<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let mut args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        if args.len() != 4 {
            return Err(Args::command().error(
                ErrorKind::WrongNumberOfValues,
                format!("expected 3 arguments, got {}", args.len().saturating_sub(1)),
            ));
        }
        args.insert(1, OsString::from("--"));
        Args::try_parse_from(args)
    }
}

pub fn run() -> ExitCode {
    init_logging();
    run_from(std::env::args_os())
}

/// Run with an explicit argument list (the first item is the program name).
pub fn run_from<I, T>(args: I) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let args = match Args::parse_operands(args) {
        Ok(args) => args,
        Err(err) => {
            log::debug!("rejected arguments: {err}");
            write_line(&usage());
            return ExitCode::FAILURE;
        }
    };

    let result = match args.password.to_str() {
        Some(password) => decrypt_or_copy(&args.input, &args.output, password),
        None => Err(UnlockError::PasswordNotUnicode),
    };
    if let Err(err) = &result {
        log::debug!("run failed: {err:?}");
    }
    write_line(&status_line(&result, &args.output));
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

pub fn usage() -> String {
    Args::command().render_usage().to_string()
}

/// The single stdout line for a finished run.
pub fn status_line(result: &Result<Outcome, UnlockError>, output: &Path) -> String {
    match result {
        Ok(_) => format!("SUCCESS:{}", output.display()),
        Err(err) => format!("ERROR:{}", err.to_string().replace(['\r', '\n'], " ")),
    }
}

fn write_line(line: &str) {
    let mut stdout = io::stdout().lock();
    if let Err(err) = writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
        // A closed pipe means nobody is listening; that is not a failure of the run.
        if err.kind() != io::ErrorKind::BrokenPipe {
            log::warn!("failed to write to stdout: {err}");
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use unlock_offcrypto::OffcryptoError;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::parse_operands(std::iter::once("office-unlock").chain(args.iter().copied()))
    }

    #[test]
    fn usage_lists_three_positionals() {
        assert_eq!(
            usage(),
            "Usage: office-unlock <INPUT> <OUTPUT> <PASSWORD>"
        );
    }

    #[test]
    fn parses_exactly_three_arguments() {
        let args = parse(&["in.xlsx", "out.xlsx", "secret"]).expect("parse");
        assert_eq!(args.input, PathBuf::from("in.xlsx"));
        assert_eq!(args.output, PathBuf::from("out.xlsx"));
        assert_eq!(args.password, OsString::from("secret"));

        assert!(parse(&[]).is_err());
        assert!(parse(&["in.xlsx", "out.xlsx"]).is_err());
        assert!(parse(&["in.xlsx", "out.xlsx", "pw", "extra"]).is_err());
    }

    #[test]
    fn hyphen_leading_values_are_positional() {
        let args = parse(&["in.xlsx", "out.xlsx", "-secret"]).expect("parse");
        assert_eq!(args.password, OsString::from("-secret"));

        let args = parse(&["--help", "-o", "--version"]).expect("parse");
        assert_eq!(args.input, PathBuf::from("--help"));
        assert_eq!(args.output, PathBuf::from("-o"));
        assert_eq!(args.password, OsString::from("--version"));
    }

    #[test]
    fn double_dash_is_an_ordinary_operand() {
        let args = parse(&["in.xlsx", "out.xlsx", "--"]).expect("parse");
        assert_eq!(args.password, OsString::from("--"));

        let args = parse(&["--", "out.xlsx", "pw"]).expect("parse");
        assert_eq!(args.input, PathBuf::from("--"));
        assert_eq!(args.password, OsString::from("pw"));

        let args = parse(&["--", "--", "--"]).expect("parse");
        assert_eq!(args.input, PathBuf::from("--"));
        assert_eq!(args.output, PathBuf::from("--"));
        assert_eq!(args.password, OsString::from("--"));

        assert!(parse(&["in.xlsx", "--", "out.xlsx"]).is_ok());
        assert!(parse(&["in.xlsx", "out.xlsx", "--", "pw"]).is_err());
        assert!(parse(&["--", "out.xlsx"]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn non_unicode_password_is_an_error_not_usage() {
        use std::os::unix::ffi::OsStringExt as _;

        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("missing.xlsx");
        let output = tmp.path().join("out.xlsx");
        let password = OsString::from_vec(vec![b'p', 0xFF, b'w']);

        let args = Args::parse_operands([
            OsString::from("office-unlock"),
            input.clone().into_os_string(),
            output.clone().into_os_string(),
            password.clone(),
        ])
        .expect("non-Unicode operands still parse");
        assert_eq!(args.password, password);

        let _ = run_from([
            OsString::from("office-unlock"),
            input.into_os_string(),
            output.clone().into_os_string(),
            password,
        ]);
        assert!(!output.exists());
        assert_eq!(
            status_line(&Err(UnlockError::PasswordNotUnicode), &output),
            "ERROR:password is not valid Unicode"
        );
    }

    #[test]
    fn status_line_success_uses_output_as_given() {
        let line = status_line(&Ok(Outcome::Copied { bytes: 3 }), Path::new("dir/out.xlsx"));
        assert_eq!(line, "SUCCESS:dir/out.xlsx");
    }

    #[test]
    fn status_line_error_is_single_line() {
        let err = UnlockError::Unexpected("first\nsecond\r\nthird".to_string());
        let line = status_line(&Err(err), Path::new("out.xlsx"));
        assert_eq!(line, "ERROR:first second  third");

        let err = UnlockError::DecryptionFailed(OffcryptoError::InvalidPassword);
        assert_eq!(
            status_line(&Err(err), Path::new("out.xlsx")),
            "ERROR:decryption failed: invalid password"
        );
    }
}
