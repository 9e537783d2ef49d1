//! Command-line interface for pairgate.
//!
//! Uses lexopt for minimal binary size overhead.

use std::ffi::OsString;
use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Command-line arguments.
///
/// Every setting is optional so that unset flags leave values from the
/// config file and environment alone.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Host address to bind to.
    pub host: Option<IpAddr>,
    /// Port to listen on.
    pub port: Option<u16>,
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// API token (overrides config file and environment).
    pub api_token: Option<String>,
    /// Session store URL.
    pub database: Option<String>,
    /// Disable authentication.
    pub no_auth: bool,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('H') | Long("host") => {
                let value: String = parser.value()?.parse()?;
                result.host = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("host", value))?,
                );
            }
            Short('p') | Long("port") => {
                let value: String = parser.value()?.parse()?;
                result.port = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("port", value))?,
                );
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('t') | Long("api-token") => {
                result.api_token = Some(parser.value()?.parse()?);
            }
            Short('d') | Long("database") => {
                result.database = Some(parser.value()?.parse()?);
            }
            Long("no-auth") => {
                result.no_auth = true;
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Value(val) => {
                return Err(ArgsError::UnexpectedArgument(val.to_string_lossy().into()));
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"pairgate {version}
Multi-tenant messaging session gateway with QR pairing

USAGE:
    pairgate [OPTIONS]

OPTIONS:
    -H, --host <ADDR>        Host address to bind [default: 127.0.0.1]
    -p, --port <PORT>        Port to listen on [default: 8080]
    -c, --config <FILE>      Path to configuration file (JSON)
    -t, --api-token <TOKEN>  Token expected in the `apitoken` header
    -d, --database <URL>     Session store URL [default: sqlite://pairgate.db]
    -l, --log-level <LVL>    Log level (error, warn, info, debug, trace)
        --no-auth            Disable authentication
    -h, --help               Print help
    -V, --version            Print version

ENVIRONMENT VARIABLES:
    PAIRGATE_HOST             Host address (overrides config)
    PAIRGATE_PORT             Port number (overrides config)
    PAIRGATE_API_TOKEN        API token (overrides config)
    PAIRGATE_DATABASE_URL     Session store URL (overrides config)
    PAIRGATE_DEFAULT_COUNTRY  Country code prefixed to bare phone numbers
    PAIRGATE_LOG_LEVEL        Log level (overrides config)
    RUST_LOG                  Alternative log level setting

EXAMPLES:
    # Start on localhost with a token
    pairgate -t my-secret-token

    # Start on all interfaces with a config file
    pairgate -H 0.0.0.0 -c /etc/pairgate/config.json

    # Development mode (in-memory store, no auth)
    pairgate --no-auth -d sqlite::memory:
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("pairgate {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Error, Debug)]
pub enum ArgsError {
    #[error("{0}")]
    Lexopt(#[from] lexopt::Error),

    #[error("invalid value for --{0}: '{1}'")]
    InvalidValue(&'static str, String),

    #[error("unexpected argument: '{0}'")]
    UnexpectedArgument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<OsString> {
        std::iter::once("pairgate")
            .chain(args.iter().copied())
            .map(OsString::from)
            .collect()
    }

    #[test]
    fn test_default_args() {
        let result = parse_args_from(args(&[])).unwrap();
        assert!(result.host.is_none());
        assert!(result.port.is_none());
        assert!(!result.no_auth);
    }

    #[test]
    fn test_host_port() {
        let result = parse_args_from(args(&["-H", "0.0.0.0", "-p", "8080"])).unwrap();
        assert_eq!(result.host.unwrap().to_string(), "0.0.0.0");
        assert_eq!(result.port, Some(8080));
    }

    #[test]
    fn test_long_options() {
        let result = parse_args_from(args(&[
            "--host",
            "192.168.1.1",
            "--port",
            "9000",
            "--database",
            "sqlite::memory:",
        ]))
        .unwrap();
        assert_eq!(result.host.unwrap().to_string(), "192.168.1.1");
        assert_eq!(result.port, Some(9000));
        assert_eq!(result.database.as_deref(), Some("sqlite::memory:"));
    }

    #[test]
    fn test_api_token() {
        let result = parse_args_from(args(&["-t", "my-secret"])).unwrap();
        assert_eq!(result.api_token, Some("my-secret".to_string()));
    }

    #[test]
    fn test_config_file() {
        let result = parse_args_from(args(&["-c", "/etc/config.json"])).unwrap();
        assert_eq!(result.config, Some(PathBuf::from("/etc/config.json")));
    }

    #[test]
    fn test_no_auth() {
        let result = parse_args_from(args(&["--no-auth"])).unwrap();
        assert!(result.no_auth);
    }

    #[test]
    fn test_help_and_version_flags() {
        assert!(parse_args_from(args(&["-h"])).unwrap().help);
        assert!(parse_args_from(args(&["--help"])).unwrap().help);
        assert!(parse_args_from(args(&["-V"])).unwrap().version);
        assert!(parse_args_from(args(&["--version"])).unwrap().version);
    }

    #[test]
    fn test_log_level() {
        let result = parse_args_from(args(&["-l", "debug"])).unwrap();
        assert_eq!(result.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_invalid_values() {
        let err = parse_args_from(args(&["-p", "invalid"])).unwrap_err();
        assert!(err.to_string().contains("--port"));

        let err = parse_args_from(args(&["-H", "not-an-ip"])).unwrap_err();
        assert!(matches!(err, ArgsError::InvalidValue("host", _)));
    }

    #[test]
    fn test_unexpected_positional() {
        let err = parse_args_from(args(&["serve"])).unwrap_err();
        assert!(matches!(err, ArgsError::UnexpectedArgument(ref a) if a == "serve"));
    }

    #[test]
    fn test_unknown_flag() {
        assert!(matches!(
            parse_args_from(args(&["--rate-limit"])),
            Err(ArgsError::Lexopt(_))
        ));
    }
}
