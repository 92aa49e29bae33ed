//! Server configuration and command-line parsing.

use crate::commands::HandlerSettings;
use crate::storage::{DeletionConfig, SlabConfig};
use crate::DEFAULT_PORT;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;
use tracing::Level;

/// Default memory limit in megabytes
pub const DEFAULT_MEMORY_MB: usize = 64;

/// Default connection limit
pub const DEFAULT_MAX_CONNS: usize = 1024;

/// Errors from command-line parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("invalid value '{value}' for {flag}")]
    InvalidValue { flag: String, value: String },

    #[error("unknown argument: {0}")]
    UnknownArgument(String),
}

/// What the command line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliAction {
    Run(Config),
    Help,
    Version,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Port to listen on
    pub port: u16,
    /// Interface to bind to (default: all)
    pub listen: IpAddr,
    /// Memory limit for items in bytes (0 = unlimited)
    pub max_bytes: usize,
    /// Item limit, reported but not enforced (0 = unlimited)
    pub max_items: u64,
    /// Connections above this are logged
    pub max_conns: usize,
    /// Debug-level logging
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_bytes: DEFAULT_MEMORY_MB * 1024 * 1024,
            max_items: 0,
            max_conns: DEFAULT_MAX_CONNS,
            verbose: false,
        }
    }
}

impl Config {
    /// Parses command-line arguments (without the program name).
    pub fn from_args<I>(args: I) -> Result<CliAction, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Config::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-p" | "--port" => config.port = parse_value(&arg, args.next())?,
                "-l" | "--listen" => config.listen = parse_value(&arg, args.next())?,
                "-m" | "--memory-limit" => {
                    let megabytes: usize = parse_value(&arg, args.next())?;
                    config.max_bytes = megabytes.checked_mul(1024 * 1024).ok_or_else(|| {
                        ConfigError::InvalidValue {
                            flag: arg.clone(),
                            value: megabytes.to_string(),
                        }
                    })?;
                }
                "-s" | "--max-items" => config.max_items = parse_value(&arg, args.next())?,
                "-c" | "--conn-limit" => config.max_conns = parse_value(&arg, args.next())?,
                "-v" | "--verbose" => config.verbose = true,
                "-h" | "--help" => return Ok(CliAction::Help),
                "-V" | "--version" => return Ok(CliAction::Version),
                _ => return Err(ConfigError::UnknownArgument(arg)),
            }
        }

        Ok(CliAction::Run(config))
    }

    /// Returns the address to bind the listener to
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    pub fn slab_config(&self) -> SlabConfig {
        SlabConfig {
            mem_limit: self.max_bytes,
            ..SlabConfig::default()
        }
    }

    pub fn handler_settings(&self, deletion: &DeletionConfig) -> HandlerSettings {
        HandlerSettings {
            limit_maxbytes: self.max_bytes as u64,
            limit_maxitems: self.max_items,
            delete_grace: deletion.grace,
        }
    }

    /// Log level used unless `RUST_LOG` says otherwise.
    pub fn log_level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Result<T, ConfigError> {
    let value = value.ok_or_else(|| ConfigError::MissingValue(flag.to_string()))?;
    value.parse().map_err(|_| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value,
    })
}

/// Usage text for `--help`.
pub fn help_text() -> String {
    format!(
        r#"
flashcache - A memcached-compatible in-memory caching daemon

USAGE:
    flashcache [OPTIONS]

OPTIONS:
    -p, --port <PORT>           Port to listen on (default: {DEFAULT_PORT})
    -l, --listen <ADDR>         Interface to bind to (default: all interfaces)
    -m, --memory-limit <MB>     Memory for items in megabytes (default: {DEFAULT_MEMORY_MB})
    -s, --max-items <N>         Item limit reported by stats (default: 0, unlimited)
    -c, --conn-limit <N>        Simultaneous connections (default: {DEFAULT_MAX_CONNS})
    -v, --verbose               Debug logging (RUST_LOG overrides)
    -V, --version               Print version information
    -h, --help                  Print this help message

CONNECTING:
    $ printf 'set name 0 0 4\r\nAriz\r\nget name\r\n' | nc 127.0.0.1 {DEFAULT_PORT}
    STORED
    VALUE name 0 4
    Ariz
    END
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn parse(args: &[&str]) -> Result<CliAction, ConfigError> {
        Config::from_args(args.iter().map(|s| s.to_string()))
    }

    fn run_config(args: &[&str]) -> Config {
        match assert_ok!(parse(args)) {
            CliAction::Run(config) => config,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = run_config(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.bind_address().to_string(), "0.0.0.0:11211");
        assert_eq!(config.max_bytes, 64 * 1024 * 1024);
        assert_eq!(config.max_conns, 1024);
        assert_eq!(config.log_level(), Level::INFO);
    }

    #[test]
    fn test_all_flags() {
        let config = run_config(&[
            "-p", "22122", "-l", "127.0.0.1", "-m", "16", "-s", "500", "-c", "10", "-v",
        ]);
        assert_eq!(config.bind_address().to_string(), "127.0.0.1:22122");
        assert_eq!(config.max_bytes, 16 * 1024 * 1024);
        assert_eq!(config.max_items, 500);
        assert_eq!(config.max_conns, 10);
        assert_eq!(config.log_level(), Level::DEBUG);

        assert_eq!(config.slab_config().mem_limit, 16 * 1024 * 1024);
        let settings = config.handler_settings(&DeletionConfig::default());
        assert_eq!(settings.limit_maxitems, 500);
        assert_eq!(settings.delete_grace.as_secs(), 4);
    }

    #[test]
    fn test_long_flags() {
        let config = run_config(&["--port", "1", "--memory-limit", "0", "--verbose"]);
        assert_eq!(config.port, 1);
        assert_eq!(config.max_bytes, 0);
        assert!(config.verbose);
    }

    #[test]
    fn test_help_and_version() {
        assert_eq!(parse(&["-h"]), Ok(CliAction::Help));
        assert_eq!(parse(&["--version"]), Ok(CliAction::Version));
        assert!(help_text().contains("--memory-limit"));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            assert_err!(parse(&["-p"])),
            ConfigError::MissingValue("-p".to_string())
        );
        assert_eq!(
            assert_err!(parse(&["-p", "huge"])),
            ConfigError::InvalidValue {
                flag: "-p".to_string(),
                value: "huge".to_string()
            }
        );
        assert_eq!(
            assert_err!(parse(&["-d"])),
            ConfigError::UnknownArgument("-d".to_string())
        );
        assert_err!(parse(&["-l", "not-an-ip"]));
    }
}
