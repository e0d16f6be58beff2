//! CLI argument parsing for the gateway.

use std::path::PathBuf;

use clap::Parser;

/// Common CLI arguments.
#[derive(Parser, Debug, Clone)]
#[command(about = "Modbus to Zenoh device gateway")]
pub struct BridgeArgs {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override the gateway uid from the configuration file.
    #[arg(long)]
    pub uid: Option<String>,
}

impl BridgeArgs {
    /// Parse CLI arguments with a default config path.
    ///
    /// If no `--config` argument is provided, uses the default. Exits the
    /// process on invalid arguments or `--help`.
    pub fn parse_with_default(default_config: &'static str) -> Self {
        Self::parse_from_with_default(std::env::args_os(), default_config)
            .unwrap_or_else(|e| e.exit())
    }

    /// Same as [`parse_with_default`](Self::parse_with_default) over an
    /// explicit argument list, returning the error instead of exiting.
    pub fn parse_from_with_default<I, T>(
        args: I,
        default_config: &'static str,
    ) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = <Self as clap::CommandFactory>::command()
            .mut_arg("config", |arg| arg.required(false).default_value(default_config))
            .try_get_matches_from(args)?;

        <Self as clap::FromArgMatches>::from_arg_matches(&matches)
    }
}
