use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult};
use crate::output::OutputFormat;

pub mod echo;
pub mod share;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Round-trip messages through a worker thread.
    Echo(EchoArgs),
    /// Have worker threads bump one shared counter.
    Share(ShareArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, format),
        Command::Share(args) => share::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Number of messages to send.
    #[arg(long, default_value = "16")]
    pub count: u32,
    /// Size in bytes of the buffer carried by each message.
    #[arg(long, default_value = "1024")]
    pub buffer_size: usize,
    /// Move buffers through the transfer list instead of copying them.
    #[arg(long)]
    pub transfer: bool,
    /// JSON document carried as the body of every message.
    #[arg(long, value_name = "JSON")]
    pub json: Option<String>,
    /// Maximum time to wait for all replies (e.g. 5s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ShareArgs {
    /// Number of worker threads.
    #[arg(long, default_value = "4")]
    pub workers: u32,
    /// Increments performed by each worker.
    #[arg(long, default_value = "1000")]
    pub iterations: u32,
    /// Maximum time to wait for every worker (e.g. 5s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `500ms`, `5s` or a bare number of seconds.
pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("duration must not be empty"));
    }

    let (number, millis) = match input.strip_suffix("ms") {
        Some(num) => (num, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| CliError::usage(format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::usage("duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration(" 3 ").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0ms").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
    }
}
