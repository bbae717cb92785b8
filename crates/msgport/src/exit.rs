use std::fmt;
use std::io;
use std::time::Duration;

use msgport_channel::PortError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(USAGE, message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn port_error(context: &str, err: PortError) -> CliError {
    let code = match err {
        PortError::Spawn(source) => return io_error(context, source),
        PortError::NotTransferable(_)
        | PortError::InvalidTransferEntry { .. }
        | PortError::PortNotInTransferList
        | PortError::DataClone(_)
        | PortError::Decode(_)
        | PortError::PayloadTooLarge { .. } => DATA_INVALID,
        PortError::MissingArguments(_) | PortError::UnknownMethod(_) => USAGE,
        PortError::PortClosed
        | PortError::WorkerSetup { .. }
        | PortError::WorkerPanicked(_)
        | PortError::Callback(_) => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn timed_out(context: &str, after: Duration) -> CliError {
    CliError::new(TIMEOUT, format!("{context}: timed out after {after:?}"))
}
