use clap::ValueEnum;
use tracing::level_filters::LevelFilter;

type InstallError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Stderr logging chosen by the global `--log-*` flags.
#[derive(Copy, Clone, Debug)]
pub struct LogSettings {
    pub format: LogFormat,
    pub level: LogLevel,
}

impl LogSettings {
    /// Every command runs ports on named worker threads; at debug and below
    /// the numeric thread id is added so interleaved records can be told apart.
    fn thread_ids(&self) -> bool {
        self.level >= LogLevel::Debug
    }

    /// Install the process-wide subscriber. Fails if one is already set.
    pub fn install(self) -> Result<(), InstallError> {
        let builder = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(LevelFilter::from(self.level))
            .with_thread_names(true)
            .with_thread_ids(self.thread_ids())
            .with_ansi(false)
            .with_target(false);

        match self.format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        }
    }
}
