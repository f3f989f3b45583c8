//! Agent error type and exit code mapping

use yarasweep_core::error::{ConfigError, ScanError, YarasweepError};
use yarasweep_scanner::ScannerError;

/// Agent-level error.
///
/// Each variant carries enough context for a single log line; the binary
/// maps it to a process exit status through [`AgentError::exit_code`].
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration loading, validation or target selection failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// The rule file could not be read or compiled.
    #[error("rule compile error: {0}")]
    Compile(String),

    /// Target resolution or the scan itself failed.
    #[error("scan error: {0}")]
    Scan(String),

    /// The scan-serving transport could not be started.
    #[error("server error: {0}")]
    Server(String),

    /// JSON serialisation failed during output rendering.
    #[error("json output error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    /// IO error (stdout write, socket, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Map the error to a process exit code.
    ///
    /// | Code | Meaning                    |
    /// |------|----------------------------|
    /// | 0    | Success                    |
    /// | 1    | Failure threshold breached |
    /// | 2    | Configuration error        |
    /// | 3    | Rule compile error         |
    /// | 4    | Scan or runtime failure    |
    ///
    /// Code 1 is never produced by an error; it comes from
    /// [`RunOutcome::exit_code`](crate::orchestrator::RunOutcome::exit_code).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Compile(_) => 3,
            Self::Scan(_) | Self::Server(_) | Self::JsonSerialize(_) | Self::Io(_) => 4,
        }
    }
}

impl From<ConfigError> for AgentError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<ScanError> for AgentError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::InvalidRequest(msg) => Self::Config(msg),
            ScanError::EngineCompile(msg) => Self::Compile(msg),
            ScanError::Engine(msg) => Self::Scan(msg),
        }
    }
}

impl From<ScannerError> for AgentError {
    fn from(e: ScannerError) -> Self {
        ScanError::from(e).into()
    }
}

impl From<YarasweepError> for AgentError {
    fn from(e: YarasweepError) -> Self {
        match e {
            YarasweepError::Config(e) => e.into(),
            YarasweepError::Scan(e) => e.into(),
            YarasweepError::Io(e) => Self::Io(e),
            other => Self::Scan(other.to_string()),
        }
    }
}
