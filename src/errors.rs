use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),
    #[error("MISSING_EXECUTABLE: {0}")]
    MissingExecutable(String),
    #[error("EXECUTION_FAILED: {message}")]
    Execution {
        message: String,
        exit_code: Option<i32>,
        output: String,
    },
    #[error("IDLE_TIMEOUT: {0}")]
    IdleTimeout(String),
    #[error("TIMEOUT: {0}")]
    Timeout(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            exit_code: None,
            output: String::new(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::MissingExecutable(_) => "MISSING_EXECUTABLE",
            Self::Execution { .. } => "EXECUTION_FAILED",
            Self::IdleTimeout(_) => "IDLE_TIMEOUT",
            Self::Timeout(_) => "TIMEOUT",
            Self::Io(_) => "IO_FAILURE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Exit code of a failed process, when one was observed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Execution { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::IdleTimeout(_) | Self::Timeout(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
