use thiserror::Error;

#[derive(Debug, Error)]
pub enum PulseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PulseError {
    /// Short error code string for logs and CLI exit messages.
    pub fn code(&self) -> &'static str {
        match self {
            PulseError::Config(_) => "CONFIG_ERROR",
            PulseError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, PulseError>;
