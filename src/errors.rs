use thiserror::Error;

/// Application-level errors.
#[derive(Error, Debug)]
pub enum LlsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("generation error: {0}")]
    Generate(String),
}

pub type LlsResult<T> = Result<T, LlsError>;
