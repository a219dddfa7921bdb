use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpalError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Job error: {0}")]
    Job(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Response contained no image")]
    NoImage,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OpalError>;
