use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Invalid settings: {0}")]
    Validation(String),

    #[error("Failed to decode input: {0}")]
    Decode(String),

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Conversion engine failed to load: {0}")]
    EngineInit(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid catalog: {0}")]
    Catalog(String),

    #[error("Conversion queue is closed")]
    QueueClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EngineError> for ConvertError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotInstalled(_) | EngineError::Load(_) => {
                ConvertError::EngineInit(err.to_string())
            }
            EngineError::Io(e) => ConvertError::Io(e),
            other => ConvertError::Encode(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;
