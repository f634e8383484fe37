use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("File error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Upload failed: {0}")]
    UploadError(String),

    #[error("{0}")]
    Protocol(String),

    #[error("upload {0} not found")]
    NotFound(String),

    #[error("Upload-Offset {got} does not match current offset {expected}")]
    OffsetMismatch { expected: u64, got: u64 },

    #[error("File \"{0}\" already exists and duplicates are not allowed")]
    DuplicateFile(String),

    #[error("Upload-Length {0} exceeds the maximum allowed size of {1} bytes")]
    TooLarge(u64, u64),
}

pub type Result<T> = std::result::Result<T, Error>;
