//! Error types for the backup pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("destinations disagree on last comparable/last backup snapshot")]
    DestinationsOutOfSync,

    #[error("incremental backup requested but no prior backup exists")]
    NoParent,

    #[error("the latest local snapshot is already the backup parent, nothing new to send")]
    NoNewSnapshot,

    #[error("resume requested but job options changed since the prior attempt: {0}")]
    OptionMismatch(String),

    #[error("upload to destination {destination} failed: {source}")]
    Upload {
        destination: String,
        #[source]
        source: Box<BackupError>,
    },

    #[error("cache warning: {0}")]
    CacheWarning(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;
