use std::path::PathBuf;

use thiserror::Error;

/// Errors shared by the cloudmetrics crates.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot read CA certificate '{}': {source}", path.display())]
    Certificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to initialize tracing: {0}")]
    Tracing(String),
}

pub type Result<T> = std::result::Result<T, Error>;
