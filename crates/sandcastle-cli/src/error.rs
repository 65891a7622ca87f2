//! Error types for the CLI

use std::path::PathBuf;

use sandcastle_cluster::{BootstrapFailure, CreateError};
use sandcastle_common::telemetry::TelemetryError;
use sandcastle_common::yaml::YamlError;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cluster(#[from] sandcastle_common::Error),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapFailure),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid cluster file {path}: {message}")]
    ClusterFile { path: PathBuf, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("command failed: {message}")]
    CommandFailed { message: String },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }

    pub fn cluster_file(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::ClusterFile {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<CreateError> for Error {
    fn from(err: CreateError) -> Self {
        match err {
            CreateError::Setup(e) => Error::Cluster(e),
            CreateError::Bootstrap(e) => Error::Bootstrap(e),
        }
    }
}

impl From<YamlError> for Error {
    fn from(err: YamlError) -> Self {
        Error::Cluster(err.into())
    }
}
