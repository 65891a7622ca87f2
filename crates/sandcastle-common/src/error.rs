//! Error types for Sandcastle cluster operations
//!
//! Errors are structured with fields to aid debugging a failed bootstrap.
//! Each variant carries the node, unit or step it concerns so a caller can
//! tell where the sequence stopped without reading logs.

use thiserror::Error;

/// Main error type for Sandcastle operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid cluster parameters, rejected before any resource is created
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field (e.g., "controlplanes")
        field: Option<String>,
    },

    /// Trust material, machine config rendering or patch failure
    #[error("config generation error [{context}]: {message}")]
    ConfigGeneration {
        /// What was being generated (e.g., "controlplane patch 2", "pki")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// The execution engine could not create, bind or start a runtime unit
    #[error("provisioning error for {unit}: {message}")]
    Provisioning {
        /// Name of the runtime unit
        unit: String,
        /// Description of what failed
        message: String,
    },

    /// Applying a machine config to a node failed
    #[error("config application failed on {node}: {message}")]
    ConfigApplication {
        /// Hostname of the node
        node: String,
        /// Description of what failed
        message: String,
    },

    /// The one-time consensus bootstrap command failed
    #[error("bootstrap command failed on {node}: {message}")]
    BootstrapCommand {
        /// Hostname of the bootstrap node
        node: String,
        /// Description of what failed
        message: String,
    },

    /// A bounded wait ran out of time
    #[error("timed out after {waited_secs}s waiting for {target}")]
    ReadinessTimeout {
        /// What was being waited on (e.g., "10.87.13.37:6443", "node/t1-worker-1")
        target: String,
        /// The wait budget in seconds
        waited_secs: u64,
    },

    /// The credential file did not contain exactly one rewritable server address
    #[error("credential rewrite error: {message}")]
    CredentialRewrite {
        /// Description of what failed
        message: String,
    },

    /// An execution engine call failed outside of provisioning
    #[error("engine error [{operation}]: {message}")]
    Engine {
        /// The engine operation (e.g., "exec", "read_file")
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The operation was cancelled before it completed
    #[error("cancelled during {step}")]
    Cancelled {
        /// The step that was interrupted
        step: String,
    },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a config generation error
    pub fn config_generation(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConfigGeneration {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a provisioning error for a runtime unit
    pub fn provisioning(unit: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioning {
            unit: unit.into(),
            message: msg.into(),
        }
    }

    /// Create a config application error for a node
    pub fn config_application(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConfigApplication {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a bootstrap command error for a node
    pub fn bootstrap_command(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::BootstrapCommand {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a readiness timeout error
    pub fn readiness_timeout(target: impl Into<String>, waited: std::time::Duration) -> Self {
        Self::ReadinessTimeout {
            target: target.into(),
            waited_secs: waited.as_secs(),
        }
    }

    /// Create a credential rewrite error
    pub fn credential_rewrite(msg: impl Into<String>) -> Self {
        Self::CredentialRewrite {
            message: msg.into(),
        }
    }

    /// Create an engine error
    pub fn engine(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Engine {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a cancellation error for the given step
    pub fn cancelled(step: impl Into<String>) -> Self {
        Self::Cancelled { step: step.into() }
    }

    /// Short machine-friendly name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "ValidationError",
            Error::ConfigGeneration { .. } => "ConfigGenerationError",
            Error::Provisioning { .. } => "ProvisioningError",
            Error::ConfigApplication { .. } => "ConfigApplicationError",
            Error::BootstrapCommand { .. } => "BootstrapCommandError",
            Error::ReadinessTimeout { .. } => "ReadinessTimeoutError",
            Error::CredentialRewrite { .. } => "CredentialRewriteError",
            Error::Engine { .. } => "EngineError",
            Error::Serialization { .. } => "SerializationError",
            Error::Cancelled { .. } => "Cancelled",
            Error::Io(_) => "IoError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
