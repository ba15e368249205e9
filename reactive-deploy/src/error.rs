//! Error taxonomy for configuration, build, protocol and transport failures
//!
//! Every failure is fatal to the run. Errors are `Clone` because a memoized
//! pipeline stage hands the same failure to every waiter.

use std::sync::Arc;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Build,
    Protocol,
    Transport,
    Internal,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No node with name {0}")]
    UnknownNode(String),

    #[error("No module with name {0}")]
    UnknownModule(String),

    #[error("Unknown {what} type '{kind}'")]
    UnknownKind { what: &'static str, kind: String },

    #[error("Duplicate {what} name '{name}'")]
    DuplicateName { what: &'static str, name: String },

    #[error("A {module_kind} module ({module}) cannot run on a {node_kind} node")]
    KindMismatch {
        module: String,
        module_kind: &'static str,
        node_kind: &'static str,
    },

    #[error("Encryption \"{encryption}\" not supported between {from} and {to}")]
    EncryptionUnsupported {
        encryption: String,
        from: String,
        to: String,
    },

    #[error("Encryption \"{encryption}\" not supported by {module}")]
    ModuleEncryptionUnsupported { encryption: String, module: String },

    #[error("Frequency {0} out of range [1, 2^32-1]")]
    FrequencyOutOfRange(u64),

    #[error("Malformed key: {0}")]
    InvalidKey(String),

    #[error("Cannot establish a connection within the same module ({0})")]
    SameModuleConnection(String),

    #[error("Module {0}: either all of the derived fields should be given or none")]
    PartialDerivedState(String),

    #[error("Command \"{command}\" exited with code {code}")]
    ProcessFailed { command: String, code: i32 },

    #[error("Unexpected output from \"{command}\": {reason}")]
    ToolOutput { command: String, reason: String },

    #[error("Reactive command {command} failed with code {code}")]
    CommandFailed { command: String, code: String },

    #[error("SetKey on {module} rejected with result code {code}")]
    SetKeyRejected { module: String, code: String },

    #[error("Module {0} response has wrong tag")]
    TagMismatch(String),

    #[error("Module {module} has no endpoint named {endpoint}")]
    EndpointNotFound { module: String, endpoint: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_)
            | Error::UnknownNode(_)
            | Error::UnknownModule(_)
            | Error::UnknownKind { .. }
            | Error::DuplicateName { .. }
            | Error::KindMismatch { .. }
            | Error::EncryptionUnsupported { .. }
            | Error::ModuleEncryptionUnsupported { .. }
            | Error::FrequencyOutOfRange(_)
            | Error::InvalidKey(_)
            | Error::SameModuleConnection(_)
            | Error::PartialDerivedState(_)
            | Error::Json(_) => ErrorCategory::Configuration,
            Error::ProcessFailed { .. } | Error::ToolOutput { .. } => ErrorCategory::Build,
            Error::CommandFailed { .. }
            | Error::SetKeyRejected { .. }
            | Error::TagMismatch(_)
            | Error::EndpointNotFound { .. }
            | Error::Protocol(_) => ErrorCategory::Protocol,
            Error::Transport(_) | Error::Io(_) => ErrorCategory::Transport,
            Error::Internal(_) => ErrorCategory::Internal,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(Arc::new(e))
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::InvalidKey(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
