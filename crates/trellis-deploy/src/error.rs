//! Error taxonomy surfaced at subcommand boundaries

use thiserror::Error;

use crate::tools::ProcessRunError;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Deployment errors
#[derive(Debug, Error)]
pub enum Error {
    /// Broken validation rule, unknown entity name, malformed field,
    /// undetectable input format
    #[error("descriptor error: {0}")]
    Descriptor(String),

    /// Action precondition unmet (e.g. attesting an undeployed module)
    #[error("preflight error: {0}")]
    Preflight(String),

    /// External tool exited non-zero during build/convert/sign
    #[error(transparent)]
    Build(#[from] ProcessRunError),

    /// Unexpected EOF, malformed response, non-Ok result code from a node
    #[error(transparent)]
    Wire(#[from] trellis_net::WireError),

    /// AEAD tag mismatch, wrong key length, unsupported cipher
    #[error(transparent)]
    Crypto(#[from] trellis_core::CryptoError),

    /// The event manager accepted the frame but reported a failed load
    #[error("deploying {module} on {node} failed")]
    Deploy { module: String, node: String },

    /// Challenge MAC mismatch or attester failure
    #[error("attestation of {module} failed: {reason}")]
    Attestation { module: String, reason: String },

    /// Unsupported (node variant, module variant) pairing
    #[error("a {module_type} module cannot run on {node} ({node_type} node)")]
    Configuration {
        module_type: &'static str,
        node: String,
        node_type: &'static str,
    },

    /// Endpoint name not found on the module
    #[error("module {module} has no endpoint named {endpoint}")]
    NoSuchEndpoint { module: String, endpoint: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn descriptor(msg: impl Into<String>) -> Self {
        Self::Descriptor(msg.into())
    }

    pub fn preflight(msg: impl Into<String>) -> Self {
        Self::Preflight(msg.into())
    }

    pub fn attestation(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Attestation {
            module: module.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Descriptor(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Descriptor(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Self::Descriptor(format!("malformed hex string: {e}"))
    }
}

impl From<trellis_net::FrameError> for Error {
    fn from(e: trellis_net::FrameError) -> Self {
        Self::Wire(trellis_net::WireError::Frame(e))
    }
}
