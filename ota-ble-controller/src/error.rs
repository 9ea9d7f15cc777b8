use std::path::PathBuf;
use std::time::Duration;

use crate::plan::Phase;
use crate::signature::SignatureError;

/// Failure reported by a [`crate::Transport`] or [`crate::Link`]
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(uuid::Uuid),
    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
    #[error("{0}")]
    Other(String),
}

/// Terminal outcome of an upload session.
///
/// Nothing here is retried inside a session, a failed upload has to start over
/// with a fresh INIT.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("malformed signature: {0}")]
    MalformedSignature(#[from] SignatureError),
    #[error("signature file {path} could not be read: {source}")]
    MissingSignatureFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("firmware file {path} could not be read: {source}")]
    MissingFirmwareFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{field} is {len} bytes, does not fit a 32-bit length")]
    FieldTooLarge { field: &'static str, len: usize },
    #[error("no device advertising a name containing {name:?}")]
    DeviceNotFound { name: String },
    #[error("device discovery failed: {0}")]
    DiscoveryFailed(#[source] TransportError),
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] TransportError),
    #[error("write failed during {phase}: {source}")]
    WriteFailed {
        phase: Phase,
        #[source]
        source: TransportError,
    },
    #[error("write timed out after {timeout:?} during {phase}")]
    WriteTimeout { phase: Phase, timeout: Duration },
    #[error("upload cancelled during {phase}")]
    Cancelled { phase: Phase },
}

impl UploadError {
    /// Errors worth a whole-session retry: the radio misbehaved, the inputs are fine
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::DeviceNotFound { .. }
                | UploadError::DiscoveryFailed(_)
                | UploadError::ConnectionFailed(_)
                | UploadError::WriteFailed { .. }
                | UploadError::WriteTimeout { .. }
        )
    }

    /// Protocol phase the error happened in, if the session got that far
    pub fn phase(&self) -> Option<Phase> {
        match self {
            UploadError::DeviceNotFound { .. } | UploadError::DiscoveryFailed(_) => {
                Some(Phase::Discovery)
            }
            UploadError::ConnectionFailed(_) => Some(Phase::Connect),
            UploadError::WriteFailed { phase, .. }
            | UploadError::WriteTimeout { phase, .. }
            | UploadError::Cancelled { phase } => Some(*phase),
            _ => None,
        }
    }
}
