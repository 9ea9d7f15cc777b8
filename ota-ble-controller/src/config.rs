//! Upload configuration
//!
//! Read from an optional JSON file, every field has a default matching the
//! stock receiver firmware.

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use ota_proto::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use ota_proto::ble::DEFAULT_DEVICE_NAME;

use crate::ble::OTA_CHARACTERISTIC;
use crate::error::UploadError;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Substring matched against advertised device names
    pub device_name: String,
    /// Write characteristic receiving the frames
    pub characteristic: uuid::Uuid,
    /// Maximum CHUNK payload in bytes
    pub chunk_size: usize,
    pub scan_timeout_secs: u64,
    /// Per-write timeout, writes wait forever when unset
    pub write_timeout_ms: Option<u64>,
    /// Whole-session attempts, each one starts again from discovery
    pub attempts: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            characteristic: OTA_CHARACTERISTIC,
            chunk_size: DEFAULT_CHUNK_SIZE,
            scan_timeout_secs: 5,
            write_timeout_ms: None,
            attempts: 1,
        }
    }
}

impl UploadConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            UploadError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            UploadError::InvalidConfiguration(format!("cannot parse {}: {e}", path.display()))
        })
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        self.chunk_size()?;
        if self.device_name.is_empty() {
            return Err(UploadError::InvalidConfiguration(
                "device_name must not be empty".to_string(),
            ));
        }
        if self.scan_timeout_secs == 0 {
            return Err(UploadError::InvalidConfiguration(
                "scan_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.write_timeout_ms == Some(0) {
            return Err(UploadError::InvalidConfiguration(
                "write_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.attempts == 0 {
            return Err(UploadError::InvalidConfiguration(
                "attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn chunk_size(&self) -> Result<NonZeroUsize, UploadError> {
        match NonZeroUsize::new(self.chunk_size) {
            Some(size) if size.get() <= MAX_CHUNK_SIZE => Ok(size),
            _ => Err(UploadError::InvalidConfiguration(format!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            ))),
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}
