use std::path::Path;

use crate::error::UploadError;

/// Firmware image to upload, read once and never modified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Vec<u8>,
}

impl FirmwareImage {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| UploadError::MissingFirmwareFile {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Image length as carried in the INIT frame
    pub fn total_size(&self) -> Result<u32, UploadError> {
        length_field("firmware", self.bytes.len())
    }
}

pub(crate) fn length_field(field: &'static str, len: usize) -> Result<u32, UploadError> {
    u32::try_from(len).map_err(|_| UploadError::FieldTooLarge { field, len })
}
