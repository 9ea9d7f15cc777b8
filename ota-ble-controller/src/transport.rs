//! Transport seam between the upload session and the radio
//!
//! [`crate::ble::BleTransport`] is the btleplug implementation; anything that
//! can find a device by name and write ordered frames to it will do.

use std::time::Duration;

use crate::error::TransportError;

#[allow(async_fn_in_trait)]
pub trait Transport {
    type Device;
    type Link: Link;

    /// Find a device whose advertised name contains `name`.
    ///
    /// `Ok(None)` when nothing matched within `timeout`.
    async fn discover_device(
        &mut self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Self::Device>, TransportError>;

    async fn open_session(&mut self, device: Self::Device) -> Result<Self::Link, TransportError>;
}

/// An open session with one device
#[allow(async_fn_in_trait)]
pub trait Link {
    /// Write one frame and wait until the transport acknowledges it
    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}
