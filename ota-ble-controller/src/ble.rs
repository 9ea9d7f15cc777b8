//! BLE transport for OTA uploads
//!
//! Finds the receiver by advertised name, connects, and writes every frame to
//! the OTA characteristic with response so each write is acknowledged before
//! the next one starts.

use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::UploadConfig;
use crate::error::{TransportError, UploadError};
use crate::session::{UploadJob, UploadReport, Uploader};
use crate::transport::{Link, Transport};

/// OTA service, 0xFFF0 on the Bluetooth base UUID
pub const OTA_SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);

/// OTA write characteristic, 0xFFF1 on the Bluetooth base UUID
pub const OTA_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A device seen during a scan
#[derive(Debug, Clone)]
pub struct OtaDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertised name contains the configured substring
    pub matches: bool,
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(TransportError::NoAdapter)
}

/// Scan for BLE devices
///
/// Devices whose name contains `name` are flagged with `matches = true`.
pub async fn scan(duration: Duration, name: &str) -> Result<Vec<OtaDevice>, TransportError> {
    let adapter = get_adapter().await?;

    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let device_name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let matches = name_matches(&device_name, name);
            devices.push(OtaDevice {
                name: device_name,
                address: peripheral.address().to_string(),
                rssi: props.rssi,
                matches,
            });
        }
    }

    if let Err(e) = adapter.stop_scan().await {
        log::warn!("stopping scan failed: {e}");
    }
    Ok(devices)
}

fn name_matches(advertised: &str, name: &str) -> bool {
    advertised.contains(name)
}

async fn find_peripheral(adapter: &Adapter, name: &str) -> Result<Option<Peripheral>, TransportError> {
    for peripheral in adapter.peripherals().await? {
        if let Some(props) = peripheral.properties().await? {
            if props.local_name.is_some_and(|n| name_matches(&n, name)) {
                return Ok(Some(peripheral));
            }
        }
    }
    Ok(None)
}

/// btleplug backed [`Transport`]
pub struct BleTransport {
    adapter: Adapter,
    characteristic: Uuid,
}

impl BleTransport {
    /// Use the first Bluetooth adapter of the host
    pub async fn new(characteristic: Uuid) -> Result<Self, TransportError> {
        Ok(Self::with_adapter(get_adapter().await?, characteristic))
    }

    pub fn with_adapter(adapter: Adapter, characteristic: Uuid) -> Self {
        Self { adapter, characteristic }
    }
}

impl Transport for BleTransport {
    type Device = Peripheral;
    type Link = BleLink;

    async fn discover_device(
        &mut self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Peripheral>, TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        let deadline = Instant::now() + timeout;

        let found = loop {
            match find_peripheral(&self.adapter, name).await {
                Ok(Some(peripheral)) => break Ok(Some(peripheral)),
                Ok(None) if Instant::now() >= deadline => break Ok(None),
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = self.adapter.stop_scan().await {
            log::warn!("stopping scan failed: {e}");
        }
        if let Ok(Some(peripheral)) = &found {
            log::info!("found device {}", peripheral.address());
        }
        found
    }

    async fn open_session(&mut self, device: Peripheral) -> Result<BleLink, TransportError> {
        device.connect().await?;

        let lookup: Result<Characteristic, TransportError> = async {
            device.discover_services().await?;
            device
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == self.characteristic)
                .ok_or(TransportError::CharacteristicNotFound(self.characteristic))
        }
        .await;

        match lookup {
            Ok(characteristic) => Ok(BleLink { peripheral: device, characteristic }),
            Err(e) => {
                // leave nothing connected behind a failed session
                let _ = device.disconnect().await;
                Err(e)
            }
        }
    }
}

/// Connected peripheral plus the OTA characteristic
pub struct BleLink {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

impl Link for BleLink {
    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.characteristic, frame, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if needs_disconnect(&self.peripheral.is_connected().await) {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

/// Skip the disconnect only when the peripheral reports itself disconnected
fn needs_disconnect(connected: &Result<bool, btleplug::Error>) -> bool {
    !matches!(connected, Ok(false))
}

/// Upload `job` to the first device matching `config.device_name`
pub async fn upload(config: UploadConfig, job: &UploadJob) -> Result<UploadReport, UploadError> {
    config.validate()?;
    let transport = BleTransport::new(config.characteristic)
        .await
        .map_err(UploadError::DiscoveryFailed)?;
    Uploader::new(transport, config).upload(job).await
}
