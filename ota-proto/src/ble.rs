//! BLE GATT constants for the OTA service
//!
//! The receiver exposes a single write characteristic; every OTA frame is
//! written to it as one attribute value.

/// OTA service UUID (16-bit 0xFFF0 on the Bluetooth base UUID)
pub const OTA_SERVICE_UUID: &str = "0000fff0-0000-1000-8000-00805f9b34fb";

/// OTA write characteristic UUID (16-bit 0xFFF1)
pub const OTA_CHARACTERISTIC_UUID: &str = "0000fff1-0000-1000-8000-00805f9b34fb";

/// Advertised name substring of the stock receiver firmware
pub const DEFAULT_DEVICE_NAME: &str = "nimble";
