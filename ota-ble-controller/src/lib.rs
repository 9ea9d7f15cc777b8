//! OTA BLE Controller
//!
//! Streams a signed firmware image to an OTA receiver over BLE: one INIT frame
//! with the image size and signature fields, the eMj signature payload and the
//! image as CHUNK frames, then END.
//!
//! # Example
//!
//! ```ignore
//! use ota_ble_controller::{UploadConfig, UploadJob, ble};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let job = UploadJob::load("firmware.bin", "firmware.sig.json")?;
//!     let report = ble::upload(UploadConfig::default(), &job).await?;
//!     println!("sent {} frames", report.frames_sent);
//!     Ok(())
//! }
//! ```

pub mod ble;
mod config;
mod error;
mod firmware;
mod plan;
mod session;
mod signature;
mod transport;

pub use config::UploadConfig;
pub use error::{TransportError, UploadError};
pub use firmware::FirmwareImage;
pub use plan::{FramePlan, Phase};
pub use session::{Progress, SessionState, UploadJob, UploadReport, Uploader};
pub use signature::{IndexField, SignatureBundle, SignatureError, SignatureRecord};
pub use transport::{Link, Transport};
