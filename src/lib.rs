//! Streaming OTA firmware update engine for flash-constrained devices.
//!
//! The engine writes an image into the inactive flash region while it is
//! still arriving, verifies it, and only then makes it bootable. The
//! running firmware is never touched.

pub mod config;
pub mod error;
pub mod flash;
pub mod logging;
pub mod network;
pub mod ota;
pub mod partition;
pub mod targets;
pub mod version;

#[cfg(feature = "espidf")]
pub mod boot;

pub use config::OtaConfig;
pub use error::{OtaError, OtaResult};

/// The engine as the firmware runs it
#[cfg(feature = "espidf")]
pub type DeviceOtaManager = ota::OtaManager<flash::esp::EspFlash, boot::EspBootConfig>;
