//! Device-side client for the Azure IoT Device Provisioning Service (DPS).
//!
//! Given a DPS endpoint, an ID scope and a registration ID, plus either a
//! symmetric enrollment key or an X.509 device certificate,
//! [`ProvisioningClient`] negotiates with the service over MQTT-on-TLS and
//! hands back the IoT Hub hostname and device ID assigned to the device:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use aziot_provisioning::ProvisioningClientBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ProvisioningClientBuilder::new(
//!     "global.azure-devices-provisioning.net",
//!     "0ne00000001",
//!     "my-device",
//! )
//! .with_symmetric_key("bXktZW5yb2xsbWVudC1rZXk=")
//! .build()?;
//!
//! client.register(Duration::from_secs(600))?;
//!
//! let info = client.iothub_device_info()?;
//! println!("assigned to {} as {}", info.iothub_hostname, info.device_id);
//! # Ok(())
//! # }
//! ```
//!
//! The registration protocol runs in the background; `register` only
//! observes it. A call whose wait expires returns
//! [`ProvisioningError::Pending`] and a later call picks up the very same
//! registration.

mod client;
mod connection;
mod dps;
mod error;

pub use client::{
    CompletionCallback, IotHubDeviceInfo, ProvisioningClient, ProvisioningClientBuilder,
};
pub use connection::DeviceCertificate;
pub use error::{ProvisioningError, TransportError};
