//! Seam between the provisioning engine and the MQTT layer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;

pub(crate) mod rumqtt;

/// One MQTT publish delivered by the connection.
#[derive(Debug, Clone)]
pub(crate) struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// X.509 client identity presented during the TLS handshake, PEM encoded.
#[derive(Clone)]
pub struct DeviceCertificate {
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

impl fmt::Debug for DeviceCertificate {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCertificate")
            .field(
                "certificate_pem",
                &format!("{} bytes", self.certificate_pem.len()),
            )
            .field(
                "private_key_pem",
                &format!("{} bytes", self.private_key_pem.len()),
            )
            .finish()
    }
}

/// Everything the transport needs to start one secure connection.
pub(crate) struct ConnectSettings {
    pub endpoint: String,
    pub client_id: String,
    pub user_name: String,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Upper bound on DNS resolution plus the TLS and MQTT handshakes.
    pub connect_timeout: Duration,
    pub trusted_certificate: Option<Vec<u8>>,
    pub device_certificate: Option<DeviceCertificate>,
}

/// Notifications the MQTT layer raises back into the provisioning engine.
///
/// Implementations take the provisioning context lock, so the connection
/// must invoke them from its own task, never from inside a
/// [`MqttConnection`] call.
pub(crate) trait ConnectionHandler: Send + Sync {
    /// The CONNECT handshake finished, successfully or not.
    fn connect_notify(&self, success: bool);
    /// A publish arrived on the response subscription.
    fn receive_notify(&self, message: MqttMessage);
    /// The established connection was lost.
    fn disconnect_notify(&self);
}

/// The MQTT operations the provisioning engine consumes.
///
/// Every operation only enqueues work; completion is reported through the
/// [`ConnectionHandler`] installed at connect time.
pub(crate) trait MqttConnection: Send {
    fn connect(
        &mut self,
        settings: ConnectSettings,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), TransportError>;

    fn subscribe(&mut self, topic_filter: &str) -> Result<(), TransportError>;

    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    fn disconnect(&mut self);
}
