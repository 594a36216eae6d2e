use thiserror::Error;

/// Failures raised by the MQTT transport layer.
///
/// These carry their detail as text so a latched terminal result can be
/// cloned to every waiting caller.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("invalid TLS configuration: {0}")]
    Tls(String),
    #[error("unable to start the MQTT connection: {0}")]
    Connect(String),
    #[error("the MQTT request queue rejected the operation: {0}")]
    Request(String),
}

/// Outcome codes of the provisioning client.
#[derive(Debug, Clone, Error)]
pub enum ProvisioningError {
    /// The registration has not reached a terminal state yet. Returned by
    /// [`register`](crate::ProvisioningClient::register) when the wait
    /// expires while the protocol is still running in the background.
    #[error("device registration has not completed yet")]
    Pending,
    /// An argument failed validation; nothing was changed.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// A fixed-size buffer is too small for the data it must receive.
    #[error("the target buffer is too small")]
    InsufficientBuffer,
    /// The operation is not available in the current registration state.
    #[error("the registration is not in the state required by this operation")]
    WrongState,
    /// The MQTT connection was lost, or torn down by deinitialization,
    /// while the registration was in progress.
    #[error("the connection to the provisioning service was lost")]
    Disconnected,
    /// The service rejected the registration and did not ask for a retry.
    #[error("the provisioning service rejected the registration with status {status}")]
    ServerResponse { status: u16 },
    /// An internal encoding or decoding step failed.
    #[error("internal client error: {0}")]
    SdkCore(String),
    /// A registration response exceeded the receive buffer.
    #[error("the registration response exceeds the receive buffer")]
    MessageTooLong,
    #[error(transparent)]
    Transport(#[from] TransportError),
}
