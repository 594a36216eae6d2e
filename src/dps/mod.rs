//! Pure encoding and decoding of the DPS wire protocol: MQTT topics,
//! request payloads, user names and SAS strings. Nothing in this module
//! touches the network.

mod query;
pub(crate) mod response;
pub(crate) mod sas;
pub(crate) mod topics;

const API_VERSION: &str = "2019-03-31";

/// The MQTT user name DPS expects on CONNECT.
pub(crate) fn user_name(id_scope: &str, registration_id: &str) -> String {
    format!(
        "{id_scope}/registrations/{registration_id}/api-version={API_VERSION}&DeviceClientType=rust%2F{}",
        env!("CARGO_PKG_VERSION")
    )
}

/// The registration request payload. The spacing around the colon is part
/// of the wire format the service has been tested against; keep it.
pub(crate) fn register_payload(registration_id: &str) -> Vec<u8> {
    format!("{{\"registrationId\" : \"{registration_id}\"}}").into_bytes()
}
