//! Composition of the shared-access-signature password.
//!
//! The split mirrors the wire codec boundary: this module produces the
//! string to sign and composes the final password, while the caller
//! supplies the HMAC-SHA256 signature over it.

use urlencoding::encode;

/// Policy name DPS expects for registration tokens.
const POLICY_NAME: &str = "registration";

fn resource_uri(id_scope: &str, registration_id: &str) -> String {
    encode(&format!("{id_scope}/registrations/{registration_id}")).into_owned()
}

/// The string the symmetric key signs: the URL-encoded resource URI and
/// the expiry, newline separated.
pub(crate) fn signature(id_scope: &str, registration_id: &str, expiry_secs: i64) -> String {
    format!(
        "{}\n{expiry_secs}",
        resource_uri(id_scope, registration_id)
    )
}

/// Composes the MQTT password from an already URL-encoded base64
/// signature.
pub(crate) fn password(
    id_scope: &str,
    registration_id: &str,
    encoded_signature: &str,
    expiry_secs: i64,
) -> String {
    format!(
        "SharedAccessSignature sr={}&sig={encoded_signature}&se={expiry_secs}&skn={POLICY_NAME}",
        resource_uri(id_scope, registration_id)
    )
}
