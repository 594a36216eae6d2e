use anyhow::{Context, Result};
use serde::Deserialize;

use super::topics;

/// Operation status the service reports once the device has a hub.
/// Compared by content; every other status routes through the retry-after
/// rule.
const OPERATION_STATUS_ASSIGNED: &str = "assigned";

/// Only the used parts are deserialized.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePayload {
    // Terminal error payloads may omit the operation id.
    #[serde(default)]
    operation_id: Option<String>,
    status: String,
    #[serde(default)]
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegistrationState {
    #[serde(default)]
    pub assigned_hub: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// A fully parsed registration response: topic metadata plus payload.
#[derive(Debug, Clone)]
pub(crate) struct RegisterResponse {
    pub status: u16,
    pub retry_after_seconds: u32,
    pub operation_id: String,
    pub operation_status: String,
    pub registration_state: Option<RegistrationState>,
}

impl RegisterResponse {
    pub(crate) fn parse(topic: &str, payload: &[u8]) -> Result<RegisterResponse> {
        let topic = topics::parse_response_topic(topic)?;
        let payload: ResponsePayload = serde_json::from_slice(payload)
            .context("Failed deserializing registration response from JSON")?;

        Ok(RegisterResponse {
            status: topic.status,
            retry_after_seconds: topic.retry_after_seconds,
            operation_id: payload.operation_id.unwrap_or_default(),
            operation_status: payload.status,
            registration_state: payload.registration_state,
        })
    }

    pub(crate) fn is_assigned(&self) -> bool {
        self.operation_status == OPERATION_STATUS_ASSIGNED
    }

    pub(crate) fn assigned_hub(&self) -> &str {
        self.registration_state
            .as_ref()
            .and_then(|state| state.assigned_hub.as_deref())
            .unwrap_or_default()
    }

    pub(crate) fn device_id(&self) -> &str {
        self.registration_state
            .as_ref()
            .and_then(|state| state.device_id.as_deref())
            .unwrap_or_default()
    }
}
