use anyhow::{Context, Result};

use super::query;

/// Topic filter every registration response arrives on.
pub(crate) const RESPONSE_TOPIC_FILTER: &str = "$dps/registrations/res/#";

const RESPONSE_TOPIC_PREFIX: &str = "$dps/registrations/res/";

// The service echoes the request id back in the response topic; a single
// registration only ever has one request outstanding.
const REQUEST_ID: &str = "1";

pub(crate) fn register_publish_topic() -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={REQUEST_ID}")
}

pub(crate) fn query_status_publish_topic(operation_id: &str) -> String {
    format!(
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={REQUEST_ID}&operationId={operation_id}"
    )
}

/// Metadata carried by a response topic such as
/// `$dps/registrations/res/202/?$rid=1&retry-after=3`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResponseTopic {
    pub status: u16,
    /// Server-directed delay before the next status query; zero when the
    /// topic carries no `retry-after` property.
    pub retry_after_seconds: u32,
}

pub(crate) fn parse_response_topic(topic: &str) -> Result<ResponseTopic> {
    let rest = topic
        .strip_prefix(RESPONSE_TOPIC_PREFIX)
        .with_context(|| format!("topic {topic:?} is not a registration response"))?;

    let (status, properties) = rest
        .split_once("/?")
        .with_context(|| format!("topic {topic:?} carries no property segment"))?;

    let status = status
        .parse::<u16>()
        .with_context(|| format!("invalid status code in topic {topic:?}"))?;

    let properties = query::parse(properties)?;
    let retry_after_seconds = match properties.get("retry-after") {
        Some(Some(value)) => value
            .parse::<u32>()
            .with_context(|| format!("invalid retry-after in topic {topic:?}"))?,
        _ => 0,
    };

    Ok(ResponseTopic {
        status,
        retry_after_seconds,
    })
}
