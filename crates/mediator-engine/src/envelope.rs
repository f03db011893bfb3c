//! Outbound OpenHIM mediator response.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::classify::ResponseEnvelope;

/// Content type OpenHIM expects for mediator responses.
pub const MEDIATOR_CONTENT_TYPE: &str = "application/json+openhim";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediatorResponse {
    #[serde(rename = "x-mediator-urn")]
    pub mediator_urn: String,
    pub status: String,
    pub response: ResponseDetails,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseDetails {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub timestamp: String,
}

impl MediatorResponse {
    /// Wrap a classified outcome for the hub. The response body carries the
    /// classified message.
    pub fn from_envelope(
        mediator_urn: impl Into<String>,
        route_name: &str,
        envelope: &ResponseEnvelope,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());

        let mut properties = Map::new();
        properties.insert("property".to_string(), Value::from(route_name));

        Self {
            mediator_urn: mediator_urn.into(),
            status: envelope.transaction_status.clone(),
            response: ResponseDetails {
                status: envelope.http_status,
                headers,
                body: envelope.message.clone(),
                timestamp: now_rfc3339(),
            },
            properties,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.response.status
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
