//! Response classification.
//!
//! Collaborators report outcomes through structurally different fields. The
//! classifier normalizes a final state or an error into one
//! [`ResponseEnvelope`], keeping the collaborator's own status, code and
//! message whenever they can be found.

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{EngineError, EngineResult};
use crate::state::State;

pub const FAILED: &str = "Failed";
pub const SUCCESSFUL: &str = "Successful";
pub const COMPLETED: &str = "Completed";
pub const DUPLICATE_MESSAGE: &str = "A duplicate was found! No action taken";
pub const NO_RESULT_MESSAGE: &str = "no body nor references";

/// Delimiter after which collaborators embed their serialized error payload.
pub const PAYLOAD_DELIMITER: &str = "responded with:";

/// Normalized outcome of one inbound event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub transaction_status: String,
    pub http_status: u16,
    pub message: Value,
    pub body: Value,
}

impl ResponseEnvelope {
    pub fn new(
        transaction_status: impl Into<String>,
        http_status: u16,
        message: impl Into<Value>,
        body: Value,
    ) -> Self {
        Self {
            transaction_status: transaction_status.into(),
            http_status,
            message: message.into(),
            body,
        }
    }

    pub fn failed(http_status: u16, message: impl Into<Value>, body: Value) -> Self {
        Self::new(FAILED, http_status, message, body)
    }
}

pub fn classify(outcome: &EngineResult<State>) -> ResponseEnvelope {
    match outcome {
        Ok(state) => classify_state(state),
        Err(error) => classify_error(error),
    }
}

/// Classify a successful run by its most recent reference, then by
/// `state.body`.
pub fn classify_state(state: &State) -> ResponseEnvelope {
    let body = state.clone().into_value();

    if let Some(latest) = state.latest_reference() {
        if let Some(result) = latest.get("body").filter(|b| has_status_fields(b)) {
            return from_status_fields(result, 200, SUCCESSFUL, body);
        }
        if latest.get("status").and_then(Value::as_str) == Some("COMPLETED") {
            return ResponseEnvelope::new(
                str_field(latest, "httpStatus").unwrap_or(COMPLETED),
                code_field(latest).unwrap_or(202),
                latest
                    .get("message")
                    .cloned()
                    .unwrap_or_else(|| Value::from(DUPLICATE_MESSAGE)),
                body,
            );
        }
    }

    if let Some(result) = state.get("body").filter(|b| has_status_fields(b)) {
        return from_status_fields(result, 200, SUCCESSFUL, body);
    }

    ResponseEnvelope::failed(500, NO_RESULT_MESSAGE, body)
}

/// Classify a failed run.
pub fn classify_error(error: &EngineError) -> ResponseEnvelope {
    let payload = error.payload().cloned().unwrap_or(Value::Null);
    let fallback_code = match error {
        EngineError::Collaborator(inner) => inner.status.unwrap_or(500),
        _ => 500,
    };

    if let Some(result) = error.payload().and_then(nested_response_body) {
        return from_status_fields(&result, fallback_code, FAILED, payload);
    }

    if let Some(embedded) = embedded_payload(&error.to_string()) {
        let result = embedded
            .get("body")
            .filter(|b| has_status_fields(b))
            .cloned()
            .unwrap_or_else(|| embedded.clone());
        if has_status_fields(&result) {
            return from_status_fields(&result, fallback_code, FAILED, embedded);
        }
    }

    ResponseEnvelope::failed(500, error.to_string(), payload)
}

/// Locate a collaborator response body inside an error payload.
fn nested_response_body(payload: &Value) -> Option<Value> {
    if has_status_fields(payload) {
        return Some(payload.clone());
    }
    let response = payload.get("response");
    let candidates = [
        response.and_then(|r| r.get("body")).cloned(),
        response
            .and_then(|r| r.get("text"))
            .and_then(Value::as_str)
            .and_then(|text| serde_json::from_str(text).ok()),
        payload.get("body").cloned(),
    ];
    candidates.into_iter().flatten().find(has_status_fields)
}

fn embedded_payload(message: &str) -> Option<Value> {
    let (_, rest) = message.split_once(PAYLOAD_DELIMITER)?;
    serde_json::from_str(rest.trim()).ok()
}

fn has_status_fields(value: &Value) -> bool {
    value.as_object().is_some_and(|object| {
        ["httpStatus", "httpStatusCode", "message"]
            .iter()
            .any(|key| object.contains_key(*key))
    })
}

fn from_status_fields(
    result: &Value,
    default_code: u16,
    default_status: &str,
    body: Value,
) -> ResponseEnvelope {
    let code = code_field(result).unwrap_or(default_code);
    let status = str_field(result, "httpStatus").unwrap_or(default_status);
    ResponseEnvelope::new(status, code, describe(result), body)
}

/// The collaborator's message, followed by import summaries or conflicts
/// when DHIS2 supplied them.
fn describe(result: &Value) -> Value {
    let message = result.get("message").cloned().unwrap_or(Value::Null);
    let details = result.get("response").and_then(|response| {
        response
            .get("importSummaries")
            .or_else(|| response.get("conflicts"))
    });
    match (message, details) {
        (Value::String(text), Some(details)) => Value::from(format!("{text} \n {details}")),
        (Value::Null, Some(details)) => json!({ "details": details }),
        (message, _) => message,
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// A reported `httpStatusCode` outside the HTTP status range reads as 500,
/// the status the response is then sent with.
fn code_field(value: &Value) -> Option<u16> {
    let code = match value.get("httpStatusCode")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    match u16::try_from(code) {
        Ok(code @ 100..=599) => Some(code),
        _ => Some(500),
    }
}
