use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{OriginalUri, State},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use mediator_engine::{MEDIATOR_CONTENT_TYPE, MediatorResponse, ResponseEnvelope};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::error;

use crate::dispatcher::{Dispatcher, EventOrigin};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Inbound events routed by the hub.
pub async fn handle_event(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Response {
    let origin = EventOrigin {
        url: uri.to_string(),
        method: method.to_string(),
    };
    let body = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(body) => body,
            Err(e) => {
                let envelope = ResponseEnvelope::failed(
                    400,
                    json!({
                        "message": format!("Request body is not valid JSON: {e}"),
                        "url": origin.url,
                        "method": origin.method,
                    }),
                    Value::Null,
                );
                return openhim_response(state.dispatcher.respond(&envelope));
            }
        }
    };

    openhim_response(state.dispatcher.dispatch(body, origin).await)
}

/// Any other endpoint and method combination.
pub async fn not_found(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
) -> Response {
    error!(url = %uri, method = %method, "Endpoint and method combination not found");
    let envelope = ResponseEnvelope::failed(
        404,
        json!({
            "message": "Combination not found",
            "url": uri.to_string(),
            "method": method.to_string(),
        }),
        Value::Null,
    );
    openhim_response(state.dispatcher.respond(&envelope))
}

fn openhim_response(response: MediatorResponse) -> Response {
    let status =
        StatusCode::from_u16(response.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, MEDIATOR_CONTENT_TYPE)],
        Json(response),
    )
        .into_response()
}
