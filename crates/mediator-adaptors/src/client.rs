//! HTTP transport shared by the adaptors.

use mediator_engine::{CollaboratorError, EngineResult};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use serde_json::{Map, Value, json};
use tracing::debug;

/// Basic-auth credentials for a collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Read `{ username, password }` from a JSON object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let username = value.get("username")?.as_str()?;
        let password = value
            .get("password")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self::new(username, password))
    }
}

/// A request to a collaborator.
#[derive(Debug, Clone)]
pub struct CollaboratorRequest {
    pub method: Method,
    pub url: String,
    pub credentials: Option<Credentials>,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Status codes counted as success; any 2xx when `None`.
    pub success_codes: Option<Vec<u16>>,
}

impl CollaboratorRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            credentials: None,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            success_codes: None,
        }
    }

    pub fn credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    fn accepts(&self, status: u16) -> bool {
        match &self.success_codes {
            Some(codes) => codes.contains(&status),
            None => (200..300).contains(&status),
        }
    }
}

/// A collaborator response that passed the success check.
#[derive(Debug, Clone, PartialEq)]
pub struct CollaboratorResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Map<String, Value>,
    pub body: Value,
}

impl CollaboratorResponse {
    /// The record prepended to `state.references`.
    pub fn into_reference(self) -> Value {
        json!({
            "statusCode": self.status,
            "statusText": self.status_text,
            "headers": self.headers,
            "body": self.body,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollaboratorClient {
    http: Client,
}

impl CollaboratorClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Send `request`. Transport failures and rejected statuses become
    /// [`CollaboratorError`]s; rejected responses keep their parsed body.
    pub async fn send(&self, request: CollaboratorRequest) -> EngineResult<CollaboratorResponse> {
        let mut builder = self
            .http
            .request(request.method.clone(), &request.url)
            .header("Accept", "application/json");

        if let Some(credentials) = &request.credentials {
            builder = builder.basic_auth(&credentials.username, credentials.password.as_ref());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(method = %request.method, url = %request.url, "Calling collaborator");
        let response = builder.send().await.map_err(|e| {
            CollaboratorError::new(format!("{} {} failed: {e}", request.method, request.url))
        })?;

        let status = response.status();
        let headers = header_map(response.headers());
        let text = response.text().await.map_err(|e| {
            CollaboratorError::new(format!(
                "{} {} returned an unreadable body: {e}",
                request.method, request.url
            ))
            .with_status(status.as_u16())
        })?;
        let body = parse_body(&text);

        if !request.accepts(status.as_u16()) {
            return Err(CollaboratorError::from_response(
                request.method.as_str(),
                &request.url,
                status.as_u16(),
                body,
            )
            .into());
        }

        debug!(method = %request.method, url = %request.url, status = status.as_u16(), "Collaborator responded");
        Ok(CollaboratorResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

/// JSON when the body parses, the raw text otherwise, `null` when empty.
pub fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Flatten a JSON object into query pairs. Arrays repeat their key.
pub fn query_pairs(value: &Value) -> Vec<(String, String)> {
    let Some(object) = value.as_object() else {
        return Vec::new();
    };
    let mut pairs = Vec::new();
    for (key, value) in object {
        match value {
            Value::Array(items) => {
                for item in items {
                    if let Some(rendered) = scalar(item) {
                        pairs.push((key.clone(), rendered));
                    }
                }
            }
            other => {
                if let Some(rendered) = scalar(other) {
                    pairs.push((key.clone(), rendered));
                }
            }
        }
    }
    pairs
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        nested => Some(nested.to_string()),
    }
}

fn header_map(headers: &HeaderMap) -> Map<String, Value> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), Value::from(v)))
        })
        .collect()
}
