//! OpenHIM core API client: mediator registration and heartbeat.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, JobConfig, OpenhimConfig};

#[derive(Debug, Error)]
pub enum OpenhimError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OpenHIM rejected {action} ({status}): {body}")]
    Rejected {
        action: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("Invalid mediator config from OpenHIM: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}

pub struct OpenhimClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    urn: String,
}

impl OpenhimClient {
    pub fn new(config: &OpenhimConfig, urn: impl Into<String>) -> Result<Self, OpenhimError> {
        let http = Client::builder()
            .danger_accept_invalid_certs(config.trust_self_signed)
            .build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            urn: urn.into(),
        })
    }

    /// `POST /mediators` with the mediator description.
    pub async fn register(&self, registration: &Value) -> Result<(), OpenhimError> {
        let response = self
            .http
            .post(format!("{}/mediators", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .json(registration)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OpenhimError::Rejected {
                action: "registration",
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        info!(urn = %self.urn, "Successfully registered mediator");
        Ok(())
    }

    /// Post a heartbeat. Returns the job configuration when the hub sends
    /// one back.
    pub async fn heartbeat(
        &self,
        uptime_secs: f64,
        force_config: bool,
    ) -> Result<Option<JobConfig>, OpenhimError> {
        let mut body = json!({ "uptime": uptime_secs });
        if force_config {
            body["config"] = Value::Bool(true);
        }
        let response = self
            .http
            .post(format!("{}/mediators/{}/heartbeat", self.base_url, self.urn))
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(OpenhimError::Rejected {
                action: "heartbeat",
                status,
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str::<Value>(&text)? {
            Value::Object(config) if !config.is_empty() => {
                Ok(Some(serde_json::from_value(Value::Object(config))?))
            }
            _ => Ok(None),
        }
    }
}

/// Mediator description sent on registration.
///
/// `languages` become the options of the `job.language` config parameter.
pub fn mediator_registration(cfg: &AppConfig, languages: &[String]) -> Value {
    let mediator = &cfg.mediator;
    let port = cfg.server.port;
    json!({
        "urn": mediator.urn,
        "version": mediator.version,
        "name": mediator.name,
        "description": mediator.description,
        "defaultChannelConfig": [{
            "name": mediator.route_name,
            "urlPattern": mediator.url_pattern,
            "type": "http",
            "allow": ["admin"],
            "methods": ["POST"],
            "routes": [{
                "name": mediator.route_name,
                "host": mediator.container_name,
                "port": port,
                "primary": true,
                "type": "http"
            }]
        }],
        "endpoints": [{
            "name": mediator.route_name,
            "host": mediator.container_name,
            "path": mediator.endpoint_path(),
            "port": port,
            "primary": true,
            "type": "http"
        }],
        "configDefs": [
            { "param": "trigger", "displayName": "Trigger", "type": "string" },
            {
                "param": "server",
                "displayName": "Collaborator server",
                "type": "struct",
                "template": [
                    { "param": "user", "displayName": "User", "type": "string" },
                    { "param": "password", "displayName": "Password", "type": "password" },
                    { "param": "url", "displayName": "URL", "type": "string" }
                ]
            },
            {
                "param": "job",
                "displayName": "Job",
                "type": "struct",
                "template": [
                    { "param": "expression", "displayName": "Expression", "type": "bigstring" },
                    { "param": "language", "displayName": "Language", "type": "option", "values": languages }
                ]
            },
            { "param": "first_mediator", "displayName": "First mediator", "type": "bool" },
            { "param": "nxt_mediator", "displayName": "Next mediator", "type": "string" }
        ],
        "config": cfg.job
    })
}

/// Register, fetch the hub's job configuration, then keep sending
/// heartbeats. Configuration returned by the hub replaces `job`.
pub async fn run(
    client: OpenhimClient,
    registration: Value,
    job: Arc<ArcSwap<JobConfig>>,
    interval: std::time::Duration,
) {
    let started = Instant::now();
    if let Err(e) = client.register(&registration).await {
        error!(error = %e, "Failed to register mediator");
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    let mut force_config = true;
    loop {
        ticker.tick().await;
        match client
            .heartbeat(started.elapsed().as_secs_f64(), force_config)
            .await
        {
            Ok(Some(config)) => {
                info!(language = %config.job.language, "Job configuration updated by OpenHIM");
                job.store(Arc::new(config));
                force_config = false;
            }
            Ok(None) => {
                debug!("Heartbeat acknowledged");
                force_config = false;
            }
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }
    }
}
