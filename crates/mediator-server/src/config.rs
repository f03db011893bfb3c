use std::net::SocketAddr;
use std::time::Duration;

use mediator_engine::SandboxConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Limits for trigger and expression evaluation
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// How this mediator describes itself to the hub
    #[serde(default)]
    pub mediator: MediatorConfig,
    /// OpenHIM core API connection
    #[serde(default)]
    pub openhim: OpenhimConfig,
    /// Initial job; replaced at runtime by configuration pushed from the hub
    #[serde(default)]
    pub job: JobConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        if self.sandbox.timeout_ms == 0 {
            return Err("sandbox.timeout_ms must be > 0".into());
        }
        if self.sandbox.memory_limit_mb == 0 || self.sandbox.max_stack_size_kb == 0 {
            return Err("sandbox memory and stack limits must be > 0".into());
        }
        if !self.mediator.url_pattern.trim_start_matches('^').starts_with('/') {
            return Err("mediator.url_pattern must start with `/` or `^/`".into());
        }
        if self.mediator.urn.is_empty() {
            return Err("mediator.urn must not be empty".into());
        }
        if self.openhim.register {
            url::Url::parse(&self.openhim.url)
                .map_err(|e| format!("openhim.url is not a valid URL: {e}"))?;
            if self.openhim.heartbeat_interval_secs == 0 {
                return Err("openhim.heartbeat_interval_secs must be > 0".into());
            }
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    4321
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediatorConfig {
    #[serde(default = "default_urn")]
    pub urn: String,
    #[serde(default = "default_mediator_name")]
    pub name: String,
    #[serde(default = "default_mediator_name")]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Host name the hub uses to reach this mediator
    #[serde(default = "default_container_name")]
    pub container_name: String,
    /// Channel URL pattern; the route path is derived from it
    #[serde(default = "default_url_pattern")]
    pub url_pattern: String,
    #[serde(default = "default_route_name")]
    pub route_name: String,
    /// Base for `job.next_mediator` values given as a bare path
    #[serde(default = "default_forward_base_url")]
    pub forward_base_url: String,
}

fn default_urn() -> String {
    "urn:mediator:skeleton-production-mediator".into()
}
fn default_mediator_name() -> String {
    "Skeleton Production Bootstrap Mediator".into()
}
fn default_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}
fn default_container_name() -> String {
    "mediator-default".into()
}
fn default_url_pattern() -> String {
    "^/defaultEndpoint".into()
}
fn default_route_name() -> String {
    "Production Route".into()
}
fn default_forward_base_url() -> String {
    "http://mediator:4321".into()
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            urn: default_urn(),
            name: default_mediator_name(),
            description: default_mediator_name(),
            version: default_version(),
            container_name: default_container_name(),
            url_pattern: default_url_pattern(),
            route_name: default_route_name(),
            forward_base_url: default_forward_base_url(),
        }
    }
}

impl MediatorConfig {
    /// Route path served for inbound events, e.g. `^/defaultEndpoint` → `/defaultEndpoint`.
    pub fn endpoint_path(&self) -> String {
        let path = self
            .url_pattern
            .trim_start_matches('^')
            .trim_end_matches('$');
        if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenhimConfig {
    #[serde(default = "default_openhim_url")]
    pub url: String,
    #[serde(default = "default_openhim_username")]
    pub username: String,
    #[serde(default = "default_openhim_password")]
    pub password: String,
    /// Accept self-signed certificates from the hub
    #[serde(default)]
    pub trust_self_signed: bool,
    /// Register with the hub and send heartbeats
    #[serde(default)]
    pub register: bool,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_openhim_url() -> String {
    "https://localhost:8080".into()
}
fn default_openhim_username() -> String {
    "root@openhim.org".into()
}
fn default_openhim_password() -> String {
    "openhim-password".into()
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}

impl Default for OpenhimConfig {
    fn default() -> Self {
        Self {
            url: default_openhim_url(),
            username: default_openhim_username(),
            password: default_openhim_password(),
            trust_self_signed: false,
            register: false,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl OpenhimConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// The job a mediator runs: when to fire, what to run, and against which
/// collaborator. Field names follow the hub's mediator config definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Script predicate over `state`
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub job: JobSpec,
    #[serde(default)]
    pub server: CollaboratorServer,
    /// `true`: the inbound body becomes `state.data`; `false`: it is the state
    #[serde(default = "default_first_mediator")]
    pub first_mediator: bool,
    /// Where to send the final state next, if anywhere
    #[serde(
        default,
        rename = "nxt_mediator",
        alias = "next_mediator",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_mediator: Option<String>,
}

fn default_first_mediator() -> bool {
    true
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            trigger: String::new(),
            job: JobSpec::default(),
            server: CollaboratorServer::default(),
            first_mediator: default_first_mediator(),
            next_mediator: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Adaptor name, e.g. `language-dhis2`
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub expression: String,
}

/// Collaborator instance injected as `state.configuration`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorServer {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub url: String,
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_FILE: &str = "job-mediator.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., MEDIATOR__SERVER__PORT=4322
        builder = builder.add_source(
            Environment::with_prefix("MEDIATOR")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.server.port, 4321);
        assert_eq!(cfg.mediator.endpoint_path(), "/defaultEndpoint");
        assert!(cfg.job.first_mediator);
        assert_eq!(cfg.openhim.heartbeat_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_endpoint_path() {
        let mut mediator = MediatorConfig::default();
        mediator.url_pattern = "^/events$".into();
        assert_eq!(mediator.endpoint_path(), "/events");
        mediator.url_pattern = "/".into();
        assert_eq!(mediator.endpoint_path(), "/");
    }

    #[test]
    fn test_job_config_accepts_hub_field_names() {
        let job: JobConfig = serde_json::from_value(serde_json::json!({
            "trigger": "true",
            "job": {"language": "language-dhis2", "expression": "event({})"},
            "server": {"user": "admin", "password": "district", "url": "https://dhis2"},
            "first_mediator": false,
            "nxt_mediator": "/second"
        }))
        .unwrap();
        assert_eq!(job.next_mediator.as_deref(), Some("/second"));
        assert!(!job.first_mediator);
        assert_eq!(job.server.user, "admin");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.mediator.url_pattern = "defaultEndpoint".into();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.openhim.register = true;
        cfg.openhim.url = "not a url".into();
        assert!(cfg.validate().is_err());
    }
}
