use std::{env, sync::Arc};

use arc_swap::ArcSwap;
use mediator_adaptors::CollaboratorClient;
use mediator_server::config::loader::{DEFAULT_CONFIG_FILE, load_config};
use mediator_server::{OpenhimClient, ServerBuilder, mediator_registration, openhim};

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    CliArgument,
    EnvironmentVariable,
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (JOB_MEDIATOR_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    mediator_server::observability::init_tracing();

    let (config_path, source) = resolve_config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(
        path = %config_path,
        source = %source,
        "Configuration loaded"
    );
    mediator_server::observability::apply_logging_level(&cfg.logging.level);

    let http = reqwest::Client::new();
    let registry = mediator_adaptors::registry(CollaboratorClient::new(http.clone()));
    let job = Arc::new(ArcSwap::from_pointee(cfg.job.clone()));

    if cfg.openhim.register {
        match OpenhimClient::new(&cfg.openhim, cfg.mediator.urn.clone()) {
            Ok(client) => {
                let registration = mediator_registration(&cfg, &registry.languages());
                tokio::spawn(openhim::run(
                    client,
                    registration,
                    job.clone(),
                    cfg.openhim.heartbeat_interval(),
                ));
            }
            Err(e) => tracing::error!(error = %e, "OpenHIM client initialization failed"),
        }
    } else {
        tracing::info!("OpenHIM registration disabled");
    }

    let server = ServerBuilder::new()
        .with_config(cfg)
        .with_registry(registry)
        .with_job(job)
        .with_http_client(http)
        .build();

    if let Err(err) = server.run().await {
        eprintln!("Server error: {err}");
        std::process::exit(1);
    }
}

/// Configuration file path and where it came from: `--config <path>` or
/// `--config=<path>`, then `JOB_MEDIATOR_CONFIG`, then `job-mediator.toml`.
fn resolve_config_path() -> (String, ConfigSource) {
    if let Some(path) = config_argument(env::args().skip(1)) {
        return (path, ConfigSource::CliArgument);
    }
    match env::var("JOB_MEDIATOR_CONFIG") {
        Ok(path) if !path.is_empty() => (path, ConfigSource::EnvironmentVariable),
        _ => (DEFAULT_CONFIG_FILE.to_string(), ConfigSource::Default),
    }
}

fn config_argument(mut args: impl Iterator<Item = String>) -> Option<String> {
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_config_argument_forms() {
        assert_eq!(config_argument(args(&["--config", "a.toml"])), Some("a.toml".into()));
        assert_eq!(config_argument(args(&["-v", "--config=b.toml"])), Some("b.toml".into()));
        assert_eq!(config_argument(args(&["--config"])), None);
        assert_eq!(config_argument(args(&[])), None);
    }
}
