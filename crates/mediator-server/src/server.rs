use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{
    Router,
    routing::{get, post},
};
use mediator_adaptors::CollaboratorClient;
use mediator_engine::AdaptorRegistry;
use tower_http::trace::TraceLayer;

use crate::config::{AppConfig, JobConfig};
use crate::dispatcher::Dispatcher;
use crate::handlers::{self, AppState};

pub struct MediatorServer {
    addr: SocketAddr,
    app: Router,
}

pub fn build_app(cfg: &AppConfig, state: AppState) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route(&cfg.mediator.endpoint_path(), post(handlers::handle_event))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http.request",
                    http.method = %req.method(),
                    http.target = %req.uri(),
                )
            }),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    registry: Option<AdaptorRegistry>,
    job: Option<Arc<ArcSwap<JobConfig>>>,
    http: reqwest::Client,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            registry: None,
            job: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub fn with_registry(mut self, registry: AdaptorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Share the live job configuration, e.g. with the heartbeat task.
    pub fn with_job(mut self, job: Arc<ArcSwap<JobConfig>>) -> Self {
        self.job = Some(job);
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// The router without a bound listener.
    pub fn build_router(self) -> Router {
        let registry = self
            .registry
            .unwrap_or_else(|| mediator_adaptors::registry(CollaboratorClient::new(self.http.clone())));
        let job = self
            .job
            .unwrap_or_else(|| Arc::new(ArcSwap::from_pointee(self.config.job.clone())));
        let dispatcher = Dispatcher::new(
            job,
            registry,
            self.config.sandbox.clone(),
            self.config.mediator.clone(),
            self.http,
        );
        build_app(
            &self.config,
            AppState {
                dispatcher: Arc::new(dispatcher),
            },
        )
    }

    pub fn build(self) -> MediatorServer {
        let addr = self.addr;
        MediatorServer {
            addr,
            app: self.build_router(),
        }
    }
}

impl MediatorServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
