//! OpenHIM job mediator.
//!
//! Receives events routed by the hub, checks the job trigger, runs the job
//! expression with the configured adaptor and answers with an OpenHIM
//! mediator response.

pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod observability;
pub mod openhim;
pub mod server;

pub use config::{AppConfig, JobConfig, MediatorConfig, OpenhimConfig};
pub use dispatcher::{Dispatcher, EventOrigin};
pub use handlers::AppState;
pub use observability::init_tracing;
pub use openhim::{OpenhimClient, OpenhimError, mediator_registration};
pub use server::{MediatorServer, ServerBuilder, build_app};
