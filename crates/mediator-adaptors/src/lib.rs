//! Collaborator adaptors for the job mediator.
//!
//! - [`HttpAdaptor`] (`language-http`): generic REST calls
//! - [`Dhis2Adaptor`] (`language-dhis2`): DHIS2 tracker and aggregate APIs

pub mod client;
pub mod dhis2;
pub mod http;

use std::sync::Arc;

use mediator_engine::AdaptorRegistry;

pub use client::{CollaboratorClient, CollaboratorRequest, CollaboratorResponse, Credentials};
pub use dhis2::Dhis2Adaptor;
pub use http::HttpAdaptor;

/// Registry holding every adaptor in this crate, sharing one HTTP client.
pub fn registry(client: CollaboratorClient) -> AdaptorRegistry {
    AdaptorRegistry::new()
        .with(Arc::new(HttpAdaptor::new(client.clone())))
        .with(Arc::new(Dhis2Adaptor::new(client)))
}
