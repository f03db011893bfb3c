//! Inbound event dispatch: trigger, configuration injection, compile, run,
//! classify.

use std::sync::Arc;

use arc_swap::ArcSwap;
use mediator_engine::state::CONFIGURATION;
use mediator_engine::{
    AdaptorRegistry, AllowList, Compiler, EngineResult, MediatorResponse, ResponseEnvelope,
    Sandbox, SandboxConfig, State, TriggerEvaluator, classify,
};
use serde_json::{Value, json};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{JobConfig, MediatorConfig};

pub const TRIGGER_NOT_ACTIVATED: &str = "Trigger did not activate, no action was performed.";

/// Where an event came from, echoed back in rejection messages.
#[derive(Debug, Clone)]
pub struct EventOrigin {
    pub url: String,
    pub method: String,
}

pub struct Dispatcher {
    job: Arc<ArcSwap<JobConfig>>,
    registry: AdaptorRegistry,
    sandbox: Sandbox,
    trigger: TriggerEvaluator,
    mediator: MediatorConfig,
    http: reqwest::Client,
}

impl Dispatcher {
    pub fn new(
        job: Arc<ArcSwap<JobConfig>>,
        registry: AdaptorRegistry,
        sandbox: SandboxConfig,
        mediator: MediatorConfig,
        http: reqwest::Client,
    ) -> Self {
        Self {
            job,
            registry,
            trigger: TriggerEvaluator::new(sandbox.clone()),
            sandbox: Sandbox::new(sandbox),
            mediator,
            http,
        }
    }

    pub fn mediator(&self) -> &MediatorConfig {
        &self.mediator
    }

    /// Handle one inbound event against the current job configuration.
    pub async fn dispatch(&self, body: Value, origin: EventOrigin) -> MediatorResponse {
        let execution_id = Uuid::new_v4();
        let job = self.job.load_full();
        let span = info_span!(
            "dispatch",
            execution_id = %execution_id,
            language = %job.job.language
        );
        let envelope = self.run(&job, body, origin).instrument(span).await;
        self.respond(&envelope)
    }

    /// Wrap an envelope in this mediator's response.
    pub fn respond(&self, envelope: &ResponseEnvelope) -> MediatorResponse {
        MediatorResponse::from_envelope(&self.mediator.urn, &self.mediator.route_name, envelope)
    }

    async fn run(&self, job: &JobConfig, body: Value, origin: EventOrigin) -> ResponseEnvelope {
        let state = match initial_state(job, body) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Inbound body is not a state object");
                return classify(&Err(e));
            }
        };

        if !self.trigger.evaluate(&job.trigger, &state) {
            info!(url = %origin.url, "Trigger did not activate");
            return ResponseEnvelope::failed(
                409,
                json!({
                    "message": TRIGGER_NOT_ACTIVATED,
                    "url": origin.url,
                    "method": origin.method,
                }),
                Value::Null,
            );
        }
        info!("Event triggered");

        let Some(adaptor) = self.registry.get(&job.job.language) else {
            error!(available = ?self.registry.languages(), "No adaptor for job language");
            return ResponseEnvelope::failed(
                500,
                format!("Unknown job language `{}`", job.job.language),
                Value::Null,
            );
        };

        let state = state.with(
            CONFIGURATION,
            json!({
                "username": job.server.user,
                "password": job.server.password,
                "hostUrl": job.server.url,
            }),
        );

        let unit = Compiler::new(AllowList::for_adaptor(adaptor.as_ref())).compile(&job.job.expression);
        for compile_error in unit.errors() {
            warn!(
                line = compile_error.line,
                column = compile_error.column,
                message = %compile_error.message,
                "Expression rejected"
            );
        }

        let outcome = self.sandbox.run(&unit, state, adaptor.as_ref()).await;
        self.report(&outcome);

        if let (Ok(state), Some(next)) = (&outcome, job.next_mediator.as_deref()) {
            self.forward(next, state.clone());
        }
        classify(&outcome)
    }

    fn report(&self, outcome: &EngineResult<State>) {
        match outcome {
            Ok(state) => {
                info!(references = state.references().len(), "Job completed");
                debug!(state = %serde_json::Value::from(state.clone()), "Final state");
            }
            Err(e) => {
                error!(error = %e, "Job failed");
                if let Some(payload) = e.payload() {
                    debug!(payload = %payload, "Failure payload");
                }
            }
        }
    }

    /// POST the final state to the next mediator without waiting for it.
    fn forward(&self, next: &str, state: State) {
        let url = if next.starts_with("http://") || next.starts_with("https://") {
            next.to_string()
        } else {
            format!(
                "{}/{}",
                self.mediator.forward_base_url.trim_end_matches('/'),
                next.trim_start_matches('/')
            )
        };
        let http = self.http.clone();
        info!(url = %url, "Routing towards next mediator");
        tokio::spawn(
            async move {
                match http.post(&url).json(&state).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!(status = response.status().as_u16(), "Next mediator accepted state");
                    }
                    Ok(response) => {
                        warn!(status = response.status().as_u16(), "Next mediator rejected state");
                    }
                    Err(e) => warn!(error = %e, "Failed to reach next mediator"),
                }
            }
            .in_current_span(),
        );
    }
}

/// `{ data: body }` for the first mediator in a chain; the body itself
/// otherwise.
fn initial_state(job: &JobConfig, body: Value) -> EngineResult<State> {
    if job.first_mediator {
        Ok(State::new().with(mediator_engine::state::DATA, body))
    } else {
        State::from_value(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let mut job = JobConfig::default();
        let state = initial_state(&job, json!({"form": 1})).unwrap();
        assert_eq!(state.into_value(), json!({"data": {"form": 1}}));

        job.first_mediator = false;
        let state = initial_state(&job, json!({"data": 2, "references": []})).unwrap();
        assert_eq!(state.into_value(), json!({"data": 2, "references": []}));
        assert!(initial_state(&job, json!([1])).is_err());
    }
}
