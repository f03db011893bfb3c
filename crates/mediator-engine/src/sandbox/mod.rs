//! Sandboxed executor.
//!
//! Each run gets a fresh QuickJS runtime with a memory cap, a stack cap and
//! an interrupt deadline. Globals outside the allow-list are deleted before
//! the helper builders, the adaptor's builders and `state` are installed.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Sandbox::run(unit, state, adaptor)           │
//! │   1. refuse units carrying compile errors    │
//! │   2. open scope (limits + deadline)          │
//! │   3. scrub globals, install bindings, state  │
//! │   4. evaluate unit → plan → Pipeline         │
//! │   5. run pipeline until the same deadline    │
//! └──────────────────────────────────────────────┘
//! ```

mod prelude;
mod scope;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adaptor::Adaptor;
use crate::compiler::CompiledUnit;
use crate::error::{EngineError, EngineResult};
use crate::state::State;

pub(crate) use scope::ScriptScope;

/// Limits applied to every sandboxed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock budget for a whole run, collaborator calls included
    pub timeout_ms: u64,
    /// Memory limit per context in megabytes
    pub memory_limit_mb: usize,
    /// Maximum stack size in kilobytes
    pub max_stack_size_kb: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            memory_limit_mb: 32,
            max_stack_size_kb: 512,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run a compiled unit against `state` with `adaptor`'s builders in scope.
    ///
    /// Units with compile errors are refused before any context exists.
    /// Errors raised by operations are returned unchanged; exceeding the
    /// time limit yields `Timeout` and drops whatever was in flight.
    pub async fn run(
        &self,
        unit: &CompiledUnit,
        state: State,
        adaptor: &dyn Adaptor,
    ) -> EngineResult<State> {
        unit.ensure_runnable()?;

        let deadline = Instant::now() + self.config.timeout();
        let scope = ScriptScope::open(&self.config, deadline)?;
        scope.install(adaptor, &state)?;
        let (pipeline, bound) = scope.load_pipeline(unit, adaptor)?;
        debug!(
            adaptor = adaptor.name(),
            operations = pipeline.len(),
            "Pipeline loaded"
        );

        let initial = bound.unwrap_or(state);
        match tokio::time::timeout_at(deadline.into(), pipeline.run(initial)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.config.timeout_ms, "Job execution timed out");
                Err(EngineError::Timeout(self.config.timeout_ms))
            }
        }
    }
}
