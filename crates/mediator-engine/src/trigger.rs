//! Trigger evaluation.

use std::time::Instant;

use tracing::{debug, warn};

use crate::error::EngineResult;
use crate::sandbox::{SandboxConfig, ScriptScope};
use crate::state::State;

/// Evaluates trigger expressions in their own minimal context, where only
/// the built-in globals and `state` are visible.
#[derive(Debug, Clone, Default)]
pub struct TriggerEvaluator {
    config: SandboxConfig,
}

impl TriggerEvaluator {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Whether `expression` holds for `state`.
    ///
    /// Any failure (syntax error, thrown exception, timeout) counts as
    /// `false` and is logged rather than returned.
    pub fn evaluate(&self, expression: &str, state: &State) -> bool {
        if expression.trim().is_empty() {
            debug!("Empty trigger expression, not dispatching");
            return false;
        }
        match self.try_evaluate(expression, state) {
            Ok(fired) => {
                debug!(fired, "Trigger evaluated");
                fired
            }
            Err(e) => {
                warn!(error = %e, trigger = %expression, "Trigger evaluation failed, treating as false");
                false
            }
        }
    }

    fn try_evaluate(&self, expression: &str, state: &State) -> EngineResult<bool> {
        let deadline = Instant::now() + self.config.timeout();
        let scope = ScriptScope::open(&self.config, deadline)?;
        scope.install_minimal(state)?;
        scope.eval_truthy(expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> State {
        State::from_value(json!({
            "data": {"form": {"@name": "Case Registration", "age": "12"}}
        }))
        .unwrap()
    }

    fn evaluator() -> TriggerEvaluator {
        TriggerEvaluator::new(SandboxConfig {
            timeout_ms: 200,
            ..Default::default()
        })
    }

    #[test]
    fn test_matching_trigger() {
        assert!(evaluator().evaluate("state.data.form['@name'] === 'Case Registration'", &state()));
        assert!(!evaluator().evaluate("state.data.form['@name'] === 'Other'", &state()));
    }

    #[test]
    fn test_truthiness() {
        let e = evaluator();
        assert!(e.evaluate("state.data.form.age", &state()));
        assert!(!e.evaluate("''", &state()));
        assert!(!e.evaluate("0", &state()));
        assert!(!e.evaluate("state.data.missing", &state()));
        assert!(e.evaluate("parseInt(state.data.form.age, 10) > 10", &state()));
    }

    #[test]
    fn test_malformed_trigger_is_false() {
        assert!(!evaluator().evaluate("state.data.form[", &state()));
    }

    #[test]
    fn test_throwing_trigger_is_false() {
        assert!(!evaluator().evaluate("state.nothing.here === 1", &state()));
        assert!(!evaluator().evaluate("(function () { throw new Error('x'); })()", &state()));
    }

    #[test]
    fn test_runaway_trigger_is_false() {
        assert!(!evaluator().evaluate("while (true) {}", &state()));
    }

    #[test]
    fn test_only_state_is_visible() {
        assert!(evaluator().evaluate("typeof execute === 'undefined'", &state()));
        assert!(evaluator().evaluate("typeof eval === 'undefined'", &state()));
    }
}
