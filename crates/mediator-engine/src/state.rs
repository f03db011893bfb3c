//! The record threaded through a pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};

pub const CONFIGURATION: &str = "configuration";
pub const DATA: &str = "data";
pub const REFERENCES: &str = "references";

/// Mapping from string keys to arbitrary JSON values.
///
/// `configuration`, `data` and `references` are reserved. Once the pipeline
/// initializer has run, `data` and `references` are always present.
/// Operations never mutate a state in place; they consume one and return the
/// next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(Map<String, Value>);

impl State {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a state from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> EngineResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(EngineError::invalid_state(format!(
                "expected an object, got {}",
                type_name(&other)
            ))),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Return a copy of this state with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    /// The current payload, `null` when absent.
    pub fn data(&self) -> &Value {
        self.0.get(DATA).unwrap_or(&Value::Null)
    }

    pub fn configuration(&self) -> Option<&Map<String, Value>> {
        self.0.get(CONFIGURATION).and_then(Value::as_object)
    }

    /// Look up a string entry of `configuration`.
    pub fn configuration_str(&self, key: &str) -> Option<&str> {
        self.configuration()
            .and_then(|config| config.get(key))
            .and_then(Value::as_str)
    }

    /// Prior call results, most recent first.
    pub fn references(&self) -> &[Value] {
        self.0
            .get(REFERENCES)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn latest_reference(&self) -> Option<&Value> {
        self.references().first()
    }

    /// Apply the pipeline initializer: `references = []` and `data = null`
    /// unless the caller already supplied them.
    pub fn with_defaults(mut self) -> Self {
        if !self.0.contains_key(REFERENCES) {
            self.0.insert(REFERENCES.to_string(), Value::Array(Vec::new()));
        }
        if !self.0.contains_key(DATA) {
            self.0.insert(DATA.to_string(), Value::Null);
        }
        self
    }

    /// Prepend a call result to `references`.
    pub fn push_reference(mut self, reference: Value) -> Self {
        let mut references = match self.0.remove(REFERENCES) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        };
        references.insert(0, reference);
        self.0.insert(REFERENCES.to_string(), Value::Array(references));
        self
    }
}

impl From<Map<String, Value>> for State {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<State> for Value {
    fn from(state: State) -> Self {
        state.into_value()
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> State {
        State::from_value(value).unwrap()
    }

    #[test]
    fn test_defaults_fill_missing_reserved_keys() {
        let s = state(json!({"form": {"name": "a"}})).with_defaults();
        assert_eq!(
            s.into_value(),
            json!({"form": {"name": "a"}, "references": [], "data": null})
        );
    }

    #[test]
    fn test_defaults_keep_caller_values() {
        let input = json!({"references": [1], "data": {"x": 1}});
        let s = state(input.clone()).with_defaults();
        assert_eq!(s.into_value(), input);
    }

    #[test]
    fn test_push_reference_prepends() {
        let s = State::new()
            .with_defaults()
            .push_reference(json!("first"))
            .push_reference(json!("second"));
        assert_eq!(s.references(), &[json!("second"), json!("first")]);
        assert_eq!(s.latest_reference(), Some(&json!("second")));
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        let err = State::from_value(json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_configuration_lookup() {
        let s = state(json!({"configuration": {"hostUrl": "http://dhis2"}}));
        assert_eq!(s.configuration_str("hostUrl"), Some("http://dhis2"));
        assert_eq!(s.configuration_str("username"), None);
        assert_eq!(s.data(), &Value::Null);
    }
}
