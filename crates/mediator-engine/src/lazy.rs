//! Lazy values and the reference resolver.
//!
//! Operation arguments may contain values that are functions of the current
//! state. They are kept as [`LazyValue::Deferred`] until the operation is
//! about to issue its collaborator call, at which point the whole argument
//! tree is resolved depth-first against the state the operation received.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::state::State;

/// Deferred values may return further deferred values; this bounds the chain.
const MAX_RESOLVE_DEPTH: usize = 64;

/// A function of state producing another (possibly lazy) value.
pub trait Deferred: Send + Sync {
    fn evaluate(&self, state: &State) -> EngineResult<LazyValue>;
}

struct FnDeferred<F>(F);

impl<F> Deferred for FnDeferred<F>
where
    F: Fn(&State) -> EngineResult<LazyValue> + Send + Sync,
{
    fn evaluate(&self, state: &State) -> EngineResult<LazyValue> {
        (self.0)(state)
    }
}

#[derive(Clone)]
pub enum LazyValue {
    Literal(Value),
    Deferred(Arc<dyn Deferred>),
    Object(IndexMap<String, LazyValue>),
    Array(Vec<LazyValue>),
}

impl LazyValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn deferred<F>(f: F) -> Self
    where
        F: Fn(&State) -> EngineResult<LazyValue> + Send + Sync + 'static,
    {
        Self::Deferred(Arc::new(FnDeferred(f)))
    }

    /// Lazy lookup of a dotted path (`data.form.name`, `references[0].body`).
    pub fn path(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::deferred(move |state| {
            Ok(LazyValue::Literal(
                lookup_path(&state.clone().into_value(), &path).unwrap_or(Value::Null),
            ))
        })
    }

    /// Resolve every deferred value against `state`.
    ///
    /// Objects and arrays are rebuilt with their literal members untouched;
    /// resolving an already literal value returns it unchanged.
    pub fn resolve(&self, state: &State) -> EngineResult<Value> {
        self.resolve_at(state, 0)
    }

    /// `chain` counts deferred hops only; plain nesting is unbounded.
    fn resolve_at(&self, state: &State, chain: usize) -> EngineResult<Value> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Deferred(deferred) => {
                if chain >= MAX_RESOLVE_DEPTH {
                    return Err(EngineError::invalid_state(
                        "lazy value did not settle (deferred chain too deep)",
                    ));
                }
                deferred.evaluate(state)?.resolve_at(state, chain + 1)
            }
            Self::Object(fields) => {
                let mut resolved = Map::with_capacity(fields.len());
                for (key, value) in fields {
                    resolved.insert(key.clone(), value.resolve_at(state, chain)?);
                }
                Ok(Value::Object(resolved))
            }
            Self::Array(items) => items
                .iter()
                .map(|item| item.resolve_at(state, chain))
                .collect::<EngineResult<Vec<_>>>()
                .map(Value::Array),
        }
    }
}

impl fmt::Debug for LazyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
            Self::Object(fields) => f.debug_map().entries(fields.iter()).finish(),
            Self::Array(items) => f.debug_list().entries(items.iter()).finish(),
        }
    }
}

impl From<Value> for LazyValue {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl FromIterator<(String, LazyValue)> for LazyValue {
    fn from_iter<I: IntoIterator<Item = (String, LazyValue)>>(iter: I) -> Self {
        Self::Object(iter.into_iter().collect())
    }
}

/// Read a `$.`-rooted, dotted and indexed path out of a JSON value.
pub fn lookup_path(root: &Value, path: &str) -> Option<Value> {
    let trimmed = path.trim_start_matches('$').trim_start_matches('.');
    let mut current = root;
    for segment in trimmed.split('.').filter(|s| !s.is_empty()) {
        let (key, indexes) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indexes
            .split(|c| c == '[' || c == ']')
            .filter(|s| !s.is_empty())
        {
            current = current.get(index.parse::<usize>().ok()?)?;
        }
    }
    Some(current.clone())
}
