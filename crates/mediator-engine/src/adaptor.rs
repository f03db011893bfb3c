//! Collaborator boundary: adaptors export operation builders that compiled
//! expressions may call.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::lazy::LazyValue;
use crate::operation::BoxedOperation;
use crate::pipeline::Pipeline;
use crate::state::State;

/// Helper builders every expression may call, whatever the adaptor.
pub const COMMON_HELPERS: &[&str] = &[
    "execute",
    "fn",
    "alterState",
    "combine",
    "each",
    "merge",
    "dataPath",
    "dataValue",
    "sourceValue",
    "lastReferenceValue",
    "field",
    "fields",
    "convertMultipleChoice",
    "checkAnswers",
    "convertToBoolean",
];

/// Built-in globals left visible inside the sandbox and callable from
/// expressions.
pub const SCRIPT_GLOBALS: &[&str] = &[
    "globalThis",
    "undefined",
    "NaN",
    "Infinity",
    "Object",
    "Array",
    "String",
    "Number",
    "Boolean",
    "Symbol",
    "Date",
    "RegExp",
    "Math",
    "JSON",
    "Map",
    "Set",
    "WeakMap",
    "WeakSet",
    "Promise",
    "Error",
    "TypeError",
    "RangeError",
    "SyntaxError",
    "ReferenceError",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "encodeURIComponent",
    "decodeURIComponent",
    "encodeURI",
    "decodeURI",
];

/// Pure script function an adaptor makes available next to its builders.
#[derive(Debug, Clone, Copy)]
pub struct ScriptHelper {
    pub name: &'static str,
    /// A complete `function <name>(...) { ... }` declaration.
    pub source: &'static str,
}

/// A collaborator module such as the DHIS2 or generic HTTP adaptor.
pub trait Adaptor: Send + Sync {
    /// Identifier referenced by `job.language`, e.g. `language-dhis2`.
    fn name(&self) -> &str;

    /// Names of the exported operation builders.
    fn operations(&self) -> &[&'static str];

    fn helpers(&self) -> &[ScriptHelper] {
        &[]
    }

    /// Build the operation `operation` closed over `args`.
    fn build(&self, operation: &str, args: Vec<LazyValue>) -> EngineResult<BoxedOperation>;

    /// Operations run ahead of every top-level pipeline.
    fn setup(&self) -> Vec<BoxedOperation> {
        Vec::new()
    }

    /// The adaptor's own `execute`: its setup followed by `operations`.
    fn execute(&self, operations: Vec<BoxedOperation>) -> Pipeline {
        let mut all = self.setup();
        all.extend(operations);
        Pipeline::new(all)
    }

    fn unknown(&self, operation: &str) -> EngineError {
        EngineError::UnknownOperation {
            adaptor: self.name().to_string(),
            operation: operation.to_string(),
        }
    }
}

/// Adaptors available to jobs, keyed by language name.
#[derive(Default, Clone)]
pub struct AdaptorRegistry {
    adaptors: HashMap<String, Arc<dyn Adaptor>>,
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adaptor: Arc<dyn Adaptor>) {
        self.adaptors.insert(adaptor.name().to_string(), adaptor);
    }

    pub fn with(mut self, adaptor: Arc<dyn Adaptor>) -> Self {
        self.register(adaptor);
        self
    }

    /// Look up an adaptor; `dhis2` and `language-dhis2` name the same one.
    pub fn get(&self, language: &str) -> Option<Arc<dyn Adaptor>> {
        self.adaptors
            .get(language)
            .or_else(|| self.adaptors.get(&format!("language-{language}")))
            .or_else(|| {
                language
                    .strip_prefix("language-")
                    .and_then(|short| self.adaptors.get(short))
            })
            .cloned()
    }

    pub fn languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adaptors.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Names an expression may invoke at call position.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    builders: BTreeSet<String>,
    helpers: BTreeSet<String>,
}

impl AllowList {
    pub fn for_adaptor(adaptor: &dyn Adaptor) -> Self {
        let mut list = Self::default();
        for name in adaptor.operations() {
            list.builders.insert((*name).to_string());
        }
        for helper in adaptor.helpers() {
            list.helpers.insert(helper.name.to_string());
        }
        for name in COMMON_HELPERS {
            list.helpers.insert((*name).to_string());
        }
        list
    }

    /// An allow-list made of explicit names plus the common helpers.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::default();
        list.builders.extend(names.into_iter().map(Into::into));
        list.helpers
            .extend(COMMON_HELPERS.iter().map(|name| (*name).to_string()));
        list
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains(name)
            || self.helpers.contains(name)
            || SCRIPT_GLOBALS.contains(&name)
    }

    pub fn is_builder(&self, name: &str) -> bool {
        self.builders.contains(name)
    }

    pub fn builders(&self) -> impl Iterator<Item = &str> {
        self.builders.iter().map(String::as_str)
    }
}

/// Positional arguments handed to an operation builder.
pub struct OperationArgs {
    operation: String,
    args: Vec<LazyValue>,
}

impl OperationArgs {
    pub fn new(operation: impl Into<String>, args: Vec<LazyValue>) -> Self {
        Self {
            operation: operation.into(),
            args,
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn required(&self, index: usize, name: &str) -> EngineResult<LazyValue> {
        self.optional(index).ok_or_else(|| {
            EngineError::invalid_argument(&self.operation, format!("missing argument `{name}`"))
        })
    }

    /// Argument at `index`, treating a literal `null` as absent.
    pub fn optional(&self, index: usize) -> Option<LazyValue> {
        match self.args.get(index) {
            None | Some(LazyValue::Literal(Value::Null)) => None,
            Some(value) => Some(value.clone()),
        }
    }

    /// Resolve an argument that must produce a string.
    pub fn resolve_string(value: &LazyValue, state: &State, operation: &str) -> EngineResult<String> {
        match value.resolve(state)? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(EngineError::invalid_argument(
                operation,
                format!("expected a string, got {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::sync_operation;

    struct Echo;

    impl Adaptor for Echo {
        fn name(&self) -> &str {
            "language-echo"
        }

        fn operations(&self) -> &[&'static str] {
            &["echo"]
        }

        fn build(&self, operation: &str, _args: Vec<LazyValue>) -> EngineResult<BoxedOperation> {
            match operation {
                "echo" => Ok(sync_operation("echo", Ok)),
                other => Err(self.unknown(other)),
            }
        }
    }

    #[test]
    fn test_registry_lookup_accepts_short_names() {
        let registry = AdaptorRegistry::new().with(Arc::new(Echo));
        assert!(registry.get("language-echo").is_some());
        assert!(registry.get("echo").is_some());
        assert!(registry.get("dhis2").is_none());
        assert_eq!(registry.languages(), vec!["language-echo".to_string()]);
    }

    #[test]
    fn test_allow_list_contents() {
        let list = AllowList::for_adaptor(&Echo);
        assert!(list.contains("echo"));
        assert!(list.contains("execute"));
        assert!(list.contains("parseInt"));
        assert!(!list.contains("require"));
        assert_eq!(list.builders().collect::<Vec<_>>(), vec!["echo"]);
    }

    #[test]
    fn test_unknown_operation_error() {
        let err = Echo.build("nope", vec![]).err().unwrap();
        assert_eq!(
            err.to_string(),
            "Unknown operation 'nope' for adaptor 'language-echo'"
        );
    }

    #[test]
    fn test_optional_treats_null_as_absent() {
        let args = OperationArgs::new("op", vec![LazyValue::literal(Value::Null)]);
        assert!(args.optional(0).is_none());
        assert!(args.required(0, "data").is_err());
    }
}
