//! Sequential pipeline executor.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::EngineResult;
use crate::lazy::LazyValue;
use crate::operation::{BoxedOperation, Operation};
use crate::state::{DATA, State};

/// Key holding the position of the current item while [`Each`] runs.
pub const INDEX: &str = "index";

/// An ordered composition of operations.
///
/// Running a pipeline first applies the initializer (`references = []`,
/// `data = null` unless present) and then each operation in order, feeding
/// each one exactly the state returned by its predecessor. The first failure
/// aborts the run and is returned as-is.
pub struct Pipeline {
    operations: Vec<BoxedOperation>,
}

/// Compose operations into a pipeline.
pub fn execute(operations: Vec<BoxedOperation>) -> Pipeline {
    Pipeline::new(operations)
}

impl Pipeline {
    pub fn new(operations: Vec<BoxedOperation>) -> Self {
        Self { operations }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub async fn run(&self, initial: State) -> EngineResult<State> {
        let mut state = initial.with_defaults();
        for (index, operation) in self.operations.iter().enumerate() {
            debug!(step = index, operation = operation.name(), "Applying operation");
            state = operation.apply(state).await?;
        }
        Ok(state)
    }
}

#[async_trait]
impl Operation for Pipeline {
    fn name(&self) -> &str {
        "execute"
    }

    async fn apply(&self, state: State) -> EngineResult<State> {
        self.run(state).await
    }
}

/// Runs `body` once per item of a collection.
///
/// `items` is resolved against the incoming state; an array yields its
/// elements, `null` yields nothing and any other value is a single item.
/// Each run sees `data` set to the item and `index` to its position, and
/// starts from the state the previous run returned.
pub struct Each {
    items: LazyValue,
    body: Pipeline,
}

impl Each {
    pub fn new(items: LazyValue, body: Pipeline) -> Self {
        Self { items, body }
    }
}

#[async_trait]
impl Operation for Each {
    fn name(&self) -> &str {
        "each"
    }

    async fn apply(&self, state: State) -> EngineResult<State> {
        let items = match self.items.resolve(&state)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        debug!(items = items.len(), "Applying operation to each item");

        let mut state = state;
        for (index, item) in items.into_iter().enumerate() {
            let scoped = state.with(DATA, item).with(INDEX, Value::from(index));
            state = self.body.run(scoped).await?;
        }
        Ok(state)
    }
}
