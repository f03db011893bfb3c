//! The unit of pipeline composition.

use std::future::Future;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::state::State;

/// A function from state to the next state.
///
/// Implementations close over their own (possibly lazy) arguments and must
/// return a new state rather than expecting the caller to observe mutation.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn apply(&self, state: State) -> EngineResult<State>;
}

pub type BoxedOperation = Box<dyn Operation>;

struct SyncOperation<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> Operation for SyncOperation<F>
where
    F: Fn(State) -> EngineResult<State> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, state: State) -> EngineResult<State> {
        (self.f)(state)
    }
}

struct AsyncOperation<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> Operation for AsyncOperation<F>
where
    F: Fn(State) -> Fut + Send + Sync,
    Fut: Future<Output = EngineResult<State>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, state: State) -> EngineResult<State> {
        (self.f)(state).await
    }
}

/// Wrap a synchronous closure as an operation.
pub fn sync_operation<F>(name: impl Into<String>, f: F) -> BoxedOperation
where
    F: Fn(State) -> EngineResult<State> + Send + Sync + 'static,
{
    Box::new(SyncOperation {
        name: name.into(),
        f,
    })
}

/// Wrap an async closure as an operation.
pub fn operation<F, Fut>(name: impl Into<String>, f: F) -> BoxedOperation
where
    F: Fn(State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EngineResult<State>> + Send + 'static,
{
    Box::new(AsyncOperation {
        name: name.into(),
        f,
    })
}
