//! One isolated QuickJS context per expression run.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rquickjs::{Array, Context, Ctx, FromJs, Function, Object, Runtime, Value};
use serde::Deserialize;
use serde_json::Value as Json;

use super::SandboxConfig;
use super::prelude;
use crate::adaptor::Adaptor;
use crate::compiler::CompiledUnit;
use crate::error::{EngineError, EngineResult};
use crate::lazy::{Deferred, LazyValue};
use crate::operation::{BoxedOperation, Operation};
use crate::pipeline::{Each, Pipeline};
use crate::state::State;

struct Engine {
    context: Context,
    _runtime: Runtime,
}

/// A QuickJS runtime and context bound to one deadline.
///
/// Script functions handed to the host (lazy values, `fn` operations) stay
/// inside the context in a registry array and are referred to by index, so
/// they can be invoked later while the pipeline runs.
pub(crate) struct ScriptScope {
    engine: Mutex<Engine>,
    deadline: Instant,
    timeout_ms: u64,
}

impl ScriptScope {
    pub(crate) fn open(config: &SandboxConfig, deadline: Instant) -> EngineResult<Arc<Self>> {
        let runtime = Runtime::new().map_err(|e| EngineError::Sandbox(e.to_string()))?;
        runtime.set_memory_limit(config.memory_limit_mb * 1024 * 1024);
        runtime.set_max_stack_size(config.max_stack_size_kb * 1024);
        runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

        let context = Context::full(&runtime).map_err(|e| EngineError::Sandbox(e.to_string()))?;

        Ok(Arc::new(Self {
            engine: Mutex::new(Engine {
                context,
                _runtime: runtime,
            }),
            deadline,
            timeout_ms: config.timeout_ms,
        }))
    }

    fn with<R: Send>(&self, f: impl FnOnce(Ctx<'_>) -> EngineResult<R> + Send) -> EngineResult<R> {
        if self.expired() {
            return Err(EngineError::Timeout(self.timeout_ms));
        }
        let engine = self.engine.lock();
        engine.context.with(f)
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Remove non-allow-listed globals and bind `state`.
    pub(crate) fn install_minimal(&self, state: &State) -> EngineResult<()> {
        // Parsed rather than spliced as an object literal, so own keys such
        // as `__proto__` stay plain data.
        let state_literal = serde_json::to_string(&serde_json::to_string(state)?)?;
        self.with(|ctx| {
            self.eval_void(&ctx, &prelude::scrub_globals())?;
            self.eval_void(&ctx, &format!("var state = JSON.parse({state_literal});"))
        })
    }

    /// Minimal setup plus console, helper builders and the adaptor's
    /// builders.
    pub(crate) fn install(&self, adaptor: &dyn Adaptor, state: &State) -> EngineResult<()> {
        let bindings = prelude::adaptor_bindings(adaptor)?;
        self.install_minimal(state)?;
        self.with(|ctx| {
            install_log(&ctx).map_err(|e| self.script_error(&ctx, e))?;
            self.eval_void(&ctx, prelude::RUNTIME)?;
            self.eval_void(&ctx, prelude::COMMON)?;
            self.eval_void(&ctx, &bindings)
        })
    }

    /// Evaluate `source` and report JavaScript truthiness of the result.
    pub(crate) fn eval_truthy(&self, source: &str) -> EngineResult<bool> {
        self.with(|ctx| {
            let value: Value = ctx
                .eval(source)
                .map_err(|e| self.script_error(&ctx, e))?;
            Ok(truthy(&value))
        })
    }

    /// Evaluate a compiled unit and turn the plan it returns into a pipeline.
    ///
    /// Also returns the state the unit bound the pipeline to, if readable.
    pub(crate) fn load_pipeline(
        self: &Arc<Self>,
        unit: &CompiledUnit,
        adaptor: &dyn Adaptor,
    ) -> EngineResult<(Pipeline, Option<State>)> {
        self.with(|ctx| {
            let js = |e| self.script_error(&ctx, e);
            let helpers = Helpers::load(&ctx).map_err(js)?;

            let result: Value = ctx.eval(unit.text()).map_err(js)?;
            let plan = Object::from_js(&ctx, result).map_err(|_| {
                EngineError::InvalidPlan("expression did not evaluate to a pipeline".into())
            })?;
            let operations: Array = plan.get("__plan").map_err(|_| {
                EngineError::InvalidPlan("expression did not call the pipeline entry point".into())
            })?;

            let bound: Value = plan.get("state").map_err(js)?;
            let bound: Option<String> = helpers.to_json.call((bound,)).map_err(js)?;
            let state = match bound.as_deref().map(serde_json::from_str::<Json>) {
                Some(Ok(value @ Json::Object(_))) => Some(State::from_value(value)?),
                _ => None,
            };

            let operations = self.operations(&ctx, &helpers, operations, adaptor)?;
            Ok((adaptor.execute(operations), state))
        })
    }

    fn operations<'js>(
        self: &Arc<Self>,
        ctx: &Ctx<'js>,
        helpers: &Helpers<'js>,
        list: Array<'js>,
        adaptor: &dyn Adaptor,
    ) -> EngineResult<Vec<BoxedOperation>> {
        let js = |e| self.script_error(ctx, e);
        let mut operations: Vec<BoxedOperation> = Vec::with_capacity(list.len());

        for position in 0..list.len() {
            let op: Value = list.get(position).map_err(js)?;
            let described: Object = helpers.describe.call((op,)).map_err(js)?;
            let kind: String = described.get("kind").map_err(js)?;

            match kind.as_str() {
                "pipeline" => {
                    let nested: Array = described.get("operations").map_err(js)?;
                    let nested = self.operations(ctx, helpers, nested, adaptor)?;
                    operations.push(Box::new(Pipeline::new(nested)));
                }
                "each" => {
                    let items: Value = described.get("items").map_err(js)?;
                    let items = self.to_lazy(ctx, helpers, items)?;
                    let body: Array = described.get("operations").map_err(js)?;
                    let body = self.operations(ctx, helpers, body, adaptor)?;
                    operations.push(Box::new(Each::new(items, Pipeline::new(body))));
                }
                "script" => {
                    let index: u32 = described.get("index").map_err(js)?;
                    operations.push(Box::new(ScriptOperation {
                        scope: Arc::clone(self),
                        index,
                    }));
                }
                "builder" => {
                    let name: String = described.get("name").map_err(js)?;
                    let raw: Array = described.get("args").map_err(js)?;
                    let mut args = Vec::with_capacity(raw.len());
                    for i in 0..raw.len() {
                        let value: Value = raw.get(i).map_err(js)?;
                        args.push(self.to_lazy(ctx, helpers, value)?);
                    }
                    operations.push(adaptor.build(&name, args)?);
                }
                _ => {
                    let found: String = described.get("type").unwrap_or_default();
                    return Err(EngineError::InvalidPlan(format!(
                        "pipeline argument {} is a {found}, not an operation",
                        position + 1
                    )));
                }
            }
        }
        Ok(operations)
    }

    fn to_lazy<'js>(
        self: &Arc<Self>,
        ctx: &Ctx<'js>,
        helpers: &Helpers<'js>,
        value: Value<'js>,
    ) -> EngineResult<LazyValue> {
        let js = |e| self.script_error(ctx, e);
        let kind: String = helpers.kind.call((value.clone(),)).map_err(js)?;

        match kind.as_str() {
            "function" => {
                let index: u32 = helpers.retain.call((value,)).map_err(js)?;
                Ok(LazyValue::Deferred(Arc::new(ScriptDeferred {
                    scope: Arc::clone(self),
                    index,
                })))
            }
            "array" => {
                let items = Array::from_js(ctx, value).map_err(js)?;
                let mut out = Vec::with_capacity(items.len());
                for i in 0..items.len() {
                    out.push(self.to_lazy(ctx, helpers, items.get(i).map_err(js)?)?);
                }
                Ok(LazyValue::Array(out))
            }
            "object" => {
                let entries: Array = helpers.entries.call((value,)).map_err(js)?;
                let mut fields = IndexMap::with_capacity(entries.len());
                for i in 0..entries.len() {
                    let pair: Array = entries.get(i).map_err(js)?;
                    let key: String = pair.get(0).map_err(js)?;
                    let item: Value = pair.get(1).map_err(js)?;
                    fields.insert(key, self.to_lazy(ctx, helpers, item)?);
                }
                Ok(LazyValue::Object(fields))
            }
            _ => {
                let json: Option<String> = helpers.to_json.call((value,)).map_err(js)?;
                match json {
                    Some(json) => Ok(LazyValue::Literal(serde_json::from_str(&json)?)),
                    None => Ok(LazyValue::Literal(Json::Null)),
                }
            }
        }
    }

    fn invoke_deferred(self: &Arc<Self>, index: u32, state: &State) -> EngineResult<LazyValue> {
        let json = serde_json::to_string(state)?;
        self.with(|ctx| {
            let js = |e| self.script_error(&ctx, e);
            let helpers = Helpers::load(&ctx).map_err(js)?;
            let value: Value = helpers.invoke.call((index, json)).map_err(js)?;
            self.to_lazy(&ctx, &helpers, value)
        })
    }

    fn invoke_operation(&self, index: u32, state: &State) -> EngineResult<State> {
        let json = serde_json::to_string(state)?;
        let next: String = self.with(|ctx| {
            let js = |e| self.script_error(&ctx, e);
            let helpers = Helpers::load(&ctx).map_err(js)?;
            helpers.invoke_operation.call((index, json)).map_err(js)
        })?;
        Ok(State::from_value(serde_json::from_str(&next)?)?.with_defaults())
    }

    fn eval_void(&self, ctx: &Ctx<'_>, source: &str) -> EngineResult<()> {
        ctx.eval::<(), _>(source)
            .map_err(|e| self.script_error(ctx, e))
    }

    /// Map an engine error to the taxonomy; thrown values keep their
    /// enumerable properties as `detail`.
    fn script_error(&self, ctx: &Ctx<'_>, error: rquickjs::Error) -> EngineError {
        if self.expired() {
            return EngineError::Timeout(self.timeout_ms);
        }
        match error {
            rquickjs::Error::Exception => {
                let thrown = ctx.catch();
                let described: Option<String> = ctx
                    .globals()
                    .get::<_, Function>("__describeError")
                    .and_then(|describe| describe.call((thrown.clone(),)))
                    .ok()
                    .flatten();
                match described.as_deref().map(serde_json::from_str::<ThrownValue>) {
                    Some(Ok(thrown)) => EngineError::Script {
                        message: thrown.message,
                        detail: thrown.detail.filter(|d| d.as_object().is_some_and(|o| !o.is_empty())),
                    },
                    _ => EngineError::script(fallback_message(ctx, thrown)),
                }
            }
            other => EngineError::Sandbox(other.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct ThrownValue {
    message: String,
    detail: Option<Json>,
}

fn fallback_message<'js>(ctx: &Ctx<'js>, thrown: Value<'js>) -> String {
    String::from_js(ctx, thrown).unwrap_or_else(|_| "script raised an exception".to_string())
}

fn install_log(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let log = Function::new(ctx.clone(), |level: String, message: String| {
        match level.as_str() {
            "error" => tracing::error!(target: "sandbox", message = %message, "console.error"),
            "warn" => tracing::warn!(target: "sandbox", message = %message, "console.warn"),
            "debug" => tracing::debug!(target: "sandbox", message = %message, "console.debug"),
            _ => tracing::info!(target: "sandbox", message = %message, "console.log"),
        }
    })?;
    ctx.globals().set("__log", log)
}

/// JavaScript truthiness.
fn truthy(value: &Value<'_>) -> bool {
    if let Some(b) = value.as_bool() {
        return b;
    }
    if let Some(n) = value.as_int() {
        return n != 0;
    }
    if let Some(n) = value.as_float() {
        return n != 0.0 && !n.is_nan();
    }
    if let Some(s) = value.as_string() {
        return s.to_string().map(|s| !s.is_empty()).unwrap_or(false);
    }
    !(value.is_null() || value.is_undefined())
}

struct Helpers<'js> {
    kind: Function<'js>,
    entries: Function<'js>,
    to_json: Function<'js>,
    describe: Function<'js>,
    retain: Function<'js>,
    invoke: Function<'js>,
    invoke_operation: Function<'js>,
}

impl<'js> Helpers<'js> {
    fn load(ctx: &Ctx<'js>) -> rquickjs::Result<Self> {
        let globals = ctx.globals();
        Ok(Self {
            kind: globals.get("__kind")?,
            entries: globals.get("__entries")?,
            to_json: globals.get("__toJson")?,
            describe: globals.get("__describe")?,
            retain: globals.get("__retain")?,
            invoke: globals.get("__invoke")?,
            invoke_operation: globals.get("__invokeOperation")?,
        })
    }
}

/// Script function used as a lazy value.
struct ScriptDeferred {
    scope: Arc<ScriptScope>,
    index: u32,
}

impl Deferred for ScriptDeferred {
    fn evaluate(&self, state: &State) -> EngineResult<LazyValue> {
        self.scope.invoke_deferred(self.index, state)
    }
}

/// Script function used as an operation (`fn`, `alterState`).
struct ScriptOperation {
    scope: Arc<ScriptScope>,
    index: u32,
}

#[async_trait]
impl Operation for ScriptOperation {
    fn name(&self) -> &str {
        "fn"
    }

    async fn apply(&self, state: State) -> EngineResult<State> {
        self.scope.invoke_operation(self.index, &state)
    }
}
