//! Job expression engine for the mediator.
//!
//! An inbound event is checked against a trigger; if it fires, the job's
//! expression is compiled, run in a QuickJS sandbox as a pipeline of adaptor
//! operations, and the outcome is classified into a response envelope.
//!
//! ```ignore
//! let compiler = Compiler::new(AllowList::for_adaptor(adaptor.as_ref()));
//! let unit = compiler.compile("createTEI(fields(field('orgUnit', dataValue('ou'))));");
//! let outcome = Sandbox::new(config).run(&unit, state, adaptor.as_ref()).await;
//! let envelope = classify(&outcome);
//! ```

pub mod adaptor;
pub mod classify;
pub mod compiler;
pub mod envelope;
pub mod error;
pub mod lazy;
pub mod operation;
pub mod pipeline;
pub mod sandbox;
pub mod state;
pub mod trigger;

pub use adaptor::{Adaptor, AdaptorRegistry, AllowList, OperationArgs, ScriptHelper};
pub use classify::{ResponseEnvelope, classify};
pub use compiler::{CompileError, CompiledUnit, Compiler, CompilerOptions};
pub use envelope::{MEDIATOR_CONTENT_TYPE, MediatorResponse};
pub use error::{CollaboratorError, EngineError, EngineResult};
pub use lazy::{Deferred, LazyValue};
pub use operation::{BoxedOperation, Operation, operation, sync_operation};
pub use pipeline::{Each, Pipeline, execute};
pub use sandbox::{Sandbox, SandboxConfig};
pub use state::State;
pub use trigger::TriggerEvaluator;
