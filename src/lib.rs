//! Probe Engine - Template-driven protocol request execution
//!
//! This crate compiles a declarative request definition (payloads, attack
//! combinators, inline probe bodies, match/extract rules) into a runnable
//! plan and executes it against network targets, correlating asynchronous
//! out-of-band signals and emitting structured result events.

pub mod compiler;
pub mod error;
pub mod executor;
pub mod expressions;
pub mod generators;
pub mod interpreter;
pub mod oob;
pub mod operators;
pub mod output;
pub mod progress;
pub mod scope;
pub mod types;


pub use error::{EngineError, EngineResult};

pub use types::{ExecutorOptions, RequestDefinition, Target, PORT_ARGUMENT};

pub use generators::{AttackType, PayloadGenerator, PayloadIterator, PayloadSource};

pub use operators::{
    CompiledOperators, Condition, Extractor, ExtractorKind, Matcher, MatcherKind, OperatorResult,
    Operators,
};

pub use compiler::CompiledRequest;

pub use interpreter::{ExecuteArgs, InitSink, ProbeInterpreter, ProbeOutput};

pub use oob::{CorrelationManager, OobSignal, Registration, OOB_URL_PLACEHOLDER};

pub use output::{create_event, ResultCallback, ResultEvent, REQUEST_TYPE};

pub use progress::{AtomicProgress, Progress};

pub use scope::{dns_variables, merge_maps, Scope, TemplateContext};
