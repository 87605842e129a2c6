//! Probe interpreter boundary
//!
//! The engine never transmits probes itself; it hands a resolved body and
//! argument map to an external interpreter and consumes its name/value
//! outcome. Implementations must tolerate many concurrent invocations with
//! independent argument sets.

use crate::error::EngineResult;
use crate::scope::{value_str, Scope};
use async_trait::async_trait;
use serde_json::Value;

/// Arguments handed to the interpreter for one probe
#[derive(Debug, Clone, Default)]
pub struct ExecuteArgs {
    /// Resolved declared arguments
    pub args: Scope,
    /// Snapshot of the per-target template context
    pub template_ctx: Scope,
}

impl ExecuteArgs {
    pub fn new(args: Scope) -> Self {
        Self {
            args,
            template_ctx: Scope::new(),
        }
    }

    pub fn with_template_ctx(mut self, template_ctx: Scope) -> Self {
        self.template_ctx = template_ctx;
        self
    }
}

/// Raw name/value outcome of one interpreter invocation
#[derive(Debug, Clone, Default)]
pub struct ProbeOutput(pub Scope);

impl ProbeOutput {
    /// Synthesize a failure outcome from an execution error.
    pub fn from_error(error: impl Into<String>) -> Self {
        let mut data = Scope::new();
        data.insert("success".to_string(), Value::Bool(false));
        data.insert("error".to_string(), Value::String(error.into()));
        Self(data)
    }

    /// Whether the interpreter reported success.
    pub fn success(&self) -> bool {
        match self.0.get("success") {
            Some(Value::Bool(b)) => *b,
            Some(other) => value_str(other) == "true",
            None => false,
        }
    }

    /// Error string carried by the outcome, if any.
    pub fn error_string(&self) -> Option<String> {
        self.0
            .get("error")
            .map(value_str)
            .filter(|s| !s.is_empty())
    }
}

/// Capabilities injectable into the one-time init phase.
///
/// The set of operations is fixed: init code may set a named variable
/// visible to all later phases, or replace/add one payload entry.
pub trait InitSink: Send {
    /// Set a variable available in pre-condition and probe code.
    fn set_variable(&mut self, name: &str, value: Value) -> EngineResult<()>;

    /// Replace or add one payload entry; the payload combinator is rebuilt.
    fn replace_payload(&mut self, name: &str, value: Value) -> EngineResult<()>;
}

/// External interpreter that executes a single probe body
#[async_trait]
pub trait ProbeInterpreter: Send + Sync {
    /// Execute a resolved body with the given arguments.
    async fn execute(&self, body: &str, args: &ExecuteArgs) -> EngineResult<ProbeOutput>;

    /// Execute the init phase. The sink carries the two init capabilities;
    /// interpreters without init support fall back to a plain execution.
    async fn execute_init(
        &self,
        body: &str,
        args: &ExecuteArgs,
        _sink: &mut dyn InitSink,
    ) -> EngineResult<ProbeOutput> {
        self.execute(body, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_probe_output_success_flag() {
        let mut data = Scope::new();
        data.insert("success".to_string(), json!(true));
        assert!(ProbeOutput(data).success());
        assert!(!ProbeOutput::default().success());
    }

    #[test]
    fn test_probe_output_from_error() {
        let output = ProbeOutput::from_error("connection refused");
        assert!(!output.success());
        assert_eq!(output.error_string().as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_empty_error_is_no_error() {
        let mut data = Scope::new();
        data.insert("error".to_string(), json!(""));
        assert_eq!(ProbeOutput(data).error_string(), None);
    }
}
