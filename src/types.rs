//! Core data types for the probe engine

use crate::generators::{AttackType, PayloadSource};
use crate::interpreter::ProbeInterpreter;
use crate::oob::CorrelationManager;
use crate::operators::Operators;
use crate::progress::{AtomicProgress, Progress};
use crate::scope::{value_str, Scope, TemplateContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Reserved argument name denoting the network port
pub const PORT_ARGUMENT: &str = "Port";

/// Declarative request definition, immutable after compilation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RequestDefinition {
    /// Request identifier within its template
    pub id: String,
    /// Script executed once after compilation, before any target
    pub init: String,
    /// Boolean-producing check evaluated before any probe is issued
    pub pre_condition: String,
    /// Inline probe body
    pub code: String,
    /// Declared arguments; values may carry `{{name}}` expressions
    pub args: HashMap<String, Value>,
    /// Payload specification expanded by the attack type
    pub payloads: BTreeMap<String, PayloadSource>,
    pub attack: AttackType,
    /// Concurrency cap for payload dispatch; > 1 enables the parallel strategy
    pub threads: usize,
    pub stop_at_first_match: bool,
    #[serde(flatten)]
    pub operators: Operators,
}

impl RequestDefinition {
    /// Look up a declared argument by case-insensitive name.
    pub fn get_arg(&self, name: &str) -> Option<&Value> {
        self.args
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Value of the reserved `Port` argument, empty when absent.
    pub fn get_port(&self) -> String {
        self.get_arg(PORT_ARGUMENT).map(value_str).unwrap_or_default()
    }

    /// Comma-separated ports the template port override must not replace.
    pub fn get_exclude_ports(&self) -> String {
        self.get_arg("exclude-ports").map(value_str).unwrap_or_default()
    }
}

/// A network target the compiled request is executed against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Raw input: hostname, host:port or URL
    pub input: String,
}

impl Target {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// Execution options shared by every request compiled from one template
pub struct ExecutorOptions {
    pub template_id: String,
    pub template_path: String,
    /// Static constants merged into every resolution scope
    pub constants: Scope,
    /// Option-level variables, evaluated against the merged scope per target
    pub variables: HashMap<String, String>,
    /// Global stop-at-first-match override
    pub stop_at_first_match: bool,
    pub interpreter: Arc<dyn ProbeInterpreter>,
    pub progress: Arc<dyn Progress>,
    /// Out-of-band correlation collaborator, when configured
    pub oob: Option<Arc<CorrelationManager>>,
    /// Mutable per-target context persisting across probes
    pub template_ctx: TemplateContext,
}

impl ExecutorOptions {
    pub fn new(interpreter: Arc<dyn ProbeInterpreter>) -> Self {
        Self {
            template_id: String::new(),
            template_path: String::new(),
            constants: Scope::new(),
            variables: HashMap::new(),
            stop_at_first_match: false,
            interpreter,
            progress: Arc::new(AtomicProgress::new()),
            oob: None,
            template_ctx: TemplateContext::new(),
        }
    }

    pub fn with_template_id(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = template_id.into();
        self
    }

    pub fn with_template_path(mut self, template_path: impl Into<String>) -> Self {
        self.template_path = template_path.into();
        self
    }

    pub fn with_constants(mut self, constants: Scope) -> Self {
        self.constants = constants;
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_oob(mut self, oob: Arc<CorrelationManager>) -> Self {
        self.oob = Some(oob);
        self
    }

    pub fn with_stop_at_first_match(mut self, stop: bool) -> Self {
        self.stop_at_first_match = stop;
        self
    }
}
