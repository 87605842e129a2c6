//! Request compilation
//!
//! Turns a request definition into a runnable plan: validates arguments,
//! builds the payload combinator, compiles operators and runs the optional
//! one-time init phase.

use crate::error::{EngineError, EngineResult};
use crate::expressions;
use crate::generators::{PayloadGenerator, PayloadSource};
use crate::interpreter::{ExecuteArgs, InitSink};
use crate::operators::CompiledOperators;
use crate::scope::Scope;
use crate::types::{ExecutorOptions, RequestDefinition};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A compiled, runnable request plan
pub struct CompiledRequest {
    pub(crate) definition: RequestDefinition,
    pub(crate) generator: Option<PayloadGenerator>,
    pub(crate) compiled_operators: Option<Arc<CompiledOperators>>,
    pub(crate) options: Arc<ExecutorOptions>,
}

impl std::fmt::Debug for CompiledRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRequest")
            .field("definition", &self.definition)
            .field("generator", &self.generator)
            .field("compiled_operators", &self.compiled_operators)
            .finish_non_exhaustive()
    }
}

impl CompiledRequest {
    /// Compile a request definition against execution options.
    pub async fn compile(
        mut definition: RequestDefinition,
        options: Arc<ExecutorOptions>,
    ) -> EngineResult<Self> {
        validate_unique_args(&definition)?;

        let mut generator = if !definition.payloads.is_empty() {
            Some(PayloadGenerator::new(
                &definition.payloads,
                definition.attack,
            )?)
        } else {
            None
        };

        let compiled_operators = if !definition.operators.is_empty() {
            Some(Arc::new(definition.operators.compile()?))
        } else {
            None
        };

        if !definition.init.is_empty() {
            run_init_phase(&mut definition, &mut generator, &options).await;
        }

        // the port must be statically known once the init phase has run;
        // init-set variables go through the same check as declared args
        if expressions::has_expressions(&definition.get_port()) {
            return Err(EngineError::reserved_argument(
                crate::types::PORT_ARGUMENT,
                "cannot contain placeholder expressions",
            ));
        }

        Ok(Self {
            definition,
            generator,
            compiled_operators,
            options,
        })
    }

    /// Total number of probes the compiled plan will issue.
    pub fn requests(&self) -> usize {
        let pre_conditions = if self.definition.pre_condition.is_empty() {
            0
        } else {
            1
        };
        match &self.generator {
            Some(generator) => generator.total() + pre_conditions,
            None => 1 + pre_conditions,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &RequestDefinition {
        &self.definition
    }

    pub fn generator(&self) -> Option<&PayloadGenerator> {
        self.generator.as_ref()
    }

    pub fn operators(&self) -> Option<&Arc<CompiledOperators>> {
        self.compiled_operators.as_ref()
    }

    pub fn options(&self) -> &Arc<ExecutorOptions> {
        &self.options
    }
}

/// Argument keys must be unique under case-insensitive comparison.
fn validate_unique_args(definition: &RequestDefinition) -> EngineResult<()> {
    let mut seen = std::collections::HashSet::new();
    for key in definition.args.keys() {
        if !seen.insert(key.to_ascii_lowercase()) {
            return Err(EngineError::compile(format!(
                "duplicate argument {} (argument names are case-insensitive)",
                key
            )));
        }
    }
    Ok(())
}

/// Resolve argument expressions against a scope. With `ignore_errors` an
/// argument that stays unresolved degrades to an empty string instead of
/// keeping its placeholder syntax.
pub(crate) fn evaluate_args(
    args: &HashMap<String, Value>,
    scope: &Scope,
    ignore_errors: bool,
) -> Scope {
    let mut resolved = Scope::new();
    for (k, v) in args {
        match v {
            Value::String(s) if expressions::has_expressions(s) => {
                let evaluated = expressions::evaluate(s, scope);
                if expressions::has_expressions(&evaluated) && ignore_errors {
                    resolved.insert(k.clone(), Value::String(String::new()));
                } else {
                    resolved.insert(k.clone(), Value::String(evaluated));
                }
            }
            other => {
                resolved.insert(k.clone(), other.clone());
            }
        }
    }
    resolved
}

/// Collects the two init capabilities for later application
struct InitCapabilities {
    has_payloads: bool,
    variables: Vec<(String, Value)>,
    payload_updates: Vec<(String, Value)>,
}

impl InitSink for InitCapabilities {
    fn set_variable(&mut self, name: &str, value: Value) -> EngineResult<()> {
        if name.is_empty() {
            return Err(EngineError::InitCapability {
                reason: "variable name cannot be empty".to_string(),
            });
        }
        if value.is_null() {
            return Err(EngineError::InitCapability {
                reason: "variable value cannot be empty".to_string(),
            });
        }
        self.variables.push((name.to_string(), value));
        Ok(())
    }

    fn replace_payload(&mut self, name: &str, value: Value) -> EngineResult<()> {
        if !self.has_payloads {
            return Err(EngineError::InitCapability {
                reason: "payloads not defined and cannot be updated".to_string(),
            });
        }
        self.payload_updates.push((name.to_string(), value));
        Ok(())
    }
}

/// Execute the init script. Failures are logged, not fatal: compilation
/// proceeds with whatever variables were set before the failure.
async fn run_init_phase(
    definition: &mut RequestDefinition,
    generator: &mut Option<PayloadGenerator>,
    options: &ExecutorOptions,
) {
    let mut all_vars: Scope = options
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    for (k, v) in &options.constants {
        all_vars.insert(k.clone(), v.clone());
    }

    // proceed with whatever args resolve; unresolved ones degrade to empty
    let args = evaluate_args(&definition.args, &all_vars, true);
    let exec_args = ExecuteArgs::new(args);

    let mut sink = InitCapabilities {
        has_payloads: !definition.payloads.is_empty(),
        variables: Vec::new(),
        payload_updates: Vec::new(),
    };

    debug!(template_id = %options.template_id, "executing request init");
    match options
        .interpreter
        .execute_init(&definition.init, &exec_args, &mut sink)
        .await
    {
        Ok(output) => {
            if let Some(error) = output.error_string() {
                warn!(template_id = %options.template_id, %error, "init failed");
            } else {
                debug!(template_id = %options.template_id, "init executed successfully");
            }
        }
        Err(error) => {
            warn!(template_id = %options.template_id, %error, "init execution failed");
        }
    }

    for (name, value) in sink.variables {
        definition.args.insert(name, value);
    }
    if !sink.payload_updates.is_empty() {
        for (name, value) in sink.payload_updates {
            definition
                .payloads
                .insert(name, PayloadSource::from_value(value));
        }
        match PayloadGenerator::new(&definition.payloads, definition.attack) {
            Ok(rebuilt) => *generator = Some(rebuilt),
            Err(error) => {
                warn!(template_id = %options.template_id, %error, "could not rebuild payloads from init");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::AttackType;
    use crate::interpreter::{ProbeInterpreter, ProbeOutput};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopInterpreter;

    #[async_trait]
    impl ProbeInterpreter for NoopInterpreter {
        async fn execute(&self, _body: &str, _args: &ExecuteArgs) -> EngineResult<ProbeOutput> {
            let mut data = Scope::new();
            data.insert("success".to_string(), json!(true));
            Ok(ProbeOutput(data))
        }
    }

    /// Init interpreter that exercises both capabilities before failing
    struct InitInterpreter;

    #[async_trait]
    impl ProbeInterpreter for InitInterpreter {
        async fn execute(&self, _body: &str, _args: &ExecuteArgs) -> EngineResult<ProbeOutput> {
            Ok(ProbeOutput::default())
        }

        async fn execute_init(
            &self,
            _body: &str,
            _args: &ExecuteArgs,
            sink: &mut dyn InitSink,
        ) -> EngineResult<ProbeOutput> {
            sink.set_variable("token", json!("abc123"))?;
            sink.replace_payload("user", json!(["root", "admin", "oracle"]))?;
            Err(EngineError::execution("runtime blew up after exports"))
        }
    }

    fn options(interpreter: Arc<dyn ProbeInterpreter>) -> Arc<ExecutorOptions> {
        Arc::new(ExecutorOptions::new(interpreter).with_template_id("test-template"))
    }

    fn definition_with_payloads() -> RequestDefinition {
        serde_json::from_value(json!({
            "id": "req-1",
            "code": "probe();",
            "payloads": {"user": ["root", "admin"]},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_port_with_expression_fails_compilation() {
        let mut definition = RequestDefinition::default();
        definition.code = "probe();".to_string();
        definition
            .args
            .insert("Port".to_string(), json!("{{port}}"));

        let err = CompiledRequest::compile(definition, options(Arc::new(NoopInterpreter)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ReservedArgument { .. }));
        assert!(err.is_compile_error());
    }

    #[tokio::test]
    async fn test_duplicate_case_insensitive_args_fail() {
        let mut definition = RequestDefinition::default();
        definition.args.insert("Host".to_string(), json!("a"));
        definition.args.insert("host".to_string(), json!("b"));

        let err = CompiledRequest::compile(definition, options(Arc::new(NoopInterpreter)))
            .await
            .unwrap_err();
        assert!(err.is_compile_error());
    }

    #[tokio::test]
    async fn test_request_count_includes_precondition() {
        let mut definition = definition_with_payloads();
        definition.pre_condition = "isPortOpen(Host, Port);".to_string();

        let compiled = CompiledRequest::compile(definition, options(Arc::new(NoopInterpreter)))
            .await
            .unwrap();
        // 2 payload entries + 1 precondition
        assert_eq!(compiled.requests(), 3);

        let plain = CompiledRequest::compile(
            RequestDefinition {
                code: "probe();".to_string(),
                ..Default::default()
            },
            options(Arc::new(NoopInterpreter)),
        )
        .await
        .unwrap();
        assert_eq!(plain.requests(), 1);
    }

    #[tokio::test]
    async fn test_init_capabilities_survive_init_failure() {
        let mut definition = definition_with_payloads();
        definition.init = "set('token', generate()); updatePayload('user', expand());".to_string();

        let compiled = CompiledRequest::compile(definition, options(Arc::new(InitInterpreter)))
            .await
            .unwrap();

        // variable set before the failure is visible to later phases
        assert_eq!(compiled.definition().get_arg("token"), Some(&json!("abc123")));
        // payload replacement rebuilt the combinator
        assert_eq!(compiled.generator().unwrap().total(), 3);
    }

    /// Init interpreter that smuggles an expression into the reserved port
    struct PortInitInterpreter;

    #[async_trait]
    impl ProbeInterpreter for PortInitInterpreter {
        async fn execute(&self, _body: &str, _args: &ExecuteArgs) -> EngineResult<ProbeOutput> {
            Ok(ProbeOutput::default())
        }

        async fn execute_init(
            &self,
            _body: &str,
            _args: &ExecuteArgs,
            sink: &mut dyn InitSink,
        ) -> EngineResult<ProbeOutput> {
            sink.set_variable("Port", json!("{{port}}"))?;
            Ok(ProbeOutput::default())
        }
    }

    #[tokio::test]
    async fn test_init_cannot_reintroduce_port_expression() {
        let mut definition = RequestDefinition::default();
        definition.code = "probe();".to_string();
        definition.init = "set('Port', lookup());".to_string();

        let err = CompiledRequest::compile(definition, options(Arc::new(PortInitInterpreter)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ReservedArgument { .. }));
    }

    #[tokio::test]
    async fn test_replace_payload_without_payloads_is_rejected() {
        let mut sink = InitCapabilities {
            has_payloads: false,
            variables: Vec::new(),
            payload_updates: Vec::new(),
        };
        assert!(sink.replace_payload("user", json!(["a"])).is_err());
        assert!(sink.set_variable("", json!("x")).is_err());
        assert!(sink.set_variable("x", Value::Null).is_err());
    }

    #[tokio::test]
    async fn test_compilation_is_deterministic() {
        let definition: RequestDefinition = serde_json::from_value(json!({
            "code": "probe();",
            "payloads": {"a": ["x", "y"], "b": ["1", "2", "3"]},
            "attack": "clusterbomb",
        }))
        .unwrap();

        let first = CompiledRequest::compile(definition.clone(), options(Arc::new(NoopInterpreter)))
            .await
            .unwrap();
        let second = CompiledRequest::compile(definition, options(Arc::new(NoopInterpreter)))
            .await
            .unwrap();

        assert_eq!(first.requests(), second.requests());
        let a: Vec<Scope> = first.generator().unwrap().iterator().collect();
        let b: Vec<Scope> = second.generator().unwrap().iterator().collect();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_operators_compiled_only_when_declared() {
        let compiled = CompiledRequest::compile(
            definition_with_payloads(),
            options(Arc::new(NoopInterpreter)),
        )
        .await
        .unwrap();
        assert!(compiled.operators().is_none());

        let with_matcher: RequestDefinition = serde_json::from_value(json!({
            "code": "probe();",
            "matchers": [{"type": "word", "words": ["ok"]}],
        }))
        .unwrap();
        let compiled = CompiledRequest::compile(with_matcher, options(Arc::new(NoopInterpreter)))
            .await
            .unwrap();
        assert!(compiled.operators().is_some());

        assert_eq!(AttackType::default(), AttackType::Sniper);
    }
}
