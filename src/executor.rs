//! Execution engine for compiled requests
//!
//! Per target: precondition gate, payload iteration (sequential or under a
//! bounded worker pool), one probe per value set, outcome routing into
//! result events. Probe failures are data, not control flow: they become
//! error-carrying events and never abort sibling probes.

use crate::compiler::{evaluate_args, CompiledRequest};
use crate::error::{EngineError, EngineResult};
use crate::interpreter::{ExecuteArgs, ProbeOutput};
use crate::oob::Registration;
use crate::output::{create_event, ResultCallback, ResultEvent, REQUEST_TYPE};
use crate::scope::{dns_variables, merge_maps, Scope};
use crate::types::Target;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

/// Input ports the template port override is allowed to replace
const OVERRIDABLE_PORTS: &[&str] = &["80", "443", "8080", "8081"];

/// Resolved network coordinates for one target
#[derive(Debug, Clone)]
struct ResolvedAddress {
    host_port: String,
    hostname: String,
    port: String,
}

/// Terminal disposition of one probe
struct ProbeOutcome {
    /// Event to forward, none when the outcome was deferred for correlation
    event: Option<ResultEvent>,
    /// Whether the probe matched synchronously
    matched: bool,
}

impl CompiledRequest {
    /// Execute the compiled plan against one target, invoking the callback
    /// once per terminal outcome.
    pub async fn execute_with_results(
        self: Arc<Self>,
        target: &Target,
        dynamic_values: &Scope,
        previous: &Scope,
        callback: ResultCallback,
    ) -> EngineResult<()> {
        let resolved = match resolve_address(
            target,
            &self.definition.get_port(),
            &self.definition.get_exclude_ports(),
        ) {
            Ok(resolved) => resolved,
            Err(err) => {
                self.options.progress.increment_failed_requests_by(1);
                return Err(err);
            }
        };

        let payload_values = self.build_payload_values(target, &resolved, dynamic_values);
        self.options.template_ctx.merge(&target.input, &payload_values);

        if !self.definition.pre_condition.is_empty()
            && !self
                .check_precondition(target, &resolved, &payload_values, previous)
                .await?
        {
            return Ok(());
        }

        let stop_at_first_match =
            self.definition.stop_at_first_match || self.options.stop_at_first_match;

        if self.generator.is_some() && self.definition.threads > 1 {
            self.execute_parallel(target, &resolved, &payload_values, stop_at_first_match, callback)
                .await;
            return Ok(());
        }

        if let Some(generator) = &self.generator {
            let mut got_matches = false;
            let mut iterator = generator.iterator();
            while let Some(value) = iterator.next() {
                match self
                    .execute_request_with_payloads(
                        target,
                        &resolved,
                        Some(&value),
                        &payload_values,
                        &callback,
                    )
                    .await
                {
                    Ok(outcome) => {
                        if let Some(event) = outcome.event {
                            callback(event);
                        }
                        if outcome.matched {
                            got_matches = true;
                            self.options.progress.increment_matched();
                        }
                    }
                    // expected to fail for some payloads, keep iterating
                    Err(err) => debug!(target = %target.input, %err, "probe dispatch failed"),
                }
                if stop_at_first_match && got_matches {
                    return Ok(());
                }
            }
            return Ok(());
        }

        let outcome = self
            .execute_request_with_payloads(target, &resolved, None, &payload_values, &callback)
            .await?;
        if let Some(event) = outcome.event {
            callback(event);
        }
        if outcome.matched {
            self.options.progress.increment_matched();
        }
        Ok(())
    }

    /// Merge static, derived and dynamic sources into the per-probe scope
    /// base, the way a single target's variables are assembled.
    fn build_payload_values(
        &self,
        target: &Target,
        resolved: &ResolvedAddress,
        dynamic_values: &Scope,
    ) -> Scope {
        let mut payload_values = dynamic_values.clone();
        payload_values.insert(
            "Hostname".to_string(),
            Value::String(resolved.host_port.clone()),
        );
        payload_values.insert("Host".to_string(), Value::String(resolved.hostname.clone()));
        payload_values.insert("Port".to_string(), Value::String(resolved.port.clone()));

        let hostname_variables = dns_variables(&resolved.hostname);
        let template_ctx = self.options.template_ctx.get_all(&target.input);
        let values = merge_maps(&[
            &payload_values,
            &hostname_variables,
            &self.options.constants,
            &template_ctx,
        ]);

        // option variables may themselves carry expressions
        let mut variables_map = Scope::new();
        for (name, raw) in &self.options.variables {
            variables_map.insert(
                name.clone(),
                Value::String(crate::expressions::evaluate(raw, &values)),
            );
        }

        merge_maps(&[
            &variables_map,
            &payload_values,
            &self.options.constants,
            &hostname_variables,
        ])
    }

    /// Evaluate the precondition. Returns false when probes for this target
    /// must be skipped; that skip is a failed-request metric, not an error.
    async fn check_precondition(
        &self,
        target: &Target,
        resolved: &ResolvedAddress,
        payload_values: &Scope,
        previous: &Scope,
    ) -> EngineResult<bool> {
        let scope = merge_maps(&[payload_values, previous]);
        let mut args = evaluate_args(&self.definition.args, &scope, true);
        args.insert("Port".to_string(), Value::String(resolved.port.clone()));
        let exec_args = ExecuteArgs::new(args)
            .with_template_ctx(self.options.template_ctx.get_all(&target.input));

        let result = self
            .options
            .interpreter
            .execute(&self.definition.pre_condition, &exec_args)
            .await
            .map_err(|e| EngineError::execution(format!("could not execute pre-condition: {}", e)))?;

        if !result.success() || result.error_string().is_some() {
            warn!(
                template_id = %self.options.template_id,
                target = %target.input,
                "precondition for request was not satisfied"
            );
            self.options.progress.increment_failed_requests_by(1);
            return Ok(false);
        }
        debug!(template_id = %self.options.template_id, "precondition satisfied");
        self.options.progress.increment_requests();
        Ok(true)
    }

    /// Parallel strategy: a single dispatcher advances the iterator in
    /// order and hands each value set to a bounded worker pool. After a
    /// stop-at-first-match cancellation the dispatcher keeps draining the
    /// iterator; remaining workers degenerate into no-ops.
    async fn execute_parallel(
        self: &Arc<Self>,
        target: &Target,
        resolved: &ResolvedAddress,
        payload_values: &Scope,
        stop_at_first_match: bool,
        callback: ResultCallback,
    ) {
        let threads = self.definition.threads.max(1);
        let semaphore = Arc::new(Semaphore::new(threads));
        let got_matches = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut workers = JoinSet::new();

        let generator = match &self.generator {
            Some(generator) => generator,
            None => return,
        };
        let mut iterator = generator.iterator();
        while let Some(value) = iterator.next() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let this = Arc::clone(self);
            let target = target.clone();
            let resolved = resolved.clone();
            let payload_values = payload_values.clone();
            let callback = Arc::clone(&callback);
            let got_matches = Arc::clone(&got_matches);
            let cancelled = Arc::clone(&cancelled);

            workers.spawn(async move {
                let _permit = permit;
                if cancelled.load(Ordering::Acquire) {
                    // work already done, exit without dispatching
                    return;
                }
                match this
                    .execute_request_with_payloads(
                        &target,
                        &resolved,
                        Some(&value),
                        &payload_values,
                        &callback,
                    )
                    .await
                {
                    Ok(outcome) => {
                        let Some(event) = outcome.event else { return };
                        if outcome.matched && stop_at_first_match {
                            // only the first match is forwarded
                            if got_matches
                                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                                .is_ok()
                            {
                                cancelled.store(true, Ordering::Release);
                                callback(event);
                            }
                        } else {
                            if outcome.matched {
                                got_matches.store(true, Ordering::Release);
                            }
                            callback(event);
                        }
                    }
                    Err(err) => debug!(target = %target.input, %err, "probe dispatch failed"),
                }
            });
        }

        while workers.join_next().await.is_some() {}
        if got_matches.load(Ordering::Acquire) {
            self.options.progress.increment_matched();
        }
    }

    /// Issue one probe: merge scopes, resolve arguments, substitute
    /// out-of-band markers, invoke the interpreter and route the outcome.
    async fn execute_request_with_payloads(
        &self,
        target: &Target,
        resolved: &ResolvedAddress,
        payload: Option<&Scope>,
        previous: &Scope,
        callback: &ResultCallback,
    ) -> EngineResult<ProbeOutcome> {
        let empty = Scope::new();
        let payload_values = merge_maps(&[payload.unwrap_or(&empty), previous]);

        let mut args = evaluate_args(&self.definition.args, &payload_values, false);
        args.insert("Port".to_string(), Value::String(resolved.port.clone()));
        let exec_args = ExecuteArgs::new(args)
            .with_template_ctx(self.options.template_ctx.get_all(&target.input));

        let mut body = self.definition.code.clone();
        let mut markers = Vec::new();
        if let Some(oob) = &self.options.oob {
            let (replaced, replaced_markers) = oob.replace_markers(&body);
            body = replaced;
            markers = replaced_markers;
        }

        let results = match self.options.interpreter.execute(&body, &exec_args).await {
            Ok(output) => output,
            // a failed probe is a normal outcome, not an abort
            Err(err) => ProbeOutput::from_error(err.to_string()),
        };
        self.options.progress.increment_requests();
        debug!(
            template_id = %self.options.template_id,
            address = %resolved.host_port,
            "sent probe request"
        );

        let mut data = payload_values.clone();
        data.insert("type".to_string(), Value::String(REQUEST_TYPE.to_string()));
        for (k, v) in results.0.iter() {
            data.insert(k.clone(), v.clone());
        }
        data.insert(
            "request".to_string(),
            Value::String(self.definition.code.clone()),
        );
        data.insert("host".to_string(), Value::String(target.input.clone()));
        data.insert(
            "matched".to_string(),
            Value::String(resolved.host_port.clone()),
        );
        data.insert(
            "template-id".to_string(),
            Value::String(self.options.template_id.clone()),
        );
        data.insert(
            "template-path".to_string(),
            Value::String(self.options.template_path.clone()),
        );
        let template_ctx = self.options.template_ctx.get_all(&target.input);
        data = merge_maps(&[&data, &template_ctx]);

        let probe_payload = payload.cloned().unwrap_or_default();

        // errors become events immediately and never count as a match
        if results.error_string().is_some() {
            let mut operator_result = self
                .compiled_operators
                .as_ref()
                .map(|operators| operators.execute(&data))
                .unwrap_or_default();
            operator_result.matched = false;
            operator_result.payload_values = probe_payload;
            let event = create_event(&data, Some(&operator_result));
            return Ok(ProbeOutcome {
                event: Some(event),
                matched: false,
            });
        }

        if !markers.is_empty() {
            if let Some(oob) = &self.options.oob {
                oob.make_placeholders(&markers, &mut data);
                oob.register(
                    markers,
                    Registration {
                        target: target.input.clone(),
                        event: data,
                        payload_values: probe_payload,
                        operators: self.compiled_operators.clone(),
                        callback: Arc::clone(callback),
                    },
                );
                // event construction is deferred until the signal arrives
                return Ok(ProbeOutcome {
                    event: None,
                    matched: false,
                });
            }
        }

        let operator_result = self.compiled_operators.as_ref().map(|operators| {
            let mut result = operators.execute(&data);
            result.payload_values = probe_payload;
            result
        });
        let matched = operator_result.as_ref().map(|r| r.matched).unwrap_or(false);
        let event = create_event(&data, operator_result.as_ref());
        Ok(ProbeOutcome {
            event: Some(event),
            matched,
        })
    }
}

/// Derive host, port and hostname from a target input, preferring the
/// template port override when the input does not already pin a
/// non-conventional port.
fn resolve_address(
    target: &Target,
    template_port: &str,
    exclude_ports: &str,
) -> EngineResult<ResolvedAddress> {
    if target.input.is_empty() {
        return Err(EngineError::TargetResolutionFailed {
            input: target.input.clone(),
            reason: "empty target input".to_string(),
        });
    }

    let address = match Url::parse(&target.input) {
        Ok(url) if url.has_host() => {
            let host = url.host_str().unwrap_or_default().to_string();
            match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host,
            }
        }
        // not a URL, use the given input as-is
        _ => target.input.clone(),
    };

    let (hostname, mut port) = split_host_port(&address);

    if !template_port.is_empty() {
        let excluded = exclude_ports.split(',').any(|p| p.trim() == port);
        let overridable =
            port.is_empty() || (OVERRIDABLE_PORTS.contains(&port.as_str()) && !excluded);
        if overridable {
            port = template_port.to_string();
        }
    }

    let host_port = if port.is_empty() {
        hostname.clone()
    } else if hostname.contains(':') {
        // IPv6 literals are re-bracketed when joined with a port
        format!("[{}]:{}", hostname, port)
    } else {
        format!("{}:{}", hostname, port)
    };

    Ok(ResolvedAddress {
        host_port,
        hostname,
        port,
    })
}

/// Split an address into hostname and port. Bracketed IPv6 hosts lose
/// their brackets; an unbracketed address with more than one colon is a
/// raw IPv6 literal carrying no port.
fn split_host_port(address: &str) -> (String, String) {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            let port = after.strip_prefix(':').unwrap_or("");
            if port.parse::<u16>().is_ok() {
                return (host.to_string(), port.to_string());
            }
            return (host.to_string(), String::new());
        }
    }
    if address.matches(':').count() > 1 {
        return (address.to_string(), String::new());
    }
    match address.rsplit_once(':') {
        Some((host, p)) if p.parse::<u16>().is_ok() => (host.to_string(), p.to_string()),
        _ => (address.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(input: &str, template_port: &str) -> ResolvedAddress {
        resolve_address(&Target::new(input), template_port, "").unwrap()
    }

    #[test]
    fn test_resolve_plain_host_uses_template_port() {
        let resolved = resolve("example.com", "5432");
        assert_eq!(resolved.hostname, "example.com");
        assert_eq!(resolved.port, "5432");
        assert_eq!(resolved.host_port, "example.com:5432");
    }

    #[test]
    fn test_resolve_explicit_port_is_kept() {
        let resolved = resolve("example.com:9999", "5432");
        assert_eq!(resolved.port, "9999");
        assert_eq!(resolved.host_port, "example.com:9999");
    }

    #[test]
    fn test_resolve_conventional_port_is_overridden() {
        let resolved = resolve("example.com:80", "5432");
        assert_eq!(resolved.port, "5432");
    }

    #[test]
    fn test_resolve_excluded_port_is_not_overridden() {
        let resolved = resolve_address(&Target::new("example.com:443"), "5432", "443").unwrap();
        assert_eq!(resolved.port, "443");
    }

    #[test]
    fn test_resolve_url_input() {
        let resolved = resolve("https://example.com:8443/path", "");
        assert_eq!(resolved.hostname, "example.com");
        assert_eq!(resolved.port, "8443");
        assert_eq!(resolved.host_port, "example.com:8443");
    }

    #[test]
    fn test_resolve_empty_input_fails() {
        assert!(resolve_address(&Target::new(""), "", "").is_err());
    }

    #[test]
    fn test_resolve_bracketed_ipv6_with_port() {
        let resolved = resolve("[::1]:8080", "5432");
        assert_eq!(resolved.hostname, "::1");
        assert_eq!(resolved.port, "5432");
        assert_eq!(resolved.host_port, "[::1]:5432");

        let resolved = resolve("[2001:db8::2]:9999", "5432");
        assert_eq!(resolved.hostname, "2001:db8::2");
        assert_eq!(resolved.port, "9999");
        assert_eq!(resolved.host_port, "[2001:db8::2]:9999");
    }

    #[test]
    fn test_resolve_raw_ipv6_carries_no_port() {
        let resolved = resolve("::1", "5432");
        assert_eq!(resolved.hostname, "::1");
        assert_eq!(resolved.port, "5432");
        assert_eq!(resolved.host_port, "[::1]:5432");

        let resolved = resolve("2001:db8::2", "");
        assert_eq!(resolved.hostname, "2001:db8::2");
        assert_eq!(resolved.port, "");
        assert_eq!(resolved.host_port, "2001:db8::2");
    }
}
