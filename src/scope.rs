//! Variable scope merging and per-target context
//!
//! This module provides the ordered-merge scope used during expression
//! resolution, the hostname-derived variables, and the mutable context
//! that persists across probes for a single target.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// A resolution scope mapping variable names to values
pub type Scope = HashMap<String, Value>;

/// Merge scopes in order; later sources override earlier ones.
pub fn merge_maps(maps: &[&Scope]) -> Scope {
    let mut merged = Scope::new();
    for map in maps {
        for (k, v) in map.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Render a value the way it appears inside a probe body or matcher part.
/// Strings are used verbatim, null becomes empty, everything else is its
/// JSON representation.
pub fn value_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Generate hostname-derived variables for a target.
///
/// For `www.example.io` this produces FQDN=`www.example.io`,
/// RDN=`example.io`, DN=`example`, TLD=`io`, SD=`www`. Hostnames without
/// enough labels only produce the variables that apply.
pub fn dns_variables(hostname: &str) -> Scope {
    let mut vars = Scope::new();
    let hostname = hostname.trim_end_matches('.');
    if hostname.is_empty() {
        return vars;
    }
    vars.insert("FQDN".to_string(), Value::String(hostname.to_string()));

    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() < 2 {
        return vars;
    }
    let tld = labels[labels.len() - 1];
    let dn = labels[labels.len() - 2];
    vars.insert("TLD".to_string(), Value::String(tld.to_string()));
    vars.insert("DN".to_string(), Value::String(dn.to_string()));
    vars.insert("RDN".to_string(), Value::String(format!("{}.{}", dn, tld)));
    if labels.len() > 2 {
        let sd = labels[..labels.len() - 2].join(".");
        vars.insert("SD".to_string(), Value::String(sd));
    }
    vars
}

/// Mutable per-target context shared across probes of one target.
///
/// Contexts are keyed by the target input and are never shared across
/// concurrent target executions; the lock only guards the map itself.
#[derive(Debug, Default)]
pub struct TemplateContext {
    inner: Mutex<HashMap<String, Scope>>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all variables stored for a target.
    pub fn get_all(&self, target: &str) -> Scope {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(target).cloned().unwrap_or_default()
    }

    /// Merge a scope into the context for a target.
    pub fn merge(&self, target: &str, scope: &Scope) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = inner.entry(target.to_string()).or_default();
        for (k, v) in scope {
            ctx.insert(k.clone(), v.clone());
        }
    }

    /// Set a single variable in the context for a target.
    pub fn set(&self, target: &str, name: &str, value: Value) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(target.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    /// Drop the context for a target once its processing ends.
    pub fn clear(&self, target: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(target);
    }
}
