//! Out-of-band correlation manager
//!
//! Probes may embed `{{oob-url}}` placeholders. Each occurrence is replaced
//! with a unique correlation URL whose marker identifier is registered
//! together with the probe's event data. When an external signal later
//! arrives bearing a marker, match/extract is re-run over the merged data
//! and the deferred event is emitted through the same callback path used
//! for synchronous matches. Undelivered registrations expire silently.

use crate::operators::CompiledOperators;
use crate::output::{create_event, ResultCallback};
use crate::scope::{merge_maps, Scope};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Placeholder substituted into probe bodies
pub const OOB_URL_PLACEHOLDER: &str = "{{oob-url}}";

/// An asynchronous external signal carrying a correlation marker
#[derive(Debug, Clone)]
pub struct OobSignal {
    /// Marker identifier echoed back by the external effect
    pub marker: String,
    /// Signal payload merged into the original event data, e.g.
    /// `oob-protocol`, `oob-request`, `oob-response`
    pub data: Scope,
}

/// Deferred-match bundle created when a probe body contains markers
pub struct Registration {
    /// Target input that owns this registration
    pub target: String,
    /// Internal event data captured at probe time
    pub event: Scope,
    /// Payload values the probe was issued with
    pub payload_values: Scope,
    pub operators: Option<Arc<CompiledOperators>>,
    pub callback: ResultCallback,
}

/// Registration table correlating markers with pending matches.
///
/// Delivery and target-completion expiry are the only two transitions;
/// an expired registration emits nothing.
pub struct CorrelationManager {
    server_domain: String,
    pending: Mutex<HashMap<String, Arc<Registration>>>,
}

impl CorrelationManager {
    pub fn new(server_domain: impl Into<String>) -> Self {
        Self {
            server_domain: server_domain.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Replace every `{{oob-url}}` occurrence in a body with a unique
    /// correlation URL, returning the substituted body and the marker ids.
    pub fn replace_markers(&self, body: &str) -> (String, Vec<String>) {
        let mut markers = Vec::new();
        let mut result = String::with_capacity(body.len());
        let mut rest = body;
        while let Some(idx) = rest.find(OOB_URL_PLACEHOLDER) {
            let marker = Uuid::new_v4().simple().to_string();
            result.push_str(&rest[..idx]);
            result.push_str(&format!("{}.{}", marker, self.server_domain));
            markers.push(marker);
            rest = &rest[idx + OOB_URL_PLACEHOLDER.len()..];
        }
        result.push_str(rest);
        (result, markers)
    }

    /// Expose the generated correlation URLs in outcome data.
    pub fn make_placeholders(&self, markers: &[String], data: &mut Scope) {
        if let Some(first) = markers.first() {
            data.insert(
                "oob-url".to_string(),
                Value::String(format!("{}.{}", first, self.server_domain)),
            );
        }
        if markers.len() > 1 {
            data.insert(
                "oob-urls".to_string(),
                Value::Array(
                    markers
                        .iter()
                        .map(|m| Value::String(format!("{}.{}", m, self.server_domain)))
                        .collect(),
                ),
            );
        }
    }

    /// Register a deferred match for a set of markers.
    pub fn register(&self, markers: Vec<String>, registration: Registration) {
        let registration = Arc::new(registration);
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for marker in markers {
            pending.insert(marker, Arc::clone(&registration));
        }
    }

    /// Deliver an external signal. Returns true when a deferred event was
    /// emitted; an unknown marker or a non-matching re-run emits nothing.
    pub fn deliver(&self, signal: &OobSignal) -> bool {
        let registration = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&signal.marker)
        };
        let Some(registration) = registration else {
            debug!(marker = %signal.marker, "no registration for delivered signal");
            return false;
        };

        let merged = merge_maps(&[&registration.event, &signal.data]);
        match &registration.operators {
            Some(operators) => {
                let mut result = operators.execute(&merged);
                if !result.matched {
                    return false;
                }
                result.payload_values = registration.payload_values.clone();
                let event = create_event(&merged, Some(&result));
                (registration.callback)(event);
            }
            None => {
                // signal arrival is itself the confirmation
                let event = create_event(&merged, None);
                (registration.callback)(event);
            }
        }
        true
    }

    /// Silently drop undelivered registrations once a target's processing
    /// ends. No partial-result event is emitted.
    pub fn complete_target(&self, target: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|_, registration| registration.target != target);
    }

    /// Number of registrations still awaiting a signal.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
