//! Result event construction
//!
//! A result event is the final externally visible record of one terminal
//! probe outcome: an error, a synchronous match or miss, or a deferred
//! out-of-band correlation match.

use crate::operators::OperatorResult;
use crate::scope::{value_str, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Protocol type string synthesized into every outcome
pub const REQUEST_TYPE: &str = "probe";

/// Callback invoked once per terminal probe outcome. Ordering across probes
/// is not guaranteed under the parallel strategy.
pub type ResultCallback = Arc<dyn Fn(ResultEvent) + Send + Sync>;

/// Final externally visible result record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    pub id: Uuid,
    pub template_id: String,
    pub template_path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub matched: String,
    pub timestamp: DateTime<Utc>,
    pub matcher_status: bool,
    pub matcher_names: Vec<String>,
    pub extracted_results: Vec<String>,
    /// Payload values the probe was issued with
    pub metadata: Scope,
    pub request: String,
    pub response: String,
    pub ip: String,
    pub error: Option<String>,
}

/// Build a result event from internal outcome data and an operator result.
pub fn create_event(data: &Scope, operator_result: Option<&OperatorResult>) -> ResultEvent {
    let field = |key: &str| data.get(key).map(value_str).unwrap_or_default();

    ResultEvent {
        id: Uuid::new_v4(),
        template_id: field("template-id"),
        template_path: field("template-path"),
        kind: field("type"),
        host: field("host"),
        matched: field("matched"),
        timestamp: Utc::now(),
        matcher_status: operator_result.map(|r| r.matched).unwrap_or(false),
        matcher_names: operator_result
            .map(|r| r.matched_names.clone())
            .unwrap_or_default(),
        extracted_results: operator_result
            .map(|r| r.output_extracts.clone())
            .unwrap_or_default(),
        metadata: operator_result
            .map(|r| r.payload_values.clone())
            .unwrap_or_default(),
        request: field("request"),
        response: field("response"),
        ip: field("ip"),
        error: data
            .get("error")
            .map(value_str)
            .filter(|e| !e.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_event_reads_synthesized_keys() {
        let mut data = Scope::new();
        data.insert("template-id".to_string(), json!("ssh-weak-auth"));
        data.insert("type".to_string(), json!(REQUEST_TYPE));
        data.insert("host".to_string(), json!("example.com"));
        data.insert("matched".to_string(), json!("example.com:22"));
        data.insert("response".to_string(), json!("login ok"));

        let result = OperatorResult {
            matched: true,
            output_extracts: vec!["OpenSSH_8.9".to_string()],
            ..Default::default()
        };
        let event = create_event(&data, Some(&result));

        assert_eq!(event.template_id, "ssh-weak-auth");
        assert_eq!(event.matched, "example.com:22");
        assert!(event.matcher_status);
        assert_eq!(event.extracted_results, vec!["OpenSSH_8.9"]);
        assert!(event.error.is_none());
    }

    #[test]
    fn test_create_event_carries_error() {
        let mut data = Scope::new();
        data.insert("error".to_string(), json!("connection refused"));

        let event = create_event(&data, None);
        assert_eq!(event.error.as_deref(), Some("connection refused"));
        assert!(!event.matcher_status);
    }
}
