//! Matcher and extractor compilation and execution
//!
//! Operators are declared on the request definition, compiled once, then
//! applied to each probe's outcome data. Matching combines per the
//! configured condition; extraction never fails a probe.

use crate::error::{EngineError, EngineResult};
use crate::expressions;
use crate::scope::{value_str, Scope};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Combination rule for multiple words, regexes or matchers
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    And,
    #[default]
    Or,
}

/// Matcher kind - a closed enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    /// Substring match against the target part
    Word,
    /// Exact equality against the target part
    Equal,
    /// Regular expression match against the target part
    Regex,
    /// DSL predicate evaluated against the whole outcome data
    Dsl,
}

/// A single matcher rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Matcher {
    #[serde(rename = "type")]
    pub kind: MatcherKind,
    /// Outcome key the matcher applies to. Defaults to `response` at
    /// compile time, except for DSL matchers which have no fixed part.
    pub part: String,
    pub name: Option<String>,
    pub words: Vec<String>,
    pub regex: Vec<String>,
    pub dsl: Vec<String>,
    pub condition: Condition,
    pub negative: bool,
}

impl Default for Matcher {
    fn default() -> Self {
        Self {
            kind: MatcherKind::Word,
            part: String::new(),
            name: None,
            words: Vec::new(),
            regex: Vec::new(),
            dsl: Vec::new(),
            condition: Condition::default(),
            negative: false,
        }
    }
}

/// Extractor kind - a closed enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// Regular expression capture against a part
    Regex,
    /// Lift named keys out of the outcome data
    Kval,
}

/// A single extractor rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Extractor {
    #[serde(rename = "type")]
    pub kind: ExtractorKind,
    pub name: Option<String>,
    pub part: String,
    pub regex: Vec<String>,
    pub group: usize,
    pub kval: Vec<String>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self {
            kind: ExtractorKind::Regex,
            name: None,
            part: String::new(),
            regex: Vec::new(),
            group: 0,
            kval: Vec::new(),
        }
    }
}

/// Declared operator set for a request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Operators {
    pub matchers: Vec<Matcher>,
    pub extractors: Vec<Extractor>,
    #[serde(rename = "matchers-condition")]
    pub matchers_condition: Condition,
}

impl Operators {
    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty() && self.extractors.is_empty()
    }

    /// Compile the operator set: apply default parts and build regexes.
    /// A malformed pattern fails compilation of the whole request.
    pub fn compile(&self) -> EngineResult<CompiledOperators> {
        let mut matchers = Vec::with_capacity(self.matchers.len());
        for matcher in &self.matchers {
            let mut matcher = matcher.clone();
            if matcher.part.is_empty() && matcher.kind != MatcherKind::Dsl {
                matcher.part = "response".to_string();
            }
            let regexes = compile_patterns(&matcher.regex)?;
            matchers.push(CompiledMatcher { matcher, regexes });
        }

        let mut extractors = Vec::with_capacity(self.extractors.len());
        for extractor in &self.extractors {
            let mut extractor = extractor.clone();
            if extractor.part.is_empty() {
                extractor.part = "response".to_string();
            }
            let regexes = compile_patterns(&extractor.regex)?;
            extractors.push(CompiledExtractor { extractor, regexes });
        }

        Ok(CompiledOperators {
            matchers,
            extractors,
            matchers_condition: self.matchers_condition,
        })
    }
}

fn compile_patterns(patterns: &[String]) -> EngineResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| EngineError::OperatorCompileFailed {
                reason: format!("invalid regex {}: {}", p, e),
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
struct CompiledMatcher {
    matcher: Matcher,
    regexes: Vec<Regex>,
}

#[derive(Debug, Clone)]
struct CompiledExtractor {
    extractor: Extractor,
    regexes: Vec<Regex>,
}

/// Result of applying compiled operators to outcome data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorResult {
    pub matched: bool,
    /// Names of the matchers that fired
    pub matched_names: Vec<String>,
    /// Extracted values per extractor name
    pub extracted: std::collections::HashMap<String, Vec<String>>,
    /// Flat list of all extracted values
    pub output_extracts: Vec<String>,
    /// Payload values the probe was issued with
    pub payload_values: Scope,
}

/// Compiled operator set ready for execution against outcome data
#[derive(Debug, Clone)]
pub struct CompiledOperators {
    matchers: Vec<CompiledMatcher>,
    extractors: Vec<CompiledExtractor>,
    matchers_condition: Condition,
}

impl CompiledOperators {
    /// Apply matchers and extractors to a probe's outcome data.
    pub fn execute(&self, data: &Scope) -> OperatorResult {
        let mut result = OperatorResult::default();

        for compiled in &self.extractors {
            let name = compiled
                .extractor
                .name
                .clone()
                .unwrap_or_else(|| format!("extract-{}", result.extracted.len()));
            let values = compiled.extract(data);
            if !values.is_empty() {
                result.output_extracts.extend(values.clone());
                result.extracted.insert(name, values);
            }
        }

        if self.matchers.is_empty() {
            // extraction-only operators match when something was extracted
            result.matched = !result.output_extracts.is_empty();
            return result;
        }

        let mut matched = self.matchers_condition == Condition::And;
        for compiled in &self.matchers {
            let hit = compiled.matches(data);
            if hit {
                if let Some(name) = &compiled.matcher.name {
                    result.matched_names.push(name.clone());
                }
            }
            match self.matchers_condition {
                Condition::And => matched = matched && hit,
                Condition::Or => matched = matched || hit,
            }
        }
        result.matched = matched;
        result
    }
}

impl CompiledMatcher {
    fn matches(&self, data: &Scope) -> bool {
        let result = match self.matcher.kind {
            MatcherKind::Dsl => self.match_dsl(data),
            _ => {
                let item = data.get(&self.matcher.part).map(value_str);
                match item {
                    Some(item) => self.match_part(&item),
                    None => false,
                }
            }
        };
        result != self.matcher.negative
    }

    fn match_part(&self, item: &str) -> bool {
        match self.matcher.kind {
            MatcherKind::Word => combine(self.matcher.condition, &self.matcher.words, |w| {
                item.contains(w)
            }),
            MatcherKind::Equal => {
                combine(self.matcher.condition, &self.matcher.words, |w| item == w)
            }
            MatcherKind::Regex => {
                combine(self.matcher.condition, &self.regexes, |r| r.is_match(item))
            }
            MatcherKind::Dsl => false,
        }
    }

    fn match_dsl(&self, data: &Scope) -> bool {
        combine(self.matcher.condition, &self.matcher.dsl, |expr| {
            expressions::evaluate_predicate(expr, data)
        })
    }
}

impl CompiledExtractor {
    fn extract(&self, data: &Scope) -> Vec<String> {
        match self.extractor.kind {
            ExtractorKind::Regex => {
                let item = match data.get(&self.extractor.part) {
                    Some(value) => value_str(value),
                    None => return Vec::new(),
                };
                let mut values = Vec::new();
                for regex in &self.regexes {
                    for caps in regex.captures_iter(&item) {
                        if let Some(m) = caps.get(self.extractor.group) {
                            values.push(m.as_str().to_string());
                        }
                    }
                }
                values
            }
            ExtractorKind::Kval => self
                .extractor
                .kval
                .iter()
                .filter_map(|key| data.get(key).map(value_str))
                .filter(|v| !v.is_empty())
                .collect(),
        }
    }
}

fn combine<T>(condition: Condition, items: &[T], mut predicate: impl FnMut(&T) -> bool) -> bool {
    if items.is_empty() {
        return false;
    }
    match condition {
        Condition::And => items.iter().all(|i| predicate(i)),
        Condition::Or => items.iter().any(|i| predicate(i)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(pairs: &[(&str, &str)]) -> Scope {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    fn word_matcher(words: &[&str]) -> Matcher {
        Matcher {
            words: words.iter().map(|w| w.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_word_matcher_defaults_to_response_part() {
        let operators = Operators {
            matchers: vec![word_matcher(&["admin"])],
            ..Default::default()
        };
        let compiled = operators.compile().unwrap();

        assert!(compiled.execute(&data(&[("response", "admin panel")])).matched);
        assert!(!compiled.execute(&data(&[("response", "login")])).matched);
        assert!(!compiled.execute(&data(&[("body", "admin panel")])).matched);
    }

    #[test]
    fn test_word_condition_and() {
        let mut matcher = word_matcher(&["admin", "panel"]);
        matcher.condition = Condition::And;
        let compiled = Operators {
            matchers: vec![matcher],
            ..Default::default()
        }
        .compile()
        .unwrap();

        assert!(compiled.execute(&data(&[("response", "admin panel")])).matched);
        assert!(!compiled.execute(&data(&[("response", "admin only")])).matched);
    }

    #[test]
    fn test_equal_matcher() {
        let mut matcher = word_matcher(&["2"]);
        matcher.kind = MatcherKind::Equal;
        matcher.part = "id".to_string();
        let compiled = Operators {
            matchers: vec![matcher],
            ..Default::default()
        }
        .compile()
        .unwrap();

        assert!(compiled.execute(&data(&[("id", "2")])).matched);
        assert!(!compiled.execute(&data(&[("id", "22")])).matched);
    }

    #[test]
    fn test_regex_matcher_and_bad_pattern() {
        let matcher = Matcher {
            kind: MatcherKind::Regex,
            regex: vec![r"uid=\d+".to_string()],
            ..Default::default()
        };
        let compiled = Operators {
            matchers: vec![matcher],
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert!(compiled.execute(&data(&[("response", "uid=100(root)")])).matched);

        let bad = Operators {
            matchers: vec![Matcher {
                kind: MatcherKind::Regex,
                regex: vec!["[".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(bad.compile().is_err());
    }

    #[test]
    fn test_dsl_matcher_has_no_default_part() {
        let matcher = Matcher {
            kind: MatcherKind::Dsl,
            dsl: vec!["id == \"2\"".to_string()],
            ..Default::default()
        };
        let operators = Operators {
            matchers: vec![matcher],
            ..Default::default()
        };
        let compiled = operators.compile().unwrap();

        assert!(compiled.execute(&data(&[("id", "2")])).matched);
        assert!(!compiled.execute(&data(&[("id", "3")])).matched);
    }

    #[test]
    fn test_negative_matcher() {
        let mut matcher = word_matcher(&["error"]);
        matcher.negative = true;
        let compiled = Operators {
            matchers: vec![matcher],
            ..Default::default()
        }
        .compile()
        .unwrap();

        assert!(compiled.execute(&data(&[("response", "all good")])).matched);
        assert!(!compiled.execute(&data(&[("response", "error: denied")])).matched);
    }

    #[test]
    fn test_matchers_condition_and() {
        let operators = Operators {
            matchers: vec![word_matcher(&["admin"]), word_matcher(&["panel"])],
            matchers_condition: Condition::And,
            ..Default::default()
        };
        let compiled = operators.compile().unwrap();

        assert!(compiled.execute(&data(&[("response", "admin panel")])).matched);
        assert!(!compiled.execute(&data(&[("response", "admin")])).matched);
    }

    #[test]
    fn test_regex_extractor_with_group() {
        let extractor = Extractor {
            kind: ExtractorKind::Regex,
            name: Some("version".to_string()),
            regex: vec![r"v(\d+\.\d+)".to_string()],
            group: 1,
            ..Default::default()
        };
        let operators = Operators {
            extractors: vec![extractor],
            ..Default::default()
        };
        let compiled = operators.compile().unwrap();

        let result = compiled.execute(&data(&[("response", "server v2.4 ready")]));
        assert!(result.matched);
        assert_eq!(result.extracted["version"], vec!["2.4"]);
        assert_eq!(result.output_extracts, vec!["2.4"]);
    }

    #[test]
    fn test_extractor_finding_nothing_is_not_failure() {
        let extractor = Extractor {
            kind: ExtractorKind::Kval,
            kval: vec!["banner".to_string()],
            ..Default::default()
        };
        let operators = Operators {
            matchers: vec![word_matcher(&["ok"])],
            extractors: vec![extractor],
            ..Default::default()
        };
        let compiled = operators.compile().unwrap();

        let result = compiled.execute(&data(&[("response", "ok")]));
        assert!(result.matched);
        assert!(result.extracted.is_empty());
    }

    #[test]
    fn test_kval_extractor() {
        let extractor = Extractor {
            kind: ExtractorKind::Kval,
            name: Some("banner".to_string()),
            kval: vec!["banner".to_string()],
            ..Default::default()
        };
        let compiled = Operators {
            extractors: vec![extractor],
            ..Default::default()
        }
        .compile()
        .unwrap();

        let result = compiled.execute(&data(&[("banner", "OpenSSH_8.9")]));
        assert_eq!(result.extracted["banner"], vec!["OpenSSH_8.9"]);
    }
}
