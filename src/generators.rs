//! Payload combinator for attack-type expansion
//!
//! This module expands a payload specification plus an attack-type strategy
//! into a lazy, finite sequence of value sets with a precomputed total.

use crate::error::{EngineError, EngineResult};
use crate::scope::{value_str, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Hard cap on cross-product expansion
const MAX_COMBINATIONS: usize = 10_000_000;

/// Attack type enumeration for payload combination
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttackType {
    /// Vary one payload field at a time, holding the others fixed
    #[default]
    Sniper,
    /// Advance all fields together, stopping at the shortest list
    Pitchfork,
    /// Every combination of every field
    ClusterBomb,
}

/// A single payload field: a literal value list or an external file
/// reference resolved to its concrete list before expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadSource {
    List(Vec<Value>),
    File(String),
}

impl PayloadSource {
    /// Resolve the source to its concrete value list. File references are
    /// read one value per line with blank lines dropped.
    pub fn resolve(&self, name: &str) -> EngineResult<Vec<String>> {
        let values = match self {
            PayloadSource::List(values) => values.iter().map(value_str).collect::<Vec<_>>(),
            PayloadSource::File(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    EngineError::PayloadGenerationFailed {
                        reason: format!("could not read payload file {}: {}", path, e),
                    }
                })?;
                content
                    .lines()
                    .map(|line| line.trim().to_string())
                    .filter(|line| !line.is_empty())
                    .collect()
            }
        };
        if values.is_empty() {
            return Err(EngineError::payload_config(format!(
                "payload {} resolved to an empty list",
                name
            )));
        }
        Ok(values)
    }

    /// Build a source from a dynamic value, as produced by the init phase.
    /// Arrays become literal lists, strings become file references.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(values) => PayloadSource::List(values),
            Value::String(path) => PayloadSource::File(path),
            other => PayloadSource::List(vec![other]),
        }
    }
}

/// Combinator over a payload specification under a chosen attack type.
///
/// Field order is deterministic (sorted by name) so that compiling the same
/// definition twice yields identical n-th combinations.
#[derive(Debug, Clone)]
pub struct PayloadGenerator {
    sets: Arc<Vec<(String, Vec<String>)>>,
    attack: AttackType,
    total: usize,
}

impl PayloadGenerator {
    /// Resolve all payload sources and precompute the expansion total.
    pub fn new(
        payloads: &BTreeMap<String, PayloadSource>,
        attack: AttackType,
    ) -> EngineResult<Self> {
        if payloads.is_empty() {
            return Err(EngineError::payload_config(
                "payload specification is empty",
            ));
        }

        let mut sets = Vec::with_capacity(payloads.len());
        for (name, source) in payloads {
            sets.push((name.clone(), source.resolve(name)?));
        }

        let total = Self::compute_total(&sets, attack)?;
        Ok(Self {
            sets: Arc::new(sets),
            attack,
            total,
        })
    }

    fn compute_total(sets: &[(String, Vec<String>)], attack: AttackType) -> EngineResult<usize> {
        let total = match attack {
            AttackType::Sniper => sets.iter().map(|(_, v)| v.len()).sum(),
            AttackType::Pitchfork => sets.iter().map(|(_, v)| v.len()).min().unwrap_or(0),
            AttackType::ClusterBomb => {
                let mut product = 1usize;
                for (_, values) in sets {
                    product = product.checked_mul(values.len()).unwrap_or(usize::MAX);
                    if product > MAX_COMBINATIONS {
                        return Err(EngineError::payload_config(format!(
                            "clusterbomb would generate too many combinations (>{})",
                            MAX_COMBINATIONS
                        )));
                    }
                }
                product
            }
        };
        Ok(total)
    }

    /// Total number of value sets the expansion will produce.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn attack_type(&self) -> AttackType {
        self.attack
    }

    /// Create a fresh forward-only iterator over the expansion.
    pub fn iterator(&self) -> PayloadIterator {
        PayloadIterator {
            sets: Arc::clone(&self.sets),
            attack: self.attack,
            total: self.total,
            produced: 0,
        }
    }
}

/// Forward-only cursor over the payload expansion.
///
/// Not rewindable; exhaustion is an idempotent terminal state. Only one
/// caller may advance it - the engine's dispatch loop.
#[derive(Debug)]
pub struct PayloadIterator {
    sets: Arc<Vec<(String, Vec<String>)>>,
    attack: AttackType,
    total: usize,
    produced: usize,
}

impl PayloadIterator {
    /// Precomputed total used for progress accounting.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Decode the n-th combination. The mapping from linear index to value
    /// set is fixed per attack type, which keeps traversal deterministic.
    fn nth_combination(&self, n: usize) -> Scope {
        let mut set = Scope::new();
        match self.attack {
            AttackType::Sniper => {
                // one field varies per value set; the others are untouched,
                // so no combination is ever produced twice
                let mut remaining = n;
                for (name, values) in self.sets.iter() {
                    if remaining < values.len() {
                        set.insert(name.clone(), Value::String(values[remaining].clone()));
                        break;
                    }
                    remaining -= values.len();
                }
            }
            AttackType::Pitchfork => {
                for (name, values) in self.sets.iter() {
                    set.insert(name.clone(), Value::String(values[n].clone()));
                }
            }
            AttackType::ClusterBomb => {
                // mixed-radix decode, last field advancing fastest
                let mut stride = self.total;
                for (name, values) in self.sets.iter() {
                    stride /= values.len();
                    let idx = (n / stride) % values.len();
                    set.insert(name.clone(), Value::String(values[idx].clone()));
                }
            }
        }
        set
    }
}

impl Iterator for PayloadIterator {
    type Item = Scope;

    fn next(&mut self) -> Option<Scope> {
        if self.produced >= self.total {
            return None;
        }
        let set = self.nth_combination(self.produced);
        self.produced += 1;
        Some(set)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.produced;
        (remaining, Some(remaining))
    }
}
