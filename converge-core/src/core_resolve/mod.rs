/*
    core_resolve - Field-level conflict detection and resolution

    Pure functions over JSON documents: no I/O, no clock reads. Callers
    pass `now_ms` explicitly, so the same inputs always produce the same
    conflicts and the same resolutions.
*/

pub mod merge;

pub use merge::{deep_merge, union_arrays};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// How a conflicting field gets resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LastWriteWins,
    SourcePriority,
    FieldPriority,
    MergeValues,
    RejectChange,
    ManualResolution,
}

/// One field where the two sides disagree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub field: String,
    pub source: String,
    pub target: String,
    pub local_value: Value,
    pub remote_value: Value,
    pub local_timestamp_ms: u64,
    pub remote_timestamp_ms: u64,
    pub strategy: ResolutionStrategy,
    pub resolved: bool,
    pub resolved_value: Option<Value>,
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub conflict_id: String,
    pub success: bool,
    pub resolved_value: Option<Value>,
    pub strategy: ResolutionStrategy,
    pub requires_manual_intervention: bool,
}

/// Resolver policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Strategy applied when nothing more specific matches
    pub default_strategy: ResolutionStrategy,

    /// Ordered endpoint identifiers; earlier entries win
    pub source_priority: Vec<String>,

    /// Per-field authoritative endpoint
    pub field_priorities: HashMap<String, String>,

    /// Per-field strategy override, consulted before everything else
    pub field_strategies: HashMap<String, ResolutionStrategy>,

    /// Separator used when merging conflicting strings
    pub string_separator: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            default_strategy: ResolutionStrategy::LastWriteWins,
            source_priority: Vec::new(),
            field_priorities: HashMap::new(),
            field_strategies: HashMap::new(),
            string_separator: ", ".to_string(),
        }
    }
}

/// Stateless conflict resolver over a fixed policy
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    config: ResolverConfig,
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig) -> Self {
        ConflictResolver { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Compare two representations of the same entity and emit a Conflict
    /// for every field present on either side whose values differ.
    ///
    /// Timestamps come from each side's `updated_at`; anything unparsable
    /// defaults to `now_ms`, which gives it the lowest last-write-wins
    /// priority against any real historical timestamp.
    pub fn detect_conflicts(
        &self,
        local: &Value,
        remote: &Value,
        source: &str,
        target: &str,
        now_ms: u64,
    ) -> Vec<Conflict> {
        let (local_map, remote_map) = match (local.as_object(), remote.as_object()) {
            (Some(l), Some(r)) => (l, r),
            _ => {
                warn!(%source, %target, "conflict detection skipped: payloads are not objects");
                return Vec::new();
            }
        };

        let local_ts = parse_timestamp(local_map.get("updated_at"), now_ms);
        let remote_ts = parse_timestamp(remote_map.get("updated_at"), now_ms);

        let mut fields: Vec<&String> = local_map.keys().chain(remote_map.keys()).collect();
        fields.sort();
        fields.dedup();

        let mut conflicts = Vec::new();
        for field in fields {
            let local_value = local_map.get(field).cloned().unwrap_or(Value::Null);
            let remote_value = remote_map.get(field).cloned().unwrap_or(Value::Null);
            if local_value == remote_value {
                continue;
            }

            conflicts.push(Conflict {
                id: format!("{}:{}:{}", source, target, field),
                field: field.clone(),
                source: source.to_string(),
                target: target.to_string(),
                local_value,
                remote_value,
                local_timestamp_ms: local_ts,
                remote_timestamp_ms: remote_ts,
                strategy: self.strategy_for(field, source, target),
                resolved: false,
                resolved_value: None,
            });
        }
        conflicts
    }

    /// Strategy precedence: per-field override, then per-field
    /// authoritative endpoint, then the source priority list, then the
    /// configured default.
    fn strategy_for(&self, field: &str, source: &str, target: &str) -> ResolutionStrategy {
        if let Some(strategy) = self.config.field_strategies.get(field) {
            return *strategy;
        }
        if self.config.field_priorities.contains_key(field) {
            return ResolutionStrategy::FieldPriority;
        }
        let order = &self.config.source_priority;
        if order.iter().any(|s| s == source) && order.iter().any(|s| s == target) {
            return ResolutionStrategy::SourcePriority;
        }
        self.config.default_strategy
    }

    pub fn resolve(&self, conflict: &Conflict) -> ResolutionResult {
        let resolved_value = match conflict.strategy {
            ResolutionStrategy::LastWriteWins => Some(self.last_write_wins(conflict)),
            ResolutionStrategy::SourcePriority => Some(self.source_priority(conflict)),
            ResolutionStrategy::FieldPriority => Some(self.field_priority(conflict)),
            ResolutionStrategy::MergeValues => Some(self.merge_values(conflict)),
            ResolutionStrategy::RejectChange => Some(conflict.local_value.clone()),
            ResolutionStrategy::ManualResolution => None,
        };

        match resolved_value {
            Some(value) => ResolutionResult {
                conflict_id: conflict.id.clone(),
                success: true,
                resolved_value: Some(value),
                strategy: conflict.strategy,
                requires_manual_intervention: false,
            },
            None => ResolutionResult {
                conflict_id: conflict.id.clone(),
                success: false,
                resolved_value: None,
                strategy: conflict.strategy,
                requires_manual_intervention: true,
            },
        }
    }

    /// Resolve every conflict, marking each successfully resolved one.
    /// `resolved` only ever transitions false to true.
    pub fn resolve_all(&self, conflicts: &mut [Conflict]) -> Vec<ResolutionResult> {
        conflicts
            .iter_mut()
            .map(|conflict| {
                let result = self.resolve(conflict);
                if result.success {
                    conflict.resolved = true;
                    conflict.resolved_value = result.resolved_value.clone();
                }
                result
            })
            .collect()
    }

    /// Strictly newer remote timestamp wins; ties keep the local value.
    fn last_write_wins(&self, conflict: &Conflict) -> Value {
        if conflict.remote_timestamp_ms > conflict.local_timestamp_ms {
            conflict.remote_value.clone()
        } else {
            conflict.local_value.clone()
        }
    }

    fn source_priority(&self, conflict: &Conflict) -> Value {
        let order = &self.config.source_priority;
        let source_rank = order.iter().position(|s| s == &conflict.source);
        let target_rank = order.iter().position(|s| s == &conflict.target);

        match (source_rank, target_rank) {
            (Some(s), Some(t)) if s < t => conflict.local_value.clone(),
            (Some(_), Some(_)) => conflict.remote_value.clone(),
            // Endpoints missing from the priority list fall back to LWW.
            _ => self.last_write_wins(conflict),
        }
    }

    fn field_priority(&self, conflict: &Conflict) -> Value {
        match self.config.field_priorities.get(&conflict.field) {
            Some(owner) if owner == &conflict.source => conflict.local_value.clone(),
            Some(owner) if owner == &conflict.target => conflict.remote_value.clone(),
            _ => self.last_write_wins(conflict),
        }
    }

    /// Type-aware merge: arrays union, objects deep-merge, strings
    /// concatenate. Incompatible types fall back to last-write-wins.
    fn merge_values(&self, conflict: &Conflict) -> Value {
        match (&conflict.local_value, &conflict.remote_value) {
            (Value::Array(l), Value::Array(r)) => Value::Array(union_arrays(l, r)),
            (Value::Object(l), Value::Object(r)) => Value::Object(deep_merge(l, r)),
            (Value::String(l), Value::String(r)) => {
                Value::String(format!("{}{}{}", l, self.config.string_separator, r))
            }
            _ => self.last_write_wins(conflict),
        }
    }

    /// Fold resolved values back into an outbound payload.
    pub fn apply_resolutions(
        payload: &Value,
        conflicts: &[Conflict],
        results: &[ResolutionResult],
    ) -> Value {
        let mut merged = payload.clone();
        if let Some(map) = merged.as_object_mut() {
            for (conflict, result) in conflicts.iter().zip(results.iter()) {
                if let Some(value) = result.resolved_value.as_ref().filter(|_| result.success) {
                    map.insert(conflict.field.clone(), value.clone());
                }
            }
        }
        merged
    }
}

/// Read an `updated_at` value as epoch milliseconds. Accepts RFC3339
/// strings and integer milliseconds; anything else yields the fallback.
pub(crate) fn parse_timestamp(value: Option<&Value>, fallback_ms: u64) -> u64 {
    match value {
        Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis().max(0) as u64)
            .unwrap_or(fallback_ms),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(fallback_ms),
        _ => fallback_ms,
    }
}
