//! Merge and interpolation policies.
//!
//! A policy decides how a frame's partial state is folded into the
//! accumulated state, and how two rolled states are blended for a time
//! between frames.
//!
//! - [`ShallowPolicy`]: top-level fields replace wholesale, numbers lerp
//! - [`NestedPolicy`]: maps (and optionally arrays) are merged and blended recursively
//! - [`CustomPolicy`]: per-field overrides, falling back to nested behavior

use crate::value::{lerp, State, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Strategy for folding frames and blending states.
pub trait StatePolicy: Send + Sync {
    /// Folds `from` (a frame's partial state) into `to`.
    fn merge(&self, from: &State, to: &mut State);
    
    /// Writes the blend of `curr` and `next` at `ratio` (0..=1) into `target`.
    ///
    /// `target` starts out equal to `curr`.
    fn interpolate(&self, curr: &State, next: &State, ratio: f64, target: &mut State);
}

// ============================================================================
// SHALLOW
// ============================================================================

/// Default policy: every top-level field of the frame overwrites the state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShallowPolicy;

impl StatePolicy for ShallowPolicy {
    fn merge(&self, from: &State, to: &mut State) {
        for (key, value) in from {
            to.insert(key.clone(), value.clone());
        }
    }
    
    fn interpolate(&self, curr: &State, next: &State, ratio: f64, target: &mut State) {
        for (key, value) in curr {
            let blended = match (value, next.get(key)) {
                (Value::Number(a), Some(Value::Number(b))) => Value::Number(lerp(*a, *b, ratio)),
                _ => value.clone(),
            };
            target.insert(key.clone(), blended);
        }
    }
}

// ============================================================================
// NESTED
// ============================================================================

/// Recursive policy for nested telemetry (e.g. `odometry.pose.x`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NestedPolicy {
    /// Merge and blend arrays element-wise instead of replacing them
    pub traverse_arrays: bool,
}

impl NestedPolicy {
    pub fn new(traverse_arrays: bool) -> Self {
        Self { traverse_arrays }
    }
    
    /// Merges a single value into `to` in place.
    pub fn merge_value(&self, from: &Value, to: &mut Value) {
        match (from, to) {
            (Value::Map(from), Value::Map(to)) => self.merge_map(from, to),
            (Value::Array(from), Value::Array(to)) if self.traverse_arrays => {
                for (i, item) in from.iter().enumerate() {
                    match to.get_mut(i) {
                        Some(slot) => self.merge_value(item, slot),
                        None => to.push(item.clone()),
                    }
                }
            }
            (from, to) => *to = from.clone(),
        }
    }
    
    fn merge_map(&self, from: &State, to: &mut State) {
        for (key, value) in from {
            match to.get_mut(key) {
                Some(slot) => self.merge_value(value, slot),
                None => {
                    to.insert(key.clone(), value.clone());
                }
            }
        }
    }
    
    /// Blends a single value. Non-numeric leaves hold at `curr`.
    pub fn interpolate_value(&self, curr: &Value, next: Option<&Value>, ratio: f64) -> Value {
        match (curr, next) {
            (Value::Number(a), Some(Value::Number(b))) => Value::Number(lerp(*a, *b, ratio)),
            (Value::Map(curr), Some(Value::Map(next))) => {
                Value::Map(self.interpolate_map(curr, next, ratio))
            }
            (Value::Array(curr), Some(Value::Array(next))) if self.traverse_arrays => Value::Array(
                curr.iter()
                    .enumerate()
                    .map(|(i, item)| self.interpolate_value(item, next.get(i), ratio))
                    .collect(),
            ),
            (curr, _) => curr.clone(),
        }
    }
    
    fn interpolate_map(&self, curr: &State, next: &State, ratio: f64) -> State {
        curr.iter()
            .map(|(key, value)| (key.clone(), self.interpolate_value(value, next.get(key), ratio)))
            .collect()
    }
}

impl StatePolicy for NestedPolicy {
    fn merge(&self, from: &State, to: &mut State) {
        self.merge_map(from, to);
    }
    
    fn interpolate(&self, curr: &State, next: &State, ratio: f64, target: &mut State) {
        for (key, value) in curr {
            target.insert(key.clone(), self.interpolate_value(value, next.get(key), ratio));
        }
    }
}

// ============================================================================
// CUSTOM
// ============================================================================

/// Per-field merge override: `(incoming, existing) -> merged`.
pub type MergeFn = Arc<dyn Fn(&Value, Option<&Value>) -> Value + Send + Sync>;

/// Per-field interpolation override: `(curr, next, ratio) -> blended`.
pub type InterpolateFn = Arc<dyn Fn(&Value, Option<&Value>, f64) -> Value + Send + Sync>;

/// A field override: either a function, or a nested table of overrides
/// for the fields of a map value.
pub enum FieldRule<F> {
    Apply(F),
    Nested(HashMap<String, FieldRule<F>>),
}

impl<F> FieldRule<F> {
    /// Builds a nested table from `(field, rule)` pairs.
    pub fn nested<I, K>(rules: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldRule<F>)>,
        K: Into<String>,
    {
        FieldRule::Nested(rules.into_iter().map(|(k, r)| (k.into(), r)).collect())
    }
}

impl FieldRule<MergeFn> {
    pub fn merge<F>(f: F) -> Self
    where
        F: Fn(&Value, Option<&Value>) -> Value + Send + Sync + 'static,
    {
        FieldRule::Apply(Arc::new(f))
    }
}

impl FieldRule<InterpolateFn> {
    pub fn interpolate<F>(f: F) -> Self
    where
        F: Fn(&Value, Option<&Value>, f64) -> Value + Send + Sync + 'static,
    {
        FieldRule::Apply(Arc::new(f))
    }
}

/// Policy with per-field overrides. Unmapped fields use the nested policy.
#[derive(Default)]
pub struct CustomPolicy {
    fallback: NestedPolicy,
    merge_rules: HashMap<String, FieldRule<MergeFn>>,
    interpolate_rules: HashMap<String, FieldRule<InterpolateFn>>,
}

impl CustomPolicy {
    pub fn new(fallback: NestedPolicy) -> Self {
        Self {
            fallback,
            merge_rules: HashMap::new(),
            interpolate_rules: HashMap::new(),
        }
    }
    
    /// Overrides merging of a top-level field.
    pub fn with_merge<F>(self, field: &str, f: F) -> Self
    where
        F: Fn(&Value, Option<&Value>) -> Value + Send + Sync + 'static,
    {
        self.with_merge_rule(field, FieldRule::merge(f))
    }
    
    /// Overrides interpolation of a top-level field.
    pub fn with_interpolate<F>(self, field: &str, f: F) -> Self
    where
        F: Fn(&Value, Option<&Value>, f64) -> Value + Send + Sync + 'static,
    {
        self.with_interpolate_rule(field, FieldRule::interpolate(f))
    }
    
    pub fn with_merge_rule(mut self, field: &str, rule: FieldRule<MergeFn>) -> Self {
        self.merge_rules.insert(field.to_string(), rule);
        self
    }
    
    pub fn with_interpolate_rule(mut self, field: &str, rule: FieldRule<InterpolateFn>) -> Self {
        self.interpolate_rules.insert(field.to_string(), rule);
        self
    }
    
    fn merge_with(&self, rules: &HashMap<String, FieldRule<MergeFn>>, from: &State, to: &mut State) {
        for (key, value) in from {
            match (rules.get(key), value) {
                (Some(FieldRule::Apply(f)), _) => {
                    let merged = f(value, to.get(key));
                    to.insert(key.clone(), merged);
                }
                (Some(FieldRule::Nested(inner)), Value::Map(from_map)) => {
                    let slot = to.entry(key.clone()).or_insert_with(|| Value::Map(State::new()));
                    if slot.as_map().is_none() {
                        *slot = Value::Map(State::new());
                    }
                    if let Value::Map(to_map) = slot {
                        self.merge_with(inner, from_map, to_map);
                    }
                }
                _ => match to.get_mut(key) {
                    Some(slot) => self.fallback.merge_value(value, slot),
                    None => {
                        to.insert(key.clone(), value.clone());
                    }
                },
            }
        }
    }
    
    fn interpolate_with(
        &self,
        rules: &HashMap<String, FieldRule<InterpolateFn>>,
        curr: &State,
        next: &State,
        ratio: f64,
    ) -> State {
        curr.iter()
            .map(|(key, value)| {
                let blended = match (rules.get(key), value, next.get(key)) {
                    (Some(FieldRule::Apply(f)), _, next) => f(value, next, ratio),
                    (Some(FieldRule::Nested(inner)), Value::Map(c), Some(Value::Map(n))) => {
                        Value::Map(self.interpolate_with(inner, c, n, ratio))
                    }
                    (_, _, next) => self.fallback.interpolate_value(value, next, ratio),
                };
                (key.clone(), blended)
            })
            .collect()
    }
}

impl StatePolicy for CustomPolicy {
    fn merge(&self, from: &State, to: &mut State) {
        self.merge_with(&self.merge_rules, from, to);
    }
    
    fn interpolate(&self, curr: &State, next: &State, ratio: f64, target: &mut State) {
        for (key, value) in self.interpolate_with(&self.interpolate_rules, curr, next, ratio) {
            target.insert(key, value);
        }
    }
}
