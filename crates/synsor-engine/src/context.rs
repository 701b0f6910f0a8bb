//! Per-cycle lazy context: one [`ReferenceValue`] cell per free name.
//!
//! Cells start empty and are filled in place on first read by the resolver
//! pipeline. The whole context lives for exactly one evaluation and is
//! discarded at the cycle boundary, so interior mutability here never
//! outlives a cycle.

use std::cell::RefCell;

use rustc_hash::FxHashMap;
use std::hash::Hasher;
use synsor_common::Scalar;
use synsor_parse::FormulaHasher;

use crate::binding::{BindingPlan, Strategy};

/// A lazily-populated cell for one free name.
#[derive(Debug)]
pub struct ReferenceValue {
    /// The external identifier this name stands for (the name itself when
    /// no alias applies); used in diagnostic dependency lines.
    pub reference: RefCell<String>,
    pub strategy: Option<Strategy>,
    value: RefCell<Option<Scalar>>,
}

impl ReferenceValue {
    fn new(name: &str, strategy: Option<Strategy>) -> Self {
        Self {
            reference: RefCell::new(name.to_string()),
            strategy,
            value: RefCell::new(None),
        }
    }
}

/// Minimal per-cycle map of `name → ReferenceValue`.
#[derive(Debug, Default)]
pub struct LazyContext {
    slots: FxHashMap<String, ReferenceValue>,
    unavailable: RefCell<Vec<String>>,
}

impl LazyContext {
    /// Create empty cells for every name in the plan.
    pub fn from_plan(plan: &BindingPlan) -> Self {
        let mut slots = FxHashMap::default();
        for name in &plan.names {
            slots.insert(
                name.clone(),
                ReferenceValue::new(name, plan.strategy(name)),
            );
        }
        Self {
            slots,
            unavailable: RefCell::new(Vec::new()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Pre-populate a slot (used for the `state` token).
    pub fn preset(&self, name: &str, value: Scalar) {
        if let Some(slot) = self.slots.get(name) {
            *slot.value.borrow_mut() = Some(value);
        }
    }

    /// Point a slot at its backing external identifier for diagnostics.
    pub fn set_reference(&self, name: &str, reference: &str) {
        if let Some(slot) = self.slots.get(name) {
            *slot.reference.borrow_mut() = reference.to_string();
        }
    }

    /// The memoized value, if this name has already been resolved.
    pub fn lookup(&self, name: &str) -> Option<Scalar> {
        self.slots
            .get(name)
            .and_then(|slot| slot.value.borrow().clone())
    }

    /// Memoize a resolved value; records a dependency line when the value
    /// is a propagated transient state.
    pub fn store(&self, name: &str, value: &Scalar) {
        if let Some(slot) = self.slots.get(name) {
            *slot.value.borrow_mut() = Some(value.clone());
            if let Some(state) = value.state_name() {
                let reference = slot.reference.borrow();
                self.record_unavailable(format!("{name} ({reference}) is {state}"));
            }
        }
    }

    pub fn strategy(&self, name: &str) -> Option<Strategy> {
        self.slots.get(name).and_then(|slot| slot.strategy)
    }

    pub fn record_unavailable(&self, line: String) {
        let mut lines = self.unavailable.borrow_mut();
        if !lines.contains(&line) {
            lines.push(line);
        }
    }

    /// Diagnostic lines for every transient dependency seen this cycle.
    pub fn unavailable_dependencies(&self) -> Vec<String> {
        self.unavailable.borrow().clone()
    }

    /// Resolved `(name, value)` pairs in sorted name order.
    pub fn resolved_pairs(&self) -> Vec<(String, Scalar)> {
        let mut pairs: Vec<(String, Scalar)> = self
            .slots
            .iter()
            .filter_map(|(name, slot)| {
                slot.value
                    .borrow()
                    .clone()
                    .map(|v| (name.clone(), v))
            })
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }

    /// Stable fingerprint of the resolved context, for the result cache.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FormulaHasher::new();
        for (name, value) in self.resolved_pairs() {
            hasher.write(name.as_bytes());
            hasher.write(&[0]);
            std::hash::Hash::hash(&value, &mut hasher);
            hasher.write(&[0xff]);
        }
        hasher.finish()
    }
}
