//! Binding plans: what free names a formula needs and how to fetch each.
//!
//! A plan is derived once per formula text and cached alongside the AST.
//! Strategy selection follows a fixed order: the reserved `state` token,
//! declared variables, sibling attribute names, sibling sensor keys, then
//! external identifier patterns against the data source and the host
//! catalog. Anything left over is a fatal missing dependency.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;
use synsor_common::{DependencyKind, EngineError, Scalar};
use synsor_parse::{Expr, ExprKind};

use crate::traits::{DataSource, EntityCatalog};

/// How a free name is fetched at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// The reserved `state` token; resolved contextually per phase.
    State,
    /// An externally-owned identifier answered by the data source.
    DataSource,
    /// An entity in the host catalog.
    HostEntity,
    /// A literal variable binding.
    Literal,
    /// A computed binding (collection pattern) evaluated by the engine.
    Computed,
    /// A sibling sensor's current-cycle value.
    CrossSensor,
    /// A sibling attribute of the same sensor, evaluated earlier this cycle.
    Attribute,
}

/// A declared variable binding on a sensor or sensor set.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableBinding {
    EntityRef(String),
    Literal(Scalar),
    CollectionPattern(String),
}

/// Frozen description of a formula's resolution needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingPlan {
    pub names: BTreeSet<String>,
    pub has_metadata: bool,
    pub has_collections: bool,
    pub strategies: FxHashMap<String, Strategy>,
    pub collection_queries: Vec<String>,
    /// `(target name, attribute)` pairs from member access.
    pub metadata_calls: Vec<(String, String)>,
}

impl BindingPlan {
    pub fn strategy(&self, name: &str) -> Option<Strategy> {
        self.strategies.get(name).copied()
    }

    /// Names that resolve to sibling sensors; these become graph edges.
    pub fn cross_sensor_names(&self) -> impl Iterator<Item = &str> {
        self.strategies
            .iter()
            .filter(|(_, s)| **s == Strategy::CrossSensor)
            .map(|(n, _)| n.as_str())
    }

    /// Names that resolve against external identifiers.
    pub fn external_names(&self) -> impl Iterator<Item = &str> {
        self.strategies
            .iter()
            .filter(|(_, s)| matches!(s, Strategy::DataSource | Strategy::HostEntity))
            .map(|(n, _)| n.as_str())
    }
}

/// Everything strategy selection can see at plan-build time.
pub struct BindingEnv<'a> {
    pub variables: &'a BTreeMap<String, VariableBinding>,
    pub sensor_keys: &'a BTreeSet<String>,
    /// Sibling attribute names; empty when building a main formula's plan.
    pub attribute_names: &'a BTreeSet<String>,
    pub data_source: &'a dyn DataSource,
    pub catalog: &'a dyn EntityCatalog,
}

/// Derive a [`BindingPlan`] from an AST.
pub fn build_plan(ast: &Expr, env: &BindingEnv<'_>) -> Result<BindingPlan, EngineError> {
    let mut plan = BindingPlan::default();
    collect(ast, env, &mut plan)?;
    // Patterns referenced through variables count as collections too.
    for name in &plan.names {
        if let Some(VariableBinding::CollectionPattern(p)) = env.variables.get(name) {
            if !plan.collection_queries.contains(p) {
                plan.collection_queries.push(p.clone());
            }
        }
    }
    plan.has_collections = !plan.collection_queries.is_empty();
    Ok(plan)
}

fn collect(expr: &Expr, env: &BindingEnv<'_>, plan: &mut BindingPlan) -> Result<(), EngineError> {
    match &expr.kind {
        ExprKind::Literal(_) => Ok(()),
        ExprKind::Name(name) => bind_name(name, env, plan),
        ExprKind::MemberAccess { .. } => bind_member_chain(expr, env, plan),
        ExprKind::Call { args, .. } => {
            for arg in args {
                collect(arg, env, plan)?;
            }
            Ok(())
        }
        ExprKind::BinaryOp { lhs, rhs, .. } => {
            collect(lhs, env, plan)?;
            collect(rhs, env, plan)
        }
        ExprKind::UnaryOp { operand, .. } => collect(operand, env, plan),
        ExprKind::Conditional {
            cond,
            then_branch,
            else_branch,
        } => {
            collect(cond, env, plan)?;
            collect(then_branch, env, plan)?;
            collect(else_branch, env, plan)
        }
        ExprKind::CollectionQuery(q) => {
            plan.has_collections = true;
            if !plan.collection_queries.contains(q) {
                plan.collection_queries.push(q.clone());
            }
            Ok(())
        }
    }
}

/// Classify an undotted free name.
fn bind_name(name: &str, env: &BindingEnv<'_>, plan: &mut BindingPlan) -> Result<(), EngineError> {
    let strategy = classify(name, env)
        .ok_or_else(|| EngineError::missing(name, DependencyKind::Variable))?;
    insert(plan, name, strategy);
    Ok(())
}

fn classify(name: &str, env: &BindingEnv<'_>) -> Option<Strategy> {
    if name == "state" {
        return Some(Strategy::State);
    }
    if let Some(binding) = env.variables.get(name) {
        return Some(match binding {
            VariableBinding::EntityRef(id) => {
                if env.data_source.is_registered(id) {
                    Strategy::DataSource
                } else {
                    Strategy::HostEntity
                }
            }
            VariableBinding::Literal(_) => Strategy::Literal,
            VariableBinding::CollectionPattern(_) => Strategy::Computed,
        });
    }
    if env.attribute_names.contains(name) {
        return Some(Strategy::Attribute);
    }
    if env.sensor_keys.contains(name) {
        return Some(Strategy::CrossSensor);
    }
    None
}

/// Classify a dotted chain. The whole dotted string may itself be an
/// external identifier (`x.power`), or the root may be a locally
/// resolvable name with a trailing metadata access (`state.voltage`).
fn bind_member_chain(
    expr: &Expr,
    env: &BindingEnv<'_>,
    plan: &mut BindingPlan,
) -> Result<(), EngineError> {
    let Some(full) = expr.dotted_name() else {
        // Chains always root in a plain name with the current grammar.
        if let ExprKind::MemberAccess { receiver, .. } = &expr.kind {
            return collect(receiver, env, plan);
        }
        return Ok(());
    };

    let (root, rest) = full.split_once('.').expect("chain has at least one dot");

    // Locally resolvable root wins: `state.voltage`, `my_var.level`,
    // `other_sensor.voltage`.
    if let Some(strategy) = classify(root, env) {
        insert(plan, root, strategy);
        plan.has_metadata = true;
        plan.metadata_calls.push((root.to_string(), rest.to_string()));
        return Ok(());
    }

    // Whole dotted string as an external identifier.
    if env.data_source.is_registered(&full) {
        insert(plan, &full, Strategy::DataSource);
        return Ok(());
    }
    if env.catalog.get(&full).is_some() {
        insert(plan, &full, Strategy::HostEntity);
        return Ok(());
    }

    // All but the last segment as an identifier, last as metadata
    // (`sensor.kitchen.voltage`).
    if let Some((prefix, attr)) = full.rsplit_once('.') {
        if prefix.contains('.') {
            let strategy = if env.data_source.is_registered(prefix) {
                Some(Strategy::DataSource)
            } else if env.catalog.get(prefix).is_some() {
                Some(Strategy::HostEntity)
            } else {
                None
            };
            if let Some(strategy) = strategy {
                insert(plan, prefix, strategy);
                plan.has_metadata = true;
                plan.metadata_calls
                    .push((prefix.to_string(), attr.to_string()));
                return Ok(());
            }
        }
    }

    Err(EngineError::missing(full, DependencyKind::ExternalId))
}

fn insert(plan: &mut BindingPlan, name: &str, strategy: Strategy) {
    plan.names.insert(name.to_string());
    plan.strategies.insert(name.to_string(), strategy);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::common::TestHost;
    use synsor_parse::parse;

    fn env_fixture<'a>(
        vars: &'a BTreeMap<String, VariableBinding>,
        keys: &'a BTreeSet<String>,
        attrs: &'a BTreeSet<String>,
        host: &'a TestHost,
    ) -> BindingEnv<'a> {
        BindingEnv {
            variables: vars,
            sensor_keys: keys,
            attribute_names: attrs,
            data_source: host,
            catalog: host,
        }
    }

    #[test]
    fn state_token_is_contextual() {
        let host = TestHost::new();
        let vars = BTreeMap::new();
        let keys = BTreeSet::new();
        let attrs = BTreeSet::new();
        let ast = parse("state * 1.1").unwrap();
        let plan = build_plan(&ast, &env_fixture(&vars, &keys, &attrs, &host)).unwrap();
        assert_eq!(plan.strategy("state"), Some(Strategy::State));
        assert!(!plan.has_metadata);
    }

    #[test]
    fn variable_bindings_pick_their_strategy() {
        let host = TestHost::new()
            .with_source("x.power", Some(Scalar::Number(1.0)))
            .with_entity_state("sensor.temp", Scalar::Number(20.0));
        let mut vars = BTreeMap::new();
        vars.insert("p".to_string(), VariableBinding::EntityRef("x.power".into()));
        vars.insert(
            "t".to_string(),
            VariableBinding::EntityRef("sensor.temp".into()),
        );
        vars.insert("k".to_string(), VariableBinding::Literal(Scalar::Int(3)));
        vars.insert(
            "doors".to_string(),
            VariableBinding::CollectionPattern("device_class:door".into()),
        );
        let keys = BTreeSet::new();
        let attrs = BTreeSet::new();
        let ast = parse("p + t + k + sum(doors)").unwrap();
        let plan = build_plan(&ast, &env_fixture(&vars, &keys, &attrs, &host)).unwrap();
        assert_eq!(plan.strategy("p"), Some(Strategy::DataSource));
        assert_eq!(plan.strategy("t"), Some(Strategy::HostEntity));
        assert_eq!(plan.strategy("k"), Some(Strategy::Literal));
        assert_eq!(plan.strategy("doors"), Some(Strategy::Computed));
        assert_eq!(plan.collection_queries, vec!["device_class:door"]);
    }

    #[test]
    fn sibling_sensor_key_is_cross_sensor() {
        let host = TestHost::new();
        let vars = BTreeMap::new();
        let keys: BTreeSet<String> = ["base".to_string()].into();
        let attrs = BTreeSet::new();
        let ast = parse("base * 1.1").unwrap();
        let plan = build_plan(&ast, &env_fixture(&vars, &keys, &attrs, &host)).unwrap();
        assert_eq!(plan.strategy("base"), Some(Strategy::CrossSensor));
    }

    #[test]
    fn dotted_external_id_stays_one_name() {
        let host = TestHost::new().with_source("x.power", Some(Scalar::Number(1.0)));
        let vars = BTreeMap::new();
        let keys = BTreeSet::new();
        let attrs = BTreeSet::new();
        let ast = parse("x.power * 2").unwrap();
        let plan = build_plan(&ast, &env_fixture(&vars, &keys, &attrs, &host)).unwrap();
        assert_eq!(plan.strategy("x.power"), Some(Strategy::DataSource));
        assert!(plan.metadata_calls.is_empty());
    }

    #[test]
    fn member_access_on_state_records_metadata() {
        let host = TestHost::new();
        let vars = BTreeMap::new();
        let keys = BTreeSet::new();
        let attrs = BTreeSet::new();
        let ast = parse("state.voltage * state").unwrap();
        let plan = build_plan(&ast, &env_fixture(&vars, &keys, &attrs, &host)).unwrap();
        assert!(plan.has_metadata);
        assert_eq!(
            plan.metadata_calls,
            vec![("state".to_string(), "voltage".to_string())]
        );
        assert_eq!(plan.names.len(), 1);
    }

    #[test]
    fn entity_attribute_access_keeps_entity_as_name() {
        let host = TestHost::new().with_entity_state("sensor.inverter", Scalar::Number(5.0));
        let vars = BTreeMap::new();
        let keys = BTreeSet::new();
        let attrs = BTreeSet::new();
        let ast = parse("sensor.inverter.voltage").unwrap();
        let plan = build_plan(&ast, &env_fixture(&vars, &keys, &attrs, &host)).unwrap();
        assert_eq!(plan.strategy("sensor.inverter"), Some(Strategy::HostEntity));
        assert_eq!(
            plan.metadata_calls,
            vec![("sensor.inverter".to_string(), "voltage".to_string())]
        );
    }

    #[test]
    fn unknown_name_is_fatal() {
        let host = TestHost::new();
        let vars = BTreeMap::new();
        let keys = BTreeSet::new();
        let attrs = BTreeSet::new();
        let ast = parse("nobody_home + 1").unwrap();
        let err = build_plan(&ast, &env_fixture(&vars, &keys, &attrs, &host)).unwrap_err();
        assert_eq!(err.kind, synsor_common::EngineErrorKind::MissingDependency);
        assert_eq!(err.missing_name(), Some("nobody_home"));
    }

    #[test]
    fn attribute_names_shadow_sensor_keys() {
        let host = TestHost::new();
        let vars = BTreeMap::new();
        let keys: BTreeSet<String> = ["daily".to_string()].into();
        let attrs: BTreeSet<String> = ["daily".to_string()].into();
        let ast = parse("daily * 2").unwrap();
        let plan = build_plan(&ast, &env_fixture(&vars, &keys, &attrs, &host)).unwrap();
        assert_eq!(plan.strategy("daily"), Some(Strategy::Attribute));
    }
}
