//! The variable resolver pipeline.
//!
//! Resolvers are asked in a fixed priority order; the first whose
//! `can_handle` accepts a name resolves it. Results are memoized in the
//! per-cycle [`LazyContext`], so each name is resolved at most once per
//! evaluation. Resolvers never block: every lookup is against preloaded
//! host structures.

use std::collections::BTreeMap;

use synsor_common::{DependencyKind, EngineError, Scalar};

use crate::binding::{BindingPlan, Strategy, VariableBinding};
use crate::collection::CollectionEngine;
use crate::compare::ComparisonRegistry;
use crate::context::LazyContext;
use crate::registry::CrossSensorRegistry;
use crate::traits::{DataSource, EntityCatalog};

/// Everything a resolver may consult. All references are to structures
/// owned by the orchestrator for the duration of one sensor evaluation.
pub struct ResolveEnv<'a> {
    pub sensor_key: &'a str,
    /// The backing external id, when the sensor declares one.
    pub backing_id: Option<&'a str>,
    /// Phase-appropriate value of the `state` token (pre-evaluation for a
    /// main formula, post-main for attributes).
    pub state_value: Option<Scalar>,
    pub variables: &'a BTreeMap<String, VariableBinding>,
    pub registry: &'a CrossSensorRegistry,
    pub data_source: &'a dyn DataSource,
    pub catalog: &'a dyn EntityCatalog,
    pub collections: &'a CollectionEngine,
    pub compare: &'a ComparisonRegistry,
}

pub trait NameResolver: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_handle(&self, name: &str, plan: &BindingPlan) -> bool;
    fn resolve(&self, name: &str, env: &ResolveEnv<'_>) -> Result<Scalar, EngineError>;
}

/* ────────────────────────── the six resolvers ──────────────────────── */

/// Priority 1: the reserved `state` token.
struct StateTokenResolver;

impl NameResolver for StateTokenResolver {
    fn name(&self) -> &'static str {
        "state-token"
    }
    fn can_handle(&self, name: &str, _plan: &BindingPlan) -> bool {
        name == "state"
    }
    fn resolve(&self, _name: &str, env: &ResolveEnv<'_>) -> Result<Scalar, EngineError> {
        Ok(env.state_value.clone().unwrap_or(Scalar::Unknown))
    }
}

/// Priority 2: sibling sensors and sibling attributes, both read from the
/// cross-sensor registry.
struct CrossSensorResolver;

impl NameResolver for CrossSensorResolver {
    fn name(&self) -> &'static str {
        "cross-sensor"
    }
    fn can_handle(&self, name: &str, plan: &BindingPlan) -> bool {
        matches!(
            plan.strategy(name),
            Some(Strategy::CrossSensor | Strategy::Attribute)
        )
    }
    fn resolve(&self, name: &str, env: &ResolveEnv<'_>) -> Result<Scalar, EngineError> {
        if let Some(v) = env.registry.get(name) {
            return Ok(v);
        }
        if let Some(v) = env.registry.attribute(env.sensor_key, name) {
            return Ok(v);
        }
        Err(EngineError::missing(name, DependencyKind::SensorKey))
    }
}

/// Priority 3: names bound to collection patterns. Outside an aggregate
/// call such a name resolves to its match count.
struct CollectionQueryResolver;

impl NameResolver for CollectionQueryResolver {
    fn name(&self) -> &'static str {
        "collection-query"
    }
    fn can_handle(&self, name: &str, plan: &BindingPlan) -> bool {
        plan.strategy(name) == Some(Strategy::Computed)
    }
    fn resolve(&self, name: &str, env: &ResolveEnv<'_>) -> Result<Scalar, EngineError> {
        let Some(VariableBinding::CollectionPattern(pattern)) = env.variables.get(name) else {
            return Err(EngineError::missing(name, DependencyKind::Variable));
        };
        let ids = env
            .collections
            .matches(pattern, env.catalog, env.compare)?;
        Ok(Scalar::Int(ids.len() as i64))
    }
}

/// Priority 4: literal bindings and explicit entity aliases.
struct ConfigVariableResolver;

impl NameResolver for ConfigVariableResolver {
    fn name(&self) -> &'static str {
        "config-variable"
    }
    fn can_handle(&self, name: &str, plan: &BindingPlan) -> bool {
        matches!(
            plan.strategy(name),
            Some(Strategy::Literal | Strategy::DataSource | Strategy::HostEntity)
        ) && name != "state"
    }
    fn resolve(&self, name: &str, env: &ResolveEnv<'_>) -> Result<Scalar, EngineError> {
        match env.variables.get(name) {
            Some(VariableBinding::Literal(v)) => Ok(v.clone()),
            Some(VariableBinding::EntityRef(id)) => read_external(id, env),
            Some(VariableBinding::CollectionPattern(_)) => {
                Err(EngineError::missing(name, DependencyKind::Variable))
            }
            // Not a variable at all: hand over to the external resolvers.
            None => read_external(name, env),
        }
    }
}

/// Priority 5: identifiers owned by the data source.
struct DataSourceResolver;

impl NameResolver for DataSourceResolver {
    fn name(&self) -> &'static str {
        "data-source"
    }
    fn can_handle(&self, name: &str, plan: &BindingPlan) -> bool {
        plan.strategy(name) == Some(Strategy::DataSource)
    }
    fn resolve(&self, name: &str, env: &ResolveEnv<'_>) -> Result<Scalar, EngineError> {
        read_from_source(name, env)
    }
}

/// Priority 6: entities in the host catalog.
struct HostEntityResolver;

impl NameResolver for HostEntityResolver {
    fn name(&self) -> &'static str {
        "host-entity"
    }
    fn can_handle(&self, name: &str, plan: &BindingPlan) -> bool {
        plan.strategy(name) == Some(Strategy::HostEntity)
    }
    fn resolve(&self, name: &str, env: &ResolveEnv<'_>) -> Result<Scalar, EngineError> {
        read_from_catalog(name, env)
    }
}

fn read_from_source(id: &str, env: &ResolveEnv<'_>) -> Result<Scalar, EngineError> {
    let answer = env.data_source.get(id);
    if !answer.exists {
        return Err(EngineError::missing(id, DependencyKind::ExternalId));
    }
    Ok(answer.value.unwrap_or(Scalar::Unknown))
}

fn read_from_catalog(id: &str, env: &ResolveEnv<'_>) -> Result<Scalar, EngineError> {
    match env.catalog.get(id) {
        Some(entity) => Ok(entity.state),
        None => Err(EngineError::missing(id, DependencyKind::ExternalId)),
    }
}

/// Data source owns the id if it claims it; the catalog is the fallback.
fn read_external(id: &str, env: &ResolveEnv<'_>) -> Result<Scalar, EngineError> {
    if env.data_source.is_registered(id) {
        read_from_source(id, env)
    } else {
        read_from_catalog(id, env)
    }
}

/* ────────────────────────────── pipeline ───────────────────────────── */

pub struct ResolverPipeline {
    resolvers: Vec<Box<dyn NameResolver>>,
}

impl ResolverPipeline {
    /// The standard six-stage pipeline in priority order.
    pub fn standard() -> Self {
        Self {
            resolvers: vec![
                Box::new(StateTokenResolver),
                Box::new(CrossSensorResolver),
                Box::new(CollectionQueryResolver),
                Box::new(ConfigVariableResolver),
                Box::new(DataSourceResolver),
                Box::new(HostEntityResolver),
            ],
        }
    }

    /// Resolve a name, memoizing into the lazy context. Subsequent calls
    /// for the same name return the stored value without re-invoking any
    /// resolver.
    pub fn resolve(
        &self,
        name: &str,
        plan: &BindingPlan,
        env: &ResolveEnv<'_>,
        ctx: &LazyContext,
    ) -> Result<Scalar, EngineError> {
        if let Some(v) = ctx.lookup(name) {
            return Ok(v);
        }
        for resolver in &self.resolvers {
            if resolver.can_handle(name, plan) {
                let value = resolver.resolve(name, env)?;
                ctx.store(name, &value);
                return Ok(value);
            }
        }
        Err(EngineError::missing(name, DependencyKind::Variable))
    }
}

impl Default for ResolverPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{BindingEnv, build_plan};
    use crate::tests::common::TestHost;
    use std::collections::BTreeSet;
    use synsor_parse::parse;

    struct Fixture {
        host: TestHost,
        variables: BTreeMap<String, VariableBinding>,
        sensor_keys: BTreeSet<String>,
        registry: CrossSensorRegistry,
        collections: CollectionEngine,
        compare: ComparisonRegistry,
    }

    impl Fixture {
        fn new(host: TestHost) -> Self {
            Self {
                host,
                variables: BTreeMap::new(),
                sensor_keys: BTreeSet::new(),
                registry: CrossSensorRegistry::new(),
                collections: CollectionEngine::new(),
                compare: ComparisonRegistry::with_builtins(),
            }
        }

        fn plan(&self, formula: &str) -> BindingPlan {
            let empty = BTreeSet::new();
            let env = BindingEnv {
                variables: &self.variables,
                sensor_keys: &self.sensor_keys,
                attribute_names: &empty,
                data_source: &self.host,
                catalog: &self.host,
            };
            build_plan(&parse(formula).unwrap(), &env).unwrap()
        }

        fn env(&self) -> ResolveEnv<'_> {
            ResolveEnv {
                sensor_key: "test",
                backing_id: None,
                state_value: Some(Scalar::Number(42.0)),
                variables: &self.variables,
                registry: &self.registry,
                data_source: &self.host,
                catalog: &self.host,
                collections: &self.collections,
                compare: &self.compare,
            }
        }
    }

    #[test]
    fn state_token_resolves_to_phase_value() {
        let fx = Fixture::new(TestHost::new());
        let plan = fx.plan("state + 1");
        let ctx = LazyContext::from_plan(&plan);
        let v = ResolverPipeline::standard()
            .resolve("state", &plan, &fx.env(), &ctx)
            .unwrap();
        assert_eq!(v, Scalar::Number(42.0));
    }

    #[test]
    fn cross_sensor_reads_registry() {
        let host = TestHost::new();
        let mut fx = Fixture::new(host);
        fx.sensor_keys.insert("base".to_string());
        fx.registry.set("base", Scalar::Number(7.0));
        let plan = fx.plan("base * 2");
        let ctx = LazyContext::from_plan(&plan);
        let v = ResolverPipeline::standard()
            .resolve("base", &plan, &fx.env(), &ctx)
            .unwrap();
        assert_eq!(v, Scalar::Number(7.0));
    }

    #[test]
    fn registered_id_with_none_value_is_unknown() {
        let host = TestHost::new().with_source("x.q", None);
        let fx = Fixture::new(host);
        let plan = fx.plan("x.q + 5");
        let ctx = LazyContext::from_plan(&plan);
        let v = ResolverPipeline::standard()
            .resolve("x.q", &plan, &fx.env(), &ctx)
            .unwrap();
        assert_eq!(v, Scalar::Unknown);
        assert_eq!(
            ctx.unavailable_dependencies(),
            vec!["x.q (x.q) is unknown".to_string()]
        );
    }

    #[test]
    fn memoization_survives_host_mutation() {
        // Second read returns the memoized value even though lookups are
        // against a different host state.
        let host = TestHost::new().with_source("x.p", Some(Scalar::Number(1.0)));
        let fx = Fixture::new(host);
        let plan = fx.plan("x.p * 2");
        let ctx = LazyContext::from_plan(&plan);
        let pipeline = ResolverPipeline::standard();
        let first = pipeline.resolve("x.p", &plan, &fx.env(), &ctx).unwrap();

        let other_host = TestHost::new().with_source("x.p", Some(Scalar::Number(99.0)));
        let mut env2 = fx.env();
        env2.data_source = &other_host;
        let second = pipeline.resolve("x.p", &plan, &env2, &ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn variable_alias_reads_target_entity() {
        let host = TestHost::new().with_entity_state("sensor.temp", Scalar::Number(20.5));
        let mut fx = Fixture::new(host);
        fx.variables.insert(
            "t".to_string(),
            VariableBinding::EntityRef("sensor.temp".into()),
        );
        let plan = fx.plan("t + 1");
        let ctx = LazyContext::from_plan(&plan);
        let v = ResolverPipeline::standard()
            .resolve("t", &plan, &fx.env(), &ctx)
            .unwrap();
        assert_eq!(v, Scalar::Number(20.5));
    }

    #[test]
    fn pattern_variable_resolves_to_match_count() {
        let host = TestHost::new()
            .with_entity(
                "binary_sensor.door",
                crate::traits::Entity {
                    state: Scalar::from("on"),
                    device_class: Some("door".into()),
                    ..Default::default()
                },
            );
        let mut fx = Fixture::new(host);
        fx.variables.insert(
            "doors".to_string(),
            VariableBinding::CollectionPattern("device_class:door".into()),
        );
        let plan = fx.plan("doors + 0");
        let ctx = LazyContext::from_plan(&plan);
        let v = ResolverPipeline::standard()
            .resolve("doors", &plan, &fx.env(), &ctx)
            .unwrap();
        assert_eq!(v, Scalar::Int(1));
    }
}
