//! The evaluation orchestrator.
//!
//! Per-cycle protocol: `begin_cycle` disables the result cache and bumps
//! the cycle id; `update_all`/`update` evaluate sensors in topological
//! order, writing each result into the cross-sensor registry as soon as
//! it lands so dependents see current-cycle values; `end_cycle` commits
//! the result cache, notifies the observer with the changed keys, and
//! re-enables external reads.
//!
//! Fatal errors trip a per-sensor circuit breaker: the sensor surfaces as
//! `Error` with a diagnostic payload and is skipped until the next
//! configuration load. Transient states are values, never breaker trips.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use synsor_common::{EngineError, Scalar};

use crate::binding::{BindingEnv, Strategy, VariableBinding};
use crate::collection::CollectionEngine;
use crate::compare::ComparisonRegistry;
use crate::compile_cache::{CacheStats, CompilationCache, CompiledFormula, DEFAULT_CAPACITY};
use crate::config::{ConfigError, SensorConfig, SensorSet};
use crate::context::LazyContext;
use crate::function::FunctionRegistry;
use crate::graph::{DependencyGraph, NodeKind};
use crate::interpreter::Interpreter;
use crate::registry::{CrossSensorRegistry, RegistrySnapshot};
use crate::resolve::{ResolveEnv, ResolverPipeline};
use crate::result_cache::ResultCache;
use crate::traits::{ChangeObserver, Host};

/* ─────────────────────────── configuration ─────────────────────────── */

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub compile_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compile_cache_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl EngineConfig {
    #[inline]
    pub fn with_compile_cache_capacity(mut self, capacity: usize) -> Self {
        self.compile_cache_capacity = capacity;
        self
    }
}

/* ───────────────────────────── results ─────────────────────────────── */

/// Outcome of one evaluated sensor, kept for external reads and
/// diagnostics.
#[derive(Debug, Clone)]
pub struct SensorResult {
    pub key: String,
    pub value: Scalar,
    pub attributes: BTreeMap<String, Scalar>,
    /// Lines of the form `"<name> (<external_id>) is <state>"`.
    pub unavailable_dependencies: Vec<String>,
    text_hash: u64,
    fingerprint: u64,
    resolved: Vec<(String, Scalar)>,
}

/// What a sensor currently surfaces to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorState {
    Value(Scalar),
    Error(EngineError),
}

/// Summary of one `update_all`/`update` pass.
#[derive(Debug)]
pub struct CycleResult {
    pub evaluated: usize,
    pub errored: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

struct LoadedSensor {
    config: SensorConfig,
    variables: BTreeMap<String, VariableBinding>,
    main: Arc<CompiledFormula>,
    /// Attribute formulas in evaluation order (attribute sub-DAG).
    attributes: Vec<(String, Arc<CompiledFormula>)>,
}

/* ────────────────────────────── engine ─────────────────────────────── */

pub struct Engine<H: Host> {
    host: H,
    functions: FunctionRegistry,
    compare: ComparisonRegistry,
    collections: CollectionEngine,
    compile_cache: CompilationCache,
    result_cache: ResultCache,
    registry: CrossSensorRegistry,
    pipeline: ResolverPipeline,
    graph: DependencyGraph,
    loaded: BTreeMap<String, LoadedSensor>,
    breaker: BTreeMap<String, EngineError>,
    previous: BTreeMap<String, Scalar>,
    last_results: BTreeMap<String, SensorResult>,
    evaluated_this_cycle: BTreeSet<String>,
    set: Option<SensorSet>,
    cycle_start: Option<RegistrySnapshot>,
    cycle_id: u64,
    in_cycle: bool,
    cycle_cancelled: bool,
    first_cycle_done: bool,
    cancel_flag: AtomicBool,
    observer: Box<dyn ChangeObserver>,
}

impl<H: Host> Engine<H> {
    pub fn new(host: H, config: EngineConfig) -> Self {
        Self {
            host,
            functions: FunctionRegistry::with_builtins(),
            compare: ComparisonRegistry::with_builtins(),
            collections: CollectionEngine::new(),
            compile_cache: CompilationCache::new(config.compile_cache_capacity),
            result_cache: ResultCache::new(),
            registry: CrossSensorRegistry::new(),
            pipeline: ResolverPipeline::standard(),
            graph: DependencyGraph::new(),
            loaded: BTreeMap::new(),
            breaker: BTreeMap::new(),
            previous: BTreeMap::new(),
            last_results: BTreeMap::new(),
            evaluated_this_cycle: BTreeSet::new(),
            set: None,
            cycle_start: None,
            cycle_id: 0,
            in_cycle: false,
            cycle_cancelled: false,
            first_cycle_done: false,
            cancel_flag: AtomicBool::new(false),
            observer: Box::new(()),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn ChangeObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// User comparison handlers register here (priorities 1–49).
    pub fn comparison_registry_mut(&mut self) -> &mut ComparisonRegistry {
        &mut self.compare
    }

    pub fn function_registry_mut(&mut self) -> &mut FunctionRegistry {
        &mut self.functions
    }

    pub fn compile_cache_stats(&self) -> CacheStats {
        self.compile_cache.stats()
    }

    /* ───────────────────────── configuration ───────────────────────── */

    /// Load (or reload) a sensor set. Both caches are cleared before the
    /// first subsequent evaluation; per-sensor fatal errors trip the
    /// breaker immediately but do not abort the rest of the set.
    pub fn load(&mut self, set: SensorSet) -> Result<(), ConfigError> {
        set.validate_data_source(&self.host, &self.host)?;

        self.compile_cache.clear_all();
        self.result_cache.clear();
        self.registry.clear();
        self.graph.clear();
        self.loaded.clear();
        self.breaker.clear();
        self.previous.clear();
        self.last_results.clear();
        self.first_cycle_done = false;

        let keys = set.keys();
        let empty_attrs = BTreeSet::new();

        for sensor in &set.sensors {
            let key = sensor.key.clone();
            self.registry.register(&key, sensor.external_id.as_deref());
            // Cross-sensor reads before a key's first evaluation (including
            // first-cycle self-references by key) see Unknown, not an error.
            self.registry.set(&key, Scalar::Unknown);

            let variables = set.merged_variables(sensor);
            let attr_names: BTreeSet<String> = sensor.attributes.keys().cloned().collect();

            // Scope the binding environments so their borrow of the host
            // ends before any breaker bookkeeping.
            let main_result = {
                let main_env = BindingEnv {
                    variables: &variables,
                    sensor_keys: &keys,
                    attribute_names: &empty_attrs,
                    data_source: &self.host,
                    catalog: &self.host,
                };
                self.compile_cache.get_or_parse(&sensor.formula, &main_env)
            };
            let main = match main_result {
                Ok(compiled) => compiled,
                Err(err) => {
                    // Keep the node in the graph so passes can count the
                    // breaker skip.
                    self.graph
                        .add_sensor(&key, std::iter::empty::<(&str, NodeKind)>());
                    self.trip_breaker(&key, err);
                    continue;
                }
            };

            let attrs_result = {
                let attr_env = BindingEnv {
                    variables: &variables,
                    sensor_keys: &keys,
                    attribute_names: &attr_names,
                    data_source: &self.host,
                    catalog: &self.host,
                };
                let mut compiled_attrs = BTreeMap::new();
                let mut failure = None;
                for (attr_name, attr_formula) in &sensor.attributes {
                    match self.compile_cache.get_or_parse(attr_formula, &attr_env) {
                        Ok(compiled) => {
                            compiled_attrs.insert(attr_name.clone(), compiled);
                        }
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                match failure {
                    Some(err) => Err(err),
                    None => Ok(compiled_attrs),
                }
            };
            let compiled_attrs = match attrs_result {
                Ok(compiled_attrs) => compiled_attrs,
                Err(err) => {
                    self.graph
                        .add_sensor(&key, std::iter::empty::<(&str, NodeKind)>());
                    self.trip_breaker(&key, err);
                    continue;
                }
            };

            let attributes = match order_attributes(&compiled_attrs) {
                Ok(order) => order
                    .into_iter()
                    .map(|name| {
                        let compiled = Arc::clone(&compiled_attrs[&name]);
                        (name, compiled)
                    })
                    .collect(),
                Err(err) => {
                    self.graph
                        .add_sensor(&key, std::iter::empty::<(&str, NodeKind)>());
                    self.trip_breaker(&key, err);
                    continue;
                }
            };

            let deps = dependency_names(&main, compiled_attrs.values(), &variables, &sensor.external_id);
            self.graph
                .add_sensor(&key, deps.iter().map(|(n, k)| (n.as_str(), *k)));

            self.loaded.insert(
                key,
                LoadedSensor {
                    config: sensor.clone(),
                    variables,
                    main,
                    attributes,
                },
            );
        }

        for cycle in self.graph.detect_cycles() {
            tracing::warn!(cycle = %cycle.join(" -> "), "circular dependency among sensors");
            // The first key repeats at the end of the reported path.
            let members = &cycle[..cycle.len().saturating_sub(1)];
            for key in members {
                let err = EngineError::cycle(cycle.clone());
                self.loaded.remove(key);
                self.trip_breaker(key, err);
            }
        }

        self.set = Some(set);
        Ok(())
    }

    /// Export the loaded configuration with persisted-form rewriting.
    pub fn export_yaml(&self) -> Result<String, ConfigError> {
        match &self.set {
            Some(set) => set.to_yaml_string(&self.registry),
            None => Err(ConfigError::Empty),
        }
    }

    fn trip_breaker(&mut self, key: &str, err: EngineError) {
        tracing::warn!(sensor = %key, error = %err, "sensor disabled until reload");
        self.observer.on_sensor_error(key, &err);
        self.breaker.insert(key.to_string(), err);
    }

    /* ─────────────────────────── cycle API ─────────────────────────── */

    pub fn begin_cycle(&mut self) {
        if self.in_cycle {
            return;
        }
        self.in_cycle = true;
        self.cycle_cancelled = false;
        self.cycle_id += 1;
        self.cancel_flag.store(false, Ordering::Relaxed);
        self.evaluated_this_cycle.clear();
        self.cycle_start = Some(self.registry.snapshot());
        self.result_cache.begin_cycle();
        self.compile_cache.freeze_evictions();
        tracing::trace!(cycle = self.cycle_id, "begin cycle");
    }

    /// Request cancellation; honored at the next sensor boundary.
    pub fn request_cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    pub fn update_all(&mut self) -> CycleResult {
        let order = self.graph.topological_order();
        self.run_pass(order)
    }

    /// Re-evaluate only the sensors affected by the changed external ids.
    pub fn update(&mut self, changed: &BTreeSet<String>) -> CycleResult {
        let affected = self.graph.affected_by(changed);
        let order: Vec<String> = self
            .graph
            .topological_order()
            .into_iter()
            .filter(|key| affected.contains(key))
            .collect();
        self.run_pass(order)
    }

    fn run_pass(&mut self, order: Vec<String>) -> CycleResult {
        debug_assert!(self.in_cycle, "update outside begin_cycle/end_cycle");
        let start = Instant::now();
        let mut evaluated = 0usize;
        let mut errored = 0usize;

        for key in order {
            if self.cancel_flag.load(Ordering::Relaxed) {
                self.cancel_pass();
                return CycleResult {
                    evaluated,
                    errored,
                    cancelled: true,
                    elapsed: start.elapsed(),
                };
            }
            if self.breaker.contains_key(&key) {
                errored += 1;
                continue;
            }
            if !self.loaded.contains_key(&key) {
                continue;
            }
            match self.eval_sensor(&key) {
                Ok(()) => evaluated += 1,
                Err(err) => {
                    errored += 1;
                    self.registry.set(&key, Scalar::Unavailable);
                    self.trip_breaker(&key, err);
                }
            }
        }

        CycleResult {
            evaluated,
            errored,
            cancelled: false,
            elapsed: start.elapsed(),
        }
    }

    fn cancel_pass(&mut self) {
        tracing::debug!(cycle = self.cycle_id, "cycle cancelled, partial results discarded");
        if let Some(snapshot) = &self.cycle_start {
            self.registry.restore(snapshot);
        }
        self.result_cache.discard_pending();
        self.evaluated_this_cycle.clear();
        self.cycle_cancelled = true;
    }

    /// Close the cycle: commit the result cache, update previous values,
    /// and notify the observer. Returns the keys whose values changed.
    pub fn end_cycle(&mut self) -> Vec<String> {
        if !self.in_cycle {
            return Vec::new();
        }

        let mut changed = Vec::new();
        if !self.cycle_cancelled {
            // Refresh cache entries for sensors not touched this pass so
            // external readers keep a complete view.
            let untouched: Vec<(u64, u64, Scalar)> = self
                .last_results
                .iter()
                .filter(|(key, _)| !self.evaluated_this_cycle.contains(*key))
                .map(|(_, r)| (r.text_hash, r.fingerprint, r.value.clone()))
                .collect();
            for (hash, fp, value) in untouched {
                self.result_cache.store(hash, fp, value);
            }

            for (key, result) in &self.last_results {
                let prior = self.previous.get(key);
                if prior != Some(&result.value) {
                    changed.push(key.clone());
                }
            }
            for (key, result) in &self.last_results {
                self.previous.insert(key.clone(), result.value.clone());
            }
        }

        self.result_cache.end_cycle();
        self.compile_cache.thaw_evictions();
        self.in_cycle = false;
        self.first_cycle_done = true;
        self.cycle_start = None;

        if !changed.is_empty() {
            self.observer.on_cycle_complete(&changed);
        }
        tracing::debug!(
            cycle = self.cycle_id,
            changed = changed.len(),
            "end cycle"
        );
        changed
    }

    /* ─────────────────────── sensor evaluation ─────────────────────── */

    fn eval_sensor(&mut self, key: &str) -> Result<(), EngineError> {
        let sensor = self.loaded.get(key).expect("sensor is loaded");
        let main = Arc::clone(&sensor.main);
        let attributes: Vec<(String, Arc<CompiledFormula>)> = sensor
            .attributes
            .iter()
            .map(|(n, c)| (n.clone(), Arc::clone(c)))
            .collect();
        let variables = sensor.variables.clone();
        let backing = sensor.config.external_id.clone();

        let state_value = self.initial_state(key, backing.as_deref(), &main);
        let (value, mut result) =
            self.evaluate_formula(key, &main, backing.as_deref(), state_value, &variables)?;
        self.registry.set(key, value.clone());
        self.result_cache
            .store(result.text_hash, result.fingerprint, value.clone());

        let mut attr_values = BTreeMap::new();
        if value == Scalar::Unavailable {
            // Main is unavailable: attributes are skipped, not evaluated.
            for (attr_name, _) in &attributes {
                self.registry
                    .set_attribute(key, attr_name, Scalar::Unavailable);
                attr_values.insert(attr_name.clone(), Scalar::Unavailable);
            }
        } else {
            for (attr_name, compiled) in &attributes {
                let (attr_value, attr_result) = self.evaluate_formula(
                    key,
                    compiled,
                    backing.as_deref(),
                    Some(value.clone()),
                    &variables,
                )?;
                self.registry.set_attribute(key, attr_name, attr_value.clone());
                self.result_cache.store(
                    attr_result.text_hash,
                    attr_result.fingerprint,
                    attr_value.clone(),
                );
                result
                    .unavailable_dependencies
                    .extend(attr_result.unavailable_dependencies);
                attr_values.insert(attr_name.clone(), attr_value);
            }
        }
        result.unavailable_dependencies.dedup();
        result.attributes = attr_values;

        self.evaluated_this_cycle.insert(key.to_string());
        self.last_results.insert(key.to_string(), result);
        Ok(())
    }

    /// The phase-appropriate `state` value before a main formula runs:
    /// the backing entity's value when one is declared, otherwise the
    /// sensor's previous post-evaluation value (`Unknown` on first cycle).
    fn initial_state(
        &self,
        key: &str,
        backing: Option<&str>,
        main: &CompiledFormula,
    ) -> Option<Scalar> {
        if !main.plan.names.contains("state") {
            return None;
        }
        let value = match backing {
            Some(id) => {
                if self.host.is_registered(id) {
                    crate::traits::DataSource::get(&self.host, id)
                        .value
                        .unwrap_or(Scalar::Unknown)
                } else {
                    match crate::traits::EntityCatalog::get(&self.host, id) {
                        Some(entity) => entity.state,
                        None => Scalar::Unknown,
                    }
                }
            }
            None => {
                if self.first_cycle_done {
                    self.previous.get(key).cloned().unwrap_or(Scalar::Unknown)
                } else {
                    Scalar::Unknown
                }
            }
        };
        Some(value)
    }

    fn evaluate_formula(
        &self,
        key: &str,
        compiled: &CompiledFormula,
        backing: Option<&str>,
        state_value: Option<Scalar>,
        variables: &BTreeMap<String, VariableBinding>,
    ) -> Result<(Scalar, SensorResult), EngineError> {
        let ctx = LazyContext::from_plan(&compiled.plan);

        if compiled.plan.names.contains("state") {
            if let Some(sv) = &state_value {
                ctx.set_reference("state", backing.unwrap_or(key));
                ctx.store("state", sv);
                // A name that is transient before evaluation short-circuits
                // the whole formula to that state.
                if sv.is_transient() {
                    let result = self.finish_result(key, compiled, &ctx, sv.clone());
                    return Ok((sv.clone(), result));
                }
            }
        }

        // Aliased names point their diagnostics at the target entity.
        for name in &compiled.plan.names {
            if let Some(VariableBinding::EntityRef(id)) = variables.get(name) {
                ctx.set_reference(name, id);
            }
        }

        let env = ResolveEnv {
            sensor_key: key,
            backing_id: backing,
            state_value,
            variables,
            registry: &self.registry,
            data_source: &self.host,
            catalog: &self.host,
            collections: &self.collections,
            compare: &self.compare,
        };
        let interpreter =
            Interpreter::new(&compiled.plan, &ctx, &self.pipeline, &env, &self.functions);
        let value = interpreter.evaluate(&compiled.ast)?;
        let result = self.finish_result(key, compiled, &ctx, value.clone());
        Ok((value, result))
    }

    fn finish_result(
        &self,
        key: &str,
        compiled: &CompiledFormula,
        ctx: &LazyContext,
        value: Scalar,
    ) -> SensorResult {
        SensorResult {
            key: key.to_string(),
            value,
            attributes: BTreeMap::new(),
            unavailable_dependencies: ctx.unavailable_dependencies(),
            text_hash: compiled.text_hash,
            fingerprint: ctx.fingerprint(),
            resolved: ctx.resolved_pairs(),
        }
    }

    /* ───────────────────────── external reads ──────────────────────── */

    /// What the sensor currently surfaces: its value, or its breaker
    /// diagnostic.
    pub fn sensor_state(&self, key: &str) -> SensorState {
        if let Some(err) = self.breaker.get(key) {
            return SensorState::Error(err.clone());
        }
        SensorState::Value(self.read_value(key))
    }

    /// Inter-cycle read path: the result cache first, then a single-sensor
    /// re-evaluation over the memoized context. Fresh data only flows
    /// during a cycle, so upstream sources are never consulted here.
    pub fn read_value(&self, key: &str) -> Scalar {
        if let Some(result) = self.last_results.get(key) {
            if let Some(v) = self.result_cache.get(result.text_hash, result.fingerprint) {
                return v.clone();
            }
            if let Some(v) = self.replay_evaluation(key, result) {
                return v;
            }
            return result.value.clone();
        }
        self.registry.get(key).unwrap_or(Scalar::Unknown)
    }

    fn replay_evaluation(&self, key: &str, result: &SensorResult) -> Option<Scalar> {
        let sensor = self.loaded.get(key)?;
        let ctx = LazyContext::from_plan(&sensor.main.plan);
        for (name, value) in &result.resolved {
            ctx.preset(name, value.clone());
        }
        let state_value = result
            .resolved
            .iter()
            .find(|(n, _)| n == "state")
            .map(|(_, v)| v.clone());
        let env = ResolveEnv {
            sensor_key: key,
            backing_id: sensor.config.external_id.as_deref(),
            state_value,
            variables: &sensor.variables,
            registry: &self.registry,
            data_source: &self.host,
            catalog: &self.host,
            collections: &self.collections,
            compare: &self.compare,
        };
        let interpreter = Interpreter::new(
            &sensor.main.plan,
            &ctx,
            &self.pipeline,
            &env,
            &self.functions,
        );
        interpreter.evaluate(&sensor.main.ast).ok()
    }

    pub fn sensor_attributes(&self, key: &str) -> BTreeMap<String, Scalar> {
        self.registry.attributes_of(key)
    }

    /// Diagnostic payload for the sensor's last evaluation.
    pub fn diagnostics(&self, key: &str) -> Option<&SensorResult> {
        self.last_results.get(key)
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    pub fn cross_sensor_registry_mut(&mut self) -> &mut CrossSensorRegistry {
        &mut self.registry
    }

    pub fn is_in_cycle(&self) -> bool {
        self.in_cycle
    }
}

/* ─────────────────────────── load helpers ──────────────────────────── */

/// Topological order of a sensor's attributes; attribute cycles are fatal.
fn order_attributes(
    attrs: &BTreeMap<String, Arc<CompiledFormula>>,
) -> Result<Vec<String>, EngineError> {
    let mut graph = DependencyGraph::new();
    for (name, compiled) in attrs {
        let deps: Vec<&str> = compiled
            .plan
            .strategies
            .iter()
            .filter(|(_, s)| **s == Strategy::Attribute)
            .map(|(n, _)| n.as_str())
            .collect();
        graph.add_sensor(name, deps.into_iter().map(|d| (d, NodeKind::Sensor)));
    }
    let cycles = graph.detect_cycles();
    if let Some(cycle) = cycles.into_iter().next() {
        return Err(EngineError::cycle(cycle));
    }
    Ok(graph.topological_order())
}

/// Names a sensor depends on, for the dependency graph: cross-sensor
/// references, external identifiers (with entity aliases followed to
/// their targets), and the backing id.
fn dependency_names<'a>(
    main: &'a Arc<CompiledFormula>,
    attr_plans: impl Iterator<Item = &'a Arc<CompiledFormula>>,
    variables: &BTreeMap<String, VariableBinding>,
    external_id: &Option<String>,
) -> Vec<(String, NodeKind)> {
    let mut deps: Vec<(String, NodeKind)> = Vec::new();
    let mut push = |name: String, kind: NodeKind| {
        if !deps.iter().any(|(n, _)| *n == name) {
            deps.push((name, kind));
        }
    };

    let plans = std::iter::once(main).chain(attr_plans);
    for compiled in plans {
        for (name, strategy) in &compiled.plan.strategies {
            match strategy {
                Strategy::CrossSensor => push(name.clone(), NodeKind::Sensor),
                Strategy::DataSource | Strategy::HostEntity => {
                    let id = match variables.get(name) {
                        Some(VariableBinding::EntityRef(id)) => id.clone(),
                        _ => name.clone(),
                    };
                    push(id, NodeKind::External);
                }
                _ => {}
            }
        }
    }
    if let Some(id) = external_id {
        if !id.is_empty() {
            push(id.clone(), NodeKind::External);
        }
    }
    deps
}
