//! Lightweight in-memory host for unit tests: a data-source map plus an
//! entity catalog, with builder helpers.

use std::collections::BTreeMap;

use synsor_common::Scalar;

use crate::config::SensorSet;
use crate::engine::{Engine, EngineConfig};
use crate::traits::{DataSource, Entity, EntityCatalog, SourceValue};

#[derive(Debug, Default, Clone)]
pub struct TestHost {
    source: BTreeMap<String, Option<Scalar>>,
    entities: BTreeMap<String, Entity>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data-source identifier; `None` means "owned but
    /// currently unknown".
    pub fn with_source(mut self, id: &str, value: Option<Scalar>) -> Self {
        self.source.insert(id.to_string(), value);
        self
    }

    pub fn with_entity(mut self, id: &str, entity: Entity) -> Self {
        self.entities.insert(id.to_string(), entity);
        self
    }

    pub fn with_entity_state(self, id: &str, state: Scalar) -> Self {
        self.with_entity(
            id,
            Entity {
                state,
                ..Default::default()
            },
        )
    }

    pub fn set_source(&mut self, id: &str, value: Option<Scalar>) {
        self.source.insert(id.to_string(), value);
    }
}

impl DataSource for TestHost {
    fn get(&self, identifier: &str) -> SourceValue {
        match self.source.get(identifier) {
            Some(value) => SourceValue {
                value: value.clone(),
                exists: true,
            },
            None => SourceValue::missing(),
        }
    }

    fn registered_count(&self) -> usize {
        self.source.len()
    }
}

impl EntityCatalog for TestHost {
    fn get(&self, entity_id: &str) -> Option<Entity> {
        self.entities.get(entity_id).cloned()
    }

    fn iter_ids(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }
}

/// Build an engine from a YAML document against the given host.
pub fn engine_with(host: TestHost, yaml: &str) -> Engine<TestHost> {
    let set = SensorSet::from_yaml_str("test", yaml).expect("yaml loads");
    let mut engine = Engine::new(host, EngineConfig::default());
    engine.load(set).expect("set loads");
    engine
}

/// One full update cycle; returns the changed keys.
pub fn run_cycle(engine: &mut Engine<TestHost>) -> Vec<String> {
    engine.begin_cycle();
    engine.update_all();
    engine.end_cycle()
}

/// Assert a scalar is a number within epsilon of `expected`.
pub fn assert_num(value: &Scalar, expected: f64) {
    let got = value
        .as_number()
        .unwrap_or_else(|| panic!("expected a number, got {value:?}"));
    assert!(
        (got - expected).abs() < 1e-9,
        "expected {expected}, got {got}"
    );
}
