//! Export/import round trips through the engine.

use super::common::{TestHost, engine_with, run_cycle};
use crate::config::{ConfigError, SensorSet};
use crate::engine::{Engine, EngineConfig, SensorState};
use synsor_common::Scalar;

const YAML: &str = r#"
version: "1.0"
global_settings:
  variables:
    tariff: 0.5
sensors:
  base:
    external_id: x.power
    formula: state * 1.0
  cost:
    formula: base * tariff
    attributes:
      daily: state * 24
"#;

fn host() -> TestHost {
    TestHost::new().with_source("x.power", Some(Scalar::Number(100.0)))
}

#[test]
fn exported_config_reimports_with_isomorphic_graph() {
    let mut engine = engine_with(host(), YAML);
    run_cycle(&mut engine);

    // Host assigns `cost` a concrete external id after registration.
    engine
        .cross_sensor_registry_mut()
        .rename("base", "sensor.base_power");
    let exported = engine.export_yaml().unwrap();

    // The re-imported set keeps its keys; the cross-sensor reference now
    // travels through the assigned external id.
    let reimported = SensorSet::from_yaml_str("test", &exported).unwrap();
    assert_eq!(
        reimported.keys(),
        ["base".to_string(), "cost".to_string()].into()
    );
    assert_eq!(
        reimported.sensor("cost").unwrap().formula,
        "sensor.base_power * tariff"
    );

    // Loading against a host that knows the assigned id reproduces the
    // same values.
    let renamed_host = TestHost::new()
        .with_source("x.power", Some(Scalar::Number(100.0)))
        .with_entity_state("sensor.base_power", Scalar::Number(100.0));
    let mut engine2 = Engine::new(renamed_host, EngineConfig::default());
    engine2.load(reimported).unwrap();
    engine2.begin_cycle();
    engine2.update_all();
    engine2.end_cycle();
    assert_eq!(
        engine2.sensor_state("cost"),
        SensorState::Value(Scalar::Number(50.0))
    );
}

#[test]
fn export_without_load_is_an_error() {
    let engine: Engine<TestHost> = Engine::new(TestHost::new(), EngineConfig::default());
    assert!(matches!(engine.export_yaml(), Err(ConfigError::Empty)));
}

#[test]
fn empty_data_source_with_backing_sensor_is_fatal_at_load() {
    let yaml = r#"
version: "1.0"
sensors:
  p:
    external_id: x.power
    formula: state * 1.0
"#;
    let set = SensorSet::from_yaml_str("test", yaml).unwrap();
    let mut engine = Engine::new(TestHost::new(), EngineConfig::default());
    assert!(matches!(
        engine.load(set),
        Err(ConfigError::EmptyDataSource { .. })
    ));
}
