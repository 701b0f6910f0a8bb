//! Configuration ingest and export.
//!
//! The YAML binding carries `version`, `global_settings`, and a `sensors`
//! map keyed by sensor key. Ingest validates the schema version (unknown
//! major versions are rejected), classifies variable bindings by shape,
//! and cross-references the data-source registration. Export rewrites
//! references so the persisted form survives host renames: within a
//! sensor, self-references become the literal `state`; across sensors,
//! keys become host-assigned external ids.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use synsor_common::Scalar;
use synsor_parse::{Expr, ExprKind, looks_like_collection_query, parse, pretty_print};

use crate::binding::VariableBinding;
use crate::registry::CrossSensorRegistry;
use crate::traits::DataSource;

/// Current schema version; configurations with a different major are
/// rejected.
pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported schema version '{found}' (supported major: {supported})")]
    UnsupportedVersion { found: String, supported: u64 },

    #[error("invalid schema version '{0}'")]
    InvalidVersion(String),

    #[error("sensor set has no sensors")]
    Empty,

    #[error("sensor '{sensor}' formula is empty")]
    EmptyFormula { sensor: String },

    #[error(
        "data source registration is empty but '{sensor}' needs identifier '{identifier}'"
    )]
    EmptyDataSource { sensor: String, identifier: String },

    #[error("formula for '{sensor}' failed to parse: {message}")]
    Formula { sensor: String, message: String },
}

/* ─────────────────────────── YAML binding ──────────────────────────── */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSetYaml {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_settings: Option<GlobalSettingsYaml>,
    pub sensors: BTreeMap<String, SensorYaml>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalSettingsYaml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, VariableYaml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorYaml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub formula: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeYaml>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, VariableYaml>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub device_info: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// An attribute is either a bare formula string or a `{formula: …}` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeYaml {
    Formula(String),
    Detailed { formula: String },
}

impl AttributeYaml {
    pub fn formula(&self) -> &str {
        match self {
            AttributeYaml::Formula(f) => f,
            AttributeYaml::Detailed { formula } => formula,
        }
    }
}

/// Raw variable value; classified into a [`VariableBinding`] by shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableYaml {
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
}

impl VariableYaml {
    fn classify(&self) -> VariableBinding {
        match self {
            VariableYaml::Bool(b) => VariableBinding::Literal(Scalar::Boolean(*b)),
            VariableYaml::Int(i) => VariableBinding::Literal(Scalar::Int(*i)),
            VariableYaml::Number(n) => VariableBinding::Literal(Scalar::Number(*n)),
            VariableYaml::Text(s) => {
                if looks_like_collection_query(s) {
                    VariableBinding::CollectionPattern(s.clone())
                } else if s.contains('.') && !s.contains(char::is_whitespace) {
                    VariableBinding::EntityRef(s.clone())
                } else {
                    VariableBinding::Literal(Scalar::Text(s.clone()))
                }
            }
        }
    }

    fn from_binding(binding: &VariableBinding) -> Self {
        match binding {
            VariableBinding::EntityRef(id) => VariableYaml::Text(id.clone()),
            VariableBinding::CollectionPattern(p) => VariableYaml::Text(p.clone()),
            VariableBinding::Literal(Scalar::Boolean(b)) => VariableYaml::Bool(*b),
            VariableBinding::Literal(Scalar::Int(i)) => VariableYaml::Int(*i),
            VariableBinding::Literal(Scalar::Number(n)) => VariableYaml::Number(*n),
            VariableBinding::Literal(other) => VariableYaml::Text(other.to_string()),
        }
    }
}

/* ─────────────────────────── runtime model ─────────────────────────── */

#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub key: String,
    pub external_id: Option<String>,
    pub formula: String,
    /// Attribute formulas; evaluation order is decided by the attribute
    /// sub-DAG, not this listing.
    pub attributes: BTreeMap<String, String>,
    pub variables: BTreeMap<String, VariableBinding>,
    pub device_info: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SensorSet {
    pub name: String,
    pub device_identifier: Option<String>,
    pub variables: BTreeMap<String, VariableBinding>,
    pub sensors: Vec<SensorConfig>,
}

impl SensorSet {
    /// Sensor keys, in declaration order. Keys are unique by construction
    /// (the YAML layer rejects duplicate map keys).
    pub fn keys(&self) -> BTreeSet<String> {
        self.sensors.iter().map(|s| s.key.clone()).collect()
    }

    pub fn sensor(&self, key: &str) -> Option<&SensorConfig> {
        self.sensors.iter().find(|s| s.key == key)
    }

    /// Parse and validate a YAML document into a sensor set.
    pub fn from_yaml_str(name: &str, yaml: &str) -> Result<Self, ConfigError> {
        let raw: SensorSetYaml = serde_yaml::from_str(yaml)?;
        Self::from_yaml(name, raw)
    }

    pub fn from_yaml(name: &str, raw: SensorSetYaml) -> Result<Self, ConfigError> {
        check_version(&raw.version)?;
        if raw.sensors.is_empty() {
            return Err(ConfigError::Empty);
        }

        let (device_identifier, global_variables) = match raw.global_settings {
            Some(gs) => (
                gs.device_identifier,
                gs.variables
                    .iter()
                    .map(|(k, v)| (k.clone(), v.classify()))
                    .collect(),
            ),
            None => (None, BTreeMap::new()),
        };

        let mut sensors = Vec::with_capacity(raw.sensors.len());
        for (key, sensor) in raw.sensors {
            if sensor.formula.trim().is_empty() {
                return Err(ConfigError::EmptyFormula { sensor: key });
            }
            sensors.push(SensorConfig {
                key,
                external_id: sensor.external_id,
                formula: sensor.formula,
                attributes: sensor
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.formula().to_string()))
                    .collect(),
                variables: sensor
                    .variables
                    .iter()
                    .map(|(k, v)| (k.clone(), v.classify()))
                    .collect(),
                device_info: sensor.device_info,
                metadata: sensor.metadata,
            });
        }

        Ok(SensorSet {
            name: name.to_string(),
            device_identifier,
            variables: global_variables,
            sensors,
        })
    }

    /// Cross-reference the data-source registration: a sensor whose
    /// backing identifier can only come from the data source is fatal to
    /// load against an empty registration.
    pub fn validate_data_source(
        &self,
        source: &dyn DataSource,
        catalog: &dyn crate::traits::EntityCatalog,
    ) -> Result<(), ConfigError> {
        if source.registered_count() > 0 {
            return Ok(());
        }
        for sensor in &self.sensors {
            if let Some(id) = &sensor.external_id {
                if !id.is_empty() && catalog.get(id).is_none() {
                    return Err(ConfigError::EmptyDataSource {
                        sensor: sensor.key.clone(),
                        identifier: id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Sensor-local variables shadow globals.
    pub fn merged_variables(&self, sensor: &SensorConfig) -> BTreeMap<String, VariableBinding> {
        let mut merged = self.variables.clone();
        for (k, v) in &sensor.variables {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Serialize back to YAML, rewriting references for persistence.
    pub fn to_yaml_string(
        &self,
        registry: &CrossSensorRegistry,
    ) -> Result<String, ConfigError> {
        let keys = self.keys();
        let mut sensors = BTreeMap::new();
        for sensor in &self.sensors {
            let rewritten = rewrite_formula(&sensor.formula, &sensor.key, &keys, registry)
                .map_err(|message| ConfigError::Formula {
                    sensor: sensor.key.clone(),
                    message,
                })?;
            let mut attributes = BTreeMap::new();
            for (attr_name, attr_formula) in &sensor.attributes {
                let rewritten_attr =
                    rewrite_formula(attr_formula, &sensor.key, &keys, registry).map_err(
                        |message| ConfigError::Formula {
                            sensor: format!("{}.{attr_name}", sensor.key),
                            message,
                        },
                    )?;
                attributes.insert(attr_name.clone(), AttributeYaml::Formula(rewritten_attr));
            }
            sensors.insert(
                sensor.key.clone(),
                SensorYaml {
                    external_id: registry
                        .external_id_of(&sensor.key)
                        .map(str::to_string)
                        .or_else(|| sensor.external_id.clone()),
                    formula: rewritten,
                    attributes,
                    variables: sensor
                        .variables
                        .iter()
                        .map(|(k, v)| (k.clone(), VariableYaml::from_binding(v)))
                        .collect(),
                    device_info: sensor.device_info.clone(),
                    metadata: sensor.metadata.clone(),
                },
            );
        }

        let global_settings = if self.device_identifier.is_some() || !self.variables.is_empty() {
            Some(GlobalSettingsYaml {
                device_identifier: self.device_identifier.clone(),
                variables: self
                    .variables
                    .iter()
                    .map(|(k, v)| (k.clone(), VariableYaml::from_binding(v)))
                    .collect(),
            })
        } else {
            None
        };

        let doc = SensorSetYaml {
            version: SCHEMA_VERSION.to_string(),
            global_settings,
            sensors,
        };
        Ok(serde_yaml::to_string(&doc)?)
    }
}

fn check_version(version: &str) -> Result<(), ConfigError> {
    let supported = major_of(SCHEMA_VERSION).expect("schema version constant is valid");
    let found = major_of(version)
        .ok_or_else(|| ConfigError::InvalidVersion(version.to_string()))?;
    if found != supported {
        return Err(ConfigError::UnsupportedVersion {
            found: version.to_string(),
            supported,
        });
    }
    Ok(())
}

/// Parse the major component, padding short forms so `"1.0"` and `"1"`
/// are accepted alongside full semver.
fn major_of(version: &str) -> Option<u64> {
    let mut parts: Vec<&str> = version.trim().split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    semver::Version::parse(&parts.join("."))
        .ok()
        .map(|v| v.major)
}

/// Rewrite a formula for export: self-references become `state`,
/// cross-sensor keys become their host-assigned external ids.
fn rewrite_formula(
    formula: &str,
    self_key: &str,
    sensor_keys: &BTreeSet<String>,
    registry: &CrossSensorRegistry,
) -> Result<String, String> {
    let ast = parse(formula).map_err(|e| e.to_string())?;
    let rewritten = rewrite_expr(&ast, self_key, sensor_keys, registry);
    Ok(pretty_print(&rewritten))
}

fn rewrite_expr(
    expr: &Expr,
    self_key: &str,
    sensor_keys: &BTreeSet<String>,
    registry: &CrossSensorRegistry,
) -> Expr {
    let rewrite = |e: &Expr| rewrite_expr(e, self_key, sensor_keys, registry);
    let kind = match &expr.kind {
        ExprKind::Name(name) => {
            if name == self_key {
                ExprKind::Name("state".to_string())
            } else if sensor_keys.contains(name) {
                match registry.external_id_of(name) {
                    Some(id) => ExprKind::Name(id.to_string()),
                    None => ExprKind::Name(name.clone()),
                }
            } else {
                ExprKind::Name(name.clone())
            }
        }
        ExprKind::Literal(v) => ExprKind::Literal(v.clone()),
        ExprKind::CollectionQuery(q) => ExprKind::CollectionQuery(q.clone()),
        ExprKind::MemberAccess { receiver, attr } => ExprKind::MemberAccess {
            receiver: Box::new(rewrite(receiver)),
            attr: attr.clone(),
        },
        ExprKind::Call { function, args } => ExprKind::Call {
            function: function.clone(),
            args: args.iter().map(|a| rewrite(a)).collect(),
        },
        ExprKind::BinaryOp { op, lhs, rhs } => ExprKind::BinaryOp {
            op: *op,
            lhs: Box::new(rewrite(lhs)),
            rhs: Box::new(rewrite(rhs)),
        },
        ExprKind::UnaryOp { op, operand } => ExprKind::UnaryOp {
            op: *op,
            operand: Box::new(rewrite(operand)),
        },
        ExprKind::Conditional {
            cond,
            then_branch,
            else_branch,
        } => ExprKind::Conditional {
            cond: Box::new(rewrite(cond)),
            then_branch: Box::new(rewrite(then_branch)),
            else_branch: Box::new(rewrite(else_branch)),
        },
    };
    Expr::new(kind, None)
}
