//! Collection queries: entities-by-predicate aggregation.
//!
//! A query string is a whitespace-separated list of clauses, combined as
//! AND. Within one clause, `|` alternatives and comma lists combine as OR:
//!
//! ```text
//! device_class:door|window        area:kitchen
//! tags:critical,outdoor           regex:^binary_sensor\.
//! state:on|off                    state >= 20
//! attribute:battery_level < 15    state in on,open
//! ```
//!
//! Comparisons delegate to the comparison handler registry. Aggregates
//! skip non-numeric candidates and return `0` over an empty match set.

use std::str::FromStr;
use std::sync::Mutex;

use regex::Regex;
use rustc_hash::FxHashMap;
use synsor_common::{EngineError, EngineErrorKind, Scalar};

use crate::compare::{CompareOp, ComparisonRegistry, scalar_eq};
use crate::traits::EntityCatalog;

/* ─────────────────────────── query model ───────────────────────────── */

#[derive(Debug, Clone, PartialEq)]
pub enum CompareTarget {
    State,
    Attribute(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    DeviceClass(Vec<String>),
    Area(Vec<String>),
    Tags(Vec<String>),
    Label(Vec<String>),
    Regex(String),
    StateTokens(Vec<String>),
    Comparison {
        target: CompareTarget,
        op: CompareOp,
        value: String,
    },
    Membership {
        target: CompareTarget,
        negate: bool,
        values: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionQuery {
    pub clauses: Vec<Clause>,
}

fn split_alternatives(s: &str) -> Vec<String> {
    s.split(['|', ','])
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::new(EngineErrorKind::DataValidation).with_message(msg)
}

/// Parse a raw query string into clauses.
pub fn parse_query(raw: &str) -> Result<CollectionQuery, EngineError> {
    let mut clauses = Vec::new();
    let mut words = raw.split_whitespace();

    while let Some(word) = words.next() {
        if let Some((pattern, rest)) = word.split_once(':') {
            match pattern {
                "device_class" => clauses.push(Clause::DeviceClass(split_alternatives(rest))),
                "area" => clauses.push(Clause::Area(split_alternatives(rest))),
                "tags" => clauses.push(Clause::Tags(split_alternatives(rest))),
                "label" => clauses.push(Clause::Label(split_alternatives(rest))),
                "regex" => clauses.push(Clause::Regex(rest.to_string())),
                "state" => clauses.push(Clause::StateTokens(split_alternatives(rest))),
                "attribute" => {
                    let target = CompareTarget::Attribute(rest.to_string());
                    clauses.push(parse_operator_clause(target, &mut words, raw)?);
                }
                other => {
                    return Err(invalid(format!("unknown pattern '{other}' in query '{raw}'")));
                }
            }
        } else if word == "state" {
            clauses.push(parse_operator_clause(CompareTarget::State, &mut words, raw)?);
        } else {
            return Err(invalid(format!("unexpected token '{word}' in query '{raw}'")));
        }
    }

    if clauses.is_empty() {
        return Err(invalid(format!("empty collection query '{raw}'")));
    }
    Ok(CollectionQuery { clauses })
}

fn parse_operator_clause<'a>(
    target: CompareTarget,
    words: &mut impl Iterator<Item = &'a str>,
    raw: &str,
) -> Result<Clause, EngineError> {
    let op_word = words
        .next()
        .ok_or_else(|| invalid(format!("missing operator in query '{raw}'")))?;

    let (op, negate) = if op_word == "not" {
        match words.next() {
            Some("in") => (CompareOp::NotIn, true),
            _ => return Err(invalid(format!("expected 'in' after 'not' in '{raw}'"))),
        }
    } else {
        let op = CompareOp::from_str(op_word)
            .map_err(|_| invalid(format!("unknown operator '{op_word}' in query '{raw}'")))?;
        (op, false)
    };

    let value = words
        .next()
        .ok_or_else(|| invalid(format!("missing comparison value in query '{raw}'")))?
        .to_string();

    match op {
        CompareOp::In | CompareOp::NotIn => Ok(Clause::Membership {
            target,
            negate: negate || op == CompareOp::NotIn,
            values: split_alternatives(&value),
        }),
        _ => Ok(Clause::Comparison { target, op, value }),
    }
}

/// Coerce a query value token into a scalar for comparison.
fn token_scalar(token: &str) -> Scalar {
    if let Ok(i) = token.parse::<i64>() {
        return Scalar::Int(i);
    }
    if let Ok(n) = token.parse::<f64>() {
        return Scalar::Number(n);
    }
    match token {
        "true" => Scalar::Boolean(true),
        "false" => Scalar::Boolean(false),
        _ => Scalar::Text(token.to_string()),
    }
}

/* ─────────────────────────── aggregates ────────────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    Std,
    Var,
}

impl Aggregate {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "sum" => Aggregate::Sum,
            "avg" | "mean" => Aggregate::Avg,
            "count" => Aggregate::Count,
            "min" => Aggregate::Min,
            "max" => Aggregate::Max,
            "std" => Aggregate::Std,
            "var" => Aggregate::Var,
            _ => return None,
        })
    }

    /// Apply to the numeric candidates of a match set. Every aggregate
    /// returns `0` on an empty slice; `std`/`var` are sample statistics.
    pub fn apply(&self, values: &[f64]) -> Scalar {
        if values.is_empty() {
            return match self {
                Aggregate::Count => Scalar::Int(0),
                _ => Scalar::Number(0.0),
            };
        }
        match self {
            Aggregate::Sum => Scalar::Number(values.iter().sum()),
            Aggregate::Avg => Scalar::Number(values.iter().sum::<f64>() / values.len() as f64),
            Aggregate::Count => Scalar::Int(values.len() as i64),
            Aggregate::Min => Scalar::Number(values.iter().copied().fold(f64::INFINITY, f64::min)),
            Aggregate::Max => {
                Scalar::Number(values.iter().copied().fold(f64::NEG_INFINITY, f64::max))
            }
            Aggregate::Std => match sample_variance(values) {
                Some(v) => Scalar::Number(v.sqrt()),
                None => Scalar::Number(0.0),
            },
            Aggregate::Var => match sample_variance(values) {
                Some(v) => Scalar::Number(v),
                None => Scalar::Number(0.0),
            },
        }
    }
}

fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    Some(ss / (values.len() - 1) as f64)
}

/* ────────────────────────────── engine ─────────────────────────────── */

/// Evaluates collection queries against the host entity catalog.
pub struct CollectionEngine {
    regex_cache: Mutex<FxHashMap<String, Regex>>,
}

impl CollectionEngine {
    pub fn new() -> Self {
        Self {
            regex_cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// Entity ids matching a query, in catalog order.
    pub fn matches(
        &self,
        raw: &str,
        catalog: &dyn EntityCatalog,
        compare: &ComparisonRegistry,
    ) -> Result<Vec<String>, EngineError> {
        let query = parse_query(raw)?;
        let mut out = Vec::new();
        for id in catalog.iter_ids() {
            let Some(entity) = catalog.get(&id) else {
                continue;
            };
            let mut all = true;
            for clause in &query.clauses {
                if !self.clause_matches(clause, &id, &entity, compare)? {
                    all = false;
                    break;
                }
            }
            if all {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Run an aggregate over a query's match set.
    pub fn aggregate(
        &self,
        func: &str,
        raw: &str,
        catalog: &dyn EntityCatalog,
        compare: &ComparisonRegistry,
    ) -> Result<Scalar, EngineError> {
        let aggregate = Aggregate::from_name(func).ok_or_else(|| {
            EngineError::new(EngineErrorKind::UnknownFunction)
                .with_message(format!("'{func}' is not an aggregate"))
        })?;
        let ids = self.matches(raw, catalog, compare)?;

        if aggregate == Aggregate::Count {
            return Ok(Scalar::Int(ids.len() as i64));
        }

        let mut values = Vec::with_capacity(ids.len());
        for id in &ids {
            let Some(entity) = catalog.get(id) else {
                continue;
            };
            if entity.state.is_transient() {
                continue;
            }
            match entity.state.as_number() {
                Some(n) => values.push(n),
                None => {
                    tracing::debug!(entity = %id, state = %entity.state, "skipping non-numeric state in aggregate");
                }
            }
        }
        Ok(aggregate.apply(&values))
    }

    fn clause_matches(
        &self,
        clause: &Clause,
        id: &str,
        entity: &crate::traits::Entity,
        compare: &ComparisonRegistry,
    ) -> Result<bool, EngineError> {
        Ok(match clause {
            Clause::DeviceClass(alts) => entity
                .device_class
                .as_deref()
                .map(|dc| alts.iter().any(|a| a == dc))
                .unwrap_or(false),
            Clause::Area(alts) => entity
                .area
                .as_deref()
                .map(|area| alts.iter().any(|a| a == area))
                .unwrap_or(false),
            Clause::Tags(wanted) => wanted.iter().any(|t| entity.tags.iter().any(|e| e == t)),
            Clause::Label(wanted) => wanted.iter().any(|l| entity.labels.iter().any(|e| e == l)),
            Clause::Regex(pattern) => self.regex_for(pattern)?.is_match(id),
            Clause::StateTokens(alts) => {
                let state = entity.state.to_string();
                alts.iter().any(|a| *a == state)
            }
            Clause::Comparison { target, op, value } => {
                let Some(subject) = self.target_value(target, entity) else {
                    return Ok(false);
                };
                if subject.is_transient() {
                    return Ok(false);
                }
                // An incomparable pair is a non-match, not a query failure.
                match compare.compare(&subject, &token_scalar(value), *op) {
                    Ok(matched) => matched,
                    Err(_) => {
                        tracing::trace!(entity = %id, "state not comparable, excluded from match set");
                        false
                    }
                }
            }
            Clause::Membership {
                target,
                negate,
                values,
            } => {
                let Some(subject) = self.target_value(target, entity) else {
                    return Ok(false);
                };
                let found = values.iter().any(|v| scalar_eq(&subject, &token_scalar(v)));
                found != *negate
            }
        })
    }

    fn target_value(
        &self,
        target: &CompareTarget,
        entity: &crate::traits::Entity,
    ) -> Option<Scalar> {
        match target {
            CompareTarget::State => Some(entity.state.clone()),
            CompareTarget::Attribute(name) => entity.attributes.get(name).cloned(),
        }
    }

    fn regex_for(&self, pattern: &str) -> Result<Regex, EngineError> {
        let mut cache = self.regex_cache.lock().expect("regex cache poisoned");
        if let Some(re) = cache.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern)
            .map_err(|e| invalid(format!("invalid regex '{pattern}': {e}")))?;
        cache.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

impl Default for CollectionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::common::TestHost;

    fn catalog() -> TestHost {
        TestHost::new()
            .with_entity(
                "binary_sensor.front_door",
                crate::traits::Entity {
                    state: Scalar::from("on"),
                    device_class: Some("door".into()),
                    area: Some("hall".into()),
                    tags: vec!["security".into()],
                    ..Default::default()
                },
            )
            .with_entity(
                "binary_sensor.kitchen_window",
                crate::traits::Entity {
                    state: Scalar::from("off"),
                    device_class: Some("window".into()),
                    area: Some("kitchen".into()),
                    ..Default::default()
                },
            )
            .with_entity(
                "light.kitchen",
                crate::traits::Entity {
                    state: Scalar::from("on"),
                    device_class: Some("light".into()),
                    area: Some("kitchen".into()),
                    ..Default::default()
                },
            )
            .with_entity(
                "sensor.kitchen_temp",
                crate::traits::Entity {
                    state: Scalar::Number(21.5),
                    device_class: Some("temperature".into()),
                    area: Some("kitchen".into()),
                    attributes: [("battery_level".to_string(), Scalar::Int(9))].into(),
                    ..Default::default()
                },
            )
    }

    fn run(query: &str) -> Vec<String> {
        let host = catalog();
        CollectionEngine::new()
            .matches(query, &host, &ComparisonRegistry::with_builtins())
            .unwrap()
    }

    #[test]
    fn pipe_alternation_is_or() {
        let ids = run("device_class:door|window");
        assert_eq!(
            ids,
            vec![
                "binary_sensor.front_door".to_string(),
                "binary_sensor.kitchen_window".to_string()
            ]
        );
    }

    #[test]
    fn whitespace_between_patterns_is_and() {
        let ids = run("device_class:door|window area:kitchen");
        assert_eq!(ids, vec!["binary_sensor.kitchen_window".to_string()]);
    }

    #[test]
    fn state_comparison_delegates_to_handlers() {
        let ids = run("state >= 20");
        assert_eq!(ids, vec!["sensor.kitchen_temp".to_string()]);
    }

    #[test]
    fn attribute_comparison() {
        let ids = run("attribute:battery_level < 15");
        assert_eq!(ids, vec!["sensor.kitchen_temp".to_string()]);
    }

    #[test]
    fn membership_and_negation() {
        assert_eq!(run("state in on,open").len(), 2);
        // `not in` over string states; the numeric temp entity's state is
        // not in the list either, so only "off" is excluded.
        assert_eq!(run("state not in off").len(), 3);
    }

    #[test]
    fn regex_matches_entity_ids() {
        let ids = run(r"regex:^binary_sensor\.");
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn tags_match_any_listed() {
        assert_eq!(run("tags:security,critical").len(), 1);
    }

    #[test]
    fn count_counts_matches_regardless_of_state_type() {
        let host = catalog();
        let engine = CollectionEngine::new();
        let reg = ComparisonRegistry::with_builtins();
        assert_eq!(
            engine
                .aggregate("count", "device_class:door|window", &host, &reg)
                .unwrap(),
            Scalar::Int(2)
        );
    }

    #[test]
    fn numeric_aggregates_skip_non_numeric() {
        let host = catalog();
        let engine = CollectionEngine::new();
        let reg = ComparisonRegistry::with_builtins();
        // Only the temperature entity is numeric in this area.
        assert_eq!(
            engine.aggregate("sum", "area:kitchen", &host, &reg).unwrap(),
            Scalar::Number(21.5)
        );
    }

    #[test]
    fn empty_match_set_aggregates_to_zero() {
        let host = catalog();
        let engine = CollectionEngine::new();
        let reg = ComparisonRegistry::with_builtins();
        assert_eq!(
            engine
                .aggregate("sum", "device_class:smoke", &host, &reg)
                .unwrap(),
            Scalar::Number(0.0)
        );
        assert_eq!(
            engine
                .aggregate("count", "device_class:smoke", &host, &reg)
                .unwrap(),
            Scalar::Int(0)
        );
        assert_eq!(
            engine
                .aggregate("avg", "device_class:smoke", &host, &reg)
                .unwrap(),
            Scalar::Number(0.0)
        );
    }

    #[test]
    fn unknown_pattern_is_rejected() {
        let err = parse_query("colour:red").unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::DataValidation);
    }

    #[test]
    fn sample_statistics() {
        let agg = Aggregate::Std;
        let Scalar::Number(std) = agg.apply(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]) else {
            panic!("expected number");
        };
        assert!((std - 2.138).abs() < 0.001);
    }
}
