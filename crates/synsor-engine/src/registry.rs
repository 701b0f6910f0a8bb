//! Cross-sensor registry: current post-evaluation values of sibling
//! sensors, plus the rename-stable mapping between sensor keys and the
//! external ids the host assigned them.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use synsor_common::Scalar;

#[derive(Debug, Default)]
pub struct CrossSensorRegistry {
    values: FxHashMap<String, Scalar>,
    attributes: FxHashMap<String, BTreeMap<String, Scalar>>,
    external_ids: FxHashMap<String, String>,
    keys_by_id: FxHashMap<String, String>,
}

/// Immutable view used for inter-cycle external reads.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub values: BTreeMap<String, Scalar>,
    pub attributes: BTreeMap<String, BTreeMap<String, Scalar>>,
    pub external_ids: BTreeMap<String, String>,
}

impl CrossSensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a sensor key to its host-assigned external id.
    pub fn register(&mut self, key: &str, external_id: Option<&str>) {
        if let Some(id) = external_id {
            self.external_ids.insert(key.to_string(), id.to_string());
            self.keys_by_id.insert(id.to_string(), key.to_string());
        } else {
            self.external_ids.remove(key);
        }
    }

    /// The host assigned a different id than the configuration hinted.
    pub fn rename(&mut self, key: &str, new_id: &str) {
        if let Some(old) = self.external_ids.insert(key.to_string(), new_id.to_string()) {
            self.keys_by_id.remove(&old);
        }
        self.keys_by_id.insert(new_id.to_string(), key.to_string());
    }

    pub fn set(&mut self, key: &str, value: Scalar) {
        self.values.insert(key.to_string(), value);
    }

    pub fn set_attribute(&mut self, key: &str, attr: &str, value: Scalar) {
        self.attributes
            .entry(key.to_string())
            .or_default()
            .insert(attr.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Scalar> {
        self.values.get(key).cloned()
    }

    pub fn attribute(&self, key: &str, attr: &str) -> Option<Scalar> {
        self.attributes
            .get(key)
            .and_then(|attrs| attrs.get(attr))
            .cloned()
    }

    pub fn attributes_of(&self, key: &str) -> BTreeMap<String, Scalar> {
        self.attributes.get(key).cloned().unwrap_or_default()
    }

    pub fn external_id_of(&self, key: &str) -> Option<&str> {
        self.external_ids.get(key).map(String::as_str)
    }

    pub fn key_for_id(&self, external_id: &str) -> Option<&str> {
        self.keys_by_id.get(external_id).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
        self.attributes.remove(key);
        if let Some(id) = self.external_ids.remove(key) {
            self.keys_by_id.remove(&id);
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.attributes.clear();
        self.external_ids.clear();
        self.keys_by_id.clear();
    }

    /// Restore values and attributes from a snapshot; used when a cycle is
    /// cancelled and its partial results must be discarded.
    pub fn restore(&mut self, snapshot: &RegistrySnapshot) {
        self.values = snapshot
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.attributes = snapshot
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            values: self.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            attributes: self
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            external_ids: self
                .external_ids
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}
