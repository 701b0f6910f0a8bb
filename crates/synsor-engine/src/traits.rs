//! synsor-engine – collaborator traits (object-safe)
//!
//! The engine never owns host state. Everything it reads comes through the
//! traits here: raw readings through [`DataSource`], the entity catalog
//! through [`EntityCatalog`], and change notification back out through
//! [`ChangeObserver`]. All lookups are synchronous against preloaded
//! structures; none of them may block.

use std::collections::BTreeMap;

use synsor_common::{EngineError, Scalar};

/* ───────────────────────────── DataSource ───────────────────────────── */

/// Answer for a single identifier lookup.
///
/// `exists == false` means "this identifier is not owned by this data
/// source". `exists == true` with `value == None` means "owned, but
/// currently unknown".
#[derive(Debug, Clone, PartialEq)]
pub struct SourceValue {
    pub value: Option<Scalar>,
    pub exists: bool,
}

impl SourceValue {
    pub fn missing() -> Self {
        Self {
            value: None,
            exists: false,
        }
    }

    pub fn unknown() -> Self {
        Self {
            value: None,
            exists: true,
        }
    }

    pub fn of(value: Scalar) -> Self {
        Self {
            value: Some(value),
            exists: true,
        }
    }
}

/// Raw value provider for externally-owned identifiers.
///
/// Contract: pure, non-blocking, deterministic within one update cycle.
pub trait DataSource: Send + Sync {
    fn get(&self, identifier: &str) -> SourceValue;

    /// Number of identifiers this source claims. An empty registration
    /// combined with formulas that need one is a configuration error.
    fn registered_count(&self) -> usize;

    fn is_registered(&self, identifier: &str) -> bool {
        self.get(identifier).exists
    }
}

/* ─────────────────────────── Entity catalog ─────────────────────────── */

/// A host entity as the engine sees it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Entity {
    pub state: Scalar,
    pub attributes: BTreeMap<String, Scalar>,
    pub device_class: Option<String>,
    pub area: Option<String>,
    pub tags: Vec<String>,
    pub labels: Vec<String>,
}

/// Host-provided catalog of entities, used by the host-entity resolver and
/// the collection query engine.
pub trait EntityCatalog: Send + Sync {
    fn get(&self, entity_id: &str) -> Option<Entity>;

    /// Snapshot of all known entity ids, in stable order.
    fn iter_ids(&self) -> Vec<String>;

    fn area_of(&self, entity_id: &str) -> Option<String> {
        self.get(entity_id).and_then(|e| e.area)
    }

    fn device_class_of(&self, entity_id: &str) -> Option<String> {
        self.get(entity_id).and_then(|e| e.device_class)
    }

    fn tags_of(&self, entity_id: &str) -> Vec<String> {
        self.get(entity_id).map(|e| e.tags).unwrap_or_default()
    }

    fn attributes_of(&self, entity_id: &str) -> BTreeMap<String, Scalar> {
        self.get(entity_id)
            .map(|e| e.attributes)
            .unwrap_or_default()
    }
}

/* ─────────────────────────────── Host ───────────────────────────────── */

/// The full collaborator surface the orchestrator needs from its host.
pub trait Host: DataSource + EntityCatalog {}
impl<T> Host for T where T: DataSource + EntityCatalog {}

/* ──────────────────────────── Observer ──────────────────────────────── */

/// Host callback invoked by the orchestrator at cycle boundaries.
pub trait ChangeObserver: Send + Sync {
    /// Called at `end_cycle` with the keys whose values changed.
    fn on_cycle_complete(&self, changed: &[String]);

    /// Called when a sensor trips its circuit breaker.
    fn on_sensor_error(&self, key: &str, error: &EngineError);
}

/// Default no-op observer.
impl ChangeObserver for () {
    fn on_cycle_complete(&self, _changed: &[String]) {}
    fn on_sensor_error(&self, _key: &str, _error: &EngineError) {}
}
