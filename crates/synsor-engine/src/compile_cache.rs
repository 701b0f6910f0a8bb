//! Content-addressed compilation cache: formula text → (AST, binding plan).
//!
//! The same text always maps to the same `Arc` within a process, so repeat
//! evaluations share one tree. The lock is held across the parse, which
//! gives at-most-one parse per text without a separate in-flight table.
//! Eviction is LRU-bounded and deferred while a cycle is running.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashMap;
use synsor_common::EngineError;
use synsor_parse::{Expr, parse, text_hash};

use crate::binding::{BindingEnv, BindingPlan, build_plan};

pub const DEFAULT_CAPACITY: usize = 1000;

/// A formula compiled once: immutable AST plus derived binding plan.
#[derive(Debug)]
pub struct CompiledFormula {
    pub text: String,
    pub text_hash: u64,
    pub ast: Expr,
    pub plan: BindingPlan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub capacity: usize,
}

struct Slot {
    artifacts: Arc<CompiledFormula>,
    last_used: u64,
}

struct CacheInner {
    map: FxHashMap<u64, Slot>,
    hits: u64,
    misses: u64,
    tick: u64,
}

pub struct CompilationCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    /// While a cycle runs, inserts may overshoot capacity; trimming waits
    /// for the cycle boundary.
    frozen: AtomicBool,
}

impl CompilationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: FxHashMap::default(),
                hits: 0,
                misses: 0,
                tick: 0,
            }),
            capacity: capacity.max(1),
            frozen: AtomicBool::new(false),
        }
    }

    /// Fetch the compiled artifacts for a formula text, parsing and
    /// deriving the plan on first sight.
    pub fn get_or_parse(
        &self,
        text: &str,
        env: &BindingEnv<'_>,
    ) -> Result<Arc<CompiledFormula>, EngineError> {
        let key = text_hash(text);
        let mut guard = self.inner.lock().expect("compilation cache poisoned");
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(slot) = inner.map.get_mut(&key) {
            slot.last_used = tick;
            inner.hits += 1;
            return Ok(Arc::clone(&slot.artifacts));
        }

        inner.misses += 1;
        let ast = parse(text).map_err(EngineError::from)?;
        let plan = build_plan(&ast, env)?;
        let artifacts = Arc::new(CompiledFormula {
            text: text.to_string(),
            text_hash: key,
            ast,
            plan,
        });
        inner.map.insert(
            key,
            Slot {
                artifacts: Arc::clone(&artifacts),
                last_used: tick,
            },
        );

        if !self.frozen.load(Ordering::Relaxed) {
            Self::trim(inner, self.capacity);
        }

        Ok(artifacts)
    }

    /// Drop everything; used on configuration reload.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock().expect("compilation cache poisoned");
        inner.map.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("compilation cache poisoned");
        let total = inner.hits + inner.misses;
        CacheStats {
            entries: inner.map.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
            capacity: self.capacity,
        }
    }

    /// Suspend eviction for the duration of a cycle.
    pub fn freeze_evictions(&self) {
        self.frozen.store(true, Ordering::Relaxed);
    }

    /// Resume eviction and trim any overshoot.
    pub fn thaw_evictions(&self) {
        self.frozen.store(false, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("compilation cache poisoned");
        Self::trim(&mut inner, self.capacity);
    }

    fn trim(inner: &mut CacheInner, capacity: usize) {
        while inner.map.len() > capacity {
            // Evict the least recently used entry.
            let Some((&victim, _)) = inner
                .map
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
            else {
                break;
            };
            inner.map.remove(&victim);
            tracing::debug!(entries = inner.map.len(), "compilation cache evicted entry");
        }
    }
}

impl Default for CompilationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
