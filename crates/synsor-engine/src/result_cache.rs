//! Cycle-scoped result cache.
//!
//! Keyed by `(formula text hash, context fingerprint)`. Disabled for the
//! whole of an update cycle: `begin_cycle` empties it, writes made during
//! the cycle are buffered, and `end_cycle` commits them and re-enables
//! reads. External readers between cycles are served from the committed
//! entries.

use rustc_hash::FxHashMap;
use synsor_common::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    Enabled,
    Disabled,
}

pub type ResultKey = (u64, u64);

#[derive(Debug)]
pub struct ResultCache {
    state: CacheState,
    entries: FxHashMap<ResultKey, Scalar>,
    pending: Vec<(ResultKey, Scalar)>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self {
            state: CacheState::Enabled,
            entries: FxHashMap::default(),
            pending: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state == CacheState::Enabled
    }

    /// Disable reads and drop the previous cycle's entries.
    pub fn begin_cycle(&mut self) {
        self.state = CacheState::Disabled;
        self.entries.clear();
        self.pending.clear();
    }

    /// Commit buffered writes and re-enable reads.
    pub fn end_cycle(&mut self) {
        for (key, value) in self.pending.drain(..) {
            self.entries.insert(key, value);
        }
        self.state = CacheState::Enabled;
    }

    /// Reads recompute while a cycle is running.
    pub fn get(&self, text_hash: u64, fingerprint: u64) -> Option<&Scalar> {
        match self.state {
            CacheState::Enabled => self.entries.get(&(text_hash, fingerprint)),
            CacheState::Disabled => None,
        }
    }

    /// Record a result. Buffered while disabled, immediate while enabled.
    pub fn store(&mut self, text_hash: u64, fingerprint: u64, value: Scalar) {
        match self.state {
            CacheState::Enabled => {
                self.entries.insert((text_hash, fingerprint), value);
            }
            CacheState::Disabled => {
                self.pending.push(((text_hash, fingerprint), value));
            }
        }
    }

    /// Drop buffered writes without committing them (cancelled cycle).
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// Empty everything; used on configuration reload.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending.clear();
        self.state = CacheState::Enabled;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}
