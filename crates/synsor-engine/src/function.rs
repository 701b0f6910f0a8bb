//! The `Function` trait and the engine-owned registry.
//!
//! Functions receive fully-evaluated scalar arguments; transient operand
//! states never reach them (the interpreter propagates those before
//! dispatch). The registry is owned by the engine rather than being a
//! process-wide table, so independent engines can carry different
//! function sets.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use synsor_common::{EngineError, EngineErrorKind, Scalar};

pub trait Function: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn min_args(&self) -> usize {
        1
    }

    /// `None` means variadic.
    fn max_args(&self) -> Option<usize> {
        Some(self.min_args())
    }

    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError>;
}

/// Case-insensitive registry keyed by lowercase name.
pub struct FunctionRegistry {
    map: FxHashMap<String, Arc<dyn Function>>,
    aliases: FxHashMap<String, String>,
}

#[inline]
fn norm<S: AsRef<str>>(s: S) -> String {
    s.as_ref().to_ascii_lowercase()
}

impl FunctionRegistry {
    pub fn empty() -> Self {
        Self {
            map: FxHashMap::default(),
            aliases: FxHashMap::default(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        crate::builtins::load_builtins(&mut reg);
        reg
    }

    pub fn register(&mut self, f: Arc<dyn Function>) {
        self.map.insert(norm(f.name()), f);
    }

    /// Register an alias name for an existing function.
    pub fn register_alias(&mut self, alias: &str, target: &str) {
        self.aliases.insert(norm(alias), norm(target));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Function>> {
        let key = norm(name);
        if let Some(f) = self.map.get(&key) {
            return Some(Arc::clone(f));
        }
        self.aliases
            .get(&key)
            .and_then(|canon| self.map.get(canon))
            .map(Arc::clone)
    }

    /// Arity-checked dispatch. An unknown function is fatal.
    pub fn call(&self, name: &str, args: &[Scalar]) -> Result<Scalar, EngineError> {
        let f = self.get(name).ok_or_else(|| {
            EngineError::new(EngineErrorKind::UnknownFunction)
                .with_message(format!("unknown function '{name}'"))
        })?;
        if args.len() < f.min_args() {
            return Err(EngineError::new(EngineErrorKind::Handler).with_message(format!(
                "{}() needs at least {} argument(s), got {}",
                f.name(),
                f.min_args(),
                args.len()
            )));
        }
        if let Some(max) = f.max_args() {
            if args.len() > max {
                return Err(EngineError::new(EngineErrorKind::Handler).with_message(format!(
                    "{}() takes at most {} argument(s), got {}",
                    f.name(),
                    max,
                    args.len()
                )));
            }
        }
        f.eval(args)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
