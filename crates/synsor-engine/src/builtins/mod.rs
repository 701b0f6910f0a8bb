pub mod math;

use crate::function::FunctionRegistry;

pub fn load_builtins(registry: &mut FunctionRegistry) {
    math::register_builtins(registry);
}
