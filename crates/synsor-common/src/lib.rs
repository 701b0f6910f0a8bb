pub mod error;
pub mod value;

pub use error::{DependencyKind, EngineError, EngineErrorKind, ErrorDetail};
pub use value::Scalar;
