//! Engine error representation.
//!
//! - **`EngineErrorKind`** : the canonical set of fatal error classes
//! - **`ErrorDetail`**     : per-kind "extension slot" (cycle path, missing name)
//! - **`EngineError`**     : one struct that glues kind, message, and detail
//!
//! Transient data states (`Unknown` / `Unavailable`) are deliberately *not*
//! here: they travel through evaluation as [`crate::Scalar`] variants. An
//! `EngineError` always means the sensor is disqualified until the
//! configuration is reloaded.

use std::{error::Error, fmt};

/// Fatal error classes recognised by the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    /// Formula text failed to parse.
    Parse,
    /// A referenced external id, sibling sensor, or variable has no mapping.
    MissingDependency,
    /// Sensors reference each other through their main formulas.
    CircularDependency,
    /// No comparison handler accepted the operand types, or a function
    /// rejected its arguments.
    Handler,
    /// An unknown function name appeared in a formula.
    UnknownFunction,
    /// A resolver returned a shape violating its contract.
    DataValidation,
    /// Configuration-level violation (schema, duplicate key, version).
    Config,
    /// The update cycle was cancelled at a sensor boundary.
    Cancelled,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Parse => "parse",
            Self::MissingDependency => "missing-dependency",
            Self::CircularDependency => "circular-dependency",
            Self::Handler => "handler",
            Self::UnknownFunction => "unknown-function",
            Self::DataValidation => "data-validation",
            Self::Config => "config",
            Self::Cancelled => "cancelled",
        })
    }
}

/// What kind of thing a missing dependency was expected to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    ExternalId,
    SensorKey,
    Variable,
    Attribute,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExternalId => "external id",
            Self::SensorKey => "sensor key",
            Self::Variable => "variable",
            Self::Attribute => "attribute",
        })
    }
}

/// Kind-specific payloads. Only variants that need extra data get it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ErrorDetail {
    #[default]
    None,

    /// `MissingDependency` – which name, and what it was expected to be.
    MissingName {
        name: String,
        dependency: DependencyKind,
    },

    /// `CircularDependency` – the cycle as an ordered key list, first key
    /// repeated at the end.
    Cycle(Vec<String>),

    /// `Parse` – byte offset into the formula text.
    Position(usize),
}

/// The single error struct the engine API passes around.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: Option<String>,
    pub detail: ErrorDetail,
}

impl From<EngineErrorKind> for EngineError {
    fn from(kind: EngineErrorKind) -> Self {
        Self {
            kind,
            message: None,
            detail: ErrorDetail::None,
        }
    }
}

impl EngineError {
    pub fn new(kind: EngineErrorKind) -> Self {
        kind.into()
    }

    /// Attach a human-readable explanation.
    pub fn with_message<S: Into<String>>(mut self, msg: S) -> Self {
        self.message = Some(msg.into());
        self
    }

    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.detail = detail;
        self
    }

    pub fn missing(name: impl Into<String>, dependency: DependencyKind) -> Self {
        let name = name.into();
        EngineError::new(EngineErrorKind::MissingDependency)
            .with_message(format!("no mapping for {dependency} '{name}'"))
            .with_detail(ErrorDetail::MissingName { name, dependency })
    }

    pub fn cycle(path: Vec<String>) -> Self {
        EngineError::new(EngineErrorKind::CircularDependency)
            .with_message(path.join(" -> "))
            .with_detail(ErrorDetail::Cycle(path))
    }

    pub fn parse_at(position: usize, msg: impl Into<String>) -> Self {
        EngineError::new(EngineErrorKind::Parse)
            .with_message(msg)
            .with_detail(ErrorDetail::Position(position))
    }

    /// The offending dependency name, when the detail carries one.
    pub fn missing_name(&self) -> Option<&str> {
        match &self.detail {
            ErrorDetail::MissingName { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref msg) = self.message {
            write!(f, ": {msg}")?;
        }
        match &self.detail {
            ErrorDetail::Position(pos) => write!(f, " (at {pos})")?,
            ErrorDetail::Cycle(path) if self.message.is_none() => {
                write!(f, " [{}]", path.join(" -> "))?
            }
            _ => {}
        }
        Ok(())
    }
}

impl Error for EngineError {}

impl From<EngineError> for String {
    fn from(error: EngineError) -> Self {
        format!("{error}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_and_message() {
        let e = EngineError::missing("sensor.kitchen", DependencyKind::ExternalId);
        let s = e.to_string();
        assert!(s.starts_with("missing-dependency"));
        assert!(s.contains("sensor.kitchen"));
        assert_eq!(e.missing_name(), Some("sensor.kitchen"));
    }

    #[test]
    fn cycle_message_is_path() {
        let e = EngineError::cycle(vec!["x".into(), "y".into(), "x".into()]);
        assert_eq!(e.to_string(), "circular-dependency: x -> y -> x");
    }
}
