use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
};

use chrono::NaiveDateTime;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A sensor-engine scalar. This is the value type formulas evaluate to and
/// the type resolvers hand back for referenced names.
///
/// `Unknown` and `Unavailable` are *propagated states*, not errors: a data
/// source that temporarily has no reading yields `Unknown`, an entity that
/// has dropped off the host yields `Unavailable`, and both flow through
/// expressions as ordinary values.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    Number(f64),
    Text(String),
    Boolean(bool),
    DateTime(NaiveDateTime),
    /// A value exists in principle but has no current reading.
    Unknown,
    /// The backing entity or source is gone for now.
    Unavailable,
    Null,
}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Scalar::Int(i) => i.hash(state),
            Scalar::Number(n) => n.to_bits().hash(state),
            Scalar::Text(s) => s.hash(state),
            Scalar::Boolean(b) => b.hash(state),
            Scalar::DateTime(dt) => dt.hash(state),
            Scalar::Unknown => state.write_u8(0),
            Scalar::Unavailable => state.write_u8(1),
            Scalar::Null => state.write_u8(2),
        }
    }
}

impl Eq for Scalar {}

impl Default for Scalar {
    fn default() -> Self {
        Scalar::Unknown
    }
}

impl Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(s) => write!(f, "{s}"),
            Scalar::Boolean(b) => write!(f, "{b}"),
            Scalar::DateTime(dt) => write!(f, "{dt}"),
            Scalar::Unknown => write!(f, "unknown"),
            Scalar::Unavailable => write!(f, "unavailable"),
            Scalar::Null => write!(f, ""),
        }
    }
}

impl Scalar {
    /// Whether this is one of the two propagated transient states.
    pub fn is_transient(&self) -> bool {
        matches!(self, Scalar::Unknown | Scalar::Unavailable)
    }

    /// Combine the transient states of two operands. `Unavailable`
    /// dominates `Unknown`; a non-transient pair returns `None`.
    pub fn dominant_transient(a: &Scalar, b: &Scalar) -> Option<Scalar> {
        match (a, b) {
            (Scalar::Unavailable, _) | (_, Scalar::Unavailable) => Some(Scalar::Unavailable),
            (Scalar::Unknown, _) | (_, Scalar::Unknown) => Some(Scalar::Unknown),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Number(n) => Some(*n),
            Scalar::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Scalar::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Saturating conversion to `i64` at the engine boundary.
    pub fn as_int_saturating(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            Scalar::Number(n) if n.is_nan() => None,
            Scalar::Number(n) => Some(if *n >= i64::MAX as f64 {
                i64::MAX
            } else if *n <= i64::MIN as f64 {
                i64::MIN
            } else {
                *n as i64
            }),
            Scalar::Boolean(b) => Some(if *b { 1 } else { 0 }),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Scalar::Boolean(b) => *b,
            Scalar::Int(i) => *i != 0,
            Scalar::Number(n) => *n != 0.0,
            Scalar::Text(s) => !s.is_empty(),
            Scalar::DateTime(_) => true,
            Scalar::Unknown | Scalar::Unavailable | Scalar::Null => false,
        }
    }

    /// Host-facing string for the propagated states (`unknown` / `unavailable`).
    pub fn state_name(&self) -> Option<&'static str> {
        match self {
            Scalar::Unknown => Some("unknown"),
            Scalar::Unavailable => Some("unavailable"),
            _ => None,
        }
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Number(n)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Boolean(b)
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}
