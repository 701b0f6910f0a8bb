//! Priority-ordered comparison dispatch.
//!
//! Handlers are asked in ascending priority; the first whose `can_handle`
//! accepts the operand pair wins. Ties keep registration order (stable
//! sort). User handlers register at priorities 1–49; the typed built-ins
//! sit at 40 (datetime, version) and 50 (boolean, numeric, string). The
//! equality/inequality fallback runs only after the whole chain declined,
//! so user handlers can override `==` for their own types.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use synsor_common::{EngineError, EngineErrorKind, Scalar};

/// Comparison operators in the wire alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
        }
    }

    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge
        )
    }

    fn apply_ordering(&self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => ord == Equal,
            CompareOp::Ne => ord != Equal,
            CompareOp::Lt => ord == Less,
            CompareOp::Le => ord != Greater,
            CompareOp::Gt => ord == Greater,
            CompareOp::Ge => ord != Less,
            CompareOp::In | CompareOp::NotIn => false,
        }
    }
}

impl FromStr for CompareOp {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "==" => CompareOp::Eq,
            "!=" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            "in" => CompareOp::In,
            "not in" => CompareOp::NotIn,
            _ => return Err(()),
        })
    }
}

/// Static description of a handler.
#[derive(Debug, Clone, Copy)]
pub struct HandlerInfo {
    pub name: &'static str,
    pub priority: u8,
    pub supported_ops: &'static [CompareOp],
}

pub trait ComparisonHandler: Send + Sync + 'static {
    fn type_info(&self) -> HandlerInfo;
    fn can_handle(&self, l: &Scalar, r: &Scalar, op: CompareOp) -> bool;
    fn compare(&self, l: &Scalar, r: &Scalar, op: CompareOp) -> Result<bool, EngineError>;
}

const ORDERED_AND_EQ: &[CompareOp] = &[
    CompareOp::Eq,
    CompareOp::Ne,
    CompareOp::Lt,
    CompareOp::Le,
    CompareOp::Gt,
    CompareOp::Ge,
];

/* ───────────────────────── built-in handlers ───────────────────────── */

fn parse_datetime(v: &Scalar) -> Option<NaiveDateTime> {
    match v {
        Scalar::DateTime(dt) => Some(*dt),
        Scalar::Text(s) => {
            let s = s.trim();
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
                .ok()
                .or_else(|| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })
        }
        _ => None,
    }
}

/// ISO-8601 datetimes, priority 40.
struct DateTimeHandler;

impl ComparisonHandler for DateTimeHandler {
    fn type_info(&self) -> HandlerInfo {
        HandlerInfo {
            name: "datetime",
            priority: 40,
            supported_ops: ORDERED_AND_EQ,
        }
    }

    fn can_handle(&self, l: &Scalar, r: &Scalar, _op: CompareOp) -> bool {
        // At least one side must already be datetime-shaped text or a
        // DateTime scalar; plain numbers never route here.
        let l_dt = parse_datetime(l);
        let r_dt = parse_datetime(r);
        l_dt.is_some() && r_dt.is_some() && (matches!(l, Scalar::DateTime(_) | Scalar::Text(_)))
    }

    fn compare(&self, l: &Scalar, r: &Scalar, op: CompareOp) -> Result<bool, EngineError> {
        let (a, b) = (parse_datetime(l), parse_datetime(r));
        match (a, b) {
            (Some(a), Some(b)) => Ok(op.apply_ordering(a.cmp(&b))),
            _ => Err(EngineError::new(EngineErrorKind::Handler)
                .with_message("datetime handler given non-datetime operands")),
        }
    }
}

fn parse_version(v: &Scalar) -> Option<semver::Version> {
    let Scalar::Text(s) = v else { return None };
    let s = s.trim();
    let parts: Vec<&str> = s.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    if !parts.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }
    // Pad "1.2" to "1.2.0" so semver accepts it.
    let mut padded = parts.iter().map(|p| p.to_string()).collect::<Vec<_>>();
    while padded.len() < 3 {
        padded.push("0".to_string());
    }
    semver::Version::parse(&padded.join(".")).ok()
}

/// Dotted integer tuples ("1.2.3"), priority 40.
struct VersionHandler;

impl ComparisonHandler for VersionHandler {
    fn type_info(&self) -> HandlerInfo {
        HandlerInfo {
            name: "version",
            priority: 40,
            supported_ops: ORDERED_AND_EQ,
        }
    }

    fn can_handle(&self, l: &Scalar, r: &Scalar, _op: CompareOp) -> bool {
        // Only multi-part dotted strings; a bare "2" belongs to numerics.
        let dotted = |v: &Scalar| matches!(v, Scalar::Text(s) if s.contains('.'));
        (dotted(l) || dotted(r)) && parse_version(l).is_some() && parse_version(r).is_some()
    }

    fn compare(&self, l: &Scalar, r: &Scalar, op: CompareOp) -> Result<bool, EngineError> {
        match (parse_version(l), parse_version(r)) {
            (Some(a), Some(b)) => Ok(op.apply_ordering(a.cmp(&b))),
            _ => Err(EngineError::new(EngineErrorKind::Handler)
                .with_message("version handler given non-version operands")),
        }
    }
}

/// Boolean pairs (`false < true`), priority 50.
struct BooleanHandler;

impl ComparisonHandler for BooleanHandler {
    fn type_info(&self) -> HandlerInfo {
        HandlerInfo {
            name: "boolean",
            priority: 50,
            supported_ops: ORDERED_AND_EQ,
        }
    }

    fn can_handle(&self, l: &Scalar, r: &Scalar, _op: CompareOp) -> bool {
        matches!((l, r), (Scalar::Boolean(_), Scalar::Boolean(_)))
    }

    fn compare(&self, l: &Scalar, r: &Scalar, op: CompareOp) -> Result<bool, EngineError> {
        match (l, r) {
            (Scalar::Boolean(a), Scalar::Boolean(b)) => Ok(op.apply_ordering(a.cmp(b))),
            _ => Err(EngineError::new(EngineErrorKind::Handler)
                .with_message("boolean handler given non-boolean operands")),
        }
    }
}

/// Numeric comparison, priority 50.
struct NumericHandler;

impl ComparisonHandler for NumericHandler {
    fn type_info(&self) -> HandlerInfo {
        HandlerInfo {
            name: "numeric",
            priority: 50,
            supported_ops: ORDERED_AND_EQ,
        }
    }

    fn can_handle(&self, l: &Scalar, r: &Scalar, _op: CompareOp) -> bool {
        l.as_number().is_some() && r.as_number().is_some()
    }

    fn compare(&self, l: &Scalar, r: &Scalar, op: CompareOp) -> Result<bool, EngineError> {
        match (l.as_number(), r.as_number()) {
            (Some(a), Some(b)) => Ok(op.apply_ordering(
                a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
            )),
            _ => Err(EngineError::new(EngineErrorKind::Handler)
                .with_message("numeric handler given non-numeric operands")),
        }
    }
}

/// Lexicographic string comparison, priority 50.
struct StringHandler;

impl ComparisonHandler for StringHandler {
    fn type_info(&self) -> HandlerInfo {
        HandlerInfo {
            name: "string",
            priority: 50,
            supported_ops: ORDERED_AND_EQ,
        }
    }

    fn can_handle(&self, l: &Scalar, r: &Scalar, _op: CompareOp) -> bool {
        matches!((l, r), (Scalar::Text(_), Scalar::Text(_)))
    }

    fn compare(&self, l: &Scalar, r: &Scalar, op: CompareOp) -> Result<bool, EngineError> {
        match (l, r) {
            (Scalar::Text(a), Scalar::Text(b)) => Ok(op.apply_ordering(a.cmp(b))),
            _ => Err(EngineError::new(EngineErrorKind::Handler)
                .with_message("string handler given non-string operands")),
        }
    }
}

/* ───────────────────────────── registry ────────────────────────────── */

pub struct ComparisonRegistry {
    handlers: Vec<Arc<dyn ComparisonHandler>>,
}

impl ComparisonRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        reg.register(Arc::new(DateTimeHandler));
        reg.register(Arc::new(VersionHandler));
        reg.register(Arc::new(BooleanHandler));
        reg.register(Arc::new(NumericHandler));
        reg.register(Arc::new(StringHandler));
        reg
    }

    /// Append a handler and re-sort; the sort is stable, so equal
    /// priorities keep registration order.
    pub fn register(&mut self, handler: Arc<dyn ComparisonHandler>) {
        self.handlers.push(handler);
        self.handlers.sort_by_key(|h| h.type_info().priority);
    }

    pub fn handlers(&self) -> impl Iterator<Item = HandlerInfo> + '_ {
        self.handlers.iter().map(|h| h.type_info())
    }

    /// Dispatch a comparison. Falls back to plain equality for `==`/`!=`
    /// when no registered handler accepts the pair.
    pub fn compare(&self, l: &Scalar, r: &Scalar, op: CompareOp) -> Result<bool, EngineError> {
        for handler in &self.handlers {
            if handler.type_info().supported_ops.contains(&op) && handler.can_handle(l, r, op) {
                return handler.compare(l, r, op);
            }
        }
        match op {
            CompareOp::Eq => Ok(scalar_eq(l, r)),
            CompareOp::Ne => Ok(!scalar_eq(l, r)),
            _ => Err(EngineError::new(EngineErrorKind::Handler).with_message(format!(
                "no comparison handler for '{}' between {l:?} and {r:?}",
                op.as_str()
            ))),
        }
    }
}

impl Default for ComparisonRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Base equality: numeric across Int/Number/Boolean, structural otherwise.
/// Transient states are never equal to anything, themselves included.
pub fn scalar_eq(l: &Scalar, r: &Scalar) -> bool {
    if l.is_transient() || r.is_transient() {
        return false;
    }
    if let (Some(a), Some(b)) = (l.as_number(), r.as_number()) {
        if !matches!((l, r), (Scalar::Text(_), Scalar::Text(_))) {
            return a == b;
        }
    }
    l == r
}
