//! Scalar math built-ins.
//!
//! Domain errors follow IEEE 754 (`sqrt(-1)` is NaN, `1 / 0` is inf);
//! only arity and type violations are hard errors. Integer inputs stay
//! integral where the operation allows it.

use std::sync::Arc;

use synsor_common::{EngineError, EngineErrorKind, Scalar};

use crate::function::{Function, FunctionRegistry};

fn num(v: &Scalar) -> Result<f64, EngineError> {
    v.as_number().ok_or_else(|| {
        EngineError::new(EngineErrorKind::Handler)
            .with_message(format!("cannot convert {v:?} to a number"))
    })
}

fn nums(args: &[Scalar]) -> Result<Vec<f64>, EngineError> {
    args.iter().map(num).collect()
}

/* ─────────────────────────── sign & rounding ───────────────────────── */

#[derive(Debug)]
pub struct AbsFn;

impl Function for AbsFn {
    fn name(&self) -> &'static str {
        "abs"
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        match &args[0] {
            Scalar::Int(i) => Ok(Scalar::Int(i.saturating_abs())),
            other => Ok(Scalar::Number(num(other)?.abs())),
        }
    }
}

#[derive(Debug)]
pub struct RoundFn;

impl Function for RoundFn {
    fn name(&self) -> &'static str {
        "round"
    }
    fn max_args(&self) -> Option<usize> {
        Some(2)
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        let value = num(&args[0])?;
        let digits = match args.get(1) {
            Some(d) => num(d)? as i32,
            None => 0,
        };
        let factor = 10f64.powi(digits);
        Ok(Scalar::Number((value * factor).round() / factor))
    }
}

#[derive(Debug)]
pub struct FloorFn;

impl Function for FloorFn {
    fn name(&self) -> &'static str {
        "floor"
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        Ok(Scalar::Number(num(&args[0])?.floor()))
    }
}

#[derive(Debug)]
pub struct CeilFn;

impl Function for CeilFn {
    fn name(&self) -> &'static str {
        "ceil"
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        Ok(Scalar::Number(num(&args[0])?.ceil()))
    }
}

/* ───────────────────────── folds over arguments ────────────────────── */

#[derive(Debug)]
pub struct MinFn;

impl Function for MinFn {
    fn name(&self) -> &'static str {
        "min"
    }
    fn max_args(&self) -> Option<usize> {
        None
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        let values = nums(args)?;
        Ok(Scalar::Number(
            values.into_iter().fold(f64::INFINITY, f64::min),
        ))
    }
}

#[derive(Debug)]
pub struct MaxFn;

impl Function for MaxFn {
    fn name(&self) -> &'static str {
        "max"
    }
    fn max_args(&self) -> Option<usize> {
        None
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        let values = nums(args)?;
        Ok(Scalar::Number(
            values.into_iter().fold(f64::NEG_INFINITY, f64::max),
        ))
    }
}

#[derive(Debug)]
pub struct SumFn;

impl Function for SumFn {
    fn name(&self) -> &'static str {
        "sum"
    }
    fn max_args(&self) -> Option<usize> {
        None
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        Ok(Scalar::Number(nums(args)?.iter().sum()))
    }
}

#[derive(Debug)]
pub struct AvgFn;

impl Function for AvgFn {
    fn name(&self) -> &'static str {
        "avg"
    }
    fn max_args(&self) -> Option<usize> {
        None
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        let values = nums(args)?;
        Ok(Scalar::Number(
            values.iter().sum::<f64>() / values.len() as f64,
        ))
    }
}

#[derive(Debug)]
pub struct CountFn;

impl Function for CountFn {
    fn name(&self) -> &'static str {
        "count"
    }
    fn min_args(&self) -> usize {
        0
    }
    fn max_args(&self) -> Option<usize> {
        None
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        let n = args
            .iter()
            .filter(|v| !matches!(v, Scalar::Null) && !v.is_transient())
            .count();
        Ok(Scalar::Int(n as i64))
    }
}

#[derive(Debug)]
pub struct StdFn;

impl Function for StdFn {
    fn name(&self) -> &'static str {
        "std"
    }
    fn max_args(&self) -> Option<usize> {
        None
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        let values = nums(args)?;
        Ok(crate::collection::Aggregate::Std.apply(&values))
    }
}

#[derive(Debug)]
pub struct VarFn;

impl Function for VarFn {
    fn name(&self) -> &'static str {
        "var"
    }
    fn max_args(&self) -> Option<usize> {
        None
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        let values = nums(args)?;
        Ok(crate::collection::Aggregate::Var.apply(&values))
    }
}

/* ───────────────────────── powers & exponents ──────────────────────── */

#[derive(Debug)]
pub struct SqrtFn;

impl Function for SqrtFn {
    fn name(&self) -> &'static str {
        "sqrt"
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        Ok(Scalar::Number(num(&args[0])?.sqrt()))
    }
}

#[derive(Debug)]
pub struct PowFn;

impl Function for PowFn {
    fn name(&self) -> &'static str {
        "pow"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        Ok(Scalar::Number(num(&args[0])?.powf(num(&args[1])?)))
    }
}

#[derive(Debug)]
pub struct LogFn;

impl Function for LogFn {
    fn name(&self) -> &'static str {
        "log"
    }
    fn max_args(&self) -> Option<usize> {
        Some(2)
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        let value = num(&args[0])?;
        match args.get(1) {
            Some(base) => Ok(Scalar::Number(value.log(num(base)?))),
            None => Ok(Scalar::Number(value.ln())),
        }
    }
}

#[derive(Debug)]
pub struct ExpFn;

impl Function for ExpFn {
    fn name(&self) -> &'static str {
        "exp"
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        Ok(Scalar::Number(num(&args[0])?.exp()))
    }
}

/* ─────────────────────────── trigonometry ──────────────────────────── */

#[derive(Debug)]
pub struct SinFn;

impl Function for SinFn {
    fn name(&self) -> &'static str {
        "sin"
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        Ok(Scalar::Number(num(&args[0])?.sin()))
    }
}

#[derive(Debug)]
pub struct CosFn;

impl Function for CosFn {
    fn name(&self) -> &'static str {
        "cos"
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        Ok(Scalar::Number(num(&args[0])?.cos()))
    }
}

#[derive(Debug)]
pub struct TanFn;

impl Function for TanFn {
    fn name(&self) -> &'static str {
        "tan"
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        Ok(Scalar::Number(num(&args[0])?.tan()))
    }
}

/* ──────────────────────── range shaping helpers ────────────────────── */

#[derive(Debug)]
pub struct ClampFn;

impl Function for ClampFn {
    fn name(&self) -> &'static str {
        "clamp"
    }
    fn min_args(&self) -> usize {
        3
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        let (v, lo, hi) = (num(&args[0])?, num(&args[1])?, num(&args[2])?);
        if lo > hi {
            return Err(EngineError::new(EngineErrorKind::Handler)
                .with_message(format!("clamp() bounds inverted: {lo} > {hi}")));
        }
        Ok(Scalar::Number(v.clamp(lo, hi)))
    }
}

/// `map(value, in_lo, in_hi, out_lo, out_hi)` – linear rescale.
#[derive(Debug)]
pub struct MapFn;

impl Function for MapFn {
    fn name(&self) -> &'static str {
        "map"
    }
    fn min_args(&self) -> usize {
        5
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        let v = num(&args[0])?;
        let (in_lo, in_hi) = (num(&args[1])?, num(&args[2])?);
        let (out_lo, out_hi) = (num(&args[3])?, num(&args[4])?);
        if in_lo == in_hi {
            return Err(EngineError::new(EngineErrorKind::Handler)
                .with_message("map() input range is empty"));
        }
        let t = (v - in_lo) / (in_hi - in_lo);
        Ok(Scalar::Number(out_lo + t * (out_hi - out_lo)))
    }
}

/// `percent(part, whole)`.
#[derive(Debug)]
pub struct PercentFn;

impl Function for PercentFn {
    fn name(&self) -> &'static str {
        "percent"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[Scalar]) -> Result<Scalar, EngineError> {
        let (part, whole) = (num(&args[0])?, num(&args[1])?);
        Ok(Scalar::Number(part / whole * 100.0))
    }
}

pub fn register_builtins(registry: &mut FunctionRegistry) {
    registry.register(Arc::new(AbsFn));
    registry.register(Arc::new(MinFn));
    registry.register(Arc::new(MaxFn));
    registry.register(Arc::new(RoundFn));
    registry.register(Arc::new(FloorFn));
    registry.register(Arc::new(CeilFn));
    registry.register(Arc::new(SqrtFn));
    registry.register(Arc::new(PowFn));
    registry.register(Arc::new(ClampFn));
    registry.register(Arc::new(MapFn));
    registry.register(Arc::new(PercentFn));
    registry.register(Arc::new(AvgFn));
    registry.register(Arc::new(SumFn));
    registry.register(Arc::new(CountFn));
    registry.register(Arc::new(StdFn));
    registry.register(Arc::new(VarFn));
    registry.register(Arc::new(SinFn));
    registry.register(Arc::new(CosFn));
    registry.register(Arc::new(TanFn));
    registry.register(Arc::new(LogFn));
    registry.register(Arc::new(ExpFn));
    registry.register_alias("mean", "avg");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Scalar]) -> Scalar {
        FunctionRegistry::with_builtins().call(name, args).unwrap()
    }

    #[test]
    fn abs_preserves_integers() {
        assert_eq!(call("abs", &[Scalar::Int(-4)]), Scalar::Int(4));
        assert_eq!(call("abs", &[Scalar::Number(-4.5)]), Scalar::Number(4.5));
    }

    #[test]
    fn round_with_digits() {
        assert_eq!(
            call("round", &[Scalar::Number(2.567), Scalar::Int(1)]),
            Scalar::Number(2.6)
        );
        assert_eq!(call("round", &[Scalar::Number(2.5)]), Scalar::Number(3.0));
    }

    #[test]
    fn map_rescales_linearly() {
        assert_eq!(
            call(
                "map",
                &[
                    Scalar::Number(5.0),
                    Scalar::Number(0.0),
                    Scalar::Number(10.0),
                    Scalar::Number(0.0),
                    Scalar::Number(100.0)
                ]
            ),
            Scalar::Number(50.0)
        );
    }

    #[test]
    fn percent_of_whole() {
        assert_eq!(
            call("percent", &[Scalar::Number(30.0), Scalar::Number(120.0)]),
            Scalar::Number(25.0)
        );
    }

    #[test]
    fn mean_is_an_alias_for_avg() {
        let args = [Scalar::Int(1), Scalar::Int(2), Scalar::Int(3)];
        assert_eq!(call("mean", &args), call("avg", &args));
        assert_eq!(call("avg", &args), Scalar::Number(2.0));
    }

    #[test]
    fn sqrt_of_negative_follows_ieee() {
        let Scalar::Number(n) = call("sqrt", &[Scalar::Number(-1.0)]) else {
            panic!("expected number");
        };
        assert!(n.is_nan());
    }

    #[test]
    fn clamp_validates_bounds() {
        assert_eq!(
            call(
                "clamp",
                &[Scalar::Number(15.0), Scalar::Number(0.0), Scalar::Number(10.0)]
            ),
            Scalar::Number(10.0)
        );
        let reg = FunctionRegistry::with_builtins();
        assert!(reg
            .call(
                "clamp",
                &[Scalar::Number(1.0), Scalar::Number(10.0), Scalar::Number(0.0)]
            )
            .is_err());
    }

    #[test]
    fn count_ignores_transients_and_null() {
        assert_eq!(
            call(
                "count",
                &[
                    Scalar::Int(1),
                    Scalar::Unknown,
                    Scalar::Null,
                    Scalar::from("x")
                ]
            ),
            Scalar::Int(2)
        );
    }
}
