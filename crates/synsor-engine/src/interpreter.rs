//! AST evaluation with transient-state propagation.
//!
//! `Unknown` and `Unavailable` flow through expressions as values:
//! arithmetic and logic over a transient operand yield the dominant
//! transient (`Unavailable` beats `Unknown`); equality and inequality
//! against a transient are `false`; aggregates skip transient candidates
//! entirely.

use synsor_common::{DependencyKind, EngineError, EngineErrorKind, Scalar};
use synsor_parse::{BinaryOp, Expr, ExprKind, UnaryOp, is_aggregate_function};

use crate::binding::{BindingPlan, Strategy, VariableBinding};
use crate::compare::CompareOp;
use crate::context::LazyContext;
use crate::function::FunctionRegistry;
use crate::resolve::{ResolveEnv, ResolverPipeline};

pub struct Interpreter<'a> {
    pub plan: &'a BindingPlan,
    pub ctx: &'a LazyContext,
    pub pipeline: &'a ResolverPipeline,
    pub env: &'a ResolveEnv<'a>,
    pub functions: &'a FunctionRegistry,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        plan: &'a BindingPlan,
        ctx: &'a LazyContext,
        pipeline: &'a ResolverPipeline,
        env: &'a ResolveEnv<'a>,
        functions: &'a FunctionRegistry,
    ) -> Self {
        Self {
            plan,
            ctx,
            pipeline,
            env,
            functions,
        }
    }

    pub fn evaluate(&self, expr: &Expr) -> Result<Scalar, EngineError> {
        match &expr.kind {
            ExprKind::Literal(v) => Ok(v.clone()),
            ExprKind::Name(name) => self.resolve_name(name),
            ExprKind::MemberAccess { .. } => self.eval_member_access(expr),
            ExprKind::Call { function, args } => self.eval_call(function, args),
            ExprKind::BinaryOp { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs),
            ExprKind::UnaryOp { op, operand } => self.eval_unary(*op, operand),
            ExprKind::Conditional {
                cond,
                then_branch,
                else_branch,
            } => self.eval_conditional(cond, then_branch, else_branch),
            ExprKind::CollectionQuery(q) => {
                // A bare query outside an aggregate call counts matches.
                let ids = self
                    .env
                    .collections
                    .matches(q, self.env.catalog, self.env.compare)?;
                Ok(Scalar::Int(ids.len() as i64))
            }
        }
    }

    fn resolve_name(&self, name: &str) -> Result<Scalar, EngineError> {
        self.pipeline.resolve(name, self.plan, self.env, self.ctx)
    }

    /* ───────────────────────── member access ───────────────────────── */

    fn eval_member_access(&self, expr: &Expr) -> Result<Scalar, EngineError> {
        let full = expr
            .dotted_name()
            .ok_or_else(|| {
                EngineError::new(EngineErrorKind::DataValidation)
                    .with_message("member access on a non-name receiver")
            })?;

        // The plan may have classified the whole chain as one external id.
        if self.plan.names.contains(&full) {
            return self.resolve_name(&full);
        }

        // Otherwise the chain splits into a target plus attribute, the way
        // the plan recorded it.
        let (target, attr) = self
            .plan
            .metadata_calls
            .iter()
            .find(|(t, a)| full == format!("{t}.{a}"))
            .map(|(t, a)| (t.clone(), a.clone()))
            .unwrap_or_else(|| {
                let (t, a) = full.rsplit_once('.').expect("dotted name has a dot");
                (t.to_string(), a.to_string())
            });

        self.fetch_attribute(&target, &attr)
    }

    /// Fetch `target.attr` according to the target's strategy.
    fn fetch_attribute(&self, target: &str, attr: &str) -> Result<Scalar, EngineError> {
        let missing = || {
            EngineError::missing(format!("{target}.{attr}"), DependencyKind::Attribute)
        };
        match self.plan.strategy(target) {
            Some(Strategy::State) => {
                // Attribute of the backing entity.
                let Some(backing) = self.env.backing_id else {
                    return Err(missing());
                };
                self.env
                    .catalog
                    .attributes_of(backing)
                    .get(attr)
                    .cloned()
                    .ok_or_else(missing)
            }
            Some(Strategy::CrossSensor) => self
                .env
                .registry
                .attribute(target, attr)
                .ok_or_else(missing),
            Some(Strategy::DataSource | Strategy::HostEntity) => {
                let id = match self.env.variables.get(target) {
                    Some(VariableBinding::EntityRef(id)) => id.clone(),
                    _ => target.to_string(),
                };
                self.env
                    .catalog
                    .attributes_of(&id)
                    .get(attr)
                    .cloned()
                    .ok_or_else(missing)
            }
            _ => Err(missing()),
        }
    }

    /* ──────────────────────────── calls ────────────────────────────── */

    fn eval_call(&self, function: &str, args: &[Expr]) -> Result<Scalar, EngineError> {
        // Aggregates over a collection query (or a pattern variable) route
        // through the collection engine.
        if is_aggregate_function(function) {
            if let [arg] = args {
                match &arg.kind {
                    ExprKind::CollectionQuery(q) => {
                        return self.env.collections.aggregate(
                            function,
                            q,
                            self.env.catalog,
                            self.env.compare,
                        );
                    }
                    ExprKind::Name(name)
                        if self.plan.strategy(name) == Some(Strategy::Computed) =>
                    {
                        if let Some(VariableBinding::CollectionPattern(p)) =
                            self.env.variables.get(name)
                        {
                            return self.env.collections.aggregate(
                                function,
                                p,
                                self.env.catalog,
                                self.env.compare,
                            );
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.evaluate(arg)?);
        }

        // Transient operands never reach a function body.
        let mut transient: Option<Scalar> = None;
        for v in &values {
            if v.is_transient() {
                transient = match transient {
                    Some(prev) => Scalar::dominant_transient(&prev, v),
                    None => Some(v.clone()),
                };
            }
        }
        if let Some(t) = transient {
            return Ok(t);
        }

        self.functions.call(function, &values)
    }

    /* ─────────────────────── binary operators ──────────────────────── */

    fn eval_binary(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Scalar, EngineError> {
        if op.is_logical() {
            return self.eval_logical(op, lhs, rhs);
        }

        let l = self.evaluate(lhs)?;
        let r = self.evaluate(rhs)?;

        if op.is_comparison() {
            return self.eval_comparison(op, l, r);
        }

        if let Some(t) = Scalar::dominant_transient(&l, &r) {
            return Ok(t);
        }
        self.eval_arithmetic(op, l, r)
    }

    fn eval_logical(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Scalar, EngineError> {
        let l = self.evaluate(lhs)?;

        // Definite short-circuit only on concrete values.
        if !l.is_transient() {
            match op {
                BinaryOp::And if !l.is_truthy() => return Ok(Scalar::Boolean(false)),
                BinaryOp::Or if l.is_truthy() => return Ok(Scalar::Boolean(true)),
                _ => {}
            }
        }

        let r = self.evaluate(rhs)?;
        if let Some(t) = Scalar::dominant_transient(&l, &r) {
            return Ok(t);
        }
        Ok(Scalar::Boolean(match op {
            BinaryOp::And => l.is_truthy() && r.is_truthy(),
            BinaryOp::Or => l.is_truthy() || r.is_truthy(),
            _ => unreachable!("eval_logical only sees and/or"),
        }))
    }

    fn eval_comparison(&self, op: BinaryOp, l: Scalar, r: Scalar) -> Result<Scalar, EngineError> {
        if l.is_transient() || r.is_transient() {
            return Ok(match op {
                // Missing data asserts nothing, in either direction.
                BinaryOp::Eq | BinaryOp::Ne => Scalar::Boolean(false),
                _ => Scalar::dominant_transient(&l, &r).expect("one side is transient"),
            });
        }
        let compare_op = match op {
            BinaryOp::Eq => CompareOp::Eq,
            BinaryOp::Ne => CompareOp::Ne,
            BinaryOp::Lt => CompareOp::Lt,
            BinaryOp::Le => CompareOp::Le,
            BinaryOp::Gt => CompareOp::Gt,
            BinaryOp::Ge => CompareOp::Ge,
            _ => unreachable!("comparison op expected"),
        };
        Ok(Scalar::Boolean(self.env.compare.compare(&l, &r, compare_op)?))
    }

    fn eval_arithmetic(&self, op: BinaryOp, l: Scalar, r: Scalar) -> Result<Scalar, EngineError> {
        // Integer pairs stay integral when the result fits.
        if let (Scalar::Int(a), Scalar::Int(b)) = (&l, &r) {
            let exact = match op {
                BinaryOp::Add => a.checked_add(*b),
                BinaryOp::Sub => a.checked_sub(*b),
                BinaryOp::Mul => a.checked_mul(*b),
                BinaryOp::Mod if *b != 0 => a.checked_rem(*b),
                _ => None,
            };
            if let Some(i) = exact {
                return Ok(Scalar::Int(i));
            }
        }

        let a = self.coerce_number(&l)?;
        let b = self.coerce_number(&r)?;
        let out = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            // IEEE 754 semantics: division by zero is ±inf, 0/0 is NaN.
            BinaryOp::Div => a / b,
            BinaryOp::Mod => a % b,
            _ => unreachable!("arithmetic op expected"),
        };
        Ok(Scalar::Number(out))
    }

    /* ─────────────────────── unary / conditional ───────────────────── */

    fn eval_unary(&self, op: UnaryOp, operand: &Expr) -> Result<Scalar, EngineError> {
        let v = self.evaluate(operand)?;
        if v.is_transient() {
            return Ok(v);
        }
        match op {
            UnaryOp::Neg => match v {
                Scalar::Int(i) => Ok(Scalar::Int(i.checked_neg().unwrap_or(i64::MAX))),
                other => Ok(Scalar::Number(-self.coerce_number(&other)?)),
            },
            UnaryOp::Pos => match v {
                Scalar::Int(i) => Ok(Scalar::Int(i)),
                other => Ok(Scalar::Number(self.coerce_number(&other)?)),
            },
            UnaryOp::Not => Ok(Scalar::Boolean(!v.is_truthy())),
        }
    }

    fn eval_conditional(
        &self,
        cond: &Expr,
        then_branch: &Expr,
        else_branch: &Expr,
    ) -> Result<Scalar, EngineError> {
        let c = self.evaluate(cond)?;
        if c.is_transient() {
            return Ok(c);
        }
        if c.is_truthy() {
            self.evaluate(then_branch)
        } else {
            self.evaluate(else_branch)
        }
    }

    fn coerce_number(&self, v: &Scalar) -> Result<f64, EngineError> {
        v.as_number().ok_or_else(|| {
            EngineError::new(EngineErrorKind::Handler)
                .with_message(format!("cannot use {v:?} in arithmetic"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{BindingEnv, build_plan};
    use crate::collection::CollectionEngine;
    use crate::compare::ComparisonRegistry;
    use crate::registry::CrossSensorRegistry;
    use crate::tests::common::TestHost;
    use std::collections::{BTreeMap, BTreeSet};
    use synsor_parse::parse;

    struct Rig {
        host: TestHost,
        variables: BTreeMap<String, VariableBinding>,
        sensor_keys: BTreeSet<String>,
        registry: CrossSensorRegistry,
        collections: CollectionEngine,
        compare: ComparisonRegistry,
        functions: FunctionRegistry,
        pipeline: ResolverPipeline,
        state: Option<Scalar>,
    }

    impl Rig {
        fn new() -> Self {
            Self::with_host(TestHost::new())
        }

        fn with_host(host: TestHost) -> Self {
            Self {
                host,
                variables: BTreeMap::new(),
                sensor_keys: BTreeSet::new(),
                registry: CrossSensorRegistry::new(),
                collections: CollectionEngine::new(),
                compare: ComparisonRegistry::with_builtins(),
                functions: FunctionRegistry::with_builtins(),
                pipeline: ResolverPipeline::standard(),
                state: Some(Scalar::Number(1000.0)),
            }
        }

        fn eval(&self, formula: &str) -> Result<Scalar, EngineError> {
            let attrs = BTreeSet::new();
            let benv = BindingEnv {
                variables: &self.variables,
                sensor_keys: &self.sensor_keys,
                attribute_names: &attrs,
                data_source: &self.host,
                catalog: &self.host,
            };
            let ast = parse(formula).unwrap();
            let plan = build_plan(&ast, &benv)?;
            let ctx = LazyContext::from_plan(&plan);
            let env = ResolveEnv {
                sensor_key: "test",
                backing_id: None,
                state_value: self.state.clone(),
                variables: &self.variables,
                registry: &self.registry,
                data_source: &self.host,
                catalog: &self.host,
                collections: &self.collections,
                compare: &self.compare,
            };
            let interp =
                Interpreter::new(&plan, &ctx, &self.pipeline, &env, &self.functions);
            interp.evaluate(&ast)
        }
    }

    #[test]
    fn arithmetic_over_state() {
        let rig = Rig::new();
        assert_eq!(rig.eval("state * 1.1").unwrap(), Scalar::Number(1100.0));
        assert_eq!(rig.eval("state % 300").unwrap(), Scalar::Number(100.0));
    }

    #[test]
    fn integer_pairs_stay_integral() {
        let rig = Rig::new();
        assert_eq!(rig.eval("2 + 3").unwrap(), Scalar::Int(5));
        assert_eq!(rig.eval("7 % 4").unwrap(), Scalar::Int(3));
        assert_eq!(rig.eval("7 / 4").unwrap(), Scalar::Number(1.75));
    }

    #[test]
    fn unknown_propagates_through_arithmetic() {
        let mut rig = Rig::new();
        rig.state = Some(Scalar::Unknown);
        assert_eq!(rig.eval("state + 5").unwrap(), Scalar::Unknown);
        assert_eq!(rig.eval("abs(state)").unwrap(), Scalar::Unknown);
    }

    #[test]
    fn unavailable_dominates_unknown() {
        let host = TestHost::new()
            .with_source("x.a", None)
            .with_entity_state("sensor.b", Scalar::Unavailable);
        let rig = Rig::with_host(host);
        assert_eq!(rig.eval("x.a + sensor.b").unwrap(), Scalar::Unavailable);
    }

    #[test]
    fn equality_against_transient_is_false() {
        let mut rig = Rig::new();
        rig.state = Some(Scalar::Unknown);
        assert_eq!(rig.eval("state == 5").unwrap(), Scalar::Boolean(false));
        assert_eq!(rig.eval("state != 5").unwrap(), Scalar::Boolean(false));
        assert_eq!(rig.eval("state > 5").unwrap(), Scalar::Unknown);
    }

    #[test]
    fn logical_short_circuit_skips_rhs() {
        // The rhs name would be a fatal missing dependency if resolved;
        // short-circuiting must avoid it. Build against a host where the
        // name exists so the plan builds, then compare counts.
        let host = TestHost::new().with_source("x.p", Some(Scalar::Number(1.0)));
        let rig = Rig::with_host(host);
        assert_eq!(
            rig.eval("false and x.p > 0").unwrap(),
            Scalar::Boolean(false)
        );
        assert_eq!(rig.eval("true or x.p > 0").unwrap(), Scalar::Boolean(true));
    }

    #[test]
    fn transient_logical_still_considers_rhs() {
        let host = TestHost::new()
            .with_source("x.a", None)
            .with_entity_state("sensor.b", Scalar::Unavailable);
        let rig = Rig::with_host(host);
        assert_eq!(rig.eval("x.a and sensor.b").unwrap(), Scalar::Unavailable);
    }

    #[test]
    fn conditional_branches_and_propagates() {
        let mut rig = Rig::new();
        assert_eq!(
            rig.eval("state > 500 ? 1 : 0").unwrap(),
            Scalar::Int(1)
        );
        assert_eq!(
            rig.eval("0 if state > 500 else 1").unwrap(),
            Scalar::Int(0)
        );
        rig.state = Some(Scalar::Unavailable);
        assert_eq!(
            rig.eval("state > 500 ? 1 : 0").unwrap(),
            Scalar::Unavailable
        );
    }

    #[test]
    fn functions_receive_scalars() {
        let rig = Rig::new();
        assert_eq!(
            rig.eval("clamp(state, 0, 100)").unwrap(),
            Scalar::Number(100.0)
        );
        assert_eq!(rig.eval("min(state, 10)").unwrap(), Scalar::Number(10.0));
    }

    #[test]
    fn unknown_function_is_fatal() {
        let rig = Rig::new();
        let err = rig.eval("frobnicate(state)").unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::UnknownFunction);
    }

    #[test]
    fn member_access_reads_entity_attributes() {
        let host = TestHost::new().with_entity(
            "sensor.inverter",
            crate::traits::Entity {
                state: Scalar::Number(230.0),
                attributes: [("voltage".to_string(), Scalar::Number(229.5))].into(),
                ..Default::default()
            },
        );
        let rig = Rig::with_host(host);
        assert_eq!(
            rig.eval("sensor.inverter.voltage").unwrap(),
            Scalar::Number(229.5)
        );
    }

    #[test]
    fn missing_attribute_is_fatal() {
        let host = TestHost::new().with_entity_state("sensor.inverter", Scalar::Number(1.0));
        let rig = Rig::with_host(host);
        let err = rig.eval("sensor.inverter.voltage").unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::MissingDependency);
    }

    #[test]
    fn aggregate_call_over_query() {
        let host = TestHost::new()
            .with_entity(
                "binary_sensor.door",
                crate::traits::Entity {
                    state: Scalar::from("on"),
                    device_class: Some("door".into()),
                    ..Default::default()
                },
            )
            .with_entity(
                "binary_sensor.window",
                crate::traits::Entity {
                    state: Scalar::from("off"),
                    device_class: Some("window".into()),
                    ..Default::default()
                },
            );
        let rig = Rig::with_host(host);
        assert_eq!(
            rig.eval("count(\"device_class:door|window\")").unwrap(),
            Scalar::Int(2)
        );
    }
}
