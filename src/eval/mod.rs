//! # Evaluator
//!
//! Evaluates an [`Expr`] against an environment view (original facts overlaid
//! by accumulated writes), the function registry, and the temporal store.
//!
//! Semantics:
//! - Boolean operators short-circuit left-to-right and apply truthiness to
//!   non-Bool operands, but always report a Bool result.
//! - Comparisons promote Int to Float when mixed; comparing values from
//!   different primitive categories is a `TypeError`, never a silent false.
//! - A bare `Ref` of an unbound name is `UndefinedField`. The safe-read
//!   idiom — `x or <literal>` — and arguments to null-safe functions read
//!   the missing name as `Null` instead.
//! - Every successful field read and every call is recorded in the
//!   observation log the executor attaches to the rule trace.

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::facts::EnvView;
use crate::functions::{FnCtx, FunctionRegistry};
use crate::value::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Runtime evaluation failure.
///
/// `UndefinedField` and `TypeError` are demotable: a rule whose condition
/// fails with one of them simply does not fire. The remaining variants are
/// fatal to the `reason` call unless the caller selected the permissive
/// strategy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("undefined field '{0}'")]
    UndefinedField(String),

    #[error("type error: {0}")]
    TypeError(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("function '{name}' expects {expected} arguments, got {got}")]
    ArityMismatch {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("PROMPT requires an adapter but none is configured")]
    PromptUnavailable,

    #[error("prompt failed: {0}")]
    PromptError(String),
}

impl EvalError {
    /// Whether the failure demotes the rule to "did not fire" rather than
    /// aborting the whole `reason` call.
    pub fn is_demotable(&self) -> bool {
        matches!(self, EvalError::UndefinedField(_) | EvalError::TypeError(_))
    }

    /// Stable short tag for traces and skip records.
    pub fn kind(&self) -> &'static str {
        match self {
            EvalError::UndefinedField(_) => "UndefinedField",
            EvalError::TypeError(_) => "TypeError",
            EvalError::DivisionByZero => "DivisionByZero",
            EvalError::ArityMismatch { .. } => "ArityMismatch",
            EvalError::UnknownFunction(_) => "UnknownFunction",
            EvalError::PromptUnavailable => "PromptUnavailable",
            EvalError::PromptError(_) => "PromptError",
        }
    }
}

/// A call recorded during evaluation. Impure calls are surfaced in traces.
#[derive(Debug, Clone, PartialEq)]
pub struct CallObservation {
    pub name: String,
    pub pure: bool,
}

/// What one evaluation observed: the field bindings it read and the
/// functions it called.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observations {
    pub reads: BTreeMap<String, Value>,
    pub calls: Vec<CallObservation>,
}

impl Observations {
    /// Merge another evaluation's observations (used when a rule evaluates
    /// its condition and then its action templates).
    pub fn absorb(&mut self, other: Observations) {
        self.reads.extend(other.reads);
        self.calls.extend(other.calls);
    }
}

/// One-shot expression evaluator.
pub struct Evaluator<'a> {
    env: EnvView<'a>,
    registry: &'a FunctionRegistry,
    ctx: &'a FnCtx<'a>,
    observations: Observations,
}

impl<'a> Evaluator<'a> {
    pub fn new(env: EnvView<'a>, registry: &'a FunctionRegistry, ctx: &'a FnCtx<'a>) -> Self {
        Evaluator {
            env,
            registry,
            ctx,
            observations: Observations::default(),
        }
    }

    pub fn into_observations(self) -> Observations {
        self.observations
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ref(name) => self.read_field(name),
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right),
            Expr::Unary { op, inner } => match op {
                UnaryOp::Not => Ok(Value::Bool(!self.eval(inner)?.is_truthy())),
                UnaryOp::Neg => match self.eval(inner)? {
                    Value::Int(i) => Ok(Value::Int(
                        i.checked_neg()
                            .ok_or_else(|| EvalError::TypeError("integer overflow in -".into()))?,
                    )),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(EvalError::TypeError(format!(
                        "cannot negate {}",
                        other.type_name()
                    ))),
                },
            },
            Expr::Call { name, args } => self.eval_call(name, args),
            Expr::Index { container, key } => self.eval_index(container, key),
            Expr::MemberOf { value, list } => {
                let needle = self.eval(value)?;
                match self.eval(list)? {
                    Value::List(items) => {
                        Ok(Value::Bool(items.iter().any(|item| item.loose_eq(&needle))))
                    }
                    other => Err(EvalError::TypeError(format!(
                        "'in' requires a list on the right, got {}",
                        other.type_name()
                    ))),
                }
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.is_truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::All(children) => {
                for child in children {
                    if !self.eval(child)?.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Any(children) => {
                for child in children {
                    if self.eval(child)?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.is_truthy())),
        }
    }

    fn read_field(&mut self, name: &str) -> Result<Value, EvalError> {
        match self.env.get(name) {
            Some(value) => {
                let value = value.clone();
                self.observations
                    .reads
                    .entry(name.to_string())
                    .or_insert_with(|| value.clone());
                Ok(value)
            }
            None => Err(EvalError::UndefinedField(name.to_string())),
        }
    }

    /// Read treating an unbound name as `Null` (safe-read idiom and
    /// null-safe function arguments).
    fn read_field_or_null(&mut self, name: &str) -> Value {
        match self.env.get(name) {
            Some(value) => {
                let value = value.clone();
                self.observations
                    .reads
                    .entry(name.to_string())
                    .or_insert_with(|| value.clone());
                value
            }
            None => Value::Null,
        }
    }

    fn eval_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value, EvalError> {
        match op {
            BinaryOp::Or => {
                // Safe-read idiom: `x or <literal>` reads a missing x as Null
                let left_value = match left {
                    Expr::Ref(name) if right.is_literal() => self.read_field_or_null(name),
                    _ => self.eval(left)?,
                };
                if left_value.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }
            BinaryOp::And => {
                if !self.eval(left)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                let equal = equality(&l, &r)?;
                Ok(Value::Bool(if op == BinaryOp::Eq { equal } else { !equal }))
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                let ordering = l.partial_compare(&r).ok_or_else(|| {
                    EvalError::TypeError(format!(
                        "cannot compare {} with {}",
                        l.type_name(),
                        r.type_name()
                    ))
                })?;
                let holds = match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                };
                Ok(Value::Bool(holds))
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                arithmetic(op, &l, &r)
            }
        }
    }

    fn eval_call(&mut self, name: &str, args: &[Expr]) -> Result<Value, EvalError> {
        let descriptor = self
            .registry
            .get(name)
            .ok_or_else(|| EvalError::UnknownFunction(name.to_string()))?
            .clone();

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let value = match arg {
                // Null-safe functions see Null for unbound bare refs
                Expr::Ref(field) if descriptor.null_safe => self.read_field_or_null(field),
                _ => self.eval(arg)?,
            };
            values.push(value);
        }

        self.observations.calls.push(CallObservation {
            name: name.to_string(),
            pure: descriptor.pure,
        });

        descriptor.invoke(&values, self.ctx)
    }

    fn eval_index(&mut self, container: &Expr, key: &Expr) -> Result<Value, EvalError> {
        let container_value = self.eval(container)?;
        let key_value = self.eval(key)?;
        match (&container_value, &key_value) {
            (Value::List(items), Value::Int(i)) => {
                let idx = usize::try_from(*i).map_err(|_| {
                    EvalError::TypeError(format!("negative list index {i}"))
                })?;
                items.get(idx).cloned().ok_or_else(|| {
                    EvalError::TypeError(format!(
                        "list index {idx} out of range (len {})",
                        items.len()
                    ))
                })
            }
            // Missing map keys read as Null; maps are open records
            (Value::Map(entries), Value::String(k)) => {
                Ok(entries.get(k).cloned().unwrap_or(Value::Null))
            }
            _ => Err(EvalError::TypeError(format!(
                "cannot index {} with {}",
                container_value.type_name(),
                key_value.type_name()
            ))),
        }
    }
}

/// Equality with numeric promotion. `Null` equals only `Null`; any other
/// cross-category pair is a type error.
fn equality(l: &Value, r: &Value) -> Result<bool, EvalError> {
    match (l, r) {
        (Value::Null, _) | (_, Value::Null) => Ok(l.is_null() && r.is_null()),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => Ok(l.loose_eq(r)),
        (Value::Bool(_), Value::Bool(_))
        | (Value::String(_), Value::String(_))
        | (Value::List(_), Value::List(_))
        | (Value::Map(_), Value::Map(_)) => Ok(l == r),
        _ => Err(EvalError::TypeError(format!(
            "cannot compare {} with {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => int_arithmetic(op, *a, *b),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let a = l.as_f64().unwrap_or(0.0);
            let b = r.as_f64().unwrap_or(0.0);
            float_arithmetic(op, a, b)
        }
        (Value::String(a), Value::String(b)) if op == BinaryOp::Add => {
            Ok(Value::String(format!("{a}{b}")))
        }
        _ => Err(EvalError::TypeError(format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn int_arithmetic(op: BinaryOp, a: i64, b: i64) -> Result<Value, EvalError> {
    let overflow = || EvalError::TypeError(format!("integer overflow in '{}'", op.symbol()));
    match op {
        BinaryOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Div => {
            if b == 0 {
                Err(EvalError::DivisionByZero)
            } else {
                a.checked_div(b).map(Value::Int).ok_or_else(overflow)
            }
        }
        BinaryOp::Mod => {
            if b == 0 {
                Err(EvalError::DivisionByZero)
            } else {
                a.checked_rem(b).map(Value::Int).ok_or_else(overflow)
            }
        }
        _ => unreachable!("non-arithmetic operator"),
    }
}

fn float_arithmetic(op: BinaryOp, a: f64, b: f64) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Add => Ok(Value::Float(a + b)),
        BinaryOp::Sub => Ok(Value::Float(a - b)),
        BinaryOp::Mul => Ok(Value::Float(a * b)),
        BinaryOp::Div => {
            if b == 0.0 {
                Err(EvalError::DivisionByZero)
            } else {
                Ok(Value::Float(a / b))
            }
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                Err(EvalError::DivisionByZero)
            } else {
                Ok(Value::Float(a % b))
            }
        }
        _ => unreachable!("non-arithmetic operator"),
    }
}
