//! # Function Registry
//!
//! Lookup table from function name to a descriptor: arity bounds, purity
//! flag, null-safety flag, and the callable itself. Built-ins cover null
//! handling, basic coercion, the temporal store functions, and the
//! `PROMPT(...)` hook. Host code may register additional functions; impure
//! registrations go through a separate, explicit method.
//!
//! The registry must be fully populated before compilation: the compiler
//! validates call names and arity against it, and it is read-only during
//! evaluation.

use crate::engine::CancelHandle;
use crate::eval::EvalError;
use crate::temporal::TemporalStore;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Registration failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("function '{0}' is already registered")]
    Duplicate(String),

    #[error("invalid arity bounds for '{name}': min {min} exceeds max {max}")]
    InvalidArity { name: String, min: usize, max: usize },
}

/// Per-evaluation context handed to every function call.
///
/// `now_ms` is frozen at the start of the `reason` call, so all temporal
/// functions in one evaluation observe the same instant. The prompt cache
/// lives for one `reason` call and memoizes `PROMPT` results.
pub struct FnCtx<'a> {
    pub now_ms: i64,
    pub temporal: &'a TemporalStore,
    pub prompt: Option<&'a dyn PromptAdapter>,
    pub prompt_cache: &'a RefCell<BTreeMap<String, Value>>,
    /// Cancellation signal; long-running impure functions should poll it.
    pub cancel: Option<&'a CancelHandle>,
}

/// External LLM adapter behind the `PROMPT(...)` built-in. The engine works
/// without one; `PROMPT` then fails with `PromptUnavailable`.
pub trait PromptAdapter: Send + Sync {
    fn complete(
        &self,
        template: &str,
        return_type: Option<&str>,
        max_tokens: Option<i64>,
    ) -> Result<Value, String>;
}

type HostFn = Arc<dyn Fn(&[Value], &FnCtx) -> Result<Value, EvalError> + Send + Sync>;

/// A registered function: arity bounds, purity, null-safety, callable.
#[derive(Clone)]
pub struct FunctionDescriptor {
    pub name: String,
    pub min_arity: usize,
    /// `None` means variadic.
    pub max_arity: Option<usize>,
    /// Pure functions have no observable side effects; impure calls are
    /// recorded in the rule trace and may block.
    pub pure: bool,
    /// Null-safe functions receive `Null` for unbound bare references in
    /// their arguments instead of the evaluator failing with
    /// `UndefinedField`.
    pub null_safe: bool,
    func: HostFn,
}

impl fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.name)
            .field("min_arity", &self.min_arity)
            .field("max_arity", &self.max_arity)
            .field("pure", &self.pure)
            .field("null_safe", &self.null_safe)
            .finish()
    }
}

impl FunctionDescriptor {
    /// Check a call-site argument count against the declared bounds.
    pub fn accepts_arity(&self, argc: usize) -> bool {
        argc >= self.min_arity && self.max_arity.map_or(true, |max| argc <= max)
    }

    pub fn arity_description(&self) -> String {
        match (self.min_arity, self.max_arity) {
            (min, Some(max)) if min == max => min.to_string(),
            (min, Some(max)) => format!("{min}..{max}"),
            (min, None) => format!("{min}+"),
        }
    }

    pub fn invoke(&self, args: &[Value], ctx: &FnCtx) -> Result<Value, EvalError> {
        if !self.accepts_arity(args.len()) {
            return Err(EvalError::ArityMismatch {
                name: self.name.clone(),
                expected: self.arity_description(),
                got: args.len(),
            });
        }
        (self.func)(args, ctx)
    }
}

/// Name → descriptor table. Frozen once compilation begins.
#[derive(Debug, Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, FunctionDescriptor>,
    prompt_adapter: Option<Arc<dyn PromptAdapter>>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        FunctionRegistry::new()
    }
}

impl fmt::Debug for dyn PromptAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PromptAdapter")
    }
}

impl FunctionRegistry {
    /// Registry pre-populated with the built-in functions.
    pub fn new() -> Self {
        let mut registry = FunctionRegistry::empty();
        registry.install_builtins();
        registry
    }

    /// Registry with no functions at all (tests and embedders that want
    /// full control).
    pub fn empty() -> Self {
        FunctionRegistry {
            functions: BTreeMap::new(),
            prompt_adapter: None,
        }
    }

    /// Register a pure host function.
    pub fn register<F>(
        &mut self,
        name: &str,
        min_arity: usize,
        max_arity: Option<usize>,
        func: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&[Value], &FnCtx) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.insert(name, min_arity, max_arity, true, false, Arc::new(func))
    }

    /// Register an impure host function. This method is the explicit opt-in
    /// the descriptor's `pure: false` flag requires: impure calls may block,
    /// are recorded in traces, and are subject to the per-call deadline.
    pub fn register_impure<F>(
        &mut self,
        name: &str,
        min_arity: usize,
        max_arity: Option<usize>,
        func: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&[Value], &FnCtx) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.insert(name, min_arity, max_arity, false, false, Arc::new(func))
    }

    fn insert(
        &mut self,
        name: &str,
        min_arity: usize,
        max_arity: Option<usize>,
        pure: bool,
        null_safe: bool,
        func: HostFn,
    ) -> Result<(), RegistryError> {
        if let Some(max) = max_arity {
            if min_arity > max {
                return Err(RegistryError::InvalidArity {
                    name: name.to_string(),
                    min: min_arity,
                    max,
                });
            }
        }
        if self.functions.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.functions.insert(
            name.to_string(),
            FunctionDescriptor {
                name: name.to_string(),
                min_arity,
                max_arity,
                pure,
                null_safe,
                func,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Install the LLM adapter behind `PROMPT(...)`.
    pub fn set_prompt_adapter(&mut self, adapter: Arc<dyn PromptAdapter>) {
        self.prompt_adapter = Some(adapter);
    }

    pub fn prompt_adapter(&self) -> Option<&dyn PromptAdapter> {
        self.prompt_adapter.as_deref()
    }

    // ------------------------------------------------------------------
    // Built-ins
    // ------------------------------------------------------------------

    fn install_builtins(&mut self) {
        let b = |r: Result<(), RegistryError>| {
            debug_assert!(r.is_ok(), "builtin registration cannot collide");
        };

        // Null helpers (null-safe: unbound refs arrive as Null)
        b(self.insert(
            "is_null",
            1,
            Some(1),
            true,
            true,
            Arc::new(|args, _| Ok(Value::Bool(args[0].is_null()))),
        ));
        b(self.insert(
            "is_defined",
            1,
            Some(1),
            true,
            true,
            Arc::new(|args, _| Ok(Value::Bool(!args[0].is_null()))),
        ));
        b(self.insert(
            "coalesce",
            1,
            None,
            true,
            true,
            Arc::new(|args, _| {
                Ok(args
                    .iter()
                    .find(|v| !v.is_null())
                    .cloned()
                    .unwrap_or(Value::Null))
            }),
        ));

        // Coercion and small numeric/string helpers
        b(self.insert("int", 1, Some(1), true, false, Arc::new(builtin_int)));
        b(self.insert("float", 1, Some(1), true, false, Arc::new(builtin_float)));
        b(self.insert("str", 1, Some(1), true, false, Arc::new(builtin_str)));
        b(self.insert("len", 1, Some(1), true, false, Arc::new(builtin_len)));
        b(self.insert("abs", 1, Some(1), true, false, Arc::new(builtin_abs)));
        b(self.insert("min", 1, None, true, false, Arc::new(builtin_min)));
        b(self.insert("max", 1, None, true, false, Arc::new(builtin_max)));

        // Temporal store
        b(self.insert(
            "record",
            2,
            Some(3),
            false,
            false,
            Arc::new(|args, ctx| {
                let key = str_arg(args, 0, "record")?;
                let value = num_arg(args, 1, "record")?;
                let at_ms = match args.get(2) {
                    Some(v) => (num_arg_value(v, "record")? * 1000.0) as i64,
                    None => ctx.now_ms,
                };
                ctx.temporal.record(key, value, at_ms);
                Ok(Value::Bool(true))
            }),
        ));
        b(self.insert(
            "recent_avg",
            2,
            Some(2),
            true,
            false,
            Arc::new(|args, ctx| {
                let (key, window_ms) = key_window(args, "recent_avg")?;
                Ok(ctx
                    .temporal
                    .recent_avg(key, window_ms, ctx.now_ms)
                    .map_or(Value::Null, Value::Float))
            }),
        ));
        b(self.insert(
            "recent_max",
            2,
            Some(2),
            true,
            false,
            Arc::new(|args, ctx| {
                let (key, window_ms) = key_window(args, "recent_max")?;
                Ok(ctx
                    .temporal
                    .recent_max(key, window_ms, ctx.now_ms)
                    .map_or(Value::Null, Value::Float))
            }),
        ));
        b(self.insert(
            "recent_min",
            2,
            Some(2),
            true,
            false,
            Arc::new(|args, ctx| {
                let (key, window_ms) = key_window(args, "recent_min")?;
                Ok(ctx
                    .temporal
                    .recent_min(key, window_ms, ctx.now_ms)
                    .map_or(Value::Null, Value::Float))
            }),
        ));
        b(self.insert(
            "recent_count",
            2,
            Some(2),
            true,
            false,
            Arc::new(|args, ctx| {
                let (key, window_ms) = key_window(args, "recent_count")?;
                Ok(Value::Int(
                    ctx.temporal.recent_count(key, window_ms, ctx.now_ms) as i64,
                ))
            }),
        ));
        b(self.insert(
            "sustained_above",
            3,
            Some(3),
            true,
            false,
            Arc::new(|args, ctx| {
                let key = str_arg(args, 0, "sustained_above")?;
                let threshold = num_arg(args, 1, "sustained_above")?;
                let window_ms = window_ms_arg(args, 2, "sustained_above")?;
                Ok(Value::Bool(ctx.temporal.sustained_above(
                    key, threshold, window_ms, ctx.now_ms,
                )))
            }),
        ));
        b(self.insert(
            "sustained_below",
            3,
            Some(3),
            true,
            false,
            Arc::new(|args, ctx| {
                let key = str_arg(args, 0, "sustained_below")?;
                let threshold = num_arg(args, 1, "sustained_below")?;
                let window_ms = window_ms_arg(args, 2, "sustained_below")?;
                Ok(Value::Bool(ctx.temporal.sustained_below(
                    key, threshold, window_ms, ctx.now_ms,
                )))
            }),
        ));
        b(self.insert(
            "set_ttl_fact",
            3,
            Some(3),
            false,
            false,
            Arc::new(|args, ctx| {
                let key = str_arg(args, 0, "set_ttl_fact")?;
                let ttl_ms = window_ms_arg(args, 2, "set_ttl_fact")?;
                ctx.temporal
                    .set_ttl_fact(key, args[1].clone(), ttl_ms, ctx.now_ms);
                Ok(Value::Bool(true))
            }),
        ));
        b(self.insert(
            "ttl_fact",
            1,
            Some(1),
            true,
            false,
            Arc::new(|args, ctx| {
                let key = str_arg(args, 0, "ttl_fact")?;
                Ok(ctx.temporal.ttl_fact(key, ctx.now_ms))
            }),
        ));
        b(self.insert(
            "has_ttl_fact",
            1,
            Some(1),
            true,
            false,
            Arc::new(|args, ctx| {
                let key = str_arg(args, 0, "has_ttl_fact")?;
                Ok(Value::Bool(ctx.temporal.has_ttl_fact(key, ctx.now_ms)))
            }),
        ));

        // LLM hook; memoized per reason call
        b(self.insert("PROMPT", 1, Some(3), false, false, Arc::new(builtin_prompt)));
    }
}

// ----------------------------------------------------------------------
// Built-in bodies and argument helpers
// ----------------------------------------------------------------------

fn type_err(function: &str, index: usize, expected: &str, got: &Value) -> EvalError {
    EvalError::TypeError(format!(
        "{function}: argument {index} must be {expected}, got {}",
        got.type_name()
    ))
}

fn str_arg<'a>(args: &'a [Value], index: usize, function: &str) -> Result<&'a str, EvalError> {
    args[index]
        .as_str()
        .ok_or_else(|| type_err(function, index, "a string", &args[index]))
}

fn num_arg_value(value: &Value, function: &str) -> Result<f64, EvalError> {
    value
        .as_f64()
        .ok_or_else(|| type_err(function, 0, "numeric", value))
}

fn num_arg(args: &[Value], index: usize, function: &str) -> Result<f64, EvalError> {
    args[index]
        .as_f64()
        .ok_or_else(|| type_err(function, index, "numeric", &args[index]))
}

/// Window arguments arrive in seconds and convert to milliseconds.
fn window_ms_arg(args: &[Value], index: usize, function: &str) -> Result<i64, EvalError> {
    let seconds = num_arg(args, index, function)?;
    Ok((seconds * 1000.0) as i64)
}

fn key_window<'a>(args: &'a [Value], function: &str) -> Result<(&'a str, i64), EvalError> {
    Ok((str_arg(args, 0, function)?, window_ms_arg(args, 1, function)?))
}

fn builtin_int(args: &[Value], _ctx: &FnCtx) -> Result<Value, EvalError> {
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => Ok(Value::Int(*f as i64)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| EvalError::TypeError(format!("int: cannot parse '{s}'"))),
        other => Err(type_err("int", 0, "int, float, bool or string", other)),
    }
}

fn builtin_float(args: &[Value], _ctx: &FnCtx) -> Result<Value, EvalError> {
    match &args[0] {
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| EvalError::TypeError(format!("float: cannot parse '{s}'"))),
        other => Err(type_err("float", 0, "int, float or string", other)),
    }
}

fn builtin_str(args: &[Value], _ctx: &FnCtx) -> Result<Value, EvalError> {
    match &args[0] {
        Value::String(s) => Ok(Value::String(s.clone())),
        other => Ok(Value::String(other.to_string())),
    }
}

fn builtin_len(args: &[Value], _ctx: &FnCtx) -> Result<Value, EvalError> {
    match &args[0] {
        Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
        Value::List(items) => Ok(Value::Int(items.len() as i64)),
        Value::Map(entries) => Ok(Value::Int(entries.len() as i64)),
        other => Err(type_err("len", 0, "a string, list or map", other)),
    }
}

fn builtin_abs(args: &[Value], _ctx: &FnCtx) -> Result<Value, EvalError> {
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(i.saturating_abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(type_err("abs", 0, "numeric", other)),
    }
}

fn fold_numeric(
    args: &[Value],
    function: &str,
    pick: impl Fn(f64, f64) -> bool,
) -> Result<Value, EvalError> {
    let mut best: Option<&Value> = None;
    for (i, arg) in args.iter().enumerate() {
        let v = arg
            .as_f64()
            .ok_or_else(|| type_err(function, i, "numeric", arg))?;
        let replace = match best.and_then(Value::as_f64) {
            Some(current) => pick(v, current),
            None => true,
        };
        if replace {
            best = Some(arg);
        }
    }
    Ok(best.cloned().unwrap_or(Value::Null))
}

fn builtin_min(args: &[Value], _ctx: &FnCtx) -> Result<Value, EvalError> {
    fold_numeric(args, "min", |candidate, current| candidate < current)
}

fn builtin_max(args: &[Value], _ctx: &FnCtx) -> Result<Value, EvalError> {
    fold_numeric(args, "max", |candidate, current| candidate > current)
}

fn builtin_prompt(args: &[Value], ctx: &FnCtx) -> Result<Value, EvalError> {
    let template = str_arg(args, 0, "PROMPT")?;
    let return_type = match args.get(1) {
        Some(_) => Some(str_arg(args, 1, "PROMPT")?),
        None => None,
    };
    let max_tokens = match args.get(2) {
        Some(v) => Some(
            v.as_i64()
                .ok_or_else(|| type_err("PROMPT", 2, "an integer", v))?,
        ),
        None => None,
    };

    let cache_key = format!(
        "{template}\u{1}{}\u{1}{}",
        return_type.unwrap_or(""),
        max_tokens.map_or(String::new(), |t| t.to_string())
    );
    if let Some(cached) = ctx.prompt_cache.borrow().get(&cache_key) {
        return Ok(cached.clone());
    }

    let adapter = ctx.prompt.ok_or(EvalError::PromptUnavailable)?;
    let result = adapter
        .complete(template, return_type, max_tokens)
        .map_err(EvalError::PromptError)?;
    ctx.prompt_cache
        .borrow_mut()
        .insert(cache_key, result.clone());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::TemporalConfig;

    fn ctx<'a>(
        temporal: &'a TemporalStore,
        cache: &'a RefCell<BTreeMap<String, Value>>,
    ) -> FnCtx<'a> {
        FnCtx {
            now_ms: 1_700_000_000_000,
            temporal,
            prompt: None,
            prompt_cache: cache,
            cancel: None,
        }
    }

    fn call(registry: &FunctionRegistry, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let temporal = TemporalStore::new(TemporalConfig::default());
        let cache = RefCell::new(BTreeMap::new());
        registry
            .get(name)
            .expect("function registered")
            .invoke(args, &ctx(&temporal, &cache))
    }

    #[test]
    fn test_builtin_null_helpers() {
        let registry = FunctionRegistry::new();
        assert_eq!(
            call(&registry, "is_null", &[Value::Null]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            call(&registry, "is_defined", &[Value::Int(1)]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            call(
                &registry,
                "coalesce",
                &[Value::Null, Value::Null, Value::Int(7)]
            ),
            Ok(Value::Int(7))
        );
    }

    #[test]
    fn test_builtin_coercions() {
        let registry = FunctionRegistry::new();
        assert_eq!(
            call(&registry, "int", &[Value::from("42")]),
            Ok(Value::Int(42))
        );
        assert_eq!(
            call(&registry, "float", &[Value::Int(2)]),
            Ok(Value::Float(2.0))
        );
        assert_eq!(
            call(&registry, "str", &[Value::Int(5)]),
            Ok(Value::from("5"))
        );
        assert_eq!(
            call(&registry, "len", &[Value::from(vec![1i64, 2, 3])]),
            Ok(Value::Int(3))
        );
        assert!(matches!(
            call(&registry, "int", &[Value::from("not a number")]),
            Err(EvalError::TypeError(_))
        ));
    }

    #[test]
    fn test_builtin_min_max_preserve_int_tag() {
        let registry = FunctionRegistry::new();
        assert_eq!(
            call(&registry, "min", &[Value::Int(3), Value::Float(1.5)]),
            Ok(Value::Float(1.5))
        );
        assert_eq!(
            call(&registry, "max", &[Value::Int(3), Value::Float(1.5)]),
            Ok(Value::Int(3))
        );
    }

    #[test]
    fn test_arity_enforcement() {
        let registry = FunctionRegistry::new();
        match call(&registry, "is_null", &[]) {
            Err(EvalError::ArityMismatch { name, got, .. }) => {
                assert_eq!(name, "is_null");
                assert_eq!(got, 0);
            }
            other => panic!("expected arity mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_temporal_builtins_share_frozen_now() {
        let registry = FunctionRegistry::new();
        let temporal = TemporalStore::new(TemporalConfig::default());
        let cache = RefCell::new(BTreeMap::new());
        let fn_ctx = ctx(&temporal, &cache);

        temporal.record("cpu", 95.0, fn_ctx.now_ms - 1_000);
        temporal.record("cpu", 97.0, fn_ctx.now_ms);

        let avg = registry
            .get("recent_avg")
            .expect("registered")
            .invoke(&[Value::from("cpu"), Value::Int(60)], &fn_ctx)
            .expect("evaluates");
        assert_eq!(avg, Value::Float(96.0));

        let count = registry
            .get("recent_count")
            .expect("registered")
            .invoke(&[Value::from("cpu"), Value::Int(60)], &fn_ctx)
            .expect("evaluates");
        assert_eq!(count, Value::Int(2));
    }

    #[test]
    fn test_prompt_without_adapter_is_unavailable() {
        let registry = FunctionRegistry::new();
        assert_eq!(
            call(&registry, "PROMPT", &[Value::from("classify: {x}")]),
            Err(EvalError::PromptUnavailable)
        );
    }

    #[test]
    fn test_prompt_results_are_cached_per_call() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingAdapter(AtomicUsize);
        impl PromptAdapter for CountingAdapter {
            fn complete(
                &self,
                _template: &str,
                _return_type: Option<&str>,
                _max_tokens: Option<i64>,
            ) -> Result<Value, String> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Value::from("yes"))
            }
        }

        let registry = FunctionRegistry::new();
        let adapter = CountingAdapter(AtomicUsize::new(0));
        let temporal = TemporalStore::new(TemporalConfig::default());
        let cache = RefCell::new(BTreeMap::new());
        let fn_ctx = FnCtx {
            now_ms: 0,
            temporal: &temporal,
            prompt: Some(&adapter),
            prompt_cache: &cache,
            cancel: None,
        };

        let descriptor = registry.get("PROMPT").expect("registered");
        let args = [Value::from("same template")];
        assert_eq!(descriptor.invoke(&args, &fn_ctx), Ok(Value::from("yes")));
        assert_eq!(descriptor.invoke(&args, &fn_ctx), Ok(Value::from("yes")));
        assert_eq!(adapter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = FunctionRegistry::new();
        let result = registry.register("is_null", 1, Some(1), |_, _| Ok(Value::Null));
        assert_eq!(result, Err(RegistryError::Duplicate("is_null".to_string())));
    }

    #[test]
    fn test_register_impure_sets_flag() {
        let mut registry = FunctionRegistry::empty();
        registry
            .register_impure("fetch_score", 1, Some(1), |_, _| Ok(Value::Int(1)))
            .expect("registers");
        let descriptor = registry.get("fetch_score").expect("registered");
        assert!(!descriptor.pure);

        registry
            .register("double", 1, Some(1), |args, _| {
                let n = args[0].as_f64().unwrap_or(0.0);
                Ok(Value::Float(n * 2.0))
            })
            .expect("registers");
        assert!(registry.get("double").expect("registered").pure);
    }
}
