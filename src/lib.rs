//! # Symbolica Rule Engine
//!
//! A deterministic rule engine: declarative IF/THEN rules are compiled once,
//! then evaluated against input facts to produce a verdict together with an
//! auditable trace of what fired and why. Designed for sub-millisecond
//! evaluation of rule sets in the hundreds-to-low-thousands range, inside
//! larger decision pipelines (loan approval, routing, alerting) where
//! reproducibility and explainability matter.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Rule Specs (text / structured / AST)
//!     ↓
//! [Parser]               → Expr AST
//!     ↓
//! [Dependency Analysis]  → read/write sets + DAG + cycle check
//!     ↓
//! [Topological Layering] → execution order (priority tie-break)
//!     ↓
//! [DAG Executor]         ⇄ [Evaluator] ⇄ [Function Registry | Temporal Store]
//!     ↓
//! ExecutionResult (verdict, fired rules, reasoning, traces, timings)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use symbolica::{Facts, RuleEngine, RuleSpec};
//! use serde_json::json;
//!
//! let mut engine = RuleEngine::new();
//! engine.compile(vec![
//!     RuleSpec::new("vip_approval", "customer_tier == 'vip' and credit_score > 750")
//!         .action("approved", json!(true))
//!         .action("credit_limit", json!(50_000)),
//! ])?;
//!
//! let facts: Facts = [
//!     ("customer_tier", "vip".into()),
//!     ("credit_score", 800i64.into()),
//! ].into_iter().collect();
//!
//! let result = engine.reason(&facts)?;
//! assert!(result.fired_rule("vip_approval"));
//! println!("{}", result.reasoning);
//! ```
//!
//! ## Ordering semantics
//!
//! Rules execute in topological order of the field-dependency DAG (plus
//! trigger edges). Within a layer, rules fire in **ascending priority**
//! order with the id as final tie-breaker: the highest-priority rule fires
//! last, so under the last-writer-wins conflict policy its writes dominate
//! the verdict.
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | Tagged value union and coercion rules |
//! | `facts` | Fact maps and the overlay environment |
//! | `ast` | Expression AST and normalized rendering |
//! | `parser` | Flat expressions and structured forms → AST |
//! | `eval` | AST + environment → value, with observation log |
//! | `functions` | Built-in and host functions, arity, purity |
//! | `temporal` | Time-indexed buffers, windowed queries, TTL facts |
//! | `dependency` | Read/write analysis, DAG, cycle detection |
//! | `ruleset` | Rule compilation and derived artifacts |
//! | `engine` | Topological execution, triggers, trace assembly |
//! | `chaining` | Goal → candidate rules; reachability check |
//! | `config` | Layered TOML + environment configuration |
//! | `clock` | Injectable time source |

pub mod ast;
pub mod chaining;
pub mod clock;
pub mod config;
pub mod dependency;
pub mod engine;
pub mod eval;
pub mod facts;
pub mod functions;
pub mod parser;
pub mod ruleset;
pub mod temporal;
pub mod trace;
pub mod value;

// Re-export the primary types
pub use chaining::{BackwardChainer, Goal};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{EngineConfig, ReasonConfig};
pub use engine::{
    CallOptions, CancelHandle, ErrorStrategy, ExecutionResult, Executor, ReasonError, SkipRecord,
};
pub use eval::EvalError;
pub use facts::Facts;
pub use functions::{FunctionRegistry, PromptAdapter, RegistryError};
pub use parser::ParseError;
pub use ruleset::{CompileError, ConditionSpec, Rule, RuleSet, RuleSpec};
pub use temporal::{TemporalConfig, TemporalStore};
pub use trace::RuleTraceEntry;
pub use value::Value;

use std::sync::Arc;

/// The engine facade: owns the configuration, function registry, temporal
/// store and clock, and orchestrates compile → reason.
///
/// A compiled [`RuleSet`] is immutable and shared freely; the temporal store
/// is the only shared mutable resource.
pub struct RuleEngine {
    config: EngineConfig,
    registry: FunctionRegistry,
    temporal: Arc<TemporalStore>,
    clock: Arc<dyn Clock>,
    rule_set: Option<RuleSet>,
}

impl RuleEngine {
    /// Engine with default configuration, the built-in function registry,
    /// and the system clock.
    pub fn new() -> Self {
        RuleEngine::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let temporal = Arc::new(TemporalStore::new(config.temporal.clone()));
        RuleEngine {
            config,
            registry: FunctionRegistry::new(),
            temporal,
            clock: Arc::new(SystemClock),
            rule_set: None,
        }
    }

    /// Swap in a deterministic clock (tests) or any other time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Mutable access to the function registry. Host registrations must
    /// complete before [`compile`](Self::compile); the registry is read-only
    /// during evaluation.
    pub fn registry_mut(&mut self) -> &mut FunctionRegistry {
        &mut self.registry
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Install the LLM adapter behind the `PROMPT(...)` built-in.
    pub fn set_prompt_adapter(&mut self, adapter: Arc<dyn PromptAdapter>) {
        self.registry.set_prompt_adapter(adapter);
    }

    /// Compile rule specs into the engine's active rule set.
    pub fn compile(&mut self, specs: Vec<RuleSpec>) -> Result<&RuleSet, CompileError> {
        let rule_set = RuleSet::compile(specs, &self.registry)?;
        self.rule_set = Some(rule_set);
        Ok(self.rule_set.as_ref().unwrap_or_else(|| unreachable!("just set")))
    }

    pub fn rule_set(&self) -> Option<&RuleSet> {
        self.rule_set.as_ref()
    }

    /// Evaluate the compiled rule set against the facts.
    pub fn reason(&self, facts: &Facts) -> Result<ExecutionResult, ReasonError> {
        self.reason_with(facts, &CallOptions::default())
    }

    /// Evaluate with per-call options (deadline override, cancellation).
    pub fn reason_with(
        &self,
        facts: &Facts,
        options: &CallOptions,
    ) -> Result<ExecutionResult, ReasonError> {
        let rule_set = self.rule_set.as_ref().ok_or(ReasonError::NotCompiled)?;
        let executor = Executor {
            rule_set,
            registry: &self.registry,
            temporal: &self.temporal,
            clock: self.clock.as_ref(),
            strategy: self.config.reason.error_strategy,
            verbose_trace: self.config.reason.verbose_trace,
            deadline_budget: self.config.reason.deadline(),
        };
        executor.reason_with(facts, options)
    }

    /// Rules that could assign the goal's fields.
    pub fn rules_for_goal(&self, goal: &Goal) -> Vec<&Rule> {
        match &self.rule_set {
            Some(rule_set) => BackwardChainer::new(rule_set)
                .with_max_depth(self.config.reason.max_chain_depth)
                .rules_for_goal(goal),
            None => Vec::new(),
        }
    }

    /// Whether the goal could be reached from the facts. Static analysis
    /// only; returning true is necessary but not sufficient.
    pub fn can_achieve(&self, goal: &Goal, facts: &Facts) -> bool {
        match &self.rule_set {
            Some(rule_set) => BackwardChainer::new(rule_set)
                .with_max_depth(self.config.reason.max_chain_depth)
                .can_achieve(goal, facts),
            None => false,
        }
    }

    /// Append a temporal sample at the clock's current time.
    pub fn record(&self, key: &str, value: f64) {
        self.temporal.record(key, value, self.clock.now_millis());
    }

    /// Append a temporal sample at an explicit timestamp.
    pub fn record_at(&self, key: &str, value: f64, at_ms: i64) {
        self.temporal.record(key, value, at_ms);
    }

    /// Store a TTL fact expiring `ttl_ms` from now.
    pub fn set_ttl_fact(&self, key: &str, value: Value, ttl_ms: i64) {
        self.temporal
            .set_ttl_fact(key, value, ttl_ms, self.clock.now_millis());
    }

    pub fn temporal(&self) -> &TemporalStore {
        &self.temporal
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_engine_starts_without_rule_set() {
        let engine = RuleEngine::new();
        assert!(engine.rule_set().is_none());
        assert!(matches!(
            engine.reason(&Facts::new()),
            Err(ReasonError::NotCompiled)
        ));
    }

    #[test]
    fn test_compile_then_reason() {
        let mut engine = RuleEngine::new();
        engine
            .compile(vec![RuleSpec::new("always", "true").action("ok", json!(true))])
            .expect("compiles");

        let result = engine.reason(&Facts::new()).expect("reasons");
        assert_eq!(result.fired, vec!["always".to_string()]);
        assert_eq!(result.writes.get("ok"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_recompile_replaces_rule_set() {
        let mut engine = RuleEngine::new();
        engine
            .compile(vec![RuleSpec::new("first", "true").action("a", json!(1))])
            .expect("compiles");
        engine
            .compile(vec![RuleSpec::new("second", "true").action("b", json!(2))])
            .expect("compiles");

        let rule_set = engine.rule_set().expect("compiled");
        assert!(rule_set.get("first").is_none());
        assert!(rule_set.get("second").is_some());
    }

    #[test]
    fn test_temporal_functions_use_injected_clock() {
        let clock = Arc::new(FixedClock::at(1_700_000_000_000));
        let mut engine = RuleEngine::new().with_clock(clock.clone());
        engine
            .compile(vec![RuleSpec::new("alarm", "recent_count('cpu', 60) >= 2")
                .action("alert", json!(true))])
            .expect("compiles");

        engine.record("cpu", 91.0);
        clock.advance(30_000);
        engine.record("cpu", 95.0);

        let result = engine.reason(&Facts::new()).expect("reasons");
        assert!(result.fired_rule("alarm"));
    }

    #[test]
    fn test_host_function_registration_before_compile() {
        let mut engine = RuleEngine::new();
        engine
            .registry_mut()
            .register("double", 1, Some(1), |args, _| {
                let n = args[0]
                    .as_f64()
                    .ok_or_else(|| EvalError::TypeError("double: numeric".to_string()))?;
                Ok(Value::Float(n * 2.0))
            })
            .expect("registers");

        engine
            .compile(vec![
                RuleSpec::new("scaled", "double(x) > 5.0").action("big", json!(true))
            ])
            .expect("compiles");

        let facts: Facts = [("x", Value::Int(3))].into_iter().collect();
        let result = engine.reason(&facts).expect("reasons");
        assert!(result.fired_rule("scaled"));
    }

    #[test]
    fn test_backward_chaining_through_facade() {
        let mut engine = RuleEngine::new();
        engine
            .compile(vec![RuleSpec::new("approve", "score > 700")
                .action("approved", json!(true))])
            .expect("compiles");

        let rules = engine.rules_for_goal(&Goal::binding("approved", true));
        assert_eq!(rules.len(), 1);

        let good: Facts = [("score", Value::Int(800))].into_iter().collect();
        let bad: Facts = [("score", Value::Int(100))].into_iter().collect();
        assert!(engine.can_achieve(&Goal::binding("approved", true), &good));
        assert!(!engine.can_achieve(&Goal::binding("approved", true), &bad));
    }
}
