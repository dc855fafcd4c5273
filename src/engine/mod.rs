//! # DAG Executor
//!
//! Runs one `reason` call: a topological pass over the compiled rule set,
//! then a drain of the trigger queue, producing an [`ExecutionResult`] with
//! the verdict, the fired rules in order, the reasoning string, and the
//! per-rule traces.
//!
//! Semantics:
//! - A rule fires at most once per call, whether reached topologically or
//!   through a trigger edge.
//! - A condition failing with `UndefinedField` or `TypeError` demotes the
//!   rule to non-firing; other evaluation failures are fatal under the
//!   strict strategy and demote under the permissive one.
//! - Writes go to the overlay; the last writer of a field wins. Action
//!   lists apply transactionally: a rule that fails mid-action discards its
//!   partial writes and does not fire.
//! - A rule that fires after a fired parent scheduled it is attributed to
//!   that parent in its trace entry, even when the topological pass (which
//!   already orders trigger targets after their sources) is what reached it.
//! - The deadline and the cancellation flag are checked between rule
//!   evaluations; tripping either returns the partial result flagged
//!   accordingly.

mod deadline;

pub use deadline::{CancelHandle, Interrupt, ReasonDeadline};

use crate::clock::Clock;
use crate::eval::{EvalError, Evaluator, Observations};
use crate::facts::{EnvView, Facts};
use crate::functions::{FnCtx, FunctionRegistry};
use crate::ruleset::{Rule, RuleSet};
use crate::temporal::TemporalStore;
use crate::trace::{render_reasoning, RuleTraceEntry};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// How runtime evaluation failures outside the always-demoted pair
/// (`UndefinedField`, `TypeError`) are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    /// `DivisionByZero`, `ArityMismatch`, prompt failures and the like
    /// abort the `reason` call.
    #[default]
    Strict,
    /// Every evaluation failure demotes the rule to non-firing.
    Permissive,
}

/// Fatal `reason` failure under the strict strategy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReasonError {
    #[error("rule '{rule}' failed: {source}")]
    RuleEvaluation {
        rule: String,
        #[source]
        source: EvalError,
    },

    #[error("no rule set compiled; call compile() first")]
    NotCompiled,
}

/// A rule that was evaluated or scheduled but did not fire, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub rule_id: String,
    pub reason: String,
}

/// Outcome of one `reason` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Full environment after the call: the input facts overlaid by every
    /// accumulated write.
    pub verdict: BTreeMap<String, Value>,

    /// Only the fields rules wrote, with their final values.
    pub writes: BTreeMap<String, Value>,

    /// Fired rule ids, in firing order.
    pub fired: Vec<String>,

    /// Deterministic human-readable rendering of the trace.
    pub reasoning: String,

    /// Total wall time of the call.
    pub elapsed: Duration,

    /// Per-rule trace entries (fired rules and demoted failures).
    pub trace: Vec<RuleTraceEntry>,

    /// Rules that were evaluated or scheduled but did not fire, with why.
    pub skipped: Vec<SkipRecord>,

    /// The per-call deadline expired before every rule was evaluated.
    pub timed_out: bool,

    /// The caller cancelled before every rule was evaluated.
    pub cancelled: bool,
}

impl ExecutionResult {
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.verdict.get(field)
    }

    pub fn fired_rule(&self, id: &str) -> bool {
        self.fired.iter().any(|f| f == id)
    }

    /// Whether the call ran to completion.
    pub fn complete(&self) -> bool {
        !self.timed_out && !self.cancelled
    }
}

/// Per-call knobs layered over the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the configured deadline when set.
    pub deadline: Option<Duration>,
    /// External cancellation handle to watch.
    pub cancel: Option<CancelHandle>,
}

/// One-call executor over a compiled rule set.
///
/// Borrows everything it needs; construct one per `reason` call (the
/// [`RuleEngine`](crate::RuleEngine) facade does this).
pub struct Executor<'a> {
    pub rule_set: &'a RuleSet,
    pub registry: &'a FunctionRegistry,
    pub temporal: &'a TemporalStore,
    pub clock: &'a dyn Clock,
    pub strategy: ErrorStrategy,
    /// Record trace entries for conditions that evaluated to plain false,
    /// and render non-firing lines into the reasoning string.
    pub verbose_trace: bool,
    pub deadline_budget: Option<Duration>,
}

struct CallState {
    overlay: BTreeMap<String, Value>,
    fired: Vec<String>,
    fired_set: BTreeSet<String>,
    /// Rule id → the fired rule that scheduled it. First parent wins.
    trigger_parent: BTreeMap<String, String>,
    queue: VecDeque<String>,
    trace: Vec<RuleTraceEntry>,
    skipped: Vec<SkipRecord>,
}

impl<'a> Executor<'a> {
    /// Evaluate the rule set against the facts.
    pub fn reason(&self, facts: &Facts) -> Result<ExecutionResult, ReasonError> {
        self.reason_with(facts, &CallOptions::default())
    }

    pub fn reason_with(
        &self,
        facts: &Facts,
        options: &CallOptions,
    ) -> Result<ExecutionResult, ReasonError> {
        let now_ms = self.clock.now_millis();
        let budget = options.deadline.or(self.deadline_budget);
        let deadline = match &options.cancel {
            Some(handle) => handle.deadline(budget),
            None => ReasonDeadline::new(budget),
        };
        let cancel_handle = deadline.cancel_handle();
        let prompt_cache = RefCell::new(BTreeMap::new());

        let mut state = CallState {
            overlay: BTreeMap::new(),
            fired: Vec::new(),
            fired_set: BTreeSet::new(),
            trigger_parent: BTreeMap::new(),
            queue: VecDeque::new(),
            trace: Vec::new(),
            skipped: Vec::new(),
        };
        let mut interrupt: Option<Interrupt> = None;

        // Topological pass
        for (position, id) in self.rule_set.execution_order().iter().enumerate() {
            if let Err(reason) = deadline.check() {
                self.record_truncation(&mut state, position, reason);
                interrupt = Some(reason);
                break;
            }
            if state.fired_set.contains(id) {
                continue;
            }
            if let Some(rule) = self.rule_set.get(id) {
                self.try_fire(rule, facts, &mut state, now_ms, &cancel_handle, &prompt_cache)?;
            }
        }

        // Trigger drain: conditions may hold now because of new writes
        while interrupt.is_none() {
            let Some(id) = state.queue.pop_front() else {
                break;
            };
            if let Err(reason) = deadline.check() {
                let label = interrupt_label(reason);
                if !state.fired_set.contains(&id) {
                    state.skipped.push(SkipRecord {
                        rule_id: id,
                        reason: label.to_string(),
                    });
                }
                for pending in state.queue.drain(..) {
                    state.skipped.push(SkipRecord {
                        rule_id: pending,
                        reason: label.to_string(),
                    });
                }
                interrupt = Some(reason);
                break;
            }
            if state.fired_set.contains(&id) {
                continue;
            }
            if let Some(rule) = self.rule_set.get(&id) {
                self.try_fire(rule, facts, &mut state, now_ms, &cancel_handle, &prompt_cache)?;
            }
        }

        let mut verdict = facts.clone().into_inner();
        verdict.extend(state.overlay.clone());

        let result = ExecutionResult {
            verdict,
            writes: state.overlay,
            reasoning: render_reasoning(&state.trace, self.verbose_trace),
            fired: state.fired,
            elapsed: deadline.elapsed(),
            trace: state.trace,
            skipped: state.skipped,
            timed_out: interrupt == Some(Interrupt::TimedOut),
            cancelled: interrupt == Some(Interrupt::Cancelled),
        };
        info!(
            fired = result.fired.len(),
            elapsed_us = result.elapsed.as_micros() as u64,
            complete = result.complete(),
            "reason call finished"
        );
        Ok(result)
    }

    fn try_fire(
        &self,
        rule: &Rule,
        facts: &Facts,
        state: &mut CallState,
        now_ms: i64,
        cancel: &CancelHandle,
        prompt_cache: &RefCell<BTreeMap<String, Value>>,
    ) -> Result<(), ReasonError> {
        let triggered_by = state.trigger_parent.get(&rule.id).cloned();
        let ctx = FnCtx {
            now_ms,
            temporal: self.temporal,
            prompt: self.registry.prompt_adapter(),
            prompt_cache,
            cancel: Some(cancel),
        };

        let mut evaluator =
            Evaluator::new(EnvView::new(facts, &state.overlay), self.registry, &ctx);
        let condition_result = evaluator.eval(&rule.condition);
        let mut observations = evaluator.into_observations();

        let held = match condition_result {
            Ok(value) => value.is_truthy(),
            Err(error) => {
                return self.handle_failure(rule, triggered_by, state, observations, error);
            }
        };

        if !held {
            if self.verbose_trace {
                let mut entry = RuleTraceEntry::not_fired(&rule.id, &rule.condition_text);
                entry.inputs = observations.reads;
                entry.triggered_by = triggered_by;
                state.trace.push(entry);
            }
            return Ok(());
        }

        // Actions apply transactionally: evaluate into a scratch overlay and
        // commit only if every template succeeds
        let mut scratch = state.overlay.clone();
        let mut writes = Vec::with_capacity(rule.actions.len());
        for (target, template) in &rule.actions {
            let mut action_eval =
                Evaluator::new(EnvView::new(facts, &scratch), self.registry, &ctx);
            match action_eval.eval(template) {
                Ok(value) => {
                    observations.absorb(action_eval.into_observations());
                    scratch.insert(target.clone(), value.clone());
                    writes.push((target.clone(), value));
                }
                Err(error) => {
                    observations.absorb(action_eval.into_observations());
                    return self.handle_failure(rule, triggered_by, state, observations, error);
                }
            }
        }
        state.overlay = scratch;

        debug!(rule = %rule.id, writes = writes.len(), "rule fired");

        let mut entry = RuleTraceEntry::fired(&rule.id, &rule.condition_text);
        entry.inputs = observations.reads;
        entry.writes = writes;
        entry.triggered_by = triggered_by;
        entry.impure_calls = observations
            .calls
            .iter()
            .filter(|call| !call.pure)
            .map(|call| call.name.clone())
            .collect();
        state.trace.push(entry);

        state.fired.push(rule.id.clone());
        state.fired_set.insert(rule.id.clone());

        // Schedule successors, deduplicated against fired and queued ids
        for target in &rule.triggers {
            if !state.fired_set.contains(target) && !state.trigger_parent.contains_key(target) {
                state.trigger_parent.insert(target.clone(), rule.id.clone());
                state.queue.push_back(target.clone());
            }
        }

        Ok(())
    }

    /// Demote or escalate an evaluation failure per the error strategy.
    fn handle_failure(
        &self,
        rule: &Rule,
        triggered_by: Option<String>,
        state: &mut CallState,
        observations: Observations,
        error: EvalError,
    ) -> Result<(), ReasonError> {
        if error.is_demotable() || self.strategy == ErrorStrategy::Permissive {
            debug!(rule = %rule.id, kind = error.kind(), "condition demoted to non-firing");
            let mut entry = RuleTraceEntry::not_fired(&rule.id, &rule.condition_text);
            entry.inputs = observations.reads;
            entry.triggered_by = triggered_by;
            entry.error = Some(error.kind().to_string());
            state.trace.push(entry);
            state.skipped.push(SkipRecord {
                rule_id: rule.id.clone(),
                reason: error.kind().to_string(),
            });
            Ok(())
        } else {
            Err(ReasonError::RuleEvaluation {
                rule: rule.id.clone(),
                source: error,
            })
        }
    }

    /// Mark everything not yet evaluated as skipped after an interrupt.
    fn record_truncation(&self, state: &mut CallState, from: usize, reason: Interrupt) {
        let label = interrupt_label(reason);
        for id in &self.rule_set.execution_order()[from..] {
            if !state.fired_set.contains(id) {
                state.skipped.push(SkipRecord {
                    rule_id: id.clone(),
                    reason: label.to_string(),
                });
            }
        }
        for pending in state.queue.drain(..) {
            if !state.fired_set.contains(&pending) {
                state.skipped.push(SkipRecord {
                    rule_id: pending,
                    reason: label.to_string(),
                });
            }
        }
    }
}

fn interrupt_label(interrupt: Interrupt) -> &'static str {
    match interrupt {
        Interrupt::TimedOut => "Timeout",
        Interrupt::Cancelled => "Cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ruleset::RuleSpec;
    use crate::temporal::TemporalConfig;
    use serde_json::json;

    struct Fixture {
        rule_set: RuleSet,
        registry: FunctionRegistry,
        temporal: TemporalStore,
        clock: FixedClock,
    }

    impl Fixture {
        fn new(specs: Vec<RuleSpec>) -> Self {
            let registry = FunctionRegistry::new();
            let rule_set = RuleSet::compile(specs, &registry).expect("compiles");
            Fixture {
                rule_set,
                registry,
                temporal: TemporalStore::new(TemporalConfig::default()),
                clock: FixedClock::at(1_700_000_000_000),
            }
        }

        fn executor(&self) -> Executor<'_> {
            Executor {
                rule_set: &self.rule_set,
                registry: &self.registry,
                temporal: &self.temporal,
                clock: &self.clock,
                strategy: ErrorStrategy::Strict,
                verbose_trace: false,
                deadline_budget: None,
            }
        }
    }

    fn facts(pairs: &[(&str, Value)]) -> Facts {
        pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    #[test]
    fn test_empty_rule_set_returns_facts_verbatim() {
        let fixture = Fixture::new(vec![]);
        let input = facts(&[("x", Value::Int(3))]);
        let result = fixture.executor().reason(&input).expect("reasons");

        assert_eq!(result.verdict.get("x"), Some(&Value::Int(3)));
        assert!(result.writes.is_empty());
        assert!(result.fired.is_empty());
        assert_eq!(result.reasoning, "");
        assert!(result.complete());
    }

    #[test]
    fn test_single_always_true_rule_fires_once() {
        let fixture = Fixture::new(vec![
            RuleSpec::new("always", "true").action("done", json!(true))
        ]);
        let result = fixture.executor().reason(&Facts::new()).expect("reasons");
        assert_eq!(result.fired, vec!["always".to_string()]);
        assert_eq!(result.writes.get("done"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_chained_writes_flow_through_overlay() {
        let fixture = Fixture::new(vec![
            RuleSpec::new("first", "x > 0").action("y", json!("{{ x * 2 }}")),
            RuleSpec::new("second", "y == 6").action("z", json!("{{ y + 1 }}")),
        ]);
        let result = fixture
            .executor()
            .reason(&facts(&[("x", Value::Int(3))]))
            .expect("reasons");

        assert_eq!(result.fired, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(result.writes.get("y"), Some(&Value::Int(6)));
        assert_eq!(result.writes.get("z"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_same_rule_actions_see_earlier_writes() {
        let fixture = Fixture::new(vec![RuleSpec::new("quote", "base > 0")
            .action("subtotal", json!("{{ base * 2 }}"))
            .action("total", json!("{{ subtotal + 5 }}"))]);
        let result = fixture
            .executor()
            .reason(&facts(&[("base", Value::Int(10))]))
            .expect("reasons");

        assert_eq!(result.writes.get("subtotal"), Some(&Value::Int(20)));
        assert_eq!(result.writes.get("total"), Some(&Value::Int(25)));
    }

    #[test]
    fn test_undefined_field_demotes_without_error() {
        let fixture = Fixture::new(vec![
            RuleSpec::new("income", "annual_income > 50000").action("ok", json!(true))
        ]);
        let result = fixture.executor().reason(&Facts::new()).expect("reasons");

        assert!(result.fired.is_empty());
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].reason, "UndefinedField");
        assert_eq!(result.trace.len(), 1);
        assert_eq!(result.trace[0].error.as_deref(), Some("UndefinedField"));
    }

    #[test]
    fn test_division_by_zero_fatal_in_strict_mode() {
        let fixture = Fixture::new(vec![
            RuleSpec::new("ratio", "10 / x > 1").action("ok", json!(true))
        ]);
        let error = fixture
            .executor()
            .reason(&facts(&[("x", Value::Int(0))]))
            .expect_err("fatal");
        assert_eq!(
            error,
            ReasonError::RuleEvaluation {
                rule: "ratio".to_string(),
                source: EvalError::DivisionByZero,
            }
        );
    }

    #[test]
    fn test_division_by_zero_demotes_in_permissive_mode() {
        let fixture = Fixture::new(vec![
            RuleSpec::new("ratio", "10 / x > 1").action("ok", json!(true)),
            RuleSpec::new("other", "x == 0").action("fallback", json!(true)),
        ]);
        let mut executor = fixture.executor();
        executor.strategy = ErrorStrategy::Permissive;

        let result = executor
            .reason(&facts(&[("x", Value::Int(0))]))
            .expect("reasons");
        assert_eq!(result.fired, vec!["other".to_string()]);
        assert_eq!(result.skipped[0].reason, "DivisionByZero");
    }

    #[test]
    fn test_failed_action_discards_partial_writes() {
        // Second action divides by zero; the first action's write must not
        // leak into the overlay under the permissive strategy
        let fixture = Fixture::new(vec![RuleSpec::new("partial", "x > 0")
            .action("a", json!(1))
            .action("b", json!("{{ 1 / 0 }}"))]);
        let mut executor = fixture.executor();
        executor.strategy = ErrorStrategy::Permissive;

        let result = executor
            .reason(&facts(&[("x", Value::Int(1))]))
            .expect("reasons");
        assert!(result.fired.is_empty());
        assert!(result.writes.is_empty());
    }

    #[test]
    fn test_last_writer_wins_with_priority_layering() {
        let fixture = Fixture::new(vec![
            RuleSpec::new("standard", "eligible")
                .priority(50)
                .action("credit_limit", json!(25_000)),
            RuleSpec::new("vip", "eligible")
                .priority(100)
                .action("credit_limit", json!(50_000)),
        ]);
        let result = fixture
            .executor()
            .reason(&facts(&[("eligible", Value::Bool(true))]))
            .expect("reasons");

        // Ascending priority within the layer: standard fires first, vip
        // fires last and its write dominates
        assert_eq!(result.fired, vec!["standard".to_string(), "vip".to_string()]);
        assert_eq!(result.writes.get("credit_limit"), Some(&Value::Int(50_000)));
    }

    #[test]
    fn test_trigger_chain_attributes_parent() {
        let fixture = Fixture::new(vec![
            RuleSpec::new("a", "x > 0").action("y", json!(1)).trigger("b"),
            RuleSpec::new("b", "y == 1").action("z", json!(2)),
        ]);
        let result = fixture
            .executor()
            .reason(&facts(&[("x", Value::Int(3))]))
            .expect("reasons");

        assert_eq!(result.fired, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(result.writes.get("y"), Some(&Value::Int(1)));
        assert_eq!(result.writes.get("z"), Some(&Value::Int(2)));

        let entry = result.trace.iter().find(|e| e.rule_id == "b").expect("traced");
        assert_eq!(entry.triggered_by.as_deref(), Some("a"));
        assert!(result.reasoning.contains("(triggered by a)"));
    }

    #[test]
    fn test_trigger_queue_fires_rule_skipped_in_topo_pass() {
        // "late" sorts before "starter" in its layer only if independent;
        // here the trigger edge orders it after, but its condition depends
        // on starter's write, so it must not fire until the write lands
        let fixture = Fixture::new(vec![
            RuleSpec::new("starter", "x > 0").action("q", json!(1)).trigger("late"),
            RuleSpec::new("late", "q == 1").action("r", json!(2)),
        ]);
        let result = fixture
            .executor()
            .reason(&facts(&[("x", Value::Int(1))]))
            .expect("reasons");

        assert!(result.fired_rule("late"));
        assert_eq!(result.writes.get("r"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_rule_fires_at_most_once() {
        let fixture = Fixture::new(vec![
            RuleSpec::new("a", "x > 0").action("y", json!(1)).trigger("b"),
            RuleSpec::new("b", "x > 0").action("z", json!(1)).trigger("c"),
            RuleSpec::new("c", "z == 1").action("w", json!(1)),
        ]);
        let result = fixture
            .executor()
            .reason(&facts(&[("x", Value::Int(1))]))
            .expect("reasons");

        let mut sorted = result.fired.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), result.fired.len(), "no rule fires twice");
        assert_eq!(result.fired.len(), 3);
    }

    #[test]
    fn test_trigger_target_with_false_condition_stays_quiet() {
        let fixture = Fixture::new(vec![
            RuleSpec::new("a", "x > 0").action("y", json!(1)).trigger("b"),
            RuleSpec::new("b", "y == 99").action("z", json!(2)),
        ]);
        let result = fixture
            .executor()
            .reason(&facts(&[("x", Value::Int(1))]))
            .expect("reasons");

        // b was evaluated (trigger reachability) but did not fire
        assert_eq!(result.fired, vec!["a".to_string()]);
        assert!(result.writes.get("z").is_none());
    }

    #[test]
    fn test_cancellation_returns_partial_result() {
        let fixture = Fixture::new(vec![
            RuleSpec::new("only", "true").action("done", json!(true))
        ]);
        let handle = CancelHandle::new();
        handle.cancel();

        let options = CallOptions {
            deadline: None,
            cancel: Some(handle),
        };
        let result = fixture
            .executor()
            .reason_with(&Facts::new(), &options)
            .expect("partial result");

        assert!(result.cancelled);
        assert!(!result.timed_out);
        assert!(result.fired.is_empty());
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].reason, "Cancelled");
    }

    #[test]
    fn test_verbose_trace_includes_non_firing() {
        let fixture = Fixture::new(vec![
            RuleSpec::new("quiet", "x > 10").action("y", json!(1))
        ]);
        let mut executor = fixture.executor();
        executor.verbose_trace = true;

        let result = executor
            .reason(&facts(&[("x", Value::Int(1))]))
            .expect("reasons");
        assert!(result.reasoning.contains("✗ quiet"));
        assert_eq!(result.trace.len(), 1);
        assert!(!result.trace[0].fired);
    }

    #[test]
    fn test_determinism_same_inputs_same_result() {
        let specs = || {
            vec![
                RuleSpec::new("a", "x > 0").action("y", json!("{{ x * 2 }}")),
                RuleSpec::new("b", "y > 4").action("z", json!("{{ y - 1 }}")),
                RuleSpec::new("c", "x > 1").priority(10).action("w", json!(1)),
            ]
        };
        let fixture = Fixture::new(specs());
        let input = facts(&[("x", Value::Int(3))]);

        let first = fixture.executor().reason(&input).expect("reasons");
        let second = fixture.executor().reason(&input).expect("reasons");

        assert_eq!(first.verdict, second.verdict);
        assert_eq!(first.fired, second.fired);
        assert_eq!(first.reasoning, second.reasoning);
    }

    #[test]
    fn test_elapsed_is_reported() {
        let fixture = Fixture::new(vec![
            RuleSpec::new("only", "true").action("done", json!(true))
        ]);
        let result = fixture.executor().reason(&Facts::new()).expect("reasons");
        assert!(result.elapsed < Duration::from_secs(1));
    }
}
