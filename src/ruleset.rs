//! # Rule Sets
//!
//! Ingests declarative rule records ([`RuleSpec`]), compiles them once into
//! immutable [`Rule`]s, and derives the artifacts the executor and backward
//! chainer need: the id index, the dependency graph, the topological
//! layering, and the reverse index from field name to writing rules.
//!
//! Compilation is the only place rules are validated: duplicate or empty
//! ids, malformed expressions, unknown functions, call-site arity, dangling
//! trigger ids, and dependency cycles are all compile-time errors.

use crate::ast::{self, Expr};
use crate::dependency::{self, DependencyGraph};
use crate::functions::FunctionRegistry;
use crate::parser::{self, ParseError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

/// Default rule priority when a spec omits one.
pub const DEFAULT_PRIORITY: i64 = 100;

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

/// Compile-time failure. Aborts rule set construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("rule '{rule}': {source}")]
    Parse {
        rule: String,
        #[source]
        source: ParseError,
    },

    #[error("duplicate rule id '{0}'")]
    DuplicateRuleId(String),

    #[error("rule id must be a non-empty identifier, got '{0}'")]
    InvalidRuleId(String),

    #[error("rule '{rule}': action target must be a non-empty identifier, got '{target}'")]
    InvalidActionTarget { rule: String, target: String },

    #[error("rule '{rule}': unknown function '{function}'")]
    UnknownFunction { rule: String, function: String },

    #[error("rule '{rule}': function '{function}' expects {expected} arguments, got {got}")]
    ArityMismatch {
        rule: String,
        function: String,
        expected: String,
        got: usize,
    },

    #[error("rule '{rule}': trigger '{trigger}' does not resolve to any rule")]
    UnresolvedTrigger { rule: String, trigger: String },

    #[error("cyclic rule dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
}

/// The condition of a not-yet-compiled rule: a flat expression string, a
/// structured `all`/`any`/`not` form, or an AST built programmatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    Text(String),
    Ast { ast: Expr },
    Structured(serde_json::Value),
}

/// A declarative rule record as produced by a surface-syntax loader.
///
/// Actions are an ordered list of `(field, template)` pairs; a later action
/// of the same rule observes the writes of earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,

    #[serde(default = "default_priority")]
    pub priority: i64,

    pub condition: ConditionSpec,

    #[serde(default)]
    pub actions: Vec<(String, serde_json::Value)>,

    #[serde(default)]
    pub triggers: Vec<String>,

    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl RuleSpec {
    pub fn new(id: impl Into<String>, condition: impl Into<String>) -> Self {
        RuleSpec {
            id: id.into(),
            priority: DEFAULT_PRIORITY,
            condition: ConditionSpec::Text(condition.into()),
            actions: Vec::new(),
            triggers: Vec::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Append an action. The template follows the action-value rules: a
    /// `{{ ... }}` string is an expression, any other string is a literal,
    /// non-strings are literals of their inferred type.
    pub fn action(mut self, field: impl Into<String>, template: serde_json::Value) -> Self {
        self.actions.push((field.into(), template));
        self
    }

    pub fn trigger(mut self, id: impl Into<String>) -> Self {
        self.triggers.push(id.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// A compiled rule. Immutable after compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: String,
    pub priority: i64,
    pub condition: Expr,
    /// Normalized condition text, rendered once for traces.
    pub condition_text: String,
    pub actions: Vec<(String, Expr)>,
    pub triggers: Vec<String>,
    pub tags: BTreeSet<String>,
    /// Fields freely read by the condition and action templates.
    pub reads: BTreeSet<String>,
    /// Fields written by the actions.
    pub writes: BTreeSet<String>,
}

impl Rule {
    /// Assemble a rule from parsed parts, deriving the read/write sets and
    /// the normalized condition text.
    pub fn from_parts(
        id: String,
        priority: i64,
        condition: Expr,
        actions: Vec<(String, Expr)>,
        triggers: Vec<String>,
        tags: Vec<String>,
    ) -> Self {
        let reads = dependency::read_set(&condition, &actions);
        let writes = dependency::write_set(&actions);
        let condition_text = condition.to_string();
        Rule {
            id,
            priority,
            condition,
            condition_text,
            actions,
            triggers,
            tags: tags.into_iter().collect(),
            reads,
            writes,
        }
    }
}

/// A compiled collection of rules plus derived artifacts.
///
/// Immutable and `Send + Sync`: safe to share across threads and reuse for
/// any number of `reason` calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    rules: Vec<Rule>,
    by_id: BTreeMap<String, usize>,
    graph: DependencyGraph,
    /// Topological layers; within a layer, ascending priority (then id), so
    /// the highest-priority rule fires last and its writes dominate.
    layers: Vec<Vec<String>>,
    order: Vec<String>,
    writers: BTreeMap<String, BTreeSet<String>>,
}

impl RuleSet {
    /// Compile rule specs against a populated function registry.
    pub fn compile(
        specs: Vec<RuleSpec>,
        registry: &FunctionRegistry,
    ) -> Result<RuleSet, CompileError> {
        let mut rules = Vec::with_capacity(specs.len());
        let mut by_id = BTreeMap::new();

        for spec in specs {
            if !ast::is_identifier(&spec.id) {
                return Err(CompileError::InvalidRuleId(spec.id));
            }
            if by_id.contains_key(&spec.id) {
                return Err(CompileError::DuplicateRuleId(spec.id));
            }

            let condition = compile_condition(&spec.id, &spec.condition)?;

            let mut actions = Vec::with_capacity(spec.actions.len());
            for (target, template) in &spec.actions {
                if !ast::is_identifier(target) {
                    return Err(CompileError::InvalidActionTarget {
                        rule: spec.id.clone(),
                        target: target.clone(),
                    });
                }
                let template = parser::parse_template(template).map_err(|source| {
                    CompileError::Parse {
                        rule: spec.id.clone(),
                        source,
                    }
                })?;
                actions.push((target.clone(), template));
            }

            let rule = Rule::from_parts(
                spec.id,
                spec.priority,
                condition,
                actions,
                spec.triggers,
                spec.tags.into_iter().collect(),
            );
            validate_calls(registry, &rule)?;

            by_id.insert(rule.id.clone(), rules.len());
            rules.push(rule);
        }

        for rule in &rules {
            for trigger in &rule.triggers {
                if !by_id.contains_key(trigger) {
                    return Err(CompileError::UnresolvedTrigger {
                        rule: rule.id.clone(),
                        trigger: trigger.clone(),
                    });
                }
            }
            if dependency::self_dependency(rule) {
                return Err(CompileError::CyclicDependency {
                    cycle: vec![rule.id.clone()],
                });
            }
        }

        let graph = dependency::build_graph(&rules);
        let layers = dependency::topo_layers(&graph, |id| {
            by_id.get(id).map_or(DEFAULT_PRIORITY, |&i| rules[i].priority)
        })
        .map_err(|cycle| CompileError::CyclicDependency { cycle })?;
        let order: Vec<String> = layers.iter().flatten().cloned().collect();

        let mut writers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for rule in &rules {
            for field in &rule.writes {
                writers
                    .entry(field.clone())
                    .or_default()
                    .insert(rule.id.clone());
            }
        }

        debug!(
            rules = rules.len(),
            layers = layers.len(),
            edges = graph.edge_count(),
            "compiled rule set"
        );

        Ok(RuleSet {
            rules,
            by_id,
            graph,
            layers,
            order,
            writers,
        })
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.by_id.get(id).map(|&i| &self.rules[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Topological layers with the pinned in-layer ordering.
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Flattened execution order for one pass.
    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Rules that write the given field, for backward chaining.
    pub fn writers_of(&self, field: &str) -> impl Iterator<Item = &Rule> {
        self.writers
            .get(field)
            .into_iter()
            .flatten()
            .filter_map(|id| self.get(id))
    }

    pub fn writes_field(&self, field: &str) -> bool {
        self.writers.contains_key(field)
    }
}

fn compile_condition(rule_id: &str, spec: &ConditionSpec) -> Result<Expr, CompileError> {
    let wrap = |source: ParseError| CompileError::Parse {
        rule: rule_id.to_string(),
        source,
    };
    match spec {
        ConditionSpec::Text(text) => parser::parse_expression(text).map_err(wrap),
        ConditionSpec::Ast { ast } => Ok(ast.clone()),
        ConditionSpec::Structured(json) => parser::parse_structured(json).map_err(wrap),
    }
}

fn validate_calls(registry: &FunctionRegistry, rule: &Rule) -> Result<(), CompileError> {
    let mut calls = Vec::new();
    rule.condition.collect_calls(&mut calls);
    for (_, template) in &rule.actions {
        template.collect_calls(&mut calls);
    }

    for (name, argc) in calls {
        let Some(descriptor) = registry.get(name) else {
            return Err(CompileError::UnknownFunction {
                rule: rule.id.clone(),
                function: name.to_string(),
            });
        };
        if !descriptor.accepts_arity(argc) {
            return Err(CompileError::ArityMismatch {
                rule: rule.id.clone(),
                function: name.to_string(),
                expected: descriptor.arity_description(),
                got: argc,
            });
        }
    }
    Ok(())
}
