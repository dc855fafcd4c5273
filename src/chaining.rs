//! # Backward Chaining
//!
//! Goal-directed reachability analysis over a compiled rule set. Never
//! executes actions; it answers which rules *could* assign a requested
//! output, and whether some rule could fire given the facts at hand.
//!
//! The achievability check is optimistic and three-valued: fields present
//! in the facts evaluate concretely, a missing field no rule writes is a
//! free input (any extension of the fact map may supply it), and a missing
//! field some rule writes becomes a sub-goal for its writers. The search is
//! a depth-bounded DFS memoized on `(rule id, goal field)`; returning true
//! is necessary but not sufficient for the goal to be reachable.

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::facts::Facts;
use crate::ruleset::{Rule, RuleSet};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Default bound on the writer-chain depth explored by `can_achieve`.
pub const DEFAULT_CHAIN_DEPTH: usize = 16;

/// A backward-chaining goal: desired output fields, each optionally pinned
/// to a desired value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Goal {
    targets: BTreeMap<String, Option<Value>>,
}

impl Goal {
    /// Goal on a single field, any value.
    pub fn field(name: impl Into<String>) -> Self {
        Goal::default().with_field(name)
    }

    /// Goal requiring a specific value for a field.
    pub fn binding(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Goal::default().with_binding(name, value)
    }

    pub fn with_field(mut self, name: impl Into<String>) -> Self {
        self.targets.insert(name.into(), None);
        self
    }

    pub fn with_binding(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.targets.insert(name.into(), Some(value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, Option<&Value>)> {
        self.targets.iter().map(|(k, v)| (k, v.as_ref()))
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Three-valued truth for the optimistic condition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Tri {
    False,
    Unknown,
    True,
}

impl Tri {
    fn not(self) -> Tri {
        match self {
            Tri::True => Tri::False,
            Tri::False => Tri::True,
            Tri::Unknown => Tri::Unknown,
        }
    }
}

/// Static approximation of an expression's value.
#[derive(Debug, Clone, PartialEq)]
enum Approx {
    Known(Value),
    /// Could be anything (missing free input, function result, ...).
    Unknown,
    /// Cannot be produced: only writable by rules that cannot fire.
    Unreachable,
}

/// Goal-directed queries over one compiled rule set.
pub struct BackwardChainer<'a> {
    rule_set: &'a RuleSet,
    max_depth: usize,
}

struct Search {
    memo: BTreeMap<(String, String), bool>,
    visiting: BTreeSet<(String, String)>,
}

impl<'a> BackwardChainer<'a> {
    pub fn new(rule_set: &'a RuleSet) -> Self {
        BackwardChainer {
            rule_set,
            max_depth: DEFAULT_CHAIN_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Every rule whose write set intersects the goal's fields and whose
    /// action template for that field could produce the requested value.
    /// A literal template must equal the requested literal; a non-literal
    /// template matches conservatively.
    pub fn rules_for_goal(&self, goal: &Goal) -> Vec<&'a Rule> {
        let mut seen = BTreeSet::new();
        let mut rules = Vec::new();
        for (field, desired) in goal.iter() {
            for rule in self.rule_set.writers_of(field) {
                if template_matches(rule, field, desired) && seen.insert(rule.id.as_str()) {
                    rules.push(rule);
                }
            }
        }
        rules
    }

    /// True iff every goal field is already bound to a matching value or
    /// could be produced by some rule whose condition could hold.
    pub fn can_achieve(&self, goal: &Goal, facts: &Facts) -> bool {
        let mut search = Search {
            memo: BTreeMap::new(),
            visiting: BTreeSet::new(),
        };
        goal.iter()
            .all(|(field, desired)| self.achievable(field, desired, facts, &mut search, self.max_depth))
    }

    fn achievable(
        &self,
        field: &str,
        desired: Option<&Value>,
        facts: &Facts,
        search: &mut Search,
        depth: usize,
    ) -> bool {
        if let Some(present) = facts.get(field) {
            match desired {
                Some(want) => {
                    if present.loose_eq(want) {
                        return true;
                    }
                }
                None => return true,
            }
        }
        if depth == 0 {
            // Bound reached: stay conservative
            return true;
        }

        for rule in self.rule_set.writers_of(field) {
            if !template_matches(rule, field, desired) {
                continue;
            }
            let key = (rule.id.clone(), field.to_string());
            if let Some(&cached) = search.memo.get(&key) {
                if cached {
                    return true;
                }
                continue;
            }
            if !search.visiting.insert(key.clone()) {
                // Already on the current path; the graph is acyclic so this
                // is a shared sub-goal, not a loop. Assume reachable.
                return true;
            }
            let could = self.could_hold(&rule.condition, facts, search, depth - 1) != Tri::False;
            search.visiting.remove(&key);
            search.memo.insert(key, could);
            if could {
                return true;
            }
        }
        false
    }

    /// Optimistic three-valued condition check.
    fn could_hold(&self, expr: &Expr, facts: &Facts, search: &mut Search, depth: usize) -> Tri {
        match expr {
            Expr::Binary {
                op: BinaryOp::And, left, right,
            } => self
                .could_hold(left, facts, search, depth)
                .min(self.could_hold(right, facts, search, depth)),
            Expr::Binary {
                op: BinaryOp::Or, left, right,
            } => self
                .could_hold(left, facts, search, depth)
                .max(self.could_hold(right, facts, search, depth)),
            Expr::Binary { op, left, right } if op.is_comparison() => {
                let l = self.approx(left, facts, search, depth);
                let r = self.approx(right, facts, search, depth);
                compare_approx(*op, &l, &r)
            }
            Expr::Unary {
                op: UnaryOp::Not,
                inner,
            }
            | Expr::Not(inner) => self.could_hold(inner, facts, search, depth).not(),
            Expr::All(children) => children
                .iter()
                .map(|child| self.could_hold(child, facts, search, depth))
                .min()
                .unwrap_or(Tri::True),
            Expr::Any(children) => children
                .iter()
                .map(|child| self.could_hold(child, facts, search, depth))
                .max()
                .unwrap_or(Tri::False),
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => match self.could_hold(cond, facts, search, depth) {
                Tri::True => self.could_hold(then, facts, search, depth),
                Tri::False => self.could_hold(otherwise, facts, search, depth),
                Tri::Unknown => self
                    .could_hold(then, facts, search, depth)
                    .max(self.could_hold(otherwise, facts, search, depth)),
            },
            other => truthiness(&self.approx(other, facts, search, depth)),
        }
    }

    /// Static value approximation.
    fn approx(&self, expr: &Expr, facts: &Facts, search: &mut Search, depth: usize) -> Approx {
        match expr {
            Expr::Literal(value) => Approx::Known(value.clone()),
            Expr::Ref(name) => {
                if let Some(value) = facts.get(name) {
                    return Approx::Known(value.clone());
                }
                if !self.rule_set.writes_field(name) {
                    // Free input: any extension of the facts may supply it
                    return Approx::Unknown;
                }
                if self.achievable(name, None, facts, search, depth) {
                    Approx::Unknown
                } else {
                    Approx::Unreachable
                }
            }
            Expr::Binary { op, left, right } => {
                if matches!(op, BinaryOp::And | BinaryOp::Or) || op.is_comparison() {
                    return tri_to_approx(self.could_hold(expr, facts, search, depth));
                }
                let l = self.approx(left, facts, search, depth);
                let r = self.approx(right, facts, search, depth);
                arithmetic_approx(*op, &l, &r)
            }
            Expr::Unary {
                op: UnaryOp::Neg,
                inner,
            } => match self.approx(inner, facts, search, depth) {
                Approx::Known(Value::Int(i)) => Approx::Known(Value::Int(i.saturating_neg())),
                Approx::Known(Value::Float(f)) => Approx::Known(Value::Float(-f)),
                Approx::Unreachable => Approx::Unreachable,
                _ => Approx::Unknown,
            },
            Expr::Unary {
                op: UnaryOp::Not, ..
            }
            | Expr::Not(_)
            | Expr::All(_)
            | Expr::Any(_) => tri_to_approx(self.could_hold(expr, facts, search, depth)),
            Expr::Call { .. } => Approx::Unknown,
            Expr::Index { container, key } => {
                let c = self.approx(container, facts, search, depth);
                let k = self.approx(key, facts, search, depth);
                match (c, k) {
                    (Approx::Unreachable, _) | (_, Approx::Unreachable) => Approx::Unreachable,
                    (Approx::Known(Value::List(items)), Approx::Known(Value::Int(i))) => {
                        usize::try_from(i)
                            .ok()
                            .and_then(|idx| items.get(idx).cloned())
                            .map_or(Approx::Unreachable, Approx::Known)
                    }
                    (Approx::Known(Value::Map(entries)), Approx::Known(Value::String(k))) => {
                        Approx::Known(entries.get(&k).cloned().unwrap_or(Value::Null))
                    }
                    _ => Approx::Unknown,
                }
            }
            Expr::MemberOf { value, list } => {
                let needle = self.approx(value, facts, search, depth);
                let haystack = self.approx(list, facts, search, depth);
                match (needle, haystack) {
                    (Approx::Unreachable, _) | (_, Approx::Unreachable) => Approx::Unreachable,
                    (Approx::Known(n), Approx::Known(Value::List(items))) => Approx::Known(
                        Value::Bool(items.iter().any(|item| item.loose_eq(&n))),
                    ),
                    _ => Approx::Unknown,
                }
            }
            Expr::Conditional { .. } => tri_to_approx(self.could_hold(expr, facts, search, depth)),
        }
    }
}

/// A literal template must equal the requested literal; anything else could
/// produce any value.
fn template_matches(rule: &Rule, field: &str, desired: Option<&Value>) -> bool {
    let Some(want) = desired else {
        return true;
    };
    let Some((_, template)) = rule.actions.iter().find(|(target, _)| target == field) else {
        return false;
    };
    match template {
        Expr::Literal(produced) => produced.loose_eq(want),
        _ => true,
    }
}

fn truthiness(approx: &Approx) -> Tri {
    match approx {
        Approx::Known(value) => {
            if value.is_truthy() {
                Tri::True
            } else {
                Tri::False
            }
        }
        Approx::Unknown => Tri::Unknown,
        Approx::Unreachable => Tri::False,
    }
}

fn tri_to_approx(tri: Tri) -> Approx {
    match tri {
        Tri::True => Approx::Known(Value::Bool(true)),
        Tri::False => Approx::Known(Value::Bool(false)),
        Tri::Unknown => Approx::Unknown,
    }
}

fn compare_approx(op: BinaryOp, l: &Approx, r: &Approx) -> Tri {
    match (l, r) {
        (Approx::Unreachable, _) | (_, Approx::Unreachable) => Tri::False,
        (Approx::Unknown, _) | (_, Approx::Unknown) => Tri::Unknown,
        (Approx::Known(a), Approx::Known(b)) => match op {
            BinaryOp::Eq => Tri::from_bool_checked(a, b, a.loose_eq(b)),
            BinaryOp::Ne => Tri::from_bool_checked(a, b, !a.loose_eq(b)),
            _ => match a.partial_compare(b) {
                Some(ordering) => {
                    let holds = match op {
                        BinaryOp::Lt => ordering.is_lt(),
                        BinaryOp::Le => ordering.is_le(),
                        BinaryOp::Gt => ordering.is_gt(),
                        _ => ordering.is_ge(),
                    };
                    if holds {
                        Tri::True
                    } else {
                        Tri::False
                    }
                }
                // A comparison that would be a type error cannot hold
                None => Tri::False,
            },
        },
    }
}

impl Tri {
    /// Equality over concrete values; a cross-category pair would fail with
    /// a type error at runtime, so it cannot hold here.
    fn from_bool_checked(a: &Value, b: &Value, holds: bool) -> Tri {
        let comparable = a.is_null()
            || b.is_null()
            || (a.is_numeric() && b.is_numeric())
            || std::mem::discriminant(a) == std::mem::discriminant(b);
        if !comparable {
            return Tri::False;
        }
        if holds {
            Tri::True
        } else {
            Tri::False
        }
    }
}

fn arithmetic_approx(op: BinaryOp, l: &Approx, r: &Approx) -> Approx {
    match (l, r) {
        (Approx::Unreachable, _) | (_, Approx::Unreachable) => Approx::Unreachable,
        (Approx::Known(a), Approx::Known(b)) if a.is_numeric() && b.is_numeric() => {
            if let (Value::Int(x), Value::Int(y)) = (a, b) {
                let result = match op {
                    BinaryOp::Add => x.checked_add(*y),
                    BinaryOp::Sub => x.checked_sub(*y),
                    BinaryOp::Mul => x.checked_mul(*y),
                    BinaryOp::Div => (*y != 0).then(|| x / y),
                    BinaryOp::Mod => (*y != 0).then(|| x % y),
                    _ => None,
                };
                return result.map_or(Approx::Unreachable, |v| Approx::Known(Value::Int(v)));
            }
            let x = a.as_f64().unwrap_or(0.0);
            let y = b.as_f64().unwrap_or(0.0);
            let result = match op {
                BinaryOp::Add => Some(x + y),
                BinaryOp::Sub => Some(x - y),
                BinaryOp::Mul => Some(x * y),
                BinaryOp::Div => (y != 0.0).then(|| x / y),
                BinaryOp::Mod => (y != 0.0).then(|| x % y),
                _ => None,
            };
            result.map_or(Approx::Unreachable, |v| Approx::Known(Value::Float(v)))
        }
        _ => Approx::Unknown,
    }
}
