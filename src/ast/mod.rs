//! # Expression AST
//!
//! Abstract syntax tree for the condition and template sub-language:
//! arithmetic, comparison, boolean logic, member access, indexing, function
//! calls, the `in` operator, a ternary conditional, and the structured
//! `all`/`any`/`not` combinators.
//!
//! Nodes are immutable after parsing. `Display` produces the normalized
//! expression text used in reasoning strings; re-parsing that text yields a
//! structurally identical tree (for trees the flat grammar can express).

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Binary operators, in the flat grammar's precedence groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// Surface token for this operator.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    /// Binding strength under the flat grammar:
    /// `or` < `and` < comparison < additive < multiplicative.
    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            _ if self.is_comparison() => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            _ => 5,
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// An expression tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// A constant value.
    Literal(Value),
    /// A free read of a fact or overlay field.
    Ref(String),
    /// Binary operation.
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Unary operation (`not`, arithmetic negation).
    Unary { op: UnaryOp, inner: Box<Expr> },
    /// Function call through the registry.
    Call { name: String, args: Vec<Expr> },
    /// List index or map key access (`container[key]`, `container.key`).
    Index {
        container: Box<Expr>,
        key: Box<Expr>,
    },
    /// Membership test (`value in list`).
    MemberOf { value: Box<Expr>, list: Box<Expr> },
    /// Ternary conditional (`cond ? then : else`).
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// Structured conjunction: true iff every child is truthy.
    All(Vec<Expr>),
    /// Structured disjunction: true iff any child is truthy.
    Any(Vec<Expr>),
    /// Structured negation.
    Not(Box<Expr>),
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn reference(name: impl Into<String>) -> Expr {
        Expr::Ref(name.into())
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Literal(_))
    }

    /// Collect every field name this expression reads via `Ref` nodes.
    /// Function names are not field reads and are excluded by construction
    /// (calls are a distinct node variant).
    pub fn collect_refs(&self, into: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ref(name) => {
                into.insert(name.clone());
            }
            Expr::Binary { left, right, .. } => {
                left.collect_refs(into);
                right.collect_refs(into);
            }
            Expr::Unary { inner, .. } => inner.collect_refs(into),
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_refs(into);
                }
            }
            Expr::Index { container, key } => {
                container.collect_refs(into);
                key.collect_refs(into);
            }
            Expr::MemberOf { value, list } => {
                value.collect_refs(into);
                list.collect_refs(into);
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                cond.collect_refs(into);
                then.collect_refs(into);
                otherwise.collect_refs(into);
            }
            Expr::All(children) | Expr::Any(children) => {
                for child in children {
                    child.collect_refs(into);
                }
            }
            Expr::Not(inner) => inner.collect_refs(into),
        }
    }

    /// Collect every call site as `(function_name, arg_count)`, for
    /// compile-time arity validation against the registry.
    pub fn collect_calls<'a>(&'a self, into: &mut Vec<(&'a str, usize)>) {
        match self {
            Expr::Literal(_) | Expr::Ref(_) => {}
            Expr::Binary { left, right, .. } => {
                left.collect_calls(into);
                right.collect_calls(into);
            }
            Expr::Unary { inner, .. } => inner.collect_calls(into),
            Expr::Call { name, args } => {
                into.push((name.as_str(), args.len()));
                for arg in args {
                    arg.collect_calls(into);
                }
            }
            Expr::Index { container, key } => {
                container.collect_calls(into);
                key.collect_calls(into);
            }
            Expr::MemberOf { value, list } => {
                value.collect_calls(into);
                list.collect_calls(into);
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                cond.collect_calls(into);
                then.collect_calls(into);
                otherwise.collect_calls(into);
            }
            Expr::All(children) | Expr::Any(children) => {
                for child in children {
                    child.collect_calls(into);
                }
            }
            Expr::Not(inner) => inner.collect_calls(into),
        }
    }

    /// Binding strength for normalized rendering. Higher binds tighter.
    fn precedence(&self) -> u8 {
        match self {
            Expr::Conditional { .. } => 0,
            Expr::Binary { op, .. } => op.precedence(),
            Expr::MemberOf { .. } => 3,
            Expr::Unary { .. } => 6,
            Expr::Index { .. } => 7,
            Expr::Literal(_) | Expr::Ref(_) | Expr::Call { .. } => 8,
            // Rendered as and/or joins, which bind like the operators
            Expr::All(_) => 2,
            Expr::Any(_) => 1,
            Expr::Not(_) => 6,
        }
    }

    fn fmt_child(&self, f: &mut fmt::Formatter<'_>, min_prec: u8) -> fmt::Result {
        if self.precedence() < min_prec {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::Ref(name) => write!(f, "{}", name),
            Expr::Binary { op, left, right } => {
                let prec = op.precedence();
                left.fmt_child(f, prec)?;
                write!(f, " {} ", op.symbol())?;
                // Left-associative: parenthesize an equal-precedence right child
                right.fmt_child(f, prec + 1)
            }
            Expr::Unary { op, inner } => match op {
                UnaryOp::Not => {
                    write!(f, "not ")?;
                    inner.fmt_child(f, 6)
                }
                UnaryOp::Neg => {
                    write!(f, "-")?;
                    inner.fmt_child(f, 6)
                }
            },
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Index { container, key } => {
                container.fmt_child(f, 7)?;
                match key.as_ref() {
                    Expr::Literal(Value::String(s)) if is_identifier(s) => {
                        write!(f, ".{}", s)
                    }
                    other => write!(f, "[{}]", other),
                }
            }
            Expr::MemberOf { value, list } => {
                value.fmt_child(f, 4)?;
                write!(f, " in ")?;
                list.fmt_child(f, 4)
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                cond.fmt_child(f, 1)?;
                write!(f, " ? ")?;
                then.fmt_child(f, 1)?;
                write!(f, " : ")?;
                otherwise.fmt_child(f, 0)
            }
            Expr::All(children) => {
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " and ")?;
                    }
                    child.fmt_child(f, 3)?;
                }
                Ok(())
            }
            Expr::Any(children) => {
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " or ")?;
                    }
                    child.fmt_child(f, 2)?;
                }
                Ok(())
            }
            Expr::Not(inner) => {
                write!(f, "not ")?;
                inner.fmt_child(f, 6)
            }
        }
    }
}
