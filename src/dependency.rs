//! # Dependency Analysis
//!
//! Static analysis of each rule's inputs and outputs, construction of the
//! rule dependency graph, cycle detection, and topological layering.
//!
//! An edge `A → B` exists when A writes a field B reads, and for every
//! trigger `B ∈ triggers(A)` (trigger chains are ordering obligations even
//! without shared fields). Any cycle is a compile-time error.
//!
//! Within a topological layer rules are ordered by ascending priority with
//! the id as final tie-breaker: the highest-priority rule fires last, so
//! under the last-writer-wins conflict policy its writes dominate.

use crate::ast::Expr;
use crate::ruleset::Rule;
use std::collections::{BTreeMap, BTreeSet};

/// Directed graph over rule ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    /// Rule id → ids that must evaluate after it.
    pub successors: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn successors_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.successors
            .get(id)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn edge_count(&self) -> usize {
        self.successors.values().map(BTreeSet::len).sum()
    }
}

/// Fields freely read by a rule: every `Ref` in the condition and in each
/// action template, excluding targets already written by an earlier action
/// of the same rule.
pub fn read_set(condition: &Expr, actions: &[(String, Expr)]) -> BTreeSet<String> {
    let mut reads = BTreeSet::new();
    condition.collect_refs(&mut reads);

    let mut written_so_far: BTreeSet<&str> = BTreeSet::new();
    for (target, template) in actions {
        let mut template_refs = BTreeSet::new();
        template.collect_refs(&mut template_refs);
        for name in template_refs {
            if !written_so_far.contains(name.as_str()) {
                reads.insert(name);
            }
        }
        written_so_far.insert(target.as_str());
    }
    reads
}

/// Fields a rule writes: its action targets.
pub fn write_set(actions: &[(String, Expr)]) -> BTreeSet<String> {
    actions.iter().map(|(target, _)| target.clone()).collect()
}

/// Build the dependency graph over compiled rules.
pub fn build_graph(rules: &[Rule]) -> DependencyGraph {
    let mut graph = DependencyGraph::default();
    for rule in rules {
        graph.successors.entry(rule.id.clone()).or_default();
    }

    for writer in rules {
        for reader in rules {
            if writer.id != reader.id && !writer.writes.is_disjoint(&reader.reads) {
                graph
                    .successors
                    .entry(writer.id.clone())
                    .or_default()
                    .insert(reader.id.clone());
            }
        }
        for triggered in &writer.triggers {
            if *triggered != writer.id {
                graph
                    .successors
                    .entry(writer.id.clone())
                    .or_default()
                    .insert(triggered.clone());
            }
        }
    }
    graph
}

/// A rule whose condition reads a field it writes depends on itself; report
/// it as a one-element cycle rather than letting layering silently skip it.
pub fn self_dependency(rule: &Rule) -> bool {
    !rule.writes.is_disjoint(&rule.reads)
        || rule.triggers.iter().any(|t| *t == rule.id)
}

/// Kahn layering. Returns the topological layers, each internally ordered
/// by ascending priority then ascending id.
///
/// On a cycle, returns `Err` with one witness cycle (ids in walk order).
pub fn topo_layers(
    graph: &DependencyGraph,
    priority_of: impl Fn(&str) -> i64,
) -> Result<Vec<Vec<String>>, Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = graph
        .successors
        .keys()
        .map(|id| (id.as_str(), 0))
        .collect();
    for successors in graph.successors.values() {
        for succ in successors {
            if let Some(count) = in_degree.get_mut(succ.as_str()) {
                *count += 1;
            }
        }
    }

    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut remaining: BTreeSet<&str> = in_degree.keys().copied().collect();

    loop {
        let mut ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| in_degree[id] == 0)
            .collect();
        if ready.is_empty() {
            break;
        }

        // Higher priority fires last within its layer so its writes win
        ready.sort_by(|a, b| {
            priority_of(a)
                .cmp(&priority_of(b))
                .then_with(|| a.cmp(b))
        });

        for id in &ready {
            remaining.remove(id);
            for succ in graph.successors_of(id) {
                if let Some(count) = in_degree.get_mut(succ) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        layers.push(ready.into_iter().map(String::from).collect());
    }

    if remaining.is_empty() {
        Ok(layers)
    } else {
        Err(find_cycle(graph, &remaining))
    }
}

/// Walk successors inside the stuck set until a node repeats; the repeated
/// segment is a genuine cycle.
fn find_cycle(graph: &DependencyGraph, stuck: &BTreeSet<&str>) -> Vec<String> {
    let start = stuck.iter().next().copied().unwrap_or_default();
    let mut path: Vec<&str> = vec![start];
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    seen.insert(start, 0);

    let mut current = start;
    loop {
        let Some(next) = graph
            .successors_of(current)
            .find(|succ| stuck.contains(succ))
        else {
            // Every stuck node has a successor in the stuck set; defensive exit
            return path.into_iter().map(String::from).collect();
        };
        if let Some(&at) = seen.get(next) {
            return path[at..].iter().map(|s| (*s).to_string()).collect();
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expression;

    fn rule(id: &str, priority: i64, condition: &str, actions: &[(&str, &str)]) -> Rule {
        let condition = parse_expression(condition).expect("condition parses");
        let actions: Vec<(String, Expr)> = actions
            .iter()
            .map(|(target, template)| {
                (
                    (*target).to_string(),
                    parse_expression(template).expect("template parses"),
                )
            })
            .collect();
        Rule::from_parts(id.to_string(), priority, condition, actions, vec![], vec![])
    }

    fn with_triggers(mut r: Rule, triggers: &[&str]) -> Rule {
        r.triggers = triggers.iter().map(|t| (*t).to_string()).collect();
        r
    }

    #[test]
    fn test_read_set_excludes_earlier_writes() {
        let condition = parse_expression("base > 0").expect("parses");
        let actions = vec![
            (
                "subtotal".to_string(),
                parse_expression("base * 2").expect("parses"),
            ),
            (
                "total".to_string(),
                parse_expression("subtotal + fee").expect("parses"),
            ),
        ];
        let reads = read_set(&condition, &actions);
        let names: Vec<&str> = reads.iter().map(String::as_str).collect();
        // `subtotal` is written by the first action, so the second action's
        // read of it is internal
        assert_eq!(names, vec!["base", "fee"]);
        assert_eq!(
            write_set(&actions).into_iter().collect::<Vec<_>>(),
            vec!["subtotal".to_string(), "total".to_string()]
        );
    }

    #[test]
    fn test_field_edges() {
        let a = rule("a", 100, "x > 0", &[("y", "1")]);
        let b = rule("b", 100, "y == 1", &[("z", "2")]);
        let graph = build_graph(&[a, b]);

        assert!(graph.successors_of("a").any(|s| s == "b"));
        assert!(!graph.successors_of("b").any(|s| s == "a"));
    }

    #[test]
    fn test_trigger_edges_without_shared_fields() {
        let a = with_triggers(rule("a", 100, "x > 0", &[("y", "1")]), &["b"]);
        let b = rule("b", 100, "q > 0", &[("r", "2")]);
        let graph = build_graph(&[a, b]);
        assert!(graph.successors_of("a").any(|s| s == "b"));
    }

    #[test]
    fn test_layers_follow_dependencies() {
        let a = rule("a", 100, "x > 0", &[("y", "1")]);
        let b = rule("b", 100, "y == 1", &[("z", "2")]);
        let c = rule("c", 100, "z == 2", &[("w", "3")]);
        let graph = build_graph(&[c.clone(), a.clone(), b.clone()]);

        let priorities: BTreeMap<&str, i64> = [("a", 100), ("b", 100), ("c", 100)].into();
        let layers = topo_layers(&graph, |id| priorities[id]).expect("acyclic");
        assert_eq!(
            layers,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string()],
                vec!["c".to_string()]
            ]
        );
    }

    #[test]
    fn test_in_layer_order_is_ascending_priority() {
        // Independent rules share a layer; priority 100 must come after
        // priority 50 so its writes dominate
        let low = rule("low_priority", 50, "eligible", &[("credit_limit", "25000")]);
        let high = rule("high_priority", 100, "eligible", &[("credit_limit", "50000")]);
        let graph = build_graph(&[high.clone(), low.clone()]);

        let priorities: BTreeMap<&str, i64> = [("low_priority", 50), ("high_priority", 100)].into();
        let layers = topo_layers(&graph, |id| priorities[id]).expect("acyclic");
        assert_eq!(
            layers,
            vec![vec!["low_priority".to_string(), "high_priority".to_string()]]
        );
    }

    #[test]
    fn test_id_breaks_priority_ties() {
        let first = rule("alpha", 100, "x > 0", &[("a", "1")]);
        let second = rule("beta", 100, "x > 0", &[("b", "1")]);
        let graph = build_graph(&[second, first]);

        let layers = topo_layers(&graph, |_| 100).expect("acyclic");
        assert_eq!(layers, vec![vec!["alpha".to_string(), "beta".to_string()]]);
    }

    #[test]
    fn test_cycle_detection_reports_members() {
        let a = rule("a", 100, "y > 0", &[("x", "1")]);
        let b = rule("b", 100, "x > 0", &[("y", "1")]);
        let graph = build_graph(&[a, b]);

        let cycle = topo_layers(&graph, |_| 100).expect_err("cycle expected");
        let mut members = cycle.clone();
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_self_dependency_detected() {
        let counter = rule("counter", 100, "count > 0", &[("count", "1")]);
        assert!(self_dependency(&counter));

        let clean = rule("clean", 100, "x > 0", &[("y", "1")]);
        assert!(!self_dependency(&clean));

        let self_trigger = with_triggers(rule("loop", 100, "x > 0", &[("y", "1")]), &["loop"]);
        assert!(self_dependency(&self_trigger));
    }
}
