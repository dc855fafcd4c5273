//! Fact maps and the evaluation environment.
//!
//! A [`Facts`] map is the read-only input to one `reason` call. During
//! execution the engine layers an overlay of rule writes on top of it; the
//! [`EnvView`] gives the evaluator the combined overlay-first view.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An ordered mapping of identifier names to values.
///
/// Ordered (BTreeMap) so that verdict assembly and rendering are
/// deterministic regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Facts(BTreeMap<String, Value>);

impl Facts {
    pub fn new() -> Self {
        Facts(BTreeMap::new())
    }

    /// Insert a fact. Returns the previous value for the name, if any.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Whether the name is bound at all (a binding to `Null` counts).
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Facts {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Facts(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Overlay-first read view over the original facts.
///
/// Rule writes accumulate in the overlay; a read consults the overlay first
/// and falls back to the base facts. The view distinguishes "bound to Null"
/// from "absent" so the safe-read idiom can behave per the null-distinction
/// contract.
#[derive(Debug, Clone, Copy)]
pub struct EnvView<'a> {
    base: &'a Facts,
    overlay: &'a BTreeMap<String, Value>,
}

impl<'a> EnvView<'a> {
    pub fn new(base: &'a Facts, overlay: &'a BTreeMap<String, Value>) -> Self {
        EnvView { base, overlay }
    }

    /// Look up a name, overlay first. `None` means the name is unbound.
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.overlay.get(name).or_else(|| self.base.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.overlay.contains_key(name) || self.base.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facts_set_and_get() {
        let mut facts = Facts::new();
        assert!(facts.set("score", 800i64).is_none());
        assert_eq!(facts.get("score"), Some(&Value::Int(800)));
        assert_eq!(facts.set("score", 750i64), Some(Value::Int(800)));
    }

    #[test]
    fn test_facts_null_binding_is_present() {
        let facts: Facts = [("maybe", Value::Null)].into_iter().collect();
        assert!(facts.contains("maybe"));
        assert_eq!(facts.get("maybe"), Some(&Value::Null));
        assert!(!facts.contains("absent"));
    }

    #[test]
    fn test_env_view_overlay_wins() {
        let facts: Facts = [("x", 1i64), ("y", 2i64)].into_iter().collect();
        let mut overlay = BTreeMap::new();
        overlay.insert("x".to_string(), Value::Int(10));

        let env = EnvView::new(&facts, &overlay);
        assert_eq!(env.get("x"), Some(&Value::Int(10)));
        assert_eq!(env.get("y"), Some(&Value::Int(2)));
        assert_eq!(env.get("z"), None);
    }

    #[test]
    fn test_facts_iterate_in_name_order() {
        let facts: Facts = [("b", 2i64), ("a", 1i64), ("c", 3i64)]
            .into_iter()
            .collect();
        let names: Vec<&str> = facts.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
