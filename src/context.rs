//! Layered variable resolution scope for one run.
//!
//! A context is an override layer plus a defaults layer on top of a
//! read-only parent snapshot. Lookup consults every override layer
//! (innermost first) before any defaults layer, so a runtime or local
//! override always beats a script/environment default regardless of
//! nesting depth. Parents are shared by `Arc` and never mutated;
//! concurrent children each own their layers, so no locking is needed.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    parent: Option<Arc<ExecutionContext>>,
    overrides: HashMap<String, Value>,
    defaults: HashMap<String, Value>,
}

impl ExecutionContext {
    /// Empty root context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Root context for a run: built-in variables, visible to every
    /// descendant unless shadowed.
    pub fn root(run_id: &str) -> Self {
        let now = Utc::now();
        let mut ctx = Self::new();
        ctx.bind("run_id", Value::String(run_id.to_string()));
        ctx.bind("timestamp", Value::String(now.to_rfc3339()));
        ctx.bind(
            "timestamp_ms",
            Value::Number(now.timestamp_millis().into()),
        );
        ctx
    }

    /// Fresh run id for a root context.
    pub fn new_run_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// New child context wrapping a read-only snapshot of `self`.
    /// The child owns `overrides`; the parent is untouched.
    pub fn child(&self, overrides: HashMap<String, Value>) -> Self {
        Self {
            parent: Some(Arc::new(self.clone())),
            overrides,
            defaults: HashMap::new(),
        }
    }

    /// Bind a name in the owned override layer. Used by executors to
    /// publish extracted variables to subsequent siblings.
    pub fn bind(&mut self, name: &str, value: Value) {
        self.overrides.insert(name.to_string(), value);
    }

    /// Bind a name in the owned defaults layer (lowest precedence).
    pub fn bind_default(&mut self, name: &str, value: Value) {
        self.defaults.insert(name.to_string(), value);
    }

    /// Resolve a variable: override chain first (innermost wins),
    /// then defaults chain. Deterministic and side-effect-free.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        self.lookup_override(name)
            .or_else(|| self.lookup_default(name))
    }

    fn lookup_override(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.overrides.get(name) {
            return Some(value.clone());
        }
        self.parent
            .as_ref()
            .and_then(|parent| parent.lookup_override(name))
    }

    fn lookup_default(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.defaults.get(name) {
            return Some(value.clone());
        }
        self.parent
            .as_ref()
            .and_then(|parent| parent.lookup_default(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn overrides(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_child_override_beats_parent() {
        let mut parent = ExecutionContext::new();
        parent.bind("n", json!("parent"));
        let child = parent.child(overrides(&[("n", json!("child"))]));

        assert_eq!(child.resolve("n"), Some(json!("child")));
        // parent untouched
        assert_eq!(parent.resolve("n"), Some(json!("parent")));
    }

    #[test]
    fn test_parent_visible_through_child() {
        let mut parent = ExecutionContext::new();
        parent.bind("a", json!(1));
        let child = parent.child(HashMap::new());
        let grandchild = child.child(HashMap::new());

        assert_eq!(grandchild.resolve("a"), Some(json!(1)));
    }

    #[test]
    fn test_any_override_beats_any_default() {
        // A default bound deep in the chain must lose to an override
        // bound anywhere above it.
        let mut root = ExecutionContext::new();
        root.bind("timeout", json!(5));
        let mut leaf = root.child(HashMap::new());
        leaf.bind_default("timeout", json!(30));

        assert_eq!(leaf.resolve("timeout"), Some(json!(5)));
    }

    #[test]
    fn test_default_used_when_nothing_overrides() {
        let root = ExecutionContext::new();
        let mut leaf = root.child(HashMap::new());
        leaf.bind_default("retries", json!(3));

        assert_eq!(leaf.resolve("retries"), Some(json!(3)));
    }

    #[test]
    fn test_undefined_resolves_to_none() {
        let ctx = ExecutionContext::new();
        assert_eq!(ctx.resolve("missing"), None);
    }

    #[test]
    fn test_new_context_starts_empty() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.resolve("anything"), None);
        ctx.bind_default("anything", json!("fallback"));
        assert_eq!(ctx.resolve("anything"), Some(json!("fallback")));
    }

    #[test]
    fn test_root_builtins_present() {
        let ctx = ExecutionContext::root("run-1");
        assert_eq!(ctx.resolve("run_id"), Some(json!("run-1")));
        assert!(ctx.resolve("timestamp").is_some());
        assert!(ctx.resolve("timestamp_ms").is_some());
    }

    #[test]
    fn test_builtin_shadowing() {
        let root = ExecutionContext::root("run-1");
        let child =
            root.child(overrides(&[("run_id", json!("shadowed"))]));
        assert_eq!(child.resolve("run_id"), Some(json!("shadowed")));
    }

    #[test]
    fn test_sibling_snapshots_are_isolated() {
        let mut parent = ExecutionContext::new();
        parent.bind("shared", json!("base"));

        let mut left = parent.child(HashMap::new());
        let right = parent.child(HashMap::new());
        left.bind("token", json!("left-only"));

        assert_eq!(right.resolve("token"), None);
        assert_eq!(right.resolve("shared"), Some(json!("base")));
    }
}
