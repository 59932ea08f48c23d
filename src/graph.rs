//! Pre-run graph resolution and validation.
//!
//! Before any HTTP call, the engine fetches every entity reachable
//! from the run target into an id-keyed arena and validates it:
//! references must exist, child refs must name exactly one target,
//! and the component graph must be acyclic both through child
//! references and through `parent_component_id` chains. Validation is
//! an explicit depth-first traversal with a visited set, never a
//! runtime recursion limit.

use crate::error::ConfigError;
use crate::model::{
    ApiDefinition, ChildRef, Component, NodeKind, Script, TestCase,
};
use crate::store::DefinitionStore;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// The reachable entity graph for one run, fully owned. Execution
/// works off this arena and never touches the store mid-run.
#[derive(Debug, Default)]
pub struct ResolvedGraph {
    pub apis: HashMap<String, ApiDefinition>,
    pub scripts: HashMap<String, Script>,
    pub components: HashMap<String, Component>,
    pub test_case: Option<TestCase>,
}

impl ResolvedGraph {
    /// Fetch and validate everything reachable from the run target.
    pub async fn resolve(
        store: &dyn DefinitionStore,
        kind: NodeKind,
        id: &str,
    ) -> Result<Self, ConfigError> {
        let mut graph = Self::default();

        match kind {
            NodeKind::Script => {
                graph.resolve_script(store, id).await?;
            }
            NodeKind::Component => {
                let mut path = Vec::new();
                graph.resolve_component(store, id, &mut path).await?;
            }
            NodeKind::TestCase => {
                let case = fetch_test_case(store, id).await?;
                for child in &case.children {
                    graph
                        .resolve_child(store, &case.id, child)
                        .await?;
                }
                graph.test_case = Some(case);
            }
        }

        graph.check_parent_chains(store).await?;
        debug!(
            scripts = graph.scripts.len(),
            components = graph.components.len(),
            apis = graph.apis.len(),
            "resolved entity graph"
        );
        Ok(graph)
    }

    async fn resolve_child(
        &mut self,
        store: &dyn DefinitionStore,
        owner: &str,
        child: &ChildRef,
    ) -> Result<(), ConfigError> {
        match (&child.script_id, &child.component_id) {
            (Some(script_id), None) => {
                self.resolve_script(store, script_id).await
            }
            (None, Some(component_id)) => {
                let mut path = Vec::new();
                self.resolve_component(store, component_id, &mut path)
                    .await
            }
            _ => Err(ConfigError::MalformedChildRef {
                owner: owner.to_string(),
            }),
        }
    }

    async fn resolve_script(
        &mut self,
        store: &dyn DefinitionStore,
        id: &str,
    ) -> Result<(), ConfigError> {
        if self.scripts.contains_key(id) {
            return Ok(());
        }
        let script = store
            .script(id)
            .await
            .map_err(|e| ConfigError::Store(e.to_string()))?
            .ok_or_else(|| ConfigError::MissingReference {
                kind: "script",
                id: id.to_string(),
            })?;

        if !self.apis.contains_key(&script.api_id) {
            let api = store
                .api_definition(&script.api_id)
                .await
                .map_err(|e| ConfigError::Store(e.to_string()))?
                .ok_or_else(|| ConfigError::MissingReference {
                    kind: "api_definition",
                    id: script.api_id.clone(),
                })?;
            self.apis.insert(api.id.clone(), api);
        }

        self.scripts.insert(script.id.clone(), script);
        Ok(())
    }

    /// Depth-first component resolution. `path` is the chain of
    /// component ids currently being visited; revisiting one of them
    /// is a cycle. A component already in the arena was fully
    /// resolved through another branch (diamond reuse is legal).
    fn resolve_component<'a>(
        &'a mut self,
        store: &'a dyn DefinitionStore,
        id: &'a str,
        path: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Result<(), ConfigError>> {
        Box::pin(async move {
            if path.iter().any(|seen| seen == id) {
                let mut cycle = path.clone();
                cycle.push(id.to_string());
                return Err(ConfigError::CycleDetected {
                    id: id.to_string(),
                    path: cycle.join(" -> "),
                });
            }
            if self.components.contains_key(id) {
                return Ok(());
            }

            let component = store
                .component(id)
                .await
                .map_err(|e| ConfigError::Store(e.to_string()))?
                .ok_or_else(|| ConfigError::MissingReference {
                    kind: "component",
                    id: id.to_string(),
                })?;

            path.push(id.to_string());
            for child in &component.children {
                match (&child.script_id, &child.component_id) {
                    (Some(script_id), None) => {
                        self.resolve_script(store, script_id).await?;
                    }
                    (None, Some(component_id)) => {
                        self.resolve_component(store, component_id, path)
                            .await?;
                    }
                    _ => {
                        return Err(ConfigError::MalformedChildRef {
                            owner: component.id.clone(),
                        })
                    }
                }
            }
            path.pop();

            self.components.insert(component.id.clone(), component);
            Ok(())
        })
    }

    /// Walk each resolved component's `parent_component_id` chain; a
    /// repeated id means the parent tree loops back on itself.
    async fn check_parent_chains(
        &self,
        store: &dyn DefinitionStore,
    ) -> Result<(), ConfigError> {
        for start in self.components.keys() {
            let mut seen: HashSet<String> = HashSet::new();
            let mut chain = vec![start.clone()];
            seen.insert(start.clone());

            let mut current = match self.components.get(start) {
                Some(component) => component.parent_component_id.clone(),
                None => None,
            };

            while let Some(parent_id) = current {
                if !seen.insert(parent_id.clone()) {
                    chain.push(parent_id.clone());
                    return Err(ConfigError::CycleDetected {
                        id: parent_id,
                        path: chain.join(" -> "),
                    });
                }
                chain.push(parent_id.clone());

                let parent = match self.components.get(&parent_id) {
                    Some(component) => component.clone(),
                    None => store
                        .component(&parent_id)
                        .await
                        .map_err(|e| ConfigError::Store(e.to_string()))?
                        .ok_or_else(|| ConfigError::MissingReference {
                            kind: "component",
                            id: parent_id.clone(),
                        })?,
                };
                current = parent.parent_component_id;
            }
        }
        Ok(())
    }
}

async fn fetch_test_case(
    store: &dyn DefinitionStore,
    id: &str,
) -> Result<TestCase, ConfigError> {
    store
        .test_case(id)
        .await
        .map_err(|e| ConfigError::Store(e.to_string()))?
        .ok_or_else(|| ConfigError::MissingReference {
            kind: "test_case",
            id: id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Bundle;
    use crate::store::MemoryStore;

    fn store(yaml: &str) -> MemoryStore {
        MemoryStore::from_bundle(Bundle::from_yaml(yaml).unwrap())
    }

    const VALID: &str = r#"
api_definitions:
  - {id: api-1, name: ping, method: GET, url: "http://x/ping"}
scripts:
  - {id: s1, name: one, api_id: api-1}
  - {id: s2, name: two, api_id: api-1}
components:
  - id: inner
    name: inner
    children:
      - {script_id: s2}
  - id: outer
    name: outer
    children:
      - {script_id: s1, execution_order: 1}
      - {component_id: inner, execution_order: 2}
test_cases:
  - id: case-1
    name: case
    children:
      - {component_id: outer}
"#;

    #[tokio::test]
    async fn test_resolves_full_reachable_graph() {
        let store = store(VALID);
        let graph = ResolvedGraph::resolve(
            &store,
            NodeKind::TestCase,
            "case-1",
        )
        .await
        .unwrap();

        assert_eq!(graph.scripts.len(), 2);
        assert_eq!(graph.components.len(), 2);
        assert_eq!(graph.apis.len(), 1);
        assert!(graph.test_case.is_some());
    }

    #[tokio::test]
    async fn test_missing_script_reference() {
        let store = store(
            r#"
test_cases:
  - id: case-1
    name: case
    children:
      - {script_id: ghost}
"#,
        );
        let err = ResolvedGraph::resolve(
            &store,
            NodeKind::TestCase,
            "case-1",
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingReference { kind: "script", .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_api_reference() {
        let store = store(
            r#"
scripts:
  - {id: s1, name: one, api_id: ghost-api}
"#,
        );
        let err =
            ResolvedGraph::resolve(&store, NodeKind::Script, "s1")
                .await
                .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingReference {
                kind: "api_definition",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_child_cycle_rejected() {
        let store = store(
            r#"
components:
  - id: a
    name: a
    children:
      - {component_id: b}
  - id: b
    name: b
    children:
      - {component_id: a}
"#,
        );
        let err =
            ResolvedGraph::resolve(&store, NodeKind::Component, "a")
                .await
                .unwrap_err();
        match err {
            ConfigError::CycleDetected { path, .. } => {
                assert!(path.contains("a -> b -> a"), "path: {path}");
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_self_reference_rejected() {
        let store = store(
            r#"
components:
  - id: a
    name: a
    children:
      - {component_id: a}
"#,
        );
        let err =
            ResolvedGraph::resolve(&store, NodeKind::Component, "a")
                .await
                .unwrap_err();
        assert!(matches!(err, ConfigError::CycleDetected { .. }));
    }

    #[tokio::test]
    async fn test_parent_chain_cycle_rejected() {
        let store = store(
            r#"
api_definitions:
  - {id: api-1, name: ping, method: GET, url: "http://x"}
scripts:
  - {id: s1, name: one, api_id: api-1}
components:
  - id: a
    name: a
    parent_component_id: b
    children:
      - {script_id: s1}
  - id: b
    name: b
    parent_component_id: a
    children: []
"#,
        );
        let err =
            ResolvedGraph::resolve(&store, NodeKind::Component, "a")
                .await
                .unwrap_err();
        assert!(matches!(err, ConfigError::CycleDetected { .. }));
    }

    #[tokio::test]
    async fn test_diamond_reuse_is_legal() {
        let store = store(
            r#"
api_definitions:
  - {id: api-1, name: ping, method: GET, url: "http://x"}
scripts:
  - {id: s1, name: one, api_id: api-1}
components:
  - id: shared
    name: shared
    children:
      - {script_id: s1}
  - id: left
    name: left
    children:
      - {component_id: shared}
  - id: right
    name: right
    children:
      - {component_id: shared}
  - id: top
    name: top
    children:
      - {component_id: left}
      - {component_id: right}
"#,
        );
        let graph =
            ResolvedGraph::resolve(&store, NodeKind::Component, "top")
                .await
                .unwrap();
        assert_eq!(graph.components.len(), 4);
    }

    #[tokio::test]
    async fn test_malformed_child_ref() {
        let store = store(
            r#"
test_cases:
  - id: case-1
    name: case
    children:
      - {execution_order: 1}
"#,
        );
        let err = ResolvedGraph::resolve(
            &store,
            NodeKind::TestCase,
            "case-1",
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MalformedChildRef { .. }
        ));
    }
}
