//! Read-only access to authored entities.
//!
//! The CRUD/persistence layer is external; the engine consumes it
//! through [`DefinitionStore`]. [`MemoryStore`] backs tests and the
//! CLI from a YAML [`Bundle`].

use crate::model::{ApiDefinition, Bundle, Component, Script, TestCase};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Read-only fetch of entity graphs by id. Implementations must be
/// safe for concurrent use.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn api_definition(&self, id: &str) -> Result<Option<ApiDefinition>>;
    async fn script(&self, id: &str) -> Result<Option<Script>>;
    async fn component(&self, id: &str) -> Result<Option<Component>>;
    async fn test_case(&self, id: &str) -> Result<Option<TestCase>>;
}

/// In-memory store over a loaded [`Bundle`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    api_definitions: HashMap<String, ApiDefinition>,
    scripts: HashMap<String, Script>,
    components: HashMap<String, Component>,
    test_cases: HashMap<String, TestCase>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bundle(bundle: Bundle) -> Self {
        let mut store = Self::new();
        for api in bundle.api_definitions {
            store.api_definitions.insert(api.id.clone(), api);
        }
        for script in bundle.scripts {
            store.scripts.insert(script.id.clone(), script);
        }
        for component in bundle.components {
            store.components.insert(component.id.clone(), component);
        }
        for case in bundle.test_cases {
            store.test_cases.insert(case.id.clone(), case);
        }
        debug!(
            apis = store.api_definitions.len(),
            scripts = store.scripts.len(),
            components = store.components.len(),
            test_cases = store.test_cases.len(),
            "loaded entity bundle"
        );
        store
    }

    /// Load a bundle file (YAML) into a store.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading entity bundle from {}", path.display());
        let content = std::fs::read_to_string(path).context(format!(
            "Failed to read bundle file: {}",
            path.display()
        ))?;
        let bundle = Bundle::from_yaml(&content).context(format!(
            "Failed to parse bundle YAML from {}",
            path.display()
        ))?;
        Ok(Self::from_bundle(bundle))
    }

    /// Ids of every test case in the store, sorted for determinism.
    pub fn test_case_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> =
            self.test_cases.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn api_definition(
        &self,
        id: &str,
    ) -> Result<Option<ApiDefinition>> {
        Ok(self.api_definitions.get(id).cloned())
    }

    async fn script(&self, id: &str) -> Result<Option<Script>> {
        Ok(self.scripts.get(id).cloned())
    }

    async fn component(&self, id: &str) -> Result<Option<Component>> {
        Ok(self.components.get(id).cloned())
    }

    async fn test_case(&self, id: &str) -> Result<Option<TestCase>> {
        Ok(self.test_cases.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLE: &str = r#"
api_definitions:
  - id: api-1
    name: ping
    method: GET
    url: http://localhost/ping
scripts:
  - id: script-1
    name: ping once
    api_id: api-1
test_cases:
  - id: case-1
    name: smoke
    children:
      - script_id: script-1
"#;

    #[tokio::test]
    async fn test_fetch_by_id() {
        let store =
            MemoryStore::from_bundle(Bundle::from_yaml(BUNDLE).unwrap());

        let api = store.api_definition("api-1").await.unwrap().unwrap();
        assert_eq!(api.name, "ping");

        let script = store.script("script-1").await.unwrap().unwrap();
        assert_eq!(script.api_id, "api-1");

        assert!(store.script("nope").await.unwrap().is_none());
        assert!(store.component("nope").await.unwrap().is_none());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.yaml");
        std::fs::write(&path, BUNDLE).unwrap();

        let store = MemoryStore::from_file(&path).unwrap();
        assert_eq!(store.test_case_ids(), vec!["case-1".to_string()]);
    }

    #[test]
    fn test_from_file_missing_path_errors() {
        let err = MemoryStore::from_file("/no/such/bundle.yaml")
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to read bundle file"));
    }
}
