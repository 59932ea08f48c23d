//! Entity and result data model.
//!
//! Entities (definitions, scripts, components, test cases) are authored
//! by an external layer and fetched read-only through
//! [`crate::store::DefinitionStore`]. Result types are produced fresh
//! for every run and never mutated after the run completes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A reusable HTTP call shape referenced by scripts.
///
/// URL, header values and the body may contain `{{var}}` placeholders
/// that are rendered against the execution context at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDefinition {
    pub id: String,
    pub name: String,
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

/// HTTP method of an [`ApiDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// A declared script parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    /// Default value used when no context layer binds the name.
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// A required parameter with no resolvable value fails the script
    /// with status ERROR before any network call.
    #[serde(default)]
    pub required: bool,
    /// Sensitive values are redacted from log output.
    #[serde(default)]
    pub sensitive: bool,
}

/// Comparison operator of an [`Assertion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssertionOperator {
    /// JSON path value equals the expected value (type-aware).
    Equals,
    /// JSON path value differs from the expected value.
    NotEquals,
    /// String/array at the path contains the expected value. An empty
    /// target matches against the raw response body.
    Contains,
    /// Response status code equals the expected value.
    StatusCode,
    /// JSON path exists in the response.
    Exists,
}

/// A declared expectation checked against a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assertion {
    /// Dot-separated path into the response root
    /// (`status` / `headers.<name>` / `body.<path>`; bare paths fall
    /// back into `body`).
    #[serde(default)]
    pub target: String,
    pub operator: AssertionOperator,
    /// Expected value; may contain `{{var}}` placeholders.
    #[serde(default)]
    pub expected: serde_json::Value,
}

/// A named variable pulled out of a response for downstream steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub name: String,
    /// Source path, same addressing as [`Assertion::target`].
    pub path: String,
}

/// Lifecycle role of a script within a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScriptType {
    Setup,
    Main,
    Teardown,
}

impl Default for ScriptType {
    fn default() -> Self {
        ScriptType::Main
    }
}

/// The smallest executable unit: one HTTP call plus assertions and
/// extractions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub script_type: ScriptType,
    /// The [`ApiDefinition`] this script executes.
    pub api_id: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    #[serde(default)]
    pub extractions: Vec<Extraction>,
}

/// Execution mode of a [`Component`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
    Conditional,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Sequential
    }
}

/// A reference from a component or test case to one child node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildRef {
    /// Exactly one of `script_id` / `component_id` must be set.
    #[serde(default)]
    pub script_id: Option<String>,
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default)]
    pub execution_order: u32,
    /// Parameter overrides layered on top of the parent context for
    /// this child only.
    #[serde(default)]
    pub overrides: HashMap<String, serde_json::Value>,
    /// Guard expression for CONDITIONAL components. Rendered via the
    /// template resolver, then evaluated as a boolean. Absent guard
    /// means the child always runs.
    #[serde(default)]
    pub guard: Option<String>,
    /// Non-required children never fail their parent.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// A composable, possibly nested, ordered set of scripts/components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Optional parent link; cycles through this chain are rejected
    /// before execution.
    #[serde(default)]
    pub parent_component_id: Option<String>,
    #[serde(default)]
    pub children: Vec<ChildRef>,
}

/// Top-level runnable composition of scripts/components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub children: Vec<ChildRef>,
    /// Case-level parameter overrides (above test data, below runtime
    /// parameters).
    #[serde(default)]
    pub overrides: HashMap<String, serde_json::Value>,
    /// Case-level test data, the lowest override layer of the root
    /// context.
    #[serde(default)]
    pub test_data: HashMap<String, serde_json::Value>,
}

/// A full entity document: everything one run may reference, keyed by
/// id once loaded into a store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub api_definitions: Vec<ApiDefinition>,
    #[serde(default)]
    pub scripts: Vec<Script>,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

impl Bundle {
    /// Deserialize a bundle from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize the bundle to a YAML string.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// Kind of node addressed by [`crate::Engine::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Script,
    Component,
    TestCase,
}

/// Terminal status of one node in the result tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl NodeStatus {
    /// True for FAILED or ERROR.
    pub fn is_failure(&self) -> bool {
        matches!(self, NodeStatus::Failed | NodeStatus::Error)
    }
}

/// Outcome of one assertion: failure is data, not control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionOutcome {
    pub target: String,
    pub operator: AssertionOperator,
    pub expected: serde_json::Value,
    /// Actual value found at the target, if any.
    pub actual: Option<serde_json::Value>,
    pub passed: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Captured HTTP request information for a script node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Captured HTTP response information for a script node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// One node of the output tree produced by a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub node_id: String,
    pub node_name: String,
    pub node_type: NodeKind,
    pub status: NodeStatus,
    pub duration_ms: u64,
    /// Trace span correlated with this node's execution.
    pub span_id: String,
    /// Error captured at this node. Never propagated upward as an
    /// error value, only as an aggregate status change.
    #[serde(default)]
    pub error: Option<String>,
    /// HTTP attempt count including retries (scripts only).
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub request: Option<RequestInfo>,
    #[serde(default)]
    pub response: Option<ResponseInfo>,
    #[serde(default)]
    pub assertions: Vec<AssertionOutcome>,
    /// Variables extracted by this node, published into the caller's
    /// context layer.
    #[serde(default)]
    pub extracted: HashMap<String, serde_json::Value>,
    /// Child results in `execution_order`, present for components and
    /// test cases.
    #[serde(default)]
    pub children: Vec<ExecutionResult>,
}

impl ExecutionResult {
    /// Skeleton result for a node that never produced output of its
    /// own (skipped, cancelled, pre-flight error).
    pub fn placeholder(
        node_id: &str,
        node_name: &str,
        node_type: NodeKind,
        status: NodeStatus,
        span_id: String,
        error: Option<String>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            node_type,
            status,
            duration_ms: 0,
            span_id,
            error,
            attempts: 0,
            request: None,
            response: None,
            assertions: Vec::new(),
            extracted: HashMap::new(),
            children: Vec::new(),
        }
    }
}
