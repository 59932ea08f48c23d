//! Test execution logic.
//!
//! [`Engine::run`] is the single entry point: resolve and validate the
//! entity graph, build the root context, then walk the tree. Every
//! failure during a run is captured at the node that produced it and
//! surfaces only as a status in the result tree; a parent never sees a
//! raw error from a child.

use crate::assertion;
use crate::context::ExecutionContext;
use crate::error::{ConfigError, EngineError};
use crate::error::{PipelineError, VariableNotFound};
use crate::graph::ResolvedGraph;
use crate::model::*;
use crate::pipeline::{HttpPipeline, PipelineRequest, RetryPolicy};
use crate::store::DefinitionStore;
use crate::template;
use crate::trace::{new_span_id, SpanKind, TraceSink};
use futures::future::BoxFuture;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Options for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Runtime parameter overrides, the highest-precedence layer of
    /// the root context.
    pub runtime_params: HashMap<String, Value>,
    /// Run-level deadline. Nodes still unfinished when it expires are
    /// reported with status ERROR, never dropped.
    pub timeout: Option<Duration>,
}

/// The execution engine.
pub struct Engine {
    store: Arc<dyn DefinitionStore>,
    client: Client,
    retry: RetryPolicy,
    sink: TraceSink,
    request_timeout: Duration,
    /// Context variable consulted for bearer-token auth injection.
    auth_variable: String,
}

impl Engine {
    pub fn new(store: Arc<dyn DefinitionStore>) -> Self {
        Self {
            store,
            client: Client::new(),
            retry: RetryPolicy::default(),
            sink: TraceSink::disabled(),
            request_timeout: Duration::from_secs(30),
            auth_variable: "token".to_string(),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_trace_sink(mut self, sink: TraceSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_auth_variable(mut self, name: &str) -> Self {
        self.auth_variable = name.to_string();
        self
    }

    /// Execute a node and return its result tree. Only configuration
    /// problems (missing references, cycles, malformed child refs)
    /// error out; they are detected before any HTTP call is made.
    pub async fn run(
        &self,
        kind: NodeKind,
        id: &str,
        runtime_params: HashMap<String, Value>,
    ) -> Result<ExecutionResult, EngineError> {
        self.run_with_options(
            kind,
            id,
            RunOptions {
                runtime_params,
                timeout: None,
            },
        )
        .await
    }

    #[instrument(skip(self, options), fields(kind = ?kind, id = %id))]
    pub async fn run_with_options(
        &self,
        kind: NodeKind,
        id: &str,
        options: RunOptions,
    ) -> Result<ExecutionResult, EngineError> {
        let graph =
            ResolvedGraph::resolve(self.store.as_ref(), kind, id).await?;

        let run_id = ExecutionContext::new_run_id();
        let deadline = options.timeout.map(|t| Instant::now() + t);
        let run = RunState {
            graph: &graph,
            run_id: &run_id,
            deadline,
            sink: &self.sink,
        };
        info!(run_id = %run_id, "starting run");

        let result = match kind {
            NodeKind::Script => {
                let script = graph.scripts.get(id).ok_or_else(|| {
                    ConfigError::MissingReference {
                        kind: "script",
                        id: id.to_string(),
                    }
                })?;
                let mut ctx = ExecutionContext::root(&run_id);
                for (name, value) in &options.runtime_params {
                    ctx.bind(name, value.clone());
                }
                let path = format!("script {}", script.name);
                self.execute_script(&run, script, &ctx, None, &path)
                    .await
            }
            NodeKind::Component => {
                let component =
                    graph.components.get(id).ok_or_else(|| {
                        ConfigError::MissingReference {
                            kind: "component",
                            id: id.to_string(),
                        }
                    })?;
                let mut ctx = ExecutionContext::root(&run_id);
                for (name, value) in &options.runtime_params {
                    ctx.bind(name, value.clone());
                }
                let path = format!("component {}", component.name);
                self.execute_component(&run, component, ctx, None, path)
                    .await
            }
            NodeKind::TestCase => {
                let case = graph.test_case.as_ref().ok_or_else(|| {
                    ConfigError::MissingReference {
                        kind: "test_case",
                        id: id.to_string(),
                    }
                })?;
                let mut ctx = ExecutionContext::root(&run_id);
                // Root layering, lowest to highest: test data, case
                // overrides, runtime parameters.
                for (name, value) in &case.test_data {
                    ctx.bind(name, value.clone());
                }
                for (name, value) in &case.overrides {
                    ctx.bind(name, value.clone());
                }
                for (name, value) in &options.runtime_params {
                    ctx.bind(name, value.clone());
                }
                self.execute_test_case(&run, case, ctx).await
            }
        };

        info!(
            run_id = %run_id,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "run finished"
        );
        Ok(result)
    }

    // ── Script executor ─────────────────────────────────

    /// States: PENDING → RESOLVING_PARAMS → RENDERING → CALLING →
    /// ASSERTING → terminal. ERROR covers everything up to and
    /// including the network call; FAILED means the call succeeded
    /// but at least one assertion did not hold.
    async fn execute_script(
        &self,
        run: &RunState<'_>,
        script: &Script,
        ctx: &ExecutionContext,
        parent_span: Option<&str>,
        node_path: &str,
    ) -> ExecutionResult {
        let span_id = new_span_id();
        run.sink_start(&span_id, parent_span, SpanKind::Script, node_path);
        let start = Instant::now();

        let mut result = ExecutionResult::placeholder(
            &script.id,
            &script.name,
            NodeKind::Script,
            NodeStatus::Error,
            span_id.clone(),
            None,
        );

        // RESOLVING_PARAMS
        debug!(script = %script.name, state = "RESOLVING_PARAMS", "script state");
        let mut script_ctx = ctx.clone();
        for param in &script.parameters {
            match ctx.resolve(&param.name) {
                Some(value) => {
                    if param.sensitive {
                        debug!(param = %param.name, value = "***", "resolved parameter");
                    } else {
                        debug!(param = %param.name, ?value, "resolved parameter");
                    }
                }
                None => match &param.default {
                    Some(default) => {
                        script_ctx.bind_default(&param.name, default.clone());
                    }
                    None if param.required => {
                        result.error = Some(format!(
                            "required parameter '{}' has no value",
                            param.name
                        ));
                        return self.finish(run, result, start);
                    }
                    None => {}
                },
            }
        }

        // RENDERING
        debug!(script = %script.name, state = "RENDERING", "script state");
        let api = match run.graph.apis.get(&script.api_id) {
            Some(api) => api,
            None => {
                result.error = Some(format!(
                    "api definition '{}' missing from resolved graph",
                    script.api_id
                ));
                return self.finish(run, result, start);
            }
        };
        let rendered = match self.render_request(api, &script_ctx, node_path)
        {
            Ok(rendered) => rendered,
            Err(err) => {
                result.error = Some(err.to_string());
                return self.finish(run, result, start);
            }
        };
        result.request = Some(RequestInfo {
            method: api.method.as_str().to_string(),
            url: rendered.url.clone(),
            headers: rendered.headers.clone(),
            body: rendered
                .body
                .as_ref()
                .map(|b| b.to_string()),
        });

        // CALLING
        debug!(script = %script.name, state = "CALLING", "script state");
        if run.expired() {
            result.error =
                Some("run cancelled before request".to_string());
            return self.finish(run, result, start);
        }
        let token = script_ctx
            .resolve(&self.auth_variable)
            .and_then(|v| v.as_str().map(|s| s.to_string()));
        let pipeline = HttpPipeline::standard(
            self.client.clone(),
            run.sink().clone(),
            token,
            self.retry.clone(),
        );
        let request = PipelineRequest {
            method: api.method,
            url: rendered.url,
            headers: rendered.headers,
            body: rendered.body,
            timeout: self.request_timeout,
            run_id: run.run_id.to_string(),
            span_id: new_span_id(),
            parent_span_id: Some(span_id.clone()),
            node_path: node_path.to_string(),
        };

        let call = pipeline.execute(request);
        let response = match run.deadline {
            Some(deadline) => {
                let remaining =
                    deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, call).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PipelineError::Cancelled),
                }
            }
            None => call.await,
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                result.attempts = err.attempts();
                result.error = Some(err.to_string());
                return self.finish(run, result, start);
            }
        };
        result.attempts = response.attempts;
        result.response = Some(ResponseInfo {
            status: response.status,
            headers: response.headers.clone(),
            body: Some(response.body.clone()),
        });

        // ASSERTING
        debug!(script = %script.name, state = "ASSERTING", "script state");
        let assertions =
            render_assertions(&script.assertions, &script_ctx, node_path);
        let outcomes = assertion::evaluate(&response, &assertions);
        let failed: Vec<&AssertionOutcome> =
            outcomes.iter().filter(|o| !o.passed).collect();

        if failed.is_empty() {
            let (extracted, warnings) =
                assertion::extract(&response, &script.extractions);
            for warning in warnings {
                warn!(script = %script.name, "{warning}");
            }
            result.extracted = extracted;
            result.status = NodeStatus::Passed;
        } else {
            result.status = NodeStatus::Failed;
            result.error = Some(
                failed
                    .iter()
                    .filter_map(|o| o.message.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            );
        }
        result.assertions = outcomes;

        self.finish(run, result, start)
    }

    fn render_request(
        &self,
        api: &ApiDefinition,
        ctx: &ExecutionContext,
        node_path: &str,
    ) -> Result<RenderedRequest, VariableNotFound> {
        let url = template::render_str(
            &api.url,
            ctx,
            &format!("{node_path}/url"),
        )?;
        let mut headers = HashMap::new();
        for (name, value) in &api.headers {
            headers.insert(
                name.clone(),
                template::render_str(
                    value,
                    ctx,
                    &format!("{node_path}/headers.{name}"),
                )?,
            );
        }
        let body = match &api.body {
            Some(body) => Some(template::render_value(
                body,
                ctx,
                &format!("{node_path}/body"),
            )?),
            None => None,
        };
        Ok(RenderedRequest { url, headers, body })
    }

    /// Close out a script result: duration, span end, completion log.
    fn finish(
        &self,
        run: &RunState<'_>,
        mut result: ExecutionResult,
        start: Instant,
    ) -> ExecutionResult {
        result.duration_ms = start.elapsed().as_millis() as u64;
        run.sink_end(&result.span_id, result.status, result.duration_ms);
        info!(
            node = %result.node_name,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "script finished"
        );
        result
    }

    // ── Component executor ──────────────────────────────

    fn execute_component<'a>(
        &'a self,
        run: &'a RunState<'a>,
        component: &'a Component,
        mut ctx: ExecutionContext,
        parent_span: Option<String>,
        node_path: String,
    ) -> BoxFuture<'a, ExecutionResult> {
        Box::pin(async move {
            let span_id = new_span_id();
            run.sink_start(
                &span_id,
                parent_span.as_deref(),
                SpanKind::Component,
                &node_path,
            );
            let start = Instant::now();
            info!(
                component = %component.name,
                mode = ?component.execution_mode,
                children = component.children.len(),
                "starting component"
            );

            let ordered = sort_children(&component.children);
            let mut published: HashMap<String, Value> = HashMap::new();
            let mut results: Vec<ExecutionResult> = Vec::new();

            match component.execution_mode {
                ExecutionMode::Sequential | ExecutionMode::Conditional => {
                    let conditional = component.execution_mode
                        == ExecutionMode::Conditional;
                    for child in &ordered {
                        if run.expired() {
                            results.push(self.cancelled_child(
                                run, child, &span_id, &node_path,
                            ));
                            continue;
                        }
                        if conditional {
                            if let Some(guard) = &child.guard {
                                match evaluate_guard(
                                    guard, &ctx, &node_path,
                                ) {
                                    Ok(true) => {}
                                    Ok(false) => {
                                        results.push(self.skipped_child(
                                            run,
                                            child,
                                            &span_id,
                                            &node_path,
                                            format!(
                                                "guard '{guard}' not met"
                                            ),
                                        ));
                                        continue;
                                    }
                                    Err(reason) => {
                                        results.push(self.skipped_child(
                                            run,
                                            child,
                                            &span_id,
                                            &node_path,
                                            format!(
                                                "guard '{guard}' not evaluable: {reason}"
                                            ),
                                        ));
                                        continue;
                                    }
                                }
                            }
                        }

                        let result = self
                            .execute_child(
                                run, child, &ctx, &span_id, &node_path,
                            )
                            .await;
                        // Extractions become visible to subsequent
                        // siblings only.
                        for (name, value) in &result.extracted {
                            ctx.bind(name, value.clone());
                            published
                                .insert(name.clone(), value.clone());
                        }
                        results.push(result);
                    }
                }
                ExecutionMode::Parallel => {
                    // Every branch gets a snapshot taken at component
                    // entry; no cross-visibility within the batch.
                    let futures: Vec<_> = ordered
                        .iter()
                        .map(|child| {
                            self.execute_child(
                                run, child, &ctx, &span_id, &node_path,
                            )
                        })
                        .collect();
                    results = futures::future::join_all(futures).await;
                    // Merge extractions after the batch, in
                    // execution_order; later orders win collisions.
                    for result in &results {
                        for (name, value) in &result.extracted {
                            ctx.bind(name, value.clone());
                            published
                                .insert(name.clone(), value.clone());
                        }
                    }
                }
            }

            let status = aggregate_status(&ordered, &results);
            let duration_ms = start.elapsed().as_millis() as u64;
            run.sink_end(&span_id, status, duration_ms);
            info!(
                component = %component.name,
                status = ?status,
                duration_ms,
                "component finished"
            );

            ExecutionResult {
                node_id: component.id.clone(),
                node_name: component.name.clone(),
                node_type: NodeKind::Component,
                status,
                duration_ms,
                span_id,
                error: None,
                attempts: 0,
                request: None,
                response: None,
                assertions: Vec::new(),
                extracted: published,
                children: results,
            }
        })
    }

    /// Dispatch one child reference: layer its overrides onto the
    /// caller's context and run the target node.
    fn execute_child<'a>(
        &'a self,
        run: &'a RunState<'a>,
        child: &'a ChildRef,
        parent_ctx: &'a ExecutionContext,
        parent_span: &'a str,
        base_path: &'a str,
    ) -> BoxFuture<'a, ExecutionResult> {
        Box::pin(async move {
            let (node_id, node_name, kind) = run.child_identity(child);

            let mut overrides = HashMap::new();
            for (name, value) in &child.overrides {
                let rendered = match template::render_value(
                    value,
                    parent_ctx,
                    &format!("{base_path}/overrides.{name}"),
                ) {
                    Ok(rendered) => rendered,
                    Err(err) => {
                        return ExecutionResult::placeholder(
                            &node_id,
                            &node_name,
                            kind,
                            NodeStatus::Error,
                            new_span_id(),
                            Some(err.to_string()),
                        );
                    }
                };
                overrides.insert(name.clone(), rendered);
            }
            let child_ctx = parent_ctx.child(overrides);

            if let Some(script_id) = &child.script_id {
                if let Some(script) = run.graph.scripts.get(script_id) {
                    let path =
                        format!("{base_path}/script {}", script.name);
                    return self
                        .execute_script(
                            run,
                            script,
                            &child_ctx,
                            Some(parent_span),
                            &path,
                        )
                        .await;
                }
            }
            if let Some(component_id) = &child.component_id {
                if let Some(component) =
                    run.graph.components.get(component_id)
                {
                    let path = format!(
                        "{base_path}/component {}",
                        component.name
                    );
                    return self
                        .execute_component(
                            run,
                            component,
                            child_ctx,
                            Some(parent_span.to_string()),
                            path,
                        )
                        .await;
                }
            }

            // Unreachable after graph validation.
            ExecutionResult::placeholder(
                &node_id,
                &node_name,
                kind,
                NodeStatus::Error,
                new_span_id(),
                Some("child reference missing from resolved graph".into()),
            )
        })
    }

    fn skipped_child(
        &self,
        run: &RunState<'_>,
        child: &ChildRef,
        parent_span: &str,
        base_path: &str,
        reason: String,
    ) -> ExecutionResult {
        let (node_id, node_name, kind) = run.child_identity(child);
        let span_id = new_span_id();
        let path = format!("{base_path}/{node_name}");
        run.sink_start(&span_id, Some(parent_span), kind.span_kind(), &path);
        run.sink_end(&span_id, NodeStatus::Skipped, 0);
        debug!(node = %node_name, %reason, "child skipped");
        ExecutionResult::placeholder(
            &node_id,
            &node_name,
            kind,
            NodeStatus::Skipped,
            span_id,
            Some(reason),
        )
    }

    fn cancelled_child(
        &self,
        run: &RunState<'_>,
        child: &ChildRef,
        parent_span: &str,
        base_path: &str,
    ) -> ExecutionResult {
        let (node_id, node_name, kind) = run.child_identity(child);
        let span_id = new_span_id();
        let path = format!("{base_path}/{node_name}");
        run.sink_start(&span_id, Some(parent_span), kind.span_kind(), &path);
        run.sink_end(&span_id, NodeStatus::Error, 0);
        warn!(node = %node_name, "child cancelled by run deadline");
        ExecutionResult::placeholder(
            &node_id,
            &node_name,
            kind,
            NodeStatus::Error,
            span_id,
            Some("cancelled by run deadline".to_string()),
        )
    }

    // ── Test case orchestrator ──────────────────────────

    /// SETUP scripts run first regardless of declared order, then
    /// MAIN children in order, then TEARDOWN scripts. Teardown always
    /// runs after a setup success, even when MAIN children failed; a
    /// setup failure skips everything else and marks the case ERROR.
    async fn execute_test_case(
        &self,
        run: &RunState<'_>,
        case: &TestCase,
        mut ctx: ExecutionContext,
    ) -> ExecutionResult {
        let node_path = format!("case {}", case.name);
        let span_id = new_span_id();
        run.sink_start(&span_id, None, SpanKind::TestCase, &node_path);
        let start = Instant::now();
        info!(case = %case.name, "starting test case");

        let ordered = sort_children(&case.children);
        let mut setup = Vec::new();
        let mut main = Vec::new();
        let mut teardown = Vec::new();
        for child in ordered {
            match run.direct_script_type(child) {
                Some(ScriptType::Setup) => setup.push(child),
                Some(ScriptType::Teardown) => teardown.push(child),
                _ => main.push(child),
            }
        }

        let mut results: Vec<ExecutionResult> = Vec::new();
        let mut setup_failed = false;

        for child in &setup {
            if setup_failed {
                results.push(self.skipped_child(
                    run,
                    child,
                    &span_id,
                    &node_path,
                    "skipped after setup failure".to_string(),
                ));
                continue;
            }
            if run.expired() {
                results.push(self.cancelled_child(
                    run, child, &span_id, &node_path,
                ));
                continue;
            }
            let result = self
                .execute_child(run, child, &ctx, &span_id, &node_path)
                .await;
            for (name, value) in &result.extracted {
                ctx.bind(name, value.clone());
            }
            if child.required && result.status.is_failure() {
                setup_failed = true;
            }
            results.push(result);
        }

        if setup_failed {
            for child in main.iter().chain(teardown.iter()) {
                results.push(self.skipped_child(
                    run,
                    child,
                    &span_id,
                    &node_path,
                    "skipped after setup failure".to_string(),
                ));
            }
        } else {
            for child in &main {
                if run.expired() {
                    results.push(self.cancelled_child(
                        run, child, &span_id, &node_path,
                    ));
                    continue;
                }
                let result = self
                    .execute_child(run, child, &ctx, &span_id, &node_path)
                    .await;
                for (name, value) in &result.extracted {
                    ctx.bind(name, value.clone());
                }
                results.push(result);
            }
            // Best-effort cleanup: teardown ignores MAIN failures and
            // the run deadline.
            for child in &teardown {
                let result = self
                    .execute_child(run, child, &ctx, &span_id, &node_path)
                    .await;
                results.push(result);
            }
        }

        let status = if setup_failed {
            NodeStatus::Error
        } else {
            // Results were pushed in phase order, one per reference,
            // so each reference keeps its own required flag even when
            // several point at the same script.
            let phase_order: Vec<&ChildRef> = setup
                .iter()
                .chain(main.iter())
                .chain(teardown.iter())
                .copied()
                .collect();
            aggregate_status(&phase_order, &results)
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        run.sink_end(&span_id, status, duration_ms);
        info!(
            case = %case.name,
            status = ?status,
            duration_ms,
            "test case finished"
        );

        ExecutionResult {
            node_id: case.id.clone(),
            node_name: case.name.clone(),
            node_type: NodeKind::TestCase,
            status,
            duration_ms,
            span_id,
            error: if setup_failed {
                Some("setup failed".to_string())
            } else {
                None
            },
            attempts: 0,
            request: None,
            response: None,
            assertions: Vec::new(),
            extracted: HashMap::new(),
            children: results,
        }
    }
}

struct RenderedRequest {
    url: String,
    headers: HashMap<String, String>,
    body: Option<Value>,
}

/// Per-run immutable state shared by all executors.
struct RunState<'a> {
    graph: &'a ResolvedGraph,
    run_id: &'a str,
    deadline: Option<Instant>,
    sink: &'a TraceSink,
}

impl<'a> RunState<'a> {
    fn expired(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    fn sink(&self) -> &TraceSink {
        self.sink
    }

    fn sink_start(
        &self,
        span_id: &str,
        parent: Option<&str>,
        kind: SpanKind,
        node_path: &str,
    ) {
        self.sink()
            .span_start(self.run_id, span_id, parent, kind, node_path);
    }

    fn sink_end(&self, span_id: &str, status: NodeStatus, duration: u64) {
        self.sink().span_end(
            self.run_id,
            span_id,
            status_label(status),
            duration,
        );
    }

    /// Id, display name and kind of a child reference target.
    fn child_identity(&self, child: &ChildRef) -> (String, String, NodeKind) {
        if let Some(script_id) = &child.script_id {
            let name = self
                .graph
                .scripts
                .get(script_id)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| script_id.clone());
            return (script_id.clone(), name, NodeKind::Script);
        }
        if let Some(component_id) = &child.component_id {
            let name = self
                .graph
                .components
                .get(component_id)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| component_id.clone());
            return (component_id.clone(), name, NodeKind::Component);
        }
        (String::new(), String::new(), NodeKind::Script)
    }

    /// Script type of a direct script child, if the child is a script.
    fn direct_script_type(&self, child: &ChildRef) -> Option<ScriptType> {
        child
            .script_id
            .as_ref()
            .and_then(|id| self.graph.scripts.get(id))
            .map(|script| script.script_type)
    }
}

fn status_label(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Passed => "PASSED",
        NodeStatus::Failed => "FAILED",
        NodeStatus::Error => "ERROR",
        NodeStatus::Skipped => "SKIPPED",
    }
}

impl NodeKind {
    fn span_kind(self) -> SpanKind {
        match self {
            NodeKind::Script => SpanKind::Script,
            NodeKind::Component => SpanKind::Component,
            NodeKind::TestCase => SpanKind::TestCase,
        }
    }
}

/// Stable order by `execution_order`; equal orders keep declaration
/// order.
fn sort_children(children: &[ChildRef]) -> Vec<&ChildRef> {
    let mut ordered: Vec<&ChildRef> = children.iter().collect();
    ordered.sort_by_key(|child| child.execution_order);
    ordered
}

/// FAILED when any required child is FAILED/ERROR; SKIPPED children
/// never fail the parent.
fn aggregate_status(
    ordered: &[&ChildRef],
    results: &[ExecutionResult],
) -> NodeStatus {
    for (child, result) in ordered.iter().zip(results.iter()) {
        if child.required && result.status.is_failure() {
            return NodeStatus::Failed;
        }
    }
    NodeStatus::Passed
}

/// Render the assertion expected values; an unresolved placeholder in
/// an expected value shows up as a failed outcome, never a panic.
fn render_assertions(
    assertions: &[Assertion],
    ctx: &ExecutionContext,
    node_path: &str,
) -> Vec<Assertion> {
    assertions
        .iter()
        .map(|a| {
            let expected = template::render_value(
                &a.expected,
                ctx,
                &format!("{node_path}/assertions.{}", a.target),
            )
            .unwrap_or_else(|err| {
                Value::String(format!("<unresolved: {}>", err.name))
            });
            Assertion {
                target: a.target.clone(),
                operator: a.operator,
                expected,
            }
        })
        .collect()
}

/// Render a CONDITIONAL guard and evaluate it as a boolean CEL
/// expression. Truthiness follows CEL conventions (non-zero,
/// non-empty). An unevaluable guard is reported as `Err`, which the
/// component executor turns into a SKIPPED child.
fn evaluate_guard(
    guard: &str,
    ctx: &ExecutionContext,
    node_path: &str,
) -> Result<bool, String> {
    let rendered = template::render_str(
        guard,
        ctx,
        &format!("{node_path}/guard"),
    )
    .map_err(|e| e.to_string())?;

    let trimmed = rendered.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Ok(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Ok(false);
    }

    let program = cel::Program::compile(trimmed)
        .map_err(|e| format!("compile error: {e}"))?;
    let context = cel::Context::default();
    let value = program
        .execute(&context)
        .map_err(|e| format!("execution error: {e}"))?;
    Ok(cel_truthy(&value))
}

fn cel_truthy(value: &cel::Value) -> bool {
    match value {
        cel::Value::Bool(b) => *b,
        cel::Value::Int(i) => *i != 0,
        cel::Value::UInt(u) => *u != 0,
        cel::Value::Float(f) => *f != 0.0,
        cel::Value::String(s) => !s.is_empty(),
        cel::Value::Null => false,
        cel::Value::List(list) => !list.is_empty(),
        cel::Value::Map(map) => !map.map.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn child(script_id: &str, order: u32) -> ChildRef {
        ChildRef {
            script_id: Some(script_id.to_string()),
            component_id: None,
            execution_order: order,
            overrides: HashMap::new(),
            guard: None,
            required: true,
        }
    }

    #[test]
    fn test_sort_children_is_stable_on_ties() {
        let children = vec![
            child("b", 2),
            child("a", 1),
            child("c", 2),
            child("d", 1),
        ];
        let ordered = sort_children(&children);
        let ids: Vec<&str> = ordered
            .iter()
            .map(|c| c.script_id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "d", "b", "c"]);
    }

    #[test]
    fn test_guard_boolean_variable() {
        let mut ctx = ExecutionContext::new();
        ctx.bind("enabled", json!(true));
        assert_eq!(evaluate_guard("{{enabled}}", &ctx, "t"), Ok(true));

        ctx.bind("enabled", json!(false));
        assert_eq!(evaluate_guard("{{enabled}}", &ctx, "t"), Ok(false));
    }

    #[test]
    fn test_guard_equality_expression() {
        let mut ctx = ExecutionContext::new();
        ctx.bind("enabled", json!(false));
        assert_eq!(
            evaluate_guard("{{enabled}} == true", &ctx, "t"),
            Ok(false)
        );

        ctx.bind("enabled", json!(true));
        assert_eq!(
            evaluate_guard("{{enabled}} == true", &ctx, "t"),
            Ok(true)
        );
    }

    #[test]
    fn test_guard_string_comparison_needs_quotes() {
        let mut ctx = ExecutionContext::new();
        ctx.bind("env", json!("prod"));
        assert_eq!(
            evaluate_guard("\"{{env}}\" == \"prod\"", &ctx, "t"),
            Ok(true)
        );
    }

    #[test]
    fn test_guard_missing_variable_is_err() {
        let ctx = ExecutionContext::new();
        assert!(evaluate_guard("{{ghost}}", &ctx, "t").is_err());
    }

    #[test]
    fn test_aggregate_skipped_never_fails_parent() {
        let refs = vec![child("a", 1), child("b", 2)];
        let ordered: Vec<&ChildRef> = refs.iter().collect();
        let results = vec![
            ExecutionResult::placeholder(
                "a",
                "a",
                NodeKind::Script,
                NodeStatus::Skipped,
                "s1".into(),
                None,
            ),
            ExecutionResult::placeholder(
                "b",
                "b",
                NodeKind::Script,
                NodeStatus::Passed,
                "s2".into(),
                None,
            ),
        ];
        assert_eq!(
            aggregate_status(&ordered, &results),
            NodeStatus::Passed
        );
    }

    #[test]
    fn test_aggregate_optional_child_failure_tolerated() {
        let mut optional = child("a", 1);
        optional.required = false;
        let refs = vec![optional, child("b", 2)];
        let ordered: Vec<&ChildRef> = refs.iter().collect();
        let results = vec![
            ExecutionResult::placeholder(
                "a",
                "a",
                NodeKind::Script,
                NodeStatus::Failed,
                "s1".into(),
                None,
            ),
            ExecutionResult::placeholder(
                "b",
                "b",
                NodeKind::Script,
                NodeStatus::Passed,
                "s2".into(),
                None,
            ),
        ];
        assert_eq!(
            aggregate_status(&ordered, &results),
            NodeStatus::Passed
        );
    }

    #[test]
    fn test_aggregate_duplicate_refs_keep_their_own_required_flag() {
        // The same script referenced twice: the optional reference
        // fails, the required one passes.
        let mut optional = child("a", 1);
        optional.required = false;
        let refs = vec![optional, child("a", 2)];
        let ordered: Vec<&ChildRef> = refs.iter().collect();
        let results = vec![
            ExecutionResult::placeholder(
                "a",
                "a",
                NodeKind::Script,
                NodeStatus::Failed,
                "s1".into(),
                None,
            ),
            ExecutionResult::placeholder(
                "a",
                "a",
                NodeKind::Script,
                NodeStatus::Passed,
                "s2".into(),
                None,
            ),
        ];
        assert_eq!(
            aggregate_status(&ordered, &results),
            NodeStatus::Passed
        );
    }

    #[test]
    fn test_aggregate_required_error_fails_parent() {
        let refs = vec![child("a", 1)];
        let ordered: Vec<&ChildRef> = refs.iter().collect();
        let results = vec![ExecutionResult::placeholder(
            "a",
            "a",
            NodeKind::Script,
            NodeStatus::Error,
            "s1".into(),
            None,
        )];
        assert_eq!(
            aggregate_status(&ordered, &results),
            NodeStatus::Failed
        );
    }
}
