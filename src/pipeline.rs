//! HTTP client pipeline.
//!
//! One request travels through an ordered chain of interceptors, each
//! of which may inspect or rewrite the request, short-circuit with a
//! synthetic response, or wrap the downstream call by invoking
//! [`Next::run`]. The chain is composed once per pipeline; the fixed
//! standard order is tracing → logging → auth-injection → retry →
//! transport. The underlying `reqwest::Client` connection pool is the
//! one shared mutable resource and is safe for concurrent use by
//! parallel branches.

use crate::error::PipelineError;
use crate::model::HttpMethod;
use crate::trace::{new_span_id, SpanKind, TraceSink};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A fully rendered outgoing request plus trace correlation fields.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub run_id: String,
    /// Span of the HTTP call; retry attempts open child spans of it.
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub node_path: String,
}

/// Normalized response handed back up the chain.
#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    /// Attempt count including retries; set by the retry interceptor.
    pub attempts: u32,
}

/// Terminal stage of the chain: actually puts bytes on the wire.
/// Abstracted so retry/ordering behavior is testable without a server.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn send(
        &self,
        req: PipelineRequest,
    ) -> Result<PipelineResponse, PipelineError>;
}

/// A pipeline stage. Implementations must call `next.run(req)` to
/// continue the chain, or return early with a synthetic response.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn handle(
        &self,
        req: PipelineRequest,
        next: Next<'_>,
    ) -> Result<PipelineResponse, PipelineError>;
}

/// Cursor over the remaining chain. Cheap to copy, so interceptors
/// like retry can invoke the downstream stages multiple times.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    pub async fn run(
        self,
        req: PipelineRequest,
    ) -> Result<PipelineResponse, PipelineError> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(
                    req,
                    Next {
                        chain: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.send(req).await,
        }
    }
}

/// Retry configuration. Retries apply only to transient conditions:
/// connect/timeout errors and the configured status codes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub retry_statuses: Vec<u16>,
    pub retry_on_connect: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
            retry_statuses: vec![500, 502, 503, 504],
            retry_on_connect: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis =
            (self.initial_backoff.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_backoff)
    }

    fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }
}

/// Emits the span for the HTTP call as a whole.
pub struct TracingInterceptor {
    sink: TraceSink,
}

impl TracingInterceptor {
    pub fn new(sink: TraceSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Interceptor for TracingInterceptor {
    async fn handle(
        &self,
        req: PipelineRequest,
        next: Next<'_>,
    ) -> Result<PipelineResponse, PipelineError> {
        let start = Instant::now();
        self.sink.span_start(
            &req.run_id,
            &req.span_id,
            req.parent_span_id.as_deref(),
            SpanKind::HttpCall,
            &req.node_path,
        );
        let run_id = req.run_id.clone();
        let span_id = req.span_id.clone();

        let result = next.run(req).await;

        let status = match &result {
            Ok(resp) => resp.status.to_string(),
            Err(err) => format!("error: {err}"),
        };
        self.sink.span_end(
            &run_id,
            &span_id,
            &status,
            start.elapsed().as_millis() as u64,
        );
        result
    }
}

/// Structured request/response logging. Authorization values are
/// redacted.
pub struct LoggingInterceptor;

#[async_trait]
impl Interceptor for LoggingInterceptor {
    async fn handle(
        &self,
        req: PipelineRequest,
        next: Next<'_>,
    ) -> Result<PipelineResponse, PipelineError> {
        let start = Instant::now();
        debug!(
            method = req.method.as_str(),
            url = %req.url,
            headers = ?redact_headers(&req.headers),
            node = %req.node_path,
            "sending request"
        );
        let method = req.method;
        let url = req.url.clone();

        let result = next.run(req).await;

        match &result {
            Ok(resp) => debug!(
                method = method.as_str(),
                url = %url,
                status = resp.status,
                attempts = resp.attempts,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "received response"
            ),
            Err(err) => warn!(
                method = method.as_str(),
                url = %url,
                error = %err,
                "request failed"
            ),
        }
        result
    }
}

/// Injects `Authorization: Bearer <token>` when the run context binds
/// a token and the request declares no Authorization header of its
/// own.
pub struct AuthInterceptor {
    token: Option<String>,
}

impl AuthInterceptor {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Interceptor for AuthInterceptor {
    async fn handle(
        &self,
        mut req: PipelineRequest,
        next: Next<'_>,
    ) -> Result<PipelineResponse, PipelineError> {
        if let Some(token) = &self.token {
            let has_auth = req
                .headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("authorization"));
            if !has_auth {
                req.headers.insert(
                    "Authorization".to_string(),
                    format!("Bearer {token}"),
                );
            }
        }
        next.run(req).await
    }
}

/// Retries transient failures with exponential backoff. Each attempt
/// opens a child span of the HTTP call span; the successful response
/// records the attempt count.
pub struct RetryInterceptor {
    policy: RetryPolicy,
    sink: TraceSink,
}

impl RetryInterceptor {
    pub fn new(policy: RetryPolicy, sink: TraceSink) -> Self {
        Self { policy, sink }
    }
}

#[async_trait]
impl Interceptor for RetryInterceptor {
    async fn handle(
        &self,
        req: PipelineRequest,
        next: Next<'_>,
    ) -> Result<PipelineResponse, PipelineError> {
        let max = self.policy.max_attempts.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=max {
            let mut attempt_req = req.clone();
            attempt_req.span_id = new_span_id();
            attempt_req.parent_span_id = Some(req.span_id.clone());
            let attempt_span = attempt_req.span_id.clone();
            let attempt_path =
                format!("{}/attempt {attempt}", req.node_path);
            self.sink.span_start(
                &req.run_id,
                &attempt_span,
                Some(&req.span_id),
                SpanKind::HttpAttempt,
                &attempt_path,
            );
            let start = Instant::now();

            let result = next.run(attempt_req).await;
            let elapsed = start.elapsed().as_millis() as u64;

            match result {
                Ok(mut resp) => {
                    self.sink.span_end(
                        &req.run_id,
                        &attempt_span,
                        &resp.status.to_string(),
                        elapsed,
                    );
                    if self.policy.is_retryable_status(resp.status) {
                        last_failure = format!("status {}", resp.status);
                        if attempt < max {
                            let delay = self.policy.backoff(attempt);
                            warn!(
                                status = resp.status,
                                attempt,
                                "transient status, retrying in {:?}",
                                delay
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    } else {
                        resp.attempts = attempt;
                        return Ok(resp);
                    }
                }
                Err(err) => {
                    self.sink.span_end(
                        &req.run_id,
                        &attempt_span,
                        &format!("error: {err}"),
                        elapsed,
                    );
                    let transient = matches!(
                        err,
                        PipelineError::Transport(_)
                            | PipelineError::Timeout(_)
                    );
                    if transient && self.policy.retry_on_connect {
                        last_failure = err.to_string();
                        if attempt < max {
                            let delay = self.policy.backoff(attempt);
                            warn!(
                                error = %err,
                                attempt,
                                "transient error, retrying in {:?}",
                                delay
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    } else {
                        return Err(err);
                    }
                }
            }
        }

        Err(PipelineError::Exhausted {
            attempts: max,
            last: last_failure,
        })
    }
}

/// Terminal stage over `reqwest`.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn convert_method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

#[async_trait]
impl Terminal for HttpTransport {
    async fn send(
        &self,
        req: PipelineRequest,
    ) -> Result<PipelineResponse, PipelineError> {
        let url = url::Url::parse(&req.url).map_err(|e| {
            PipelineError::InvalidUrl {
                url: req.url.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut builder = self
            .client
            .request(Self::convert_method(req.method), url)
            .timeout(req.timeout);

        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }

        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::Timeout(req.timeout.as_millis() as u64)
            } else {
                PipelineError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;

        Ok(PipelineResponse {
            status,
            headers,
            body,
            attempts: 1,
        })
    }
}

/// Composed interceptor chain plus terminal transport.
pub struct HttpPipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
    terminal: Box<dyn Terminal>,
}

impl HttpPipeline {
    /// Custom chain over the given terminal.
    pub fn new(
        interceptors: Vec<Arc<dyn Interceptor>>,
        terminal: Box<dyn Terminal>,
    ) -> Self {
        Self {
            interceptors,
            terminal,
        }
    }

    /// Standard chain in fixed order: tracing → logging → auth →
    /// retry → transport.
    pub fn standard(
        client: Client,
        sink: TraceSink,
        auth_token: Option<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self::new(
            vec![
                Arc::new(TracingInterceptor::new(sink.clone())),
                Arc::new(LoggingInterceptor),
                Arc::new(AuthInterceptor::new(auth_token)),
                Arc::new(RetryInterceptor::new(policy, sink)),
            ],
            Box::new(HttpTransport::new(client)),
        )
    }

    pub async fn execute(
        &self,
        req: PipelineRequest,
    ) -> Result<PipelineResponse, PipelineError> {
        Next {
            chain: &self.interceptors,
            terminal: self.terminal.as_ref(),
        }
        .run(req)
        .await
    }
}

/// Header map with authorization values masked, for log output.
pub(crate) fn redact_headers(
    headers: &HashMap<String, String>,
) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            if k.eq_ignore_ascii_case("authorization") {
                (k.clone(), "***".to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Terminal that replays a scripted sequence of outcomes.
    struct ScriptedTerminal {
        outcomes: Mutex<Vec<Result<u16, PipelineError>>>,
        seen_headers: Mutex<Vec<HashMap<String, String>>>,
    }

    impl ScriptedTerminal {
        fn new(outcomes: Vec<Result<u16, PipelineError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                seen_headers: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Terminal for ScriptedTerminal {
        async fn send(
            &self,
            req: PipelineRequest,
        ) -> Result<PipelineResponse, PipelineError> {
            self.seen_headers.lock().unwrap().push(req.headers.clone());
            let next = self.outcomes.lock().unwrap().remove(0);
            next.map(|status| PipelineResponse {
                status,
                headers: HashMap::new(),
                body: String::new(),
                attempts: 1,
            })
        }
    }

    fn request() -> PipelineRequest {
        PipelineRequest {
            method: HttpMethod::Get,
            url: "http://localhost/x".into(),
            headers: HashMap::new(),
            body: None,
            timeout: Duration::from_secs(5),
            run_id: "run-1".into(),
            span_id: "span-http".into(),
            parent_span_id: None,
            node_path: "script s".into(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            multiplier: 1.0,
            max_backoff: Duration::from_millis(2),
            ..RetryPolicy::default()
        }
    }

    fn retry_pipeline(
        policy: RetryPolicy,
        terminal: ScriptedTerminal,
    ) -> HttpPipeline {
        HttpPipeline::new(
            vec![Arc::new(RetryInterceptor::new(
                policy,
                TraceSink::disabled(),
            ))],
            Box::new(terminal),
        )
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let terminal = ScriptedTerminal::new(vec![
            Ok(503),
            Ok(503),
            Ok(200),
        ]);
        let pipeline = retry_pipeline(fast_policy(3), terminal);

        let resp = pipeline.execute(request()).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_terminal() {
        let terminal =
            ScriptedTerminal::new(vec![Ok(503), Ok(503), Ok(503)]);
        let pipeline = retry_pipeline(fast_policy(3), terminal);

        let err = pipeline.execute(request()).await.unwrap_err();
        match err {
            PipelineError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.contains("503"), "last: {last}");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_status_passes_through() {
        // 404 is a response, not a transient condition: the
        // assertion layer decides what it means.
        let terminal = ScriptedTerminal::new(vec![Ok(404)]);
        let pipeline = retry_pipeline(fast_policy(3), terminal);

        let resp = pipeline.execute(request()).await.unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(resp.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_on_transport_error() {
        let terminal = ScriptedTerminal::new(vec![
            Err(PipelineError::Transport("connection refused".into())),
            Ok(200),
        ]);
        let pipeline = retry_pipeline(fast_policy(3), terminal);

        let resp = pipeline.execute(request()).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.attempts, 2);
    }

    #[tokio::test]
    async fn test_invalid_url_is_not_retried() {
        let terminal = ScriptedTerminal::new(vec![
            Err(PipelineError::InvalidUrl {
                url: "::".into(),
                reason: "bad".into(),
            }),
            Ok(200),
        ]);
        let pipeline = retry_pipeline(fast_policy(3), terminal);

        let err = pipeline.execute(request()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_auth_injection_when_token_bound() {
        let terminal = ScriptedTerminal::new(vec![Ok(200)]);
        let auth = AuthInterceptor::new(Some("abc".into()));
        let next = Next {
            chain: &[],
            terminal: &terminal,
        };
        auth.handle(request(), next).await.unwrap();
        let seen = terminal.seen_headers.lock().unwrap();
        assert_eq!(
            seen[0].get("Authorization").map(String::as_str),
            Some("Bearer abc")
        );
    }

    #[tokio::test]
    async fn test_auth_does_not_clobber_existing_header() {
        let terminal = ScriptedTerminal::new(vec![Ok(200)]);
        let auth = AuthInterceptor::new(Some("abc".into()));
        let mut req = request();
        req.headers
            .insert("Authorization".into(), "Bearer explicit".into());
        let next = Next {
            chain: &[],
            terminal: &terminal,
        };
        auth.handle(req, next).await.unwrap();
        let seen = terminal.seen_headers.lock().unwrap();
        assert_eq!(
            seen[0].get("Authorization").map(String::as_str),
            Some("Bearer explicit")
        );
    }

    #[tokio::test]
    async fn test_retry_emits_attempt_spans() {
        let (sink, mut rx) = TraceSink::channel();
        let terminal = ScriptedTerminal::new(vec![Ok(503), Ok(200)]);
        let pipeline = HttpPipeline::new(
            vec![Arc::new(RetryInterceptor::new(fast_policy(3), sink))],
            Box::new(terminal),
        );
        pipeline.execute(request()).await.unwrap();

        let mut starts = 0;
        while let Ok(event) = rx.try_recv() {
            if let crate::trace::TraceEvent::SpanStart {
                kind,
                parent_span_id,
                ..
            } = event
            {
                assert_eq!(kind, SpanKind::HttpAttempt);
                assert_eq!(parent_span_id.as_deref(), Some("span-http"));
                starts += 1;
            }
        }
        assert_eq!(starts, 2, "one child span per attempt");
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(300),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(4), Duration::from_millis(300));
    }

    #[test]
    fn test_redact_headers() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer x".into());
        headers.insert("Accept".to_string(), "application/json".into());
        let redacted = redact_headers(&headers);
        assert_eq!(redacted["Authorization"], "***");
        assert_eq!(redacted["Accept"], "application/json");
    }
}
